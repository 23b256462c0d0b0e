//! Terminal output for the CLI
//!
//! Interactive terminals get `cliclack` prompts and spinners; CI and piped
//! output fall back to plain lines. Anything written here goes to stdout,
//! logs go to stderr.

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, note, outro_error, outro_success, remark, section,
    step_error, step_error_detail, step_info, step_ok, step_ok_detail, step_warn, step_warn_hint,
};
pub use progress::{EvaluationProgress, TaskSpinner};
pub use prompts::{confirm, select};
pub use theme::{init_theme, status_style, suspension_heading, KilnTheme};
