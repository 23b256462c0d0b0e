//! Kiln's colours
//!
//! Prompts glow amber while a node waits on the user. The run report and
//! the debugger take their status colours from here.

use crate::debug::DebugReason;
use cliclack::ThemeState;
use console::Style;

/// 256-colour index of the amber accent
const AMBER: u8 = 214;

fn amber() -> Style {
    Style::new().color256(AMBER)
}

/// Colour of a root's status in the run report
pub fn status_style(ok: bool) -> Style {
    if ok {
        Style::new().green()
    } else {
        Style::new().red().bold()
    }
}

/// Heading shown when a node is handed to the debugger
pub fn suspension_heading(operation: &str, reason: &DebugReason) -> String {
    match reason {
        DebugReason::Breakpoint { label } => {
            let label = label.as_deref().map(|l| format!(" ({})", l)).unwrap_or_default();
            amber()
                .bold()
                .apply_to(format!("Breakpoint at {}{}", operation, label))
                .to_string()
        }
        DebugReason::Failure { .. } => status_style(false)
            .apply_to(format!("{} failed", operation))
            .to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct KilnTheme;

impl cliclack::Theme for KilnTheme {
    fn bar_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Active | ThemeState::Submit => amber(),
            ThemeState::Error(_) => Style::new().red(),
            ThemeState::Cancel => Style::new().dim(),
        }
    }

    fn state_symbol_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Active => amber().bold(),
            ThemeState::Error(_) => Style::new().red(),
            ThemeState::Cancel => Style::new().dim(),
            ThemeState::Submit => status_style(true),
        }
    }
}

pub fn init_theme() {
    cliclack::set_theme(KilnTheme);
}
