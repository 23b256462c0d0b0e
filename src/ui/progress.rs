//! Spinners with a CI fallback

use super::context::UiContext;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// A cliclack spinner for short CLI tasks
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    fancy: bool,
    quiet: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            fancy: ctx.use_fancy_output(),
            quiet: ctx.is_quiet(),
        }
    }

    pub fn start(&mut self, message: &str) {
        if self.fancy {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else if !self.quiet {
            println!("{} {}", style("...").dim(), message);
        }
    }

    pub fn stop(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.stop(message),
            None if !self.quiet => println!("{} {}", style("[OK]").green(), message),
            None => {}
        }
    }

    pub fn stop_error(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.error(message),
            None if !self.quiet => println!("{} {}", style("[FAIL]").red(), message),
            None => {}
        }
    }

    /// Remove the spinner, e.g. before handing the terminal to a shell
    pub fn clear(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.clear();
        }
    }
}

/// Elapsed-time indicator shown while a graph evaluates
///
/// Evaluation is one future per request, so this only ticks; the report
/// printed afterwards carries the per-root detail.
pub struct EvaluationProgress {
    bar: Option<ProgressBar>,
}

impl EvaluationProgress {
    pub fn start(ctx: &UiContext, roots: usize) -> Self {
        let label = format!("{} root{}", roots, if roots == 1 { "" } else { "s" });
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new_spinner();
            if let Ok(template) =
                ProgressStyle::default_spinner().template("  {spinner:.yellow} Evaluating {msg}  {elapsed:.dim}")
            {
                bar.set_style(template.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
            }
            bar.set_message(label);
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            if !ctx.is_quiet() {
                println!("Evaluating {}...", label);
            }
            None
        };
        Self { bar }
    }

    /// Hide the indicator while the terminal is used for something else
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.bar {
            Some(bar) => bar.suspend(f),
            None => f(),
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

impl Drop for EvaluationProgress {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinner_non_interactive() {
        let ctx = UiContext::non_interactive();
        let mut spinner = TaskSpinner::new(&ctx);
        spinner.start("Opening store...");
        spinner.stop("Store ready");
    }

    #[test]
    fn evaluation_progress_non_interactive() {
        let ctx = UiContext::non_interactive();
        let progress = EvaluationProgress::start(&ctx, 2);
        assert_eq!(progress.suspend(|| 7), 7);
        progress.finish();
    }
}
