//! Interactive vs CI detection

use std::io::IsTerminal;

/// Environment variables set by common CI systems
const CI_MARKERS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "CIRCLECI",
    "BUILDKITE",
    "JENKINS_URL",
    "TF_BUILD",
];

/// How the CLI talks to the user
#[derive(Debug, Clone)]
pub struct UiContext {
    interactive: bool,
    auto_yes: bool,
    /// Machine-readable output requested; human chatter is suppressed
    quiet: bool,
}

impl UiContext {
    pub fn detect() -> Self {
        Self {
            interactive: detect_interactive(),
            auto_yes: false,
            quiet: false,
        }
    }

    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            auto_yes: false,
            quiet: false,
        }
    }

    /// Answer every prompt with yes
    pub fn with_auto_yes(mut self, yes: bool) -> Self {
        self.auto_yes = yes;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Spinners and colour only on a real terminal with human output
    pub fn use_fancy_output(&self) -> bool {
        self.interactive && !self.quiet
    }
}

fn detect_interactive() -> bool {
    std::io::stdout().is_terminal()
        && std::io::stdin().is_terminal()
        && !CI_MARKERS.iter().any(|var| std::env::var_os(var).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_interactive_context() {
        let ctx = UiContext::non_interactive();
        assert!(!ctx.is_interactive());
        assert!(!ctx.auto_yes());
        assert!(!ctx.use_fancy_output());
    }

    #[test]
    fn quiet_disables_fancy_output() {
        let ctx = UiContext {
            interactive: true,
            auto_yes: false,
            quiet: false,
        };
        assert!(ctx.use_fancy_output());
        assert!(!ctx.with_quiet(true).use_fancy_output());
    }
}
