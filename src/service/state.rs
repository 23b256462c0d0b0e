//! Service instance states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one service instance
///
/// `Starting → HealthChecking → Running ⇄ StopPending → Stopped`, with
/// `Failed` reachable from `Starting` and `HealthChecking`. `Stopped` and
/// `Failed` are terminal; a later request creates a fresh instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Starting,
    HealthChecking,
    Running,
    StopPending,
    Stopped,
    Failed,
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// The sandbox is up and usable by dependents
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::StopPending)
    }

    /// Whether a transition to `next` is part of the lifecycle
    pub fn can_become(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Starting, HealthChecking)
                | (Starting, Failed)
                | (HealthChecking, Running)
                | (HealthChecking, StopPending)
                | (HealthChecking, Failed)
                | (Running, StopPending)
                | (StopPending, Running)
                | (StopPending, Stopped)
        ) || (!self.is_terminal() && next == Stopped)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::HealthChecking => "health-checking",
            Self::Running => "running",
            Self::StopPending => "stop-pending",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use ServiceState::*;
        assert!(Starting.can_become(HealthChecking));
        assert!(HealthChecking.can_become(Running));
        assert!(Running.can_become(StopPending));
        assert!(StopPending.can_become(Running));
        assert!(StopPending.can_become(Stopped));
        assert!(HealthChecking.can_become(Failed));

        assert!(!Running.can_become(Failed));
        assert!(!Stopped.can_become(Running));
        assert!(!Failed.can_become(Stopped));
    }

    #[test]
    fn explicit_stop_from_any_live_state() {
        use ServiceState::*;
        for state in [Starting, HealthChecking, Running, StopPending] {
            assert!(state.can_become(Stopped), "{state}");
        }
    }

    #[test]
    fn display() {
        assert_eq!(ServiceState::StopPending.to_string(), "stop-pending");
        assert!(ServiceState::StopPending.is_live());
        assert!(ServiceState::Failed.is_terminal());
    }
}
