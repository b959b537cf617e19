//! Supervised process lifecycle state

use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProcessState {
    /// Nothing launched yet
    #[default]
    Idle,

    /// Spawning the process
    Launching,

    /// Spawned, waiting for the port to open
    ProbingReadiness,

    /// Port is open
    Running,

    /// Termination in progress
    Stopping,

    /// Process confirmed gone and port released
    Stopped,

    /// Launch or readiness failed; the process may still be alive
    Failed,
}

impl ProcessState {
    /// States in which a start or stop is underway
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProcessState::Launching | ProcessState::ProbingReadiness | ProcessState::Stopping
        )
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self,
            ProcessState::Idle | ProcessState::Stopped | ProcessState::Failed
        )
    }

    pub fn can_transition_to(&self, next: ProcessState) -> bool {
        use ProcessState::*;

        match (self, next) {
            (Idle | Stopped | Failed, Launching) => true,
            (Launching, ProbingReadiness | Failed | Stopping) => true,
            (ProbingReadiness, Running | Failed | Stopping) => true,
            (Running, Stopping | Stopped) => true,
            (Failed, Stopping) => true,
            // Launching only happens from Stopping inside a restart
            (Stopping, Stopped | Launching) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Idle => "idle",
            ProcessState::Launching => "launching",
            ProcessState::ProbingReadiness => "probing-readiness",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessState::*;

    const ALL: [ProcessState; 7] = [
        Idle,
        Launching,
        ProbingReadiness,
        Running,
        Stopping,
        Stopped,
        Failed,
    ];

    #[test]
    fn test_happy_path_transitions() {
        let path = [Idle, Launching, ProbingReadiness, Running, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_failed_only_from_launch_phases() {
        for state in ALL {
            let allowed = state.can_transition_to(Failed);
            assert_eq!(allowed, matches!(state, Launching | ProbingReadiness));
        }
    }

    #[test]
    fn test_idle_is_never_reentered() {
        for state in ALL {
            assert!(!state.can_transition_to(Idle));
        }
    }

    #[test]
    fn test_restart_skips_stopped() {
        assert!(Stopping.can_transition_to(Launching));
        assert!(!Running.can_transition_to(Launching));
    }

    #[test]
    fn test_classification() {
        assert!(Launching.is_transient());
        assert!(Stopping.is_transient());
        assert!(!Running.is_transient());
        assert!(Failed.can_start());
        assert!(!Running.can_start());
        for state in ALL {
            if state.is_transient() {
                assert!(!state.can_start(), "{state} must not start");
            }
        }
        assert_eq!(ProcessState::default(), Idle);
        assert_eq!(ProbingReadiness.to_string(), "probing-readiness");
    }
}
