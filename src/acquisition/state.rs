//! Driver lifecycle states.

use serde::{Deserialize, Serialize};

/// State of an [`AcquisitionDriver`](crate::acquisition::driver::AcquisitionDriver).
///
/// `Idle → Validating → Running ⇄ Paused → Finishing → Idle`; `Aborting` is
/// reachable from `Running` and `Paused` and leads to `Finishing`. A run that
/// fails while starting goes from `Validating` straight to `Finishing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    /// No run in progress, ready to accept one
    #[default]
    Idle,
    /// Checking settings and resources
    Validating,
    /// Submitting events
    Running,
    /// Engine paused between events
    Paused,
    /// Abort requested, waiting for the in-flight event
    Aborting,
    /// Tearing down the run
    Finishing,
}

impl DriverState {
    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: DriverState) -> bool {
        use DriverState::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Running)
                | (Validating, Idle)
                | (Validating, Finishing)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Aborting)
                | (Paused, Aborting)
                | (Running, Finishing)
                | (Paused, Finishing)
                | (Aborting, Finishing)
                | (Finishing, Idle)
        )
    }

    /// A run is in progress (anything but `Idle`).
    pub fn is_active(self) -> bool {
        self != DriverState::Idle
    }

    /// Events are being, or may again be, submitted.
    pub fn is_running(self) -> bool {
        matches!(self, DriverState::Running | DriverState::Paused)
    }
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverState::Idle => write!(f, "idle"),
            DriverState::Validating => write!(f, "validating"),
            DriverState::Running => write!(f, "running"),
            DriverState::Paused => write!(f, "paused"),
            DriverState::Aborting => write!(f, "aborting"),
            DriverState::Finishing => write!(f, "finishing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        assert!(DriverState::Idle.can_transition_to(DriverState::Validating));
        assert!(DriverState::Paused.can_transition_to(DriverState::Aborting));
        assert!(DriverState::Aborting.can_transition_to(DriverState::Finishing));
        assert!(!DriverState::Idle.can_transition_to(DriverState::Running));
        assert!(!DriverState::Aborting.can_transition_to(DriverState::Running));
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(DriverState::Finishing.to_string(), "finishing");
        assert!(!DriverState::Idle.is_active());
        assert!(DriverState::Paused.is_running());
    }
}
