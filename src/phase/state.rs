//! Phase lifecycle states and the transition table.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    /// Context is being created
    Initializing,
    /// Initialized and waiting to be started
    Ready,
    /// Body is executing
    Running,
    /// Suspended by the caller
    Paused,
    /// Body returned successfully
    Completed,
    /// Body failed
    Failed,
    /// Stopped by the caller
    Aborted,
}

impl PhaseState {
    pub const ALL: [PhaseState; 7] = [
        PhaseState::Initializing,
        PhaseState::Ready,
        PhaseState::Running,
        PhaseState::Paused,
        PhaseState::Completed,
        PhaseState::Failed,
        PhaseState::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Initializing => "INITIALIZING",
            PhaseState::Ready => "READY",
            PhaseState::Running => "RUNNING",
            PhaseState::Paused => "PAUSED",
            PhaseState::Completed => "COMPLETED",
            PhaseState::Failed => "FAILED",
            PhaseState::Aborted => "ABORTED",
        }
    }

    /// Terminal states accept no further transitions; only a checkpoint
    /// rollback can move a phase out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseState::Completed | PhaseState::Failed | PhaseState::Aborted
        )
    }

    /// Whether `self -> next` is an allowed lifecycle transition.
    pub fn can_transition_to(&self, next: PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, next),
            (Initializing, Ready)
                | (Ready, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Aborted)
                | (Paused, Aborted)
        )
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhaseState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown phase state '{}'", s))
    }
}
