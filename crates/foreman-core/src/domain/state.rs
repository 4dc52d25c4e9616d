//! Work state machine.

use serde::{Deserialize, Serialize};

/// Persisted state of a WorkSpec.
///
/// State transitions:
/// - Enqueued -> Running -> Succeeded
/// - Enqueued -> Running -> Enqueued (retry, or periodic reset)
/// - Enqueued -> Running -> Failed
/// - Blocked -> Enqueued (all prerequisites succeeded)
/// - Blocked -> Failed / Cancelled (a prerequisite failed / was cancelled)
/// - any non-finished -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkState {
    /// Eligible once its constraints and timing are met.
    Enqueued,

    /// Currently executing (run attempt already counted).
    Running,

    Succeeded,

    Failed,

    /// Waiting for prerequisites.
    Blocked,

    Cancelled,
}

impl WorkState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            WorkState::Succeeded | WorkState::Failed | WorkState::Cancelled
        )
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkState::Enqueued => "ENQUEUED",
            WorkState::Running => "RUNNING",
            WorkState::Succeeded => "SUCCEEDED",
            WorkState::Failed => "FAILED",
            WorkState::Blocked => "BLOCKED",
            WorkState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}
