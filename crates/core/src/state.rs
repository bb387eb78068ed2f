use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task id as seen by the result backend.
///
/// `PENDING -> STARTED? -> (SUCCESS | FAILURE | RETRY -> ...)`, with
/// `REVOKED` terminal from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    #[default]
    Pending,
    Started,
    Success,
    Failure,
    Retry,
    Revoked,
}

impl TaskState {
    /// Ready states carry a final result.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }

    /// States that mean the task did not succeed.
    pub fn is_exception(self) -> bool {
        matches!(self, Self::Failure | Self::Retry | Self::Revoked)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match (self, next) {
            (Self::Revoked, _) => false,
            (_, Self::Revoked) => true,
            (Self::Success | Self::Failure, _) => false,
            (_, Self::Pending) => false,
            _ => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Retry => "RETRY",
            Self::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
