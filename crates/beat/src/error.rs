use fahrplan_core::FahrplanError;
use thiserror::Error;

/// Errors raised by schedule parsing, persistence and the beat loop.
#[derive(Debug, Error)]
pub enum BeatError {
    #[error(transparent)]
    Fahrplan(#[from] FahrplanError),

    /// A crontab field could not be parsed or is out of range.
    #[error("invalid crontab {field} '{value}': {reason}")]
    Crontab {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid schedule for entry '{entry}': {reason}")]
    InvalidSchedule { entry: String, reason: String },

    /// The persisted schedule exists but cannot be decoded.
    #[error("schedule store {path} is corrupt: {reason}")]
    StoreCorrupt { path: String, reason: String },

    #[error("beat runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BeatError {
    /// Attach the entry name to a schedule error.
    pub(crate) fn in_entry(self, name: &str) -> Self {
        match self {
            Self::InvalidSchedule { reason, .. } => Self::InvalidSchedule {
                entry: name.to_string(),
                reason,
            },
            err @ Self::Crontab { .. } => Self::InvalidSchedule {
                entry: name.to_string(),
                reason: err.to_string(),
            },
            other => other,
        }
    }
}

/// Result alias for beat operations.
pub type Result<T> = std::result::Result<T, BeatError>;
