use std::time::Duration;

use thiserror::Error;

/// Errors raised by the dispatcher, the router and the result side.
#[derive(Debug, Error)]
pub enum FahrplanError {
    /// Task name is unknown to the registry.
    #[error("task not registered: {0}")]
    NotRegistered(String),

    /// Routed queue is absent and missing queues may not be created.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Arguments have the wrong shape, or a time field is out of range.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Serializer (or content type) not in the accepted set.
    #[error("security error: {0}")]
    Security(String),

    /// Required configuration is missing or invalid.
    #[error("improperly configured: {0}")]
    ImproperlyConfigured(String),

    /// Broker unreachable or channel lost. Transient.
    #[error("connection error: {0}")]
    Connection(String),

    /// Connection acquisition timed out. Transient.
    #[error("connection timeout after {0:?}")]
    Timeout(Duration),

    /// Publish retry budget (or task retry limit) exhausted.
    #[error("max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<FahrplanError>,
    },

    /// Task retry limit exhausted on the execution side.
    #[error("can't retry {task}[{id}]: max retries ({max_retries}) exceeded")]
    TaskRetriesExhausted {
        task: String,
        id: String,
        max_retries: u32,
    },

    #[error("chord error: {0}")]
    Chord(String),

    #[error("task revoked: {0}")]
    TaskRevoked(String),

    /// Result did not become ready in time.
    #[error("result not ready after {0:?}")]
    ResultTimeout(Duration),

    /// The task itself failed; carries the stored error.
    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FahrplanError {
    /// Whether a publish may be retried after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Whether the broker connection should be dropped and re-established.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Result alias for fahrplan operations.
pub type Result<T> = std::result::Result<T, FahrplanError>;
