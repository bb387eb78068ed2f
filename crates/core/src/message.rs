//! Wire shape of a task invocation.
//!
//! The body is a JSON object with exactly these keys: `task`, `id`, `args`,
//! `kwargs`, `retries`, `eta`, `expires`, `utc`, `callbacks`, `errbacks`,
//! `timelimit`, `taskset`, `chord`. Any other key found when decoding is
//! kept in [`TaskMessage::extra`] and written back out on encode.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FahrplanError, Result};
use crate::queue::DeliveryMode;

/// A task invocation as carried by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task: String,
    pub id: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub eta: Option<String>,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default = "default_utc")]
    pub utc: bool,
    #[serde(default)]
    pub callbacks: Option<Vec<Signature>>,
    #[serde(default)]
    pub errbacks: Option<Vec<Signature>>,
    /// `(hard, soft)` seconds.
    #[serde(default)]
    pub timelimit: (Option<f64>, Option<f64>),
    /// Group id, kept under its legacy wire name.
    #[serde(rename = "taskset", default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub chord: Option<Signature>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_utc() -> bool {
    true
}

impl TaskMessage {
    /// A first-submission message with no arguments.
    pub fn new(task: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            id: id.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            retries: 0,
            eta: None,
            expires: None,
            utc: true,
            callbacks: None,
            errbacks: None,
            timelimit: (None, None),
            group_id: None,
            chord: None,
            extra: Map::new(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The body as a JSON value, as handed to publish signal receivers.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn eta_datetime(&self) -> Result<Option<DateTime<FixedOffset>>> {
        parse_iso(self.eta.as_deref())
    }

    pub fn expires_datetime(&self) -> Result<Option<DateTime<FixedOffset>>> {
        parse_iso(self.expires.as_deref())
    }
}

fn parse_iso(raw: Option<&str>) -> Result<Option<DateTime<FixedOffset>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(s)
            .map_err(|e| FahrplanError::InvalidTask(format!("bad timestamp '{s}': {e}")))
    })
    .transpose()
}

/// A fresh task id: UUIDv4, lower-case hex with dashes.
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Signature ───────────────────────────────────────────────────────

/// A serializable reference to a task call: used for link/errback
/// callbacks and chord bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub subtask_type: Option<String>,
    /// Immutable signatures do not receive the parent's result.
    #[serde(default)]
    pub immutable: bool,
}

impl Signature {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            options: Map::new(),
            subtask_type: None,
            immutable: false,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }
}

// ── Transport properties ────────────────────────────────────────────

/// Per-message properties passed to the broker alongside the body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: String,
    pub content_encoding: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub priority: Option<u8>,
    pub expiration_ms: Option<u64>,
    #[serde(default)]
    pub headers: Map<String, Value>,
}
