//! Shared building blocks for the fahrplan task dispatcher and beat scheduler.
//!
//! This crate provides:
//! - The error taxonomy used across the workspace ([`FahrplanError`])
//! - Layered configuration with TOML sources and `FAHRPLAN_*` env overrides
//! - Clocks and fixed-offset timezones
//! - Wire types: [`TaskMessage`], [`QueueSpec`], [`DeliveryDescriptor`]
//! - Task option bags and the task state machine

pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod options;
pub mod queue;
pub mod state;

pub use clock::{isoformat, Clock, ManualClock, SystemClock, Timezone};
pub use config::{
    BeatEntryConfig, Config, ConfigBuilder, CrontabSpec, RetryPolicy, ScheduleSpec,
    MAX_RETRY_DELAY,
};
pub use error::{FahrplanError, Result};
pub use message::{new_task_id, MessageProperties, Signature, TaskMessage};
pub use options::{Expires, PublishOptions, TaskOptions};
pub use queue::{DeliveryDescriptor, DeliveryMode, ExchangeType, HaPolicy, QueueSpec};
pub use state::TaskState;
