use std::collections::BTreeMap;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::Timezone;
use crate::options::TaskOptions;
use crate::queue::{DeliveryMode, ExchangeType, HaPolicy, QueueSpec};

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for an application: broker, routing, publishing,
/// results and the periodic scheduler.
///
/// Keys are flat, as in `fahrplan.toml`. Anything not recognised lands in
/// [`Config::extras`] untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // ── Broker ──
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// Maximum connections held by the pool.
    #[serde(default = "default_broker_pool_limit")]
    pub broker_pool_limit: usize,

    /// Seconds to wait for a pooled connection.
    #[serde(default = "default_broker_connection_timeout")]
    pub broker_connection_timeout: f64,

    /// `None` retries forever.
    #[serde(default = "default_broker_connection_max_retries")]
    pub broker_connection_max_retries: Option<u32>,

    #[serde(default)]
    pub broker_heartbeat: Option<f64>,

    // ── Serialization ──
    #[serde(default = "default_task_serializer")]
    pub task_serializer: String,

    #[serde(default = "default_accept_content")]
    pub accept_content: Vec<String>,

    #[serde(default)]
    pub message_compression: Option<String>,

    // ── Publishing ──
    #[serde(default = "default_true")]
    pub task_publish_retry: bool,

    #[serde(default)]
    pub task_publish_retry_policy: RetryPolicy,

    #[serde(default)]
    pub task_send_sent_event: bool,

    // ── Routing ──
    #[serde(default = "default_queue_name")]
    pub task_default_queue: String,

    /// Defaults to the default queue name when unset.
    #[serde(default)]
    pub task_default_exchange: Option<String>,

    #[serde(default)]
    pub task_default_exchange_type: ExchangeType,

    /// Defaults to the default queue name when unset.
    #[serde(default)]
    pub task_default_routing_key: Option<String>,

    #[serde(default)]
    pub task_default_delivery_mode: DeliveryMode,

    #[serde(default)]
    pub task_queues: Vec<QueueSpec>,

    #[serde(default = "default_true")]
    pub task_create_missing_queues: bool,

    #[serde(default)]
    pub task_queue_ha_policy: Option<HaPolicy>,

    /// Ordered route maps: `task name or glob -> partial options`.
    #[serde(default)]
    pub task_routes: Vec<IndexMap<String, TaskOptions>>,

    /// Ordered annotation maps: `task name or "*" -> option overrides`.
    #[serde(default)]
    pub task_annotations: Vec<IndexMap<String, TaskOptions>>,

    // ── Task defaults ──
    #[serde(default)]
    pub task_track_started: bool,

    #[serde(default)]
    pub task_acks_late: bool,

    #[serde(default)]
    pub task_ignore_result: bool,

    #[serde(default)]
    pub task_store_errors_even_if_ignored: bool,

    #[serde(default)]
    pub task_time_limit: Option<f64>,

    #[serde(default)]
    pub task_soft_time_limit: Option<f64>,

    // ── Results ──
    /// `memory://` or unset (results disabled).
    #[serde(default)]
    pub result_backend: Option<String>,

    /// Seconds a stored result is kept.
    #[serde(default = "default_result_expires")]
    pub result_expires: Option<u64>,

    // ── Time ──
    #[serde(default)]
    pub timezone: Timezone,

    #[serde(default = "default_true")]
    pub enable_utc: bool,

    // ── Beat ──
    #[serde(default)]
    pub beat_schedule: IndexMap<String, BeatEntryConfig>,

    #[serde(default = "default_beat_schedule_filename")]
    pub beat_schedule_filename: String,

    /// Sync after this many dispatched tasks. `0` disables the count trigger.
    #[serde(default)]
    pub beat_sync_every: u32,

    /// Seconds between syncs.
    #[serde(default = "default_beat_sync_interval")]
    pub beat_sync_interval: f64,

    /// Ceiling in seconds on the sleep between ticks.
    #[serde(default = "default_beat_max_loop_interval")]
    pub beat_max_loop_interval: f64,

    /// Unrecognised keys, forwarded opaquely.
    #[serde(flatten)]
    pub extras: BTreeMap<String, toml::Value>,
}

fn default_broker_url() -> String {
    "memory://".into()
}

fn default_broker_pool_limit() -> usize {
    10
}

fn default_broker_connection_timeout() -> f64 {
    4.0
}

fn default_broker_connection_max_retries() -> Option<u32> {
    Some(100)
}

fn default_task_serializer() -> String {
    "json".into()
}

fn default_accept_content() -> Vec<String> {
    vec!["json".into()]
}

fn default_true() -> bool {
    true
}

fn default_queue_name() -> String {
    "fahrplan".into()
}

fn default_result_expires() -> Option<u64> {
    Some(86_400)
}

fn default_beat_schedule_filename() -> String {
    "fahrplan-beat-schedule.json".into()
}

fn default_beat_sync_interval() -> f64 {
    180.0
}

fn default_beat_max_loop_interval() -> f64 {
    300.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            broker_pool_limit: default_broker_pool_limit(),
            broker_connection_timeout: default_broker_connection_timeout(),
            broker_connection_max_retries: default_broker_connection_max_retries(),
            broker_heartbeat: None,
            task_serializer: default_task_serializer(),
            accept_content: default_accept_content(),
            message_compression: None,
            task_publish_retry: true,
            task_publish_retry_policy: RetryPolicy::default(),
            task_send_sent_event: false,
            task_default_queue: default_queue_name(),
            task_default_exchange: None,
            task_default_exchange_type: ExchangeType::Direct,
            task_default_routing_key: None,
            task_default_delivery_mode: DeliveryMode::Persistent,
            task_queues: Vec::new(),
            task_create_missing_queues: true,
            task_queue_ha_policy: None,
            task_routes: Vec::new(),
            task_annotations: Vec::new(),
            task_track_started: false,
            task_acks_late: false,
            task_ignore_result: false,
            task_store_errors_even_if_ignored: false,
            task_time_limit: None,
            task_soft_time_limit: None,
            result_backend: None,
            result_expires: default_result_expires(),
            timezone: Timezone::utc(),
            enable_utc: true,
            beat_schedule: IndexMap::new(),
            beat_schedule_filename: default_beat_schedule_filename(),
            beat_sync_every: 0,
            beat_sync_interval: default_beat_sync_interval(),
            beat_max_loop_interval: default_beat_max_loop_interval(),
            extras: BTreeMap::new(),
        }
    }
}

// ── Publish retry policy ────────────────────────────────────────────

/// Linear backoff for publish retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// `None` retries forever.
    #[serde(default = "default_policy_max_retries")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub interval_start: f64,
    #[serde(default = "default_interval_step")]
    pub interval_step: f64,
    #[serde(default = "default_interval_max")]
    pub interval_max: f64,
}

fn default_policy_max_retries() -> Option<u32> {
    Some(3)
}

fn default_interval_step() -> f64 {
    0.2
}

fn default_interval_max() -> f64 {
    0.2
}

/// Upper bound on any single publish retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_policy_max_retries(),
            interval_start: 0.0,
            interval_step: default_interval_step(),
            interval_max: default_interval_max(),
        }
    }
}

impl RetryPolicy {
    /// Wait before the `attempt`-th retry (1-based):
    /// `min(interval_start + (attempt - 1) * interval_step, interval_max)`.
    pub fn delay_for_retry(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1) as f64;
        let secs = (self.interval_start + steps * self.interval_step).min(self.interval_max);
        Duration::try_from_secs_f64(secs.max(0.0))
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }

    /// Whether another retry is allowed after `attempts` retries so far.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_retries.map_or(true, |max| attempts < max)
    }
}

// ── Beat schedule ───────────────────────────────────────────────────

/// One entry of `beat_schedule`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatEntryConfig {
    pub task: String,
    pub schedule: ScheduleSpec,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub options: TaskOptions,
    /// Round interval schedules to the resolution of `run_every`.
    #[serde(default)]
    pub relative: bool,
}

/// Either a run-every interval in seconds or a crontab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleSpec {
    Every(f64),
    Crontab(CrontabSpec),
}

/// Crontab fields in their textual form (`"*/15"`, `"mon-fri"`, `"0,30"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrontabSpec {
    #[serde(default = "star")]
    pub minute: String,
    #[serde(default = "star")]
    pub hour: String,
    #[serde(default = "star")]
    pub day_of_week: String,
    #[serde(default = "star")]
    pub day_of_month: String,
    #[serde(default = "star")]
    pub month_of_year: String,
}

fn star() -> String {
    "*".into()
}

impl Default for CrontabSpec {
    fn default() -> Self {
        Self {
            minute: star(),
            hour: star(),
            day_of_week: star(),
            day_of_month: star(),
            month_of_year: star(),
        }
    }
}
