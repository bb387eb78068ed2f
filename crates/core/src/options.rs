//! Task-level defaults and per-call publish options.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::RetryPolicy;
use crate::message::Signature;
use crate::queue::{DeliveryMode, ExchangeType};

/// Partial option set used for task defaults, annotations, route targets
/// and schedule entry options. Every field is optional; layers are merged
/// with [`TaskOptions::fill_from`] and [`TaskOptions::apply`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskOptions {
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub exchange_type: Option<ExchangeType>,
    pub routing_key: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub priority: Option<u8>,
    pub serializer: Option<String>,
    pub compression: Option<String>,
    pub time_limit: Option<f64>,
    pub soft_time_limit: Option<f64>,
    /// Seconds after submission at which the message expires.
    pub expires: Option<f64>,
    pub max_retries: Option<u32>,
    /// Seconds; countdown used by a retry that does not name one.
    pub default_retry_delay: Option<f64>,
    pub ignore_result: Option<bool>,
    pub store_errors_even_if_ignored: Option<bool>,
    pub acks_late: Option<bool>,
    pub track_started: Option<bool>,
    pub trail: Option<bool>,
}

macro_rules! each_option_field {
    ($mac:ident, $a:expr, $b:expr) => {
        $mac!($a, $b, queue);
        $mac!($a, $b, exchange);
        $mac!($a, $b, exchange_type);
        $mac!($a, $b, routing_key);
        $mac!($a, $b, delivery_mode);
        $mac!($a, $b, priority);
        $mac!($a, $b, serializer);
        $mac!($a, $b, compression);
        $mac!($a, $b, time_limit);
        $mac!($a, $b, soft_time_limit);
        $mac!($a, $b, expires);
        $mac!($a, $b, max_retries);
        $mac!($a, $b, default_retry_delay);
        $mac!($a, $b, ignore_result);
        $mac!($a, $b, store_errors_even_if_ignored);
        $mac!($a, $b, acks_late);
        $mac!($a, $b, track_started);
        $mac!($a, $b, trail);
    };
}

macro_rules! fill_field {
    ($dst:expr, $src:expr, $f:ident) => {
        if $dst.$f.is_none() {
            $dst.$f = $src.$f.clone();
        }
    };
}

macro_rules! apply_field {
    ($dst:expr, $src:expr, $f:ident) => {
        if $src.$f.is_some() {
            $dst.$f = $src.$f.clone();
        }
    };
}

impl TaskOptions {
    /// Fill unset fields from a lower-precedence layer.
    pub fn fill_from(&mut self, lower: &TaskOptions) {
        each_option_field!(fill_field, self, lower);
    }

    /// Overwrite fields with every value set in a higher-precedence layer.
    pub fn apply(&mut self, upper: &TaskOptions) {
        each_option_field!(apply_field, self, upper);
    }

    pub fn is_empty(&self) -> bool {
        *self == TaskOptions::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }
}

// ── Per-call options ────────────────────────────────────────────────

/// Expiry given either relative to submission or as an absolute instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expires {
    In(Duration),
    At(DateTime<Utc>),
}

/// Options accepted by `send_task` for a single submission.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub task_id: Option<String>,
    /// Seconds from now; mutually exclusive with `eta`.
    pub countdown: Option<f64>,
    pub eta: Option<DateTime<Utc>>,
    pub expires: Option<Expires>,

    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub exchange_type: Option<ExchangeType>,
    pub routing_key: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub priority: Option<u8>,
    pub serializer: Option<String>,
    pub compression: Option<String>,

    /// Falls back to `task_publish_retry` when unset.
    pub retry: Option<bool>,
    pub retry_policy: Option<RetryPolicy>,

    pub link: Vec<Signature>,
    pub link_error: Vec<Signature>,
    pub group_id: Option<String>,
    pub chord: Option<Signature>,
    pub retries: u32,
    pub time_limit: Option<f64>,
    pub soft_time_limit: Option<f64>,

    pub headers: Map<String, Value>,
    pub reply_to: Option<String>,
    /// Record the result handle as a child of the executing task.
    pub add_to_parent: bool,
    pub connect_timeout: Option<Duration>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            task_id: None,
            countdown: None,
            eta: None,
            expires: None,
            queue: None,
            exchange: None,
            exchange_type: None,
            routing_key: None,
            delivery_mode: None,
            priority: None,
            serializer: None,
            compression: None,
            retry: None,
            retry_policy: None,
            link: Vec::new(),
            link_error: Vec::new(),
            group_id: None,
            chord: None,
            retries: 0,
            time_limit: None,
            soft_time_limit: None,
            headers: Map::new(),
            reply_to: None,
            add_to_parent: true,
            connect_timeout: None,
        }
    }
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn countdown(mut self, secs: f64) -> Self {
        self.countdown = Some(secs);
        self
    }

    pub fn eta(mut self, at: DateTime<Utc>) -> Self {
        self.eta = Some(at);
        self
    }

    pub fn expires(mut self, expires: Expires) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn serializer(mut self, name: impl Into<String>) -> Self {
        self.serializer = Some(name.into());
        self
    }

    pub fn retry(mut self, enabled: bool) -> Self {
        self.retry = Some(enabled);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn link(mut self, sig: Signature) -> Self {
        self.link.push(sig);
        self
    }

    pub fn link_error(mut self, sig: Signature) -> Self {
        self.link_error.push(sig);
        self
    }

    pub fn add_to_parent(mut self, enabled: bool) -> Self {
        self.add_to_parent = enabled;
        self
    }

    /// The routing and encoding overrides carried by this call, as the
    /// highest-precedence layer for the router.
    pub fn overrides(&self) -> TaskOptions {
        TaskOptions {
            queue: self.queue.clone(),
            exchange: self.exchange.clone(),
            exchange_type: self.exchange_type,
            routing_key: self.routing_key.clone(),
            delivery_mode: self.delivery_mode,
            priority: self.priority,
            serializer: self.serializer.clone(),
            compression: self.compression.clone(),
            time_limit: self.time_limit,
            soft_time_limit: self.soft_time_limit,
            ..TaskOptions::default()
        }
    }
}

impl From<&TaskOptions> for PublishOptions {
    fn from(opts: &TaskOptions) -> Self {
        Self {
            queue: opts.queue.clone(),
            exchange: opts.exchange.clone(),
            exchange_type: opts.exchange_type,
            routing_key: opts.routing_key.clone(),
            delivery_mode: opts.delivery_mode,
            priority: opts.priority,
            serializer: opts.serializer.clone(),
            compression: opts.compression.clone(),
            time_limit: opts.time_limit,
            soft_time_limit: opts.soft_time_limit,
            expires: opts
                .expires
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(|secs| Expires::In(Duration::from_secs_f64(secs))),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_keeps_existing_values() {
        let mut upper = TaskOptions::default().queue("fast");
        let lower = TaskOptions {
            queue: Some("slow".into()),
            priority: Some(5),
            ..Default::default()
        };
        upper.fill_from(&lower);
        assert_eq!(upper.queue.as_deref(), Some("fast"));
        assert_eq!(upper.priority, Some(5));
    }

    #[test]
    fn apply_overwrites_set_values_only() {
        let mut base = TaskOptions {
            queue: Some("a".into()),
            max_retries: Some(3),
            ..Default::default()
        };
        base.apply(&TaskOptions {
            max_retries: Some(10),
            ..Default::default()
        });
        assert_eq!(base.queue.as_deref(), Some("a"));
        assert_eq!(base.max_retries, Some(10));
    }

    #[test]
    fn unknown_option_is_rejected() {
        let err = toml::from_str::<TaskOptions>("qeueu = \"typo\"").unwrap_err();
        assert!(err.to_string().contains("qeueu"));
    }

    #[test]
    fn entry_options_convert_expiry() {
        let opts = TaskOptions {
            queue: Some("beat".into()),
            expires: Some(30.0),
            ..Default::default()
        };
        let publish = PublishOptions::from(&opts);
        assert_eq!(publish.queue.as_deref(), Some("beat"));
        assert_eq!(publish.expires, Some(Expires::In(Duration::from_secs(30))));
        assert!(publish.add_to_parent);
    }
}
