use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ── Exchange / delivery enums ───────────────────────────────────────

/// How an exchange matches routing keys against bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Topic,
    Fanout,
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
        })
    }
}

/// Whether the broker keeps a message across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// AMQP numeric code (1 transient, 2 persistent).
    pub fn code(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }
}

/// High-availability policy forwarded to brokers that support mirrored
/// queues: either a policy name (`"all"`) or an explicit node list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HaPolicy {
    Named(String),
    Nodes(Vec<String>),
}

impl HaPolicy {
    /// Queue declaration arguments for this policy.
    pub fn arguments(&self) -> Map<String, Value> {
        let mut args = Map::new();
        match self {
            Self::Named(name) => {
                args.insert("x-ha-policy".into(), json!(name));
            }
            Self::Nodes(nodes) => {
                args.insert("x-ha-policy".into(), json!("nodes"));
                args.insert("x-ha-policy-params".into(), json!(nodes));
            }
        }
        args
    }
}

// ── Queue declaration ───────────────────────────────────────────────

/// A named queue and the exchange binding that feeds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,

    /// Empty until the default exchange is substituted on insertion.
    #[serde(default)]
    pub exchange: String,

    #[serde(default)]
    pub exchange_type: ExchangeType,

    /// Defaults to the queue name when empty.
    #[serde(default)]
    pub routing_key: String,

    #[serde(default = "default_true")]
    pub durable: bool,

    #[serde(default)]
    pub auto_delete: bool,

    #[serde(default)]
    pub ha_policy: Option<HaPolicy>,
}

fn default_true() -> bool {
    true
}

impl QueueSpec {
    /// A durable direct queue bound to an exchange of the same name with
    /// the queue name as routing key.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            exchange: name.clone(),
            routing_key: name.clone(),
            name,
            exchange_type: ExchangeType::Direct,
            durable: true,
            auto_delete: false,
            ha_policy: None,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>, kind: ExchangeType) -> Self {
        self.exchange = exchange.into();
        self.exchange_type = kind;
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    /// Declaration arguments passed to the broker.
    pub fn arguments(&self) -> Map<String, Value> {
        self.ha_policy
            .as_ref()
            .map(HaPolicy::arguments)
            .unwrap_or_default()
    }
}

impl fmt::Display for QueueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ".> {} exchange={}({}) key={}",
            self.name, self.exchange, self.exchange_type, self.routing_key
        )
    }
}

// ── Router output ───────────────────────────────────────────────────

/// Where and how a single task message is delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryDescriptor {
    pub queue: Option<String>,
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    pub delivery_mode: DeliveryMode,
    pub priority: Option<u8>,
    pub serializer: String,
    pub compression: Option<String>,
}
