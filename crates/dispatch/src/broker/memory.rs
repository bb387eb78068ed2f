use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fahrplan_core::{ExchangeType, FahrplanError, MessageProperties, QueueSpec, Result};
use indexmap::IndexMap;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Broker, Transport};
use crate::serialization::{Compression, Serializer, COMPRESSION_HEADER};

/// One publish as seen by the in-memory broker.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Queues the message was delivered to.
    pub queues: Vec<String>,
}

impl PublishedMessage {
    /// Decode the body, undoing compression, into a JSON value.
    pub fn decoded(&self) -> Result<Value> {
        let raw = match self.properties.headers.get(COMPRESSION_HEADER) {
            Some(Value::String(kind)) => Compression::lookup(kind)?.decompress(&self.body)?,
            _ => self.body.clone(),
        };
        let serializer = Serializer::lookup(&self.properties.content_type).ok_or_else(|| {
            FahrplanError::Security(format!(
                "unknown content type '{}'",
                self.properties.content_type
            ))
        })?;
        serializer.loads(&raw)
    }
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    exchanges: HashMap<String, ExchangeType>,
    bindings: Vec<Binding>,
    queues: IndexMap<String, VecDeque<PublishedMessage>>,
    published: Vec<PublishedMessage>,
    attempts: Vec<Instant>,
    fail_next: u32,
}

/// In-process broker with AMQP-style exchange routing.
///
/// Clones share state, so every pooled connection of an app sees the same
/// queues. Records every publish and can fail the next N publishes with a
/// transient error.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
    transport: Transport,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            transport: Transport::Memory,
        }
    }

    /// Fail the next `n` publish attempts with a connection error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Every successful publish, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// When each publish attempt (failed or not) happened.
    pub fn publish_attempts(&self) -> Vec<Instant> {
        self.lock().attempts.clone()
    }

    /// Remove and return everything waiting in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<PublishedMessage> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }
        let kind = self.exchanges.get(exchange).ok_or_else(|| {
            FahrplanError::ImproperlyConfigured(format!("no exchange '{exchange}' declared"))
        })?;
        let mut targets: Vec<String> = Vec::new();
        for b in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match kind {
                ExchangeType::Direct => b.routing_key == routing_key,
                ExchangeType::Topic => topic_matches(&b.routing_key, routing_key),
                ExchangeType::Fanout => true,
            };
            if hit && !targets.contains(&b.queue) {
                targets.push(b.queue.clone());
            }
        }
        Ok(targets)
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub(crate) fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(p: &[&str], k: &[&str]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&p[1..], k) || (!k.is_empty() && go(p, &k[1..])),
            (Some(&"*"), Some(_)) => go(&p[1..], &k[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &k[1..]),
            _ => false,
        }
    }
    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    go(&p, &k)
}

#[async_trait]
impl Broker for MemoryBroker {
    fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeType, _durable: bool) -> Result<()> {
        self.lock()
            .exchanges
            .entry(name.to_string())
            .or_insert(kind);
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.lock().queues.entry(queue.name.clone()).or_default();
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.lock();
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<()> {
        let mut state = self.lock();
        state.attempts.push(Instant::now());
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(FahrplanError::Connection(
                "memory broker: injected publish failure".into(),
            ));
        }

        let targets = state.route(exchange, routing_key)?;
        let message = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties: properties.clone(),
            queues: targets.clone(),
        };
        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "message unroutable");
        }
        for queue in &targets {
            if let Some(q) = state.queues.get_mut(queue) {
                q.push_back(message.clone());
            }
        }
        trace!(exchange = %exchange, routing_key = %routing_key, queues = ?targets, "published");
        state.published.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> MessageProperties {
        MessageProperties {
            content_type: "application/json".into(),
            content_encoding: "utf-8".into(),
            ..Default::default()
        }
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("task.*", "task.sent"));
        assert!(!topic_matches("task.*", "task.sent.extra"));
        assert!(topic_matches("task.#", "task.sent.extra"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.sent", "task.sent"));
        assert!(!topic_matches("worker.*", "task.sent"));
    }

    #[tokio::test]
    async fn nameless_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueSpec::new("default")).await.unwrap();
        broker.publish("", "default", b"{}".to_vec(), &props()).await.unwrap();
        broker.publish("", "nowhere", b"{}".to_vec(), &props()).await.unwrap();
        assert_eq!(broker.queue_len("default"), 1);
        assert_eq!(broker.published().len(), 2);
        assert!(broker.published()[1].queues.is_empty());
    }

    #[tokio::test]
    async fn direct_and_fanout_exchanges() {
        let broker = MemoryBroker::new();
        for q in ["a", "b"] {
            broker.declare_queue(&QueueSpec::new(q)).await.unwrap();
        }
        broker.declare_exchange("d", ExchangeType::Direct, true).await.unwrap();
        broker.declare_exchange("f", ExchangeType::Fanout, true).await.unwrap();
        broker.bind("a", "d", "key.a").await.unwrap();
        broker.bind("a", "f", "").await.unwrap();
        broker.bind("b", "f", "").await.unwrap();

        broker.publish("d", "key.a", b"1".to_vec(), &props()).await.unwrap();
        broker.publish("f", "ignored", b"2".to_vec(), &props()).await.unwrap();
        assert_eq!(broker.queue_len("a"), 2);
        assert_eq!(broker.drain("b").len(), 1);
        assert_eq!(broker.queue_len("b"), 0);
    }

    #[tokio::test]
    async fn undeclared_exchange_is_rejected() {
        let broker = MemoryBroker::new();
        let err = broker.publish("ghost", "k", Vec::new(), &props()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1);
        let err = broker.publish("", "q", Vec::new(), &props()).await.unwrap_err();
        assert!(err.is_transient());
        broker.publish("", "q", Vec::new(), &props()).await.unwrap();
        assert_eq!(broker.publish_attempts().len(), 2);
        assert_eq!(broker.published().len(), 1);
    }
}
