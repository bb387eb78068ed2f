//! Monitoring events published next to task messages.

use chrono::{DateTime, Utc};
use fahrplan_core::{
    DeliveryDescriptor, DeliveryMode, ExchangeType, MessageProperties, Result, TaskMessage,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::broker::Broker;

/// Topic exchange carrying monitoring events.
pub const EVENT_EXCHANGE: &str = "fahrplan.events";

pub const TASK_SENT_ROUTING_KEY: &str = "task.sent";

/// Emitted after a task message was published, when
/// `task_send_sent_event` is on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSentEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub uuid: String,
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub retries: u32,
    pub eta: Option<String>,
    pub expires: Option<String>,
    pub queue: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    /// Seconds since the epoch.
    pub timestamp: f64,
}

impl TaskSentEvent {
    pub fn new(message: &TaskMessage, delivery: &DeliveryDescriptor, at: DateTime<Utc>) -> Self {
        Self {
            kind: "task-sent".to_string(),
            uuid: message.id.clone(),
            name: message.task.clone(),
            args: message.args.clone(),
            kwargs: message.kwargs.clone(),
            retries: message.retries,
            eta: message.eta.clone(),
            expires: message.expires.clone(),
            queue: delivery.queue.clone(),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            timestamp: at.timestamp_micros() as f64 / 1e6,
        }
    }
}

/// Declare the event exchange and publish `event` to it.
pub async fn publish_task_sent(broker: &dyn Broker, event: &TaskSentEvent) -> Result<()> {
    broker
        .declare_exchange(EVENT_EXCHANGE, ExchangeType::Topic, true)
        .await?;
    let properties = MessageProperties {
        content_type: "application/json".to_string(),
        content_encoding: "utf-8".to_string(),
        delivery_mode: DeliveryMode::Transient,
        ..MessageProperties::default()
    };
    let body = serde_json::to_vec(event)?;
    broker
        .publish(EVENT_EXCHANGE, TASK_SENT_ROUTING_KEY, body, &properties)
        .await?;
    debug!(task_id = %event.uuid, "task-sent event published");
    Ok(())
}
