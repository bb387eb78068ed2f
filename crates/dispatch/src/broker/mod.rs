//! Broker seam: declare exchanges and queues, bind them, publish bodies.
//!
//! [`MemoryBroker`] routes in-process and backs `memory://`. [`ZmqBroker`]
//! publishes over a ZeroMQ PUB socket for `tcp://` and `ipc://` URLs.

mod memory;
mod transport;
mod zmq;

use std::sync::Arc;

use async_trait::async_trait;
use fahrplan_core::{ExchangeType, MessageProperties, QueueSpec, Result};

pub use memory::{MemoryBroker, PublishedMessage};
pub use transport::Transport;
pub use zmq::{ZmqBroker, ZmqEnvelope, ZmqHeader};

/// A live connection to a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Where this connection points, for logs.
    fn transport(&self) -> &Transport;

    async fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Hand one encoded body to the broker. The nameless exchange `""`
    /// delivers straight to the queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Blanket implementation so `Arc<dyn Broker>` can be used directly.
#[async_trait]
impl<T: Broker + ?Sized> Broker for Arc<T> {
    fn transport(&self) -> &Transport {
        (**self).transport()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()> {
        (**self).declare_exchange(name, kind, durable).await
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        (**self).declare_queue(queue).await
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        (**self).bind(queue, exchange, routing_key).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<()> {
        (**self).publish(exchange, routing_key, body, properties).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

/// Declare a queue, its exchange and the binding between them.
pub async fn declare_queue_binding(broker: &dyn Broker, queue: &QueueSpec) -> Result<()> {
    if !queue.exchange.is_empty() {
        broker
            .declare_exchange(&queue.exchange, queue.exchange_type, queue.durable)
            .await?;
    }
    broker.declare_queue(queue).await?;
    if !queue.exchange.is_empty() {
        broker
            .bind(&queue.name, &queue.exchange, &queue.routing_key)
            .await?;
    }
    Ok(())
}
