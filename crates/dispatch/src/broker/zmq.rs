use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use fahrplan_core::{ExchangeType, FahrplanError, MessageProperties, QueueSpec, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use zeromq::prelude::*;
use zeromq::{PubSocket, ZmqMessage};

use super::{Broker, Transport};
use crate::serialization::{Compression, Serializer, COMPRESSION_HEADER};

/// Task messages over a ZeroMQ PUB socket.
///
/// ZeroMQ keeps no exchanges or queues, so each message carries its own
/// routing metadata. Frames on the wire, see [`ZmqEnvelope`]:
///
/// | frame | content |
/// |---|---|
/// | 0 | topic: the exchange name for fanout exchanges, else the routing key |
/// | 1 | JSON [`ZmqHeader`] |
/// | 2 | encoded (possibly compressed) body |
///
/// Subscribers filter on the topic prefix, so a SUB socket subscribed to a
/// queue's routing key sees exactly what a direct binding would deliver.
pub struct ZmqBroker {
    socket: tokio::sync::Mutex<PubSocket>,
    transport: Transport,
    /// Exchange kinds declared on this connection.
    exchanges: Mutex<HashMap<String, ExchangeType>>,
}

fn zmq_err(err: zeromq::ZmqError) -> FahrplanError {
    FahrplanError::Connection(err.to_string())
}

impl ZmqBroker {
    /// Connect to an endpoint where a forwarder or a consumer's SUB socket
    /// is bound.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self> {
        let mut socket = PubSocket::new();
        socket
            .connect(&transport.endpoint())
            .await
            .map_err(zmq_err)?;
        info!("zmq broker connected");
        Ok(Self::with_socket(socket, transport))
    }

    /// Bind the PUB side; consumers connect to it.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self> {
        let mut socket = PubSocket::new();
        socket.bind(&transport.endpoint()).await.map_err(zmq_err)?;
        info!("zmq broker bound");
        Ok(Self::with_socket(socket, transport))
    }

    fn with_socket(socket: PubSocket, transport: &Transport) -> Self {
        Self {
            socket: tokio::sync::Mutex::new(socket),
            transport: transport.clone(),
            exchanges: Mutex::new(HashMap::new()),
        }
    }

    fn exchange_type(&self, exchange: &str) -> ExchangeType {
        self.exchanges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(exchange)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for ZmqBroker {
    fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeType, _durable: bool) -> Result<()> {
        let previous = self
            .exchanges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), kind);
        if let Some(previous) = previous.filter(|p| *p != kind) {
            warn!(exchange = %name, %previous, %kind, "zmq: exchange redeclared with another type");
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        debug!(queue = %queue.name, routing_key = %queue.routing_key, "zmq: queue is a topic filter");
        Ok(())
    }

    async fn bind(&self, _queue: &str, _exchange: &str, _routing_key: &str) -> Result<()> {
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &MessageProperties,
    ) -> Result<()> {
        let envelope = ZmqEnvelope {
            header: ZmqHeader {
                exchange: exchange.to_string(),
                exchange_type: self.exchange_type(exchange),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
            },
            body,
        };
        let topic = envelope.topic().to_string();
        let frames = envelope.into_message()?;

        self.socket.lock().await.send(frames).await.map_err(zmq_err)?;
        debug!(exchange, routing_key, topic = %topic, "zmq: published");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!(endpoint = %self.transport, "zmq: closing");
        Ok(())
    }
}

// ── Envelope ──

/// Routing metadata sent ahead of every body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZmqHeader {
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    pub properties: MessageProperties,
}

/// One task message as carried over ZeroMQ.
#[derive(Debug, Clone, PartialEq)]
pub struct ZmqEnvelope {
    pub header: ZmqHeader,
    pub body: Vec<u8>,
}

impl ZmqEnvelope {
    /// The subscription topic this envelope is published under.
    pub fn topic(&self) -> &str {
        match self.header.exchange_type {
            ExchangeType::Fanout => &self.header.exchange,
            ExchangeType::Direct | ExchangeType::Topic => &self.header.routing_key,
        }
    }

    pub fn into_message(self) -> Result<ZmqMessage> {
        let mut frames = ZmqMessage::from(self.topic().to_string());
        frames.push_back(serde_json::to_vec(&self.header)?.into());
        frames.push_back(self.body.into());
        Ok(frames)
    }

    /// Parse the three frames written by [`ZmqBroker`].
    pub fn from_message(message: &ZmqMessage) -> Result<Self> {
        let frames: Vec<_> = message.iter().collect();
        let [_, header, body] = frames.as_slice() else {
            return Err(FahrplanError::InvalidTask(format!(
                "expected 3 zmq frames, got {}",
                frames.len()
            )));
        };
        Ok(Self {
            header: serde_json::from_slice(header)?,
            body: body.to_vec(),
        })
    }

    /// The body with any compression named in the headers undone.
    pub fn decompressed_body(&self) -> Result<Vec<u8>> {
        match self.header.properties.headers.get(COMPRESSION_HEADER) {
            Some(name) => {
                let name = name.as_str().unwrap_or_default();
                Compression::lookup(name)?.decompress(&self.body)
            }
            None => Ok(self.body.clone()),
        }
    }

    /// Decode the body with the serializer named by its content type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let content_type = &self.header.properties.content_type;
        let serializer = Serializer::lookup(content_type).ok_or_else(|| {
            FahrplanError::Security(format!("unknown content type '{content_type}'"))
        })?;
        serializer.loads(&self.decompressed_body()?)
    }
}
