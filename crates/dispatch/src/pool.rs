//! Bounded pool of broker connections.
//!
//! Acquisition is FIFO-fair (a tokio semaphore) and bounded by a timeout.
//! Released connections go back to an idle list unless they were marked
//! broken or the pool was reset since they were opened.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fahrplan_core::{FahrplanError, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::broker::{Broker, MemoryBroker, Transport, ZmqBroker};

/// Opens new broker connections for the pool.
#[async_trait]
pub trait BrokerFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>>;
}

/// Every connection is a handle on the same in-memory broker.
#[async_trait]
impl BrokerFactory for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        Ok(Arc::new(self.clone()))
    }
}

/// Picks the broker implementation from the URL scheme.
pub struct UrlBrokerFactory {
    transport: Transport,
    memory: MemoryBroker,
}

impl UrlBrokerFactory {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            transport: Transport::parse(url)?,
            memory: MemoryBroker::new(),
        })
    }
}

#[async_trait]
impl BrokerFactory for UrlBrokerFactory {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        match &self.transport {
            Transport::Memory => Ok(Arc::new(self.memory.clone())),
            transport => Ok(Arc::new(ZmqBroker::connect(transport).await?)),
        }
    }
}

pub struct ConnectionPool {
    factory: Arc<dyn BrokerFactory>,
    permits: Arc<Semaphore>,
    limit: usize,
    idle: Mutex<Vec<Arc<dyn Broker>>>,
    generation: AtomicU64,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("limit", &self.limit)
            .field("available", &self.available())
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn BrokerFactory>, limit: usize) -> Arc<Self> {
        let limit = limit.max(1);
        Arc::new(Self {
            factory,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            idle: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// Wait for a free slot, reusing an idle connection when one exists.
    /// Fails with [`FahrplanError::Timeout`] when nothing frees up in time.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection> {
        tokio::time::timeout(timeout, self.acquire_inner())
            .await
            .map_err(|_| FahrplanError::Timeout(timeout))?
    }

    async fn acquire_inner(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FahrplanError::Connection("connection pool closed".into()))?;
        let generation = self.generation.load(Ordering::Acquire);
        let reused = self.lock_idle().pop();
        let broker = match reused {
            Some(broker) => broker,
            None => {
                let broker = self.factory.connect().await?;
                debug!(transport = %broker.transport(), "opened broker connection");
                broker
            }
        };
        Ok(PooledConnection {
            broker,
            pool: Arc::clone(self),
            generation,
            broken: false,
            _permit: permit,
        })
    }

    /// Drop idle connections and disown those currently checked out.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let dropped = std::mem::take(&mut *self.lock_idle()).len();
        info!(dropped, "connection pool reset");
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots not currently checked out.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    fn release(&self, broker: Arc<dyn Broker>, generation: u64) {
        if generation == self.generation.load(Ordering::Acquire) {
            self.lock_idle().push(broker);
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Broker>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A checked-out connection. Returns to the pool on drop.
pub struct PooledConnection {
    broker: Arc<dyn Broker>,
    pool: Arc<ConnectionPool>,
    generation: u64,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("generation", &self.generation)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Do not return this connection to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }
}

impl Deref for PooledConnection {
    type Target = dyn Broker;

    fn deref(&self) -> &Self::Target {
        self.broker.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.broken {
            debug!(transport = %self.broker.transport(), "discarding broken connection");
        } else {
            self.pool.release(self.broker.clone(), self.generation);
        }
    }
}
