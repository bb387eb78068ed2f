//! Task dispatch: registry, routing, serialization and publishing of task
//! messages, plus result handles and in-process execution.

pub mod annotations;
pub mod app;
pub mod broker;
pub mod context;
pub mod events;
pub mod execute;
pub mod pool;
pub mod producer;
pub mod queues;
pub mod registry;
pub mod result;
pub mod retry;
pub mod router;
pub mod serialization;
pub mod signals;
pub mod task;

pub use annotations::Annotations;
pub use app::{App, AppBuilder, BACKEND_CLEANUP_TASK};
pub use broker::{
    Broker, MemoryBroker, PublishedMessage, Transport, ZmqBroker, ZmqEnvelope, ZmqHeader,
};
pub use context::{current_app, current_task, push_app, AppGuard, Runtime};
pub use events::TaskSentEvent;
pub use execute::ExecutionReport;
pub use pool::{BrokerFactory, ConnectionPool, PooledConnection, UrlBrokerFactory};
pub use producer::{Producer, ProducerPool};
pub use queues::QueueSet;
pub use registry::{Registry, TaskDescriptor, TaskHandle};
pub use result::{
    AsyncResult, DisabledBackend, EagerResult, GroupResult, MemoryBackend, ResultBackend, TaskMeta,
};
pub use router::{MapRoute, Route, Router};
pub use serialization::{Compression, Serializer};
pub use signals::{ConnectOptions, Signal, Signals};
pub use task::{sync_task_fn, task_fn, RetryRequest, TaskFn, TaskOutcome, TaskRequest};
