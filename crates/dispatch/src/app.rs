//! The application root: configuration, registry, routing, pools, signals.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use fahrplan_core::{
    Clock, Config, ConfigBuilder, ExchangeType, FahrplanError, PublishOptions, QueueSpec, Result,
    SystemClock, TaskOptions,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::annotations::Annotations;
use crate::broker::{declare_queue_binding, Broker, MemoryBroker};
use crate::context::{current_task, Runtime};
use crate::pool::{BrokerFactory, ConnectionPool, PooledConnection, UrlBrokerFactory};
use crate::producer::ProducerPool;
use crate::queues::{default_auto_exchange, AutoExchange, QueueSet};
use crate::registry::{Binder, Registry, TaskDescriptor, TaskHandle};
use crate::result::{AsyncResult, DisabledBackend, MemoryBackend, ResultBackend};
use crate::router::{Route, Router};
use crate::signals::{AfterFork, AppFinalized, Signals};
use crate::task::{sync_task_fn, task_fn, TaskOutcome, TaskRequest};

/// Name of the built-in task that purges expired results.
pub const BACKEND_CLEANUP_TASK: &str = "fahrplan.backend_cleanup";

enum ConfState {
    Pending(ConfigBuilder),
    Ready(Arc<Config>),
}

pub(crate) struct AppInner {
    name: String,
    conf: Mutex<ConfState>,
    clock: Arc<dyn Clock>,
    registry: Registry,
    signals: Arc<Signals>,
    broker_factory: Option<Arc<dyn BrokerFactory>>,
    backend_override: Option<Arc<dyn ResultBackend>>,
    extra_routes: Vec<Arc<dyn Route>>,
    auto_exchange: AutoExchange,

    router: Mutex<Option<Arc<Router>>>,
    backend: Mutex<Option<Arc<dyn ResultBackend>>>,
    connections: Connections,

    finalize_lock: Mutex<()>,
    finalized: AtomicBool,
}

/// Broker pool plus the declarations made over it.
#[derive(Default)]
pub(crate) struct Connections {
    pool: Mutex<Option<Arc<ConnectionPool>>>,
    declared: Mutex<HashSet<String>>,
}

/// Cheap, clonable handle on an application.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
    /// Set on handles from [`App::with_own_connections`].
    own: Option<Arc<Connections>>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.inner.name)
            .field("tasks", &self.inner.registry.len())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::default()
    }

    /// An app configured from defaults and the environment.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder().name(name).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn downgrade(&self) -> Weak<AppInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<AppInner>) -> Option<App> {
        weak.upgrade().map(|inner| App { inner, own: None })
    }

    /// A handle on the same app (configuration, registry, signals, router
    /// and backend) that opens its own broker connections. Use it for
    /// work running on another thread or runtime of this process.
    pub fn with_own_connections(&self) -> App {
        App {
            inner: self.inner.clone(),
            own: Some(Arc::new(Connections::default())),
        }
    }

    fn connections(&self) -> &Connections {
        self.own.as_deref().unwrap_or(&self.inner.connections)
    }

    /// Make this the runtime's fallback app.
    pub fn set_current(&self) {
        Runtime::global().set_default_app(self.clone());
    }

    // ── Configuration ──

    /// Resolved configuration. The layers are merged on first call.
    pub fn conf(&self) -> Result<Arc<Config>> {
        let mut state = lock(&self.inner.conf);
        match &*state {
            ConfState::Ready(conf) => Ok(conf.clone()),
            ConfState::Pending(builder) => {
                let conf = Arc::new(builder.clone().build()?);
                debug!(app = %self.inner.name, broker = %conf.redacted_broker_url(), "configuration resolved");
                *state = ConfState::Ready(conf.clone());
                Ok(conf)
            }
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.clock.now()
    }

    pub fn signals(&self) -> &Arc<Signals> {
        &self.inner.signals
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    // ── Tasks ──

    pub fn register(&self, desc: TaskDescriptor) -> TaskHandle {
        let desc = self.inner.registry.register(desc);
        TaskHandle::new(desc.name())
    }

    /// Register an async task body.
    pub fn task<F, Fut>(&self, name: &str, f: F) -> TaskHandle
    where
        F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        self.register(TaskDescriptor::new(name, task_fn(f)))
    }

    /// Register a synchronous task body.
    pub fn task_sync<F>(&self, name: &str, f: F) -> TaskHandle
    where
        F: Fn(&TaskRequest) -> TaskOutcome + Send + Sync + 'static,
    {
        self.register(TaskDescriptor::new(name, sync_task_fn(f)))
    }

    /// Look a task up, finalizing first.
    pub fn get_task(&self, name: &str) -> Result<Arc<TaskDescriptor>> {
        self.finalize()?;
        self.inner.registry.get(name)
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::Acquire)
    }

    /// Bind every registered task to this app's defaults and annotations.
    /// Only the first call does the work; concurrent callers wait for it.
    pub fn finalize(&self) -> Result<()> {
        if self.is_finalized() {
            return Ok(());
        }
        let _guard = lock(&self.inner.finalize_lock);
        if self.is_finalized() {
            return Ok(());
        }
        let conf = self.conf()?;
        let binder = task_binder(&conf);

        let bound = Runtime::global().with_shared_tasks(|ctors| {
            for ctor in ctors {
                self.register(ctor(self));
            }
            let bound = self.inner.registry.finalize(binder);
            self.inner.finalized.store(true, Ordering::Release);
            bound
        });

        let tasks = self.inner.registry.len();
        info!(app = %self.inner.name, tasks, bound, "app finalized");
        self.inner
            .signals
            .app_finalized
            .send(&self.inner.name, &AppFinalized { tasks });
        Ok(())
    }

    // ── Routing and results ──

    pub fn router(&self) -> Result<Arc<Router>> {
        let mut slot = lock(&self.inner.router);
        if let Some(router) = &*slot {
            return Ok(router.clone());
        }
        let conf = self.conf()?;
        let queues = QueueSet::from_config(&conf, self.inner.auto_exchange.clone());
        let router = Arc::new(Router::new(conf, queues, self.inner.extra_routes.clone()));
        *slot = Some(router.clone());
        Ok(router)
    }

    /// The result backend named by `result_backend`. Unset disables
    /// results; only `memory://` is built in.
    pub fn backend(&self) -> Result<Arc<dyn ResultBackend>> {
        let mut slot = lock(&self.inner.backend);
        if let Some(backend) = &*slot {
            return Ok(backend.clone());
        }
        let backend: Arc<dyn ResultBackend> = match &self.inner.backend_override {
            Some(backend) => backend.clone(),
            None => {
                let conf = self.conf()?;
                match conf.result_backend.as_deref() {
                    None => Arc::new(DisabledBackend),
                    Some(url) if url.starts_with("memory://") => {
                        let expires = conf.result_expires.map(std::time::Duration::from_secs);
                        Arc::new(MemoryBackend::new(self.inner.clock.clone(), expires))
                    }
                    Some(url) => {
                        return Err(FahrplanError::ImproperlyConfigured(format!(
                            "unsupported result backend '{url}'"
                        )))
                    }
                }
            }
        };
        *slot = Some(backend.clone());
        Ok(backend)
    }

    // ── Connections ──

    pub fn pool(&self) -> Result<Arc<ConnectionPool>> {
        let mut slot = lock(&self.connections().pool);
        if let Some(pool) = &*slot {
            return Ok(pool.clone());
        }
        let conf = self.conf()?;
        let factory: Arc<dyn BrokerFactory> = match &self.inner.broker_factory {
            Some(factory) => factory.clone(),
            None => Arc::new(UrlBrokerFactory::new(&conf.broker_url)?),
        };
        let pool = ConnectionPool::new(factory, conf.broker_pool_limit);
        *slot = Some(pool.clone());
        Ok(pool)
    }

    /// Check out a broker connection, waiting at most
    /// `broker_connection_timeout`.
    pub async fn connection(&self) -> Result<PooledConnection> {
        let timeout = self.conf()?.connection_timeout();
        self.pool()?.acquire(timeout).await
    }

    pub fn producer_pool(&self) -> ProducerPool {
        ProducerPool::new(self.clone())
    }

    /// Declare `queue` (exchange, queue, binding) once per connection
    /// lifetime of this app.
    pub(crate) async fn ensure_queue(&self, broker: &dyn Broker, queue: &QueueSpec) -> Result<()> {
        let key = format!("queue:{}", queue.name);
        if lock(&self.connections().declared).contains(&key) {
            return Ok(());
        }
        declare_queue_binding(broker, queue).await?;
        lock(&self.connections().declared).insert(key);
        Ok(())
    }

    pub(crate) async fn ensure_exchange(
        &self,
        broker: &dyn Broker,
        exchange: &str,
        kind: ExchangeType,
    ) -> Result<()> {
        if exchange.is_empty() {
            return Ok(());
        }
        let key = format!("exchange:{exchange}");
        if lock(&self.connections().declared).contains(&key) {
            return Ok(());
        }
        broker.declare_exchange(exchange, kind, true).await?;
        lock(&self.connections().declared).insert(key);
        Ok(())
    }

    pub(crate) fn forget_declarations(&self) {
        lock(&self.connections().declared).clear();
    }

    /// Drop this handle's pooled connections and forget its declarations;
    /// they are re-established lazily.
    pub fn after_fork(&self) {
        if let Some(pool) = &*lock(&self.connections().pool) {
            pool.reset();
        }
        self.forget_declarations();
        self.inner.signals.after_fork.send(&self.inner.name, &AfterFork);
    }

    // ── Dispatch ──

    /// Route, encode and publish a task by name.
    ///
    /// `args` must be an array (or null) and `kwargs` an object (or null).
    /// The task does not have to be registered here. When called from
    /// inside an executing task the returned handle records that task as
    /// its parent, and with `add_to_parent` it is also recorded as a child.
    pub async fn send_task(
        &self,
        name: &str,
        args: Value,
        kwargs: Value,
        options: PublishOptions,
    ) -> Result<AsyncResult> {
        let (args, kwargs) = call_args(args, kwargs)?;
        self.send_task_parts(name, args, kwargs, options).await
    }

    pub(crate) async fn send_task_parts(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: PublishOptions,
    ) -> Result<AsyncResult> {
        self.finalize()?;
        let add_to_parent = options.add_to_parent;
        let parent = current_task();

        let producer = self.producer_pool().acquire();
        let task_id = producer.publish_task(name, args, kwargs, options).await?;

        let backend = self.backend()?;
        let mut result = AsyncResult::new(task_id, backend.clone());
        if let Some(parent) = parent {
            result = result.with_parent(AsyncResult::new(parent.id.clone(), backend));
            if add_to_parent {
                parent.add_child(result.clone());
            }
        }
        Ok(result)
    }
}

/// Split loosely typed call arguments into positional and keyword parts.
pub(crate) fn call_args(args: Value, kwargs: Value) -> Result<(Vec<Value>, Map<String, Value>)> {
    let args = match args {
        Value::Array(args) => args,
        Value::Null => Vec::new(),
        other => {
            return Err(FahrplanError::InvalidTask(format!(
                "args must be a list, got {other}"
            )))
        }
    };
    let kwargs = match kwargs {
        Value::Object(kwargs) => kwargs,
        Value::Null => Map::new(),
        other => {
            return Err(FahrplanError::InvalidTask(format!(
                "kwargs must be a mapping, got {other}"
            )))
        }
    };
    Ok((args, kwargs))
}

/// Options every task is bound with: declared options, then annotations
/// over them, then app-wide defaults for whatever is still unset.
fn task_binder(conf: &Config) -> Binder {
    let annotations = Annotations::new(conf.task_annotations.clone());
    let defaults = TaskOptions {
        track_started: Some(conf.task_track_started),
        acks_late: Some(conf.task_acks_late),
        ignore_result: Some(conf.task_ignore_result),
        store_errors_even_if_ignored: Some(conf.task_store_errors_even_if_ignored),
        time_limit: conf.task_time_limit,
        soft_time_limit: conf.task_soft_time_limit,
        ..TaskOptions::default()
    };
    Arc::new(move |desc: &TaskDescriptor| {
        let mut opts = desc.options().clone();
        annotations.annotate(desc.name(), &mut opts);
        opts.fill_from(&defaults);
        opts
    })
}

fn backend_cleanup_task(app: Weak<AppInner>) -> TaskDescriptor {
    let body = task_fn(move |_req: TaskRequest| {
        let app = App::upgrade(&app);
        async move {
            let Some(app) = app else {
                return TaskOutcome::fail("app is gone");
            };
            let backend = match app.backend() {
                Ok(backend) => backend,
                Err(e) => return TaskOutcome::fail(e.to_string()),
            };
            match backend.cleanup().await {
                Ok(removed) => TaskOutcome::ok(json!(removed)),
                Err(e) => TaskOutcome::fail(e.to_string()),
            }
        }
    });
    TaskDescriptor::new(BACKEND_CLEANUP_TASK, body).with_options(TaskOptions {
        ignore_result: Some(true),
        ..TaskOptions::default()
    })
}

// ── Builder ─────────────────────────────────────────────────────────

pub struct AppBuilder {
    name: String,
    config: ConfState,
    clock: Option<Arc<dyn Clock>>,
    broker_factory: Option<Arc<dyn BrokerFactory>>,
    backend: Option<Arc<dyn ResultBackend>>,
    routes: Vec<Arc<dyn Route>>,
    signals: Option<Arc<Signals>>,
    auto_exchange: AutoExchange,
    set_as_current: bool,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self {
            name: "fahrplan".to_string(),
            config: ConfState::Pending(ConfigBuilder::new()),
            clock: None,
            broker_factory: None,
            backend: None,
            routes: Vec::new(),
            signals: None,
            auto_exchange: default_auto_exchange(),
            set_as_current: false,
        }
    }
}

impl AppBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Use an already resolved configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = ConfState::Ready(Arc::new(config));
        self
    }

    /// Resolve configuration lazily from these layers.
    pub fn config_builder(mut self, builder: ConfigBuilder) -> Self {
        self.config = ConfState::Pending(builder);
        self
    }

    /// Override one key above every other layer. Has no effect after
    /// [`AppBuilder::config`].
    pub fn preconf(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        if let ConfState::Pending(builder) = self.config {
            self.config = ConfState::Pending(builder.preconf(key, value));
        }
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Publish into this in-memory broker regardless of `broker_url`.
    pub fn broker(mut self, broker: MemoryBroker) -> Self {
        self.broker_factory = Some(Arc::new(broker));
        self
    }

    pub fn broker_factory(mut self, factory: Arc<dyn BrokerFactory>) -> Self {
        self.broker_factory = Some(factory);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ResultBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Append a routing rule after the configured route maps.
    pub fn route(mut self, route: Arc<dyn Route>) -> Self {
        self.routes.push(route);
        self
    }

    /// Share a signal catalogue with other apps.
    pub fn signals(mut self, signals: Arc<Signals>) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn auto_exchange(mut self, factory: AutoExchange) -> Self {
        self.auto_exchange = factory;
        self
    }

    pub fn set_as_current(mut self) -> Self {
        self.set_as_current = true;
        self
    }

    pub fn build(self) -> App {
        let inner = Arc::new_cyclic(|weak: &Weak<AppInner>| {
            let registry = Registry::new();
            registry.register(backend_cleanup_task(weak.clone()));
            AppInner {
                name: self.name,
                conf: Mutex::new(self.config),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
                registry,
                signals: self.signals.unwrap_or_default(),
                broker_factory: self.broker_factory,
                backend_override: self.backend,
                extra_routes: self.routes,
                auto_exchange: self.auto_exchange,
                router: Mutex::new(None),
                backend: Mutex::new(None),
                connections: Connections::default(),
                finalize_lock: Mutex::new(()),
                finalized: AtomicBool::new(false),
            }
        });
        let app = App { inner, own: None };
        Runtime::global().register_app(&app);
        if self.set_as_current {
            app.set_current();
        }
        debug!(app = %app.name(), "app created");
        app
    }
}

#[cfg(test)]
mod tests;
