//! Resolve a task invocation to a delivery descriptor.
//!
//! Each field comes from the first layer that sets it:
//! call overrides, annotations, the first matching route rule, task
//! defaults, then the app defaults.

use std::fmt;
use std::sync::{Arc, Mutex};

use fahrplan_core::{Config, DeliveryDescriptor, QueueSpec, Result, TaskOptions};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::annotations::{glob_match, Annotations};
use crate::queues::QueueSet;

/// A routing rule. Returns the partial options for tasks it claims.
pub trait Route: Send + Sync {
    fn route_for_task(
        &self,
        task: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Option<TaskOptions>;
}

impl<F> Route for F
where
    F: Fn(&str, &[Value], &Map<String, Value>) -> Option<TaskOptions> + Send + Sync,
{
    fn route_for_task(
        &self,
        task: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Option<TaskOptions> {
        self(task, args, kwargs)
    }
}

/// Route rule backed by a `name or glob -> options` map. Exact names win
/// over globs; among globs the first in map order wins.
#[derive(Debug, Clone, Default)]
pub struct MapRoute {
    map: IndexMap<String, TaskOptions>,
}

impl MapRoute {
    pub fn new(map: IndexMap<String, TaskOptions>) -> Self {
        Self { map }
    }
}

impl Route for MapRoute {
    fn route_for_task(
        &self,
        task: &str,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> Option<TaskOptions> {
        if let Some(exact) = self.map.get(task) {
            return Some(exact.clone());
        }
        self.map
            .iter()
            .find(|(pattern, _)| glob_match(pattern, task))
            .map(|(_, opts)| opts.clone())
    }
}

pub struct Router {
    routes: Vec<Arc<dyn Route>>,
    annotations: Annotations,
    queues: Mutex<QueueSet>,
    config: Arc<Config>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .field("annotations", &self.annotations)
            .finish()
    }
}

impl Router {
    /// Router over the configured route maps, followed by `extra` rules.
    pub fn new(config: Arc<Config>, queues: QueueSet, extra: Vec<Arc<dyn Route>>) -> Self {
        let mut routes: Vec<Arc<dyn Route>> = config
            .task_routes
            .iter()
            .map(|map| Arc::new(MapRoute::new(map.clone())) as Arc<dyn Route>)
            .collect();
        routes.extend(extra);
        Self {
            routes,
            annotations: Annotations::new(config.task_annotations.clone()),
            queues: Mutex::new(queues),
            config,
        }
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Snapshot of the queue set, including queues created while routing.
    pub fn queues(&self) -> QueueSet {
        self.lock_queues().clone()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.lock_queues().get(name).cloned()
    }

    /// Options from the first rule that claims `task`.
    pub fn rule_for(
        &self,
        task: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Option<TaskOptions> {
        self.routes
            .iter()
            .find_map(|route| route.route_for_task(task, args, kwargs))
    }

    pub fn route(
        &self,
        overrides: &TaskOptions,
        task_defaults: Option<&TaskOptions>,
        task: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<DeliveryDescriptor> {
        let mut opts = overrides.clone();
        opts.fill_from(&self.annotations.resolve(task));
        if let Some(rule) = self.rule_for(task, args, kwargs) {
            opts.fill_from(&rule);
        }
        if let Some(defaults) = task_defaults {
            opts.fill_from(defaults);
        }

        let conf = &self.config;
        let (queue, exchange, exchange_type, routing_key) = match (&opts.queue, &opts.exchange) {
            (Some(name), _) => self.through_queue(name, &opts)?,
            (None, None) => self.through_queue(&conf.task_default_queue, &opts)?,
            (None, Some(exchange)) => (
                None,
                exchange.clone(),
                opts.exchange_type.unwrap_or(conf.task_default_exchange_type),
                opts.routing_key
                    .clone()
                    .unwrap_or_else(|| conf.default_routing_key().to_string()),
            ),
        };

        let descriptor = DeliveryDescriptor {
            queue,
            exchange,
            exchange_type,
            routing_key,
            delivery_mode: opts.delivery_mode.unwrap_or(conf.task_default_delivery_mode),
            priority: opts.priority,
            serializer: opts
                .serializer
                .clone()
                .unwrap_or_else(|| conf.task_serializer.clone()),
            compression: opts.compression.clone().or_else(|| conf.message_compression.clone()),
        };
        debug!(
            task = %task,
            queue = ?descriptor.queue,
            exchange = %descriptor.exchange,
            routing_key = %descriptor.routing_key,
            "routed task"
        );
        Ok(descriptor)
    }

    fn through_queue(
        &self,
        name: &str,
        opts: &TaskOptions,
    ) -> Result<(Option<String>, String, fahrplan_core::ExchangeType, String)> {
        let spec = self.lock_queues().get_or_create(name)?;
        Ok((
            Some(spec.name),
            opts.exchange.clone().unwrap_or(spec.exchange),
            opts.exchange_type.unwrap_or(spec.exchange_type),
            opts.routing_key.clone().unwrap_or(spec.routing_key),
        ))
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, QueueSet> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}
