//! The set of queues an app knows about.

use std::fmt;
use std::sync::Arc;

use fahrplan_core::{Config, ExchangeType, FahrplanError, HaPolicy, QueueSpec, Result};
use indexmap::{IndexMap, IndexSet};
use tracing::info;

/// Picks the exchange for a queue created on demand.
pub type AutoExchange = Arc<dyn Fn(&str) -> (String, ExchangeType) + Send + Sync>;

/// Auto-created queues are bound to the nameless direct exchange, which
/// routes by queue name.
pub fn default_auto_exchange() -> AutoExchange {
    Arc::new(|_name| (String::new(), ExchangeType::Direct))
}

#[derive(Clone)]
pub struct QueueSet {
    queues: IndexMap<String, QueueSpec>,
    consume_from: Option<IndexSet<String>>,
    default_exchange: Option<(String, ExchangeType)>,
    ha_policy: Option<HaPolicy>,
    create_missing: bool,
    auto_exchange: AutoExchange,
}

impl fmt::Debug for QueueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSet")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("consume_from", &self.consume_from)
            .field("create_missing", &self.create_missing)
            .finish()
    }
}

impl QueueSet {
    pub fn new(create_missing: bool) -> Self {
        Self {
            queues: IndexMap::new(),
            consume_from: None,
            default_exchange: None,
            ha_policy: None,
            create_missing,
            auto_exchange: default_auto_exchange(),
        }
    }

    /// Configured queues plus the default queue.
    pub fn from_config(config: &Config, auto_exchange: AutoExchange) -> Self {
        let mut set = Self {
            default_exchange: config
                .task_default_exchange
                .clone()
                .map(|name| (name, config.task_default_exchange_type)),
            ha_policy: config.task_queue_ha_policy.clone(),
            auto_exchange,
            ..Self::new(config.task_create_missing_queues)
        };
        for spec in &config.task_queues {
            set.add(spec.clone());
        }
        if !set.contains(&config.task_default_queue) {
            set.add(
                QueueSpec::new(config.task_default_queue.clone())
                    .with_exchange(config.default_exchange(), config.task_default_exchange_type)
                    .with_routing_key(config.default_routing_key()),
            );
        }
        set
    }

    pub fn with_default_exchange(mut self, name: impl Into<String>, kind: ExchangeType) -> Self {
        self.default_exchange = Some((name.into(), kind));
        self
    }

    pub fn with_ha_policy(mut self, policy: HaPolicy) -> Self {
        self.ha_policy = Some(policy);
        self
    }

    /// Insert a queue, filling an empty exchange from the default exchange
    /// and an empty routing key from the queue name.
    pub fn add(&mut self, mut spec: QueueSpec) -> &QueueSpec {
        if spec.exchange.is_empty() {
            if let Some((name, kind)) = &self.default_exchange {
                spec.exchange = name.clone();
                spec.exchange_type = *kind;
            }
        }
        if spec.routing_key.is_empty() {
            spec.routing_key = spec.name.clone();
        }
        if spec.ha_policy.is_none() {
            spec.ha_policy = self.ha_policy.clone();
        }
        let name = spec.name.clone();
        self.queues.insert(name.clone(), spec);
        &self.queues[&name]
    }

    pub fn get(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Look a queue up, declaring it on the fly when allowed.
    pub fn get_or_create(&mut self, name: &str) -> Result<QueueSpec> {
        if let Some(spec) = self.queues.get(name) {
            return Ok(spec.clone());
        }
        if !self.create_missing {
            return Err(FahrplanError::QueueNotFound(name.to_string()));
        }
        let (exchange, kind) = (self.auto_exchange)(name);
        info!(queue = %name, exchange = %exchange, "auto-creating queue");
        let spec = QueueSpec::new(name).with_exchange(exchange, kind);
        Ok(self.add(spec).clone())
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueSpec> {
        self.queues.values()
    }

    // ── Consumer selection ──

    /// Restrict consumption to `names`. Unknown names are created (or
    /// rejected) as for routing.
    pub fn select_subset<I, S>(&mut self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut selected = IndexSet::new();
        for name in names {
            let spec = self.get_or_create(name.as_ref())?;
            selected.insert(spec.name);
        }
        self.consume_from = Some(selected);
        Ok(())
    }

    /// Stop consuming from `name`.
    pub fn deselect(&mut self, name: &str) {
        let selected = self
            .consume_from
            .get_or_insert_with(|| self.queues.keys().cloned().collect());
        selected.shift_remove(name);
    }

    /// Queues a consumer would listen on: the selected subset, or all.
    pub fn consume_from(&self) -> Vec<&QueueSpec> {
        match &self.consume_from {
            Some(names) => names.iter().filter_map(|n| self.queues.get(n)).collect(),
            None => self.queues.values().collect(),
        }
    }

    /// One line per consumed queue, sorted by name.
    pub fn format(&self, indent: usize) -> String {
        let mut lines: Vec<String> = self
            .consume_from()
            .into_iter()
            .map(|q| format!("{}{q}", " ".repeat(indent)))
            .collect();
        lines.sort();
        lines.join("\n")
    }
}
