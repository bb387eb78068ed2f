//! Task registry: name -> descriptor.
//!
//! Mutations are serialized by one mutex. Every mutation publishes a fresh
//! immutable snapshot, so lookups only clone an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use fahrplan_core::{FahrplanError, Result, TaskOptions};
use tracing::debug;

use crate::task::TaskFn;

/// Retry limit when neither the task nor an annotation sets one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Seconds between retries when neither the task nor the retry sets one.
pub const DEFAULT_RETRY_DELAY: f64 = 180.0;

/// A named task body with its declared options.
pub struct TaskDescriptor {
    name: String,
    callable: TaskFn,
    options: TaskOptions,
    bound: OnceLock<TaskOptions>,
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("bound", &self.bound.get().is_some())
            .finish()
    }
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, callable: TaskFn) -> Self {
        Self {
            name: name.into(),
            callable,
            options: TaskOptions::default(),
            bound: OnceLock::new(),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn callable(&self) -> &TaskFn {
        &self.callable
    }

    /// Options as declared at registration.
    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    /// Options after binding: annotations and app defaults applied.
    /// Falls back to the declared options while unbound.
    pub fn resolved_options(&self) -> &TaskOptions {
        self.bound.get().unwrap_or(&self.options)
    }

    pub fn is_bound(&self) -> bool {
        self.bound.get().is_some()
    }

    pub fn max_retries(&self) -> u32 {
        self.resolved_options()
            .max_retries
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn default_retry_delay(&self) -> f64 {
        self.resolved_options()
            .default_retry_delay
            .unwrap_or(DEFAULT_RETRY_DELAY)
    }

    fn bind(&self, options: TaskOptions) -> bool {
        self.bound.set(options).is_ok()
    }

    fn same_body(&self, other: &TaskDescriptor) -> bool {
        Arc::ptr_eq(&self.callable, &other.callable) && self.options == other.options
    }
}

/// Opaque handle returned from registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    name: String,
}

impl TaskHandle {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Computes a descriptor's bound options.
pub type Binder = Arc<dyn Fn(&TaskDescriptor) -> TaskOptions + Send + Sync>;

type Snapshot = Arc<HashMap<String, Arc<TaskDescriptor>>>;

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<String, Arc<TaskDescriptor>>,
    pending: Vec<String>,
    binder: Option<Binder>,
}

#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
    snapshot: RwLock<Snapshot>,
    binds: AtomicUsize,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.len())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor and return the canonical instance.
    ///
    /// Same name with the same body is a no-op; a different body replaces
    /// the old one. After [`Registry::finalize`] new descriptors are bound
    /// immediately, before that they wait in the pending list.
    pub fn register(&self, desc: TaskDescriptor) -> Arc<TaskDescriptor> {
        let mut state = self.lock_state();
        if let Some(existing) = state.tasks.get(desc.name()) {
            if existing.same_body(&desc) {
                return existing.clone();
            }
            debug!(task = %desc.name(), "replacing registered task");
        }

        let desc = Arc::new(desc);
        state.tasks.insert(desc.name().to_string(), desc.clone());
        match state.binder.clone() {
            Some(binder) => self.bind(&desc, &binder),
            None => state.pending.push(desc.name().to_string()),
        }
        self.publish(&state);
        desc
    }

    /// Bind every pending descriptor and switch to immediate binding.
    /// Only the first call does anything; returns how many were bound.
    pub fn finalize(&self, binder: Binder) -> usize {
        let mut state = self.lock_state();
        if state.binder.is_some() {
            return 0;
        }
        let before = self.bind_count();
        let pending = std::mem::take(&mut state.pending);
        for name in pending {
            if let Some(desc) = state.tasks.get(&name).cloned() {
                self.bind(&desc, &binder);
            }
        }
        state.binder = Some(binder);
        self.publish(&state);
        self.bind_count() - before
    }

    pub fn get(&self, name: &str) -> Result<Arc<TaskDescriptor>> {
        self.lookup(name)
            .ok_or_else(|| FahrplanError::NotRegistered(name.to_string()))
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<TaskDescriptor>> {
        self.current().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.current().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.current().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finalized(&self) -> bool {
        self.lock_state().binder.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Total successful binds over the registry's lifetime.
    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::Acquire)
    }

    fn bind(&self, desc: &TaskDescriptor, binder: &Binder) {
        if desc.bind(binder(desc)) {
            self.binds.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn current(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn publish(&self, state: &RegistryState) {
        let next = Arc::new(state.tasks.clone());
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
