//! Result backend seam and the handles returned by `send_task`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fahrplan_core::{Clock, FahrplanError, Result, TaskState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Stored state of one task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub traceback: Option<String>,
    /// Ids of tasks sent while this one executed.
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub date_done: Option<DateTime<Utc>>,
}

impl TaskMeta {
    pub fn new(task_id: impl Into<String>, state: TaskState, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            result,
            traceback: None,
            children: Vec::new(),
            date_done: None,
        }
    }

    /// What an unknown id looks like.
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self::new(task_id, TaskState::Pending, Value::Null)
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn with_children(mut self, children: Vec<String>) -> Self {
        self.children = children;
        self
    }
}

/// Where task states and return values are kept.
#[async_trait]
pub trait ResultBackend: Send + Sync + fmt::Debug {
    async fn store(&self, meta: TaskMeta) -> Result<()>;

    /// Unknown ids come back as `PENDING`.
    async fn fetch(&self, task_id: &str) -> Result<TaskMeta>;

    async fn forget(&self, task_id: &str) -> Result<()>;

    /// Drop expired results; returns how many were removed.
    async fn cleanup(&self) -> Result<usize>;

    async fn save_group(&self, group_id: &str, task_ids: Vec<String>) -> Result<()>;

    async fn restore_group(&self, group_id: &str) -> Result<Option<Vec<String>>>;

    /// Whether [`ResultBackend::cleanup`] does anything.
    fn supports_cleanup(&self) -> bool {
        false
    }
}

// ── Disabled ──

/// Used when no `result_backend` is configured. Writes are dropped and
/// reads fail.
#[derive(Debug, Default)]
pub struct DisabledBackend;

fn disabled() -> FahrplanError {
    FahrplanError::ImproperlyConfigured(
        "no result backend configured: set result_backend to read task results".into(),
    )
}

#[async_trait]
impl ResultBackend for DisabledBackend {
    async fn store(&self, _meta: TaskMeta) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, _task_id: &str) -> Result<TaskMeta> {
        Err(disabled())
    }

    async fn forget(&self, _task_id: &str) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<usize> {
        Ok(0)
    }

    async fn save_group(&self, _group_id: &str, _task_ids: Vec<String>) -> Result<()> {
        Err(disabled())
    }

    async fn restore_group(&self, _group_id: &str) -> Result<Option<Vec<String>>> {
        Err(disabled())
    }
}

// ── Memory ──

#[derive(Debug, Default)]
struct MemoryResults {
    tasks: HashMap<String, (TaskMeta, DateTime<Utc>)>,
    groups: HashMap<String, (Vec<String>, DateTime<Utc>)>,
}

/// In-process backend. Entries older than `expires` are removed by
/// [`ResultBackend::cleanup`].
#[derive(Debug)]
pub struct MemoryBackend {
    inner: Mutex<MemoryResults>,
    expires: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>, expires: Option<Duration>) -> Self {
        Self {
            inner: Mutex::default(),
            expires,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryResults> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ResultBackend for MemoryBackend {
    async fn store(&self, mut meta: TaskMeta) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.lock();
        if let Some((existing, _)) = inner.tasks.get(&meta.task_id) {
            if existing.state != meta.state && !existing.state.can_transition_to(meta.state) {
                warn!(
                    task_id = %meta.task_id,
                    from = %existing.state,
                    to = %meta.state,
                    "ignoring result state change"
                );
                return Ok(());
            }
        }
        if meta.state.is_ready() && meta.date_done.is_none() {
            meta.date_done = Some(now);
        }
        debug!(task_id = %meta.task_id, state = %meta.state, "stored result");
        inner.tasks.insert(meta.task_id.clone(), (meta, now));
        Ok(())
    }

    async fn fetch(&self, task_id: &str) -> Result<TaskMeta> {
        Ok(self
            .lock()
            .tasks
            .get(task_id)
            .map(|(meta, _)| meta.clone())
            .unwrap_or_else(|| TaskMeta::pending(task_id)))
    }

    async fn forget(&self, task_id: &str) -> Result<()> {
        self.lock().tasks.remove(task_id);
        Ok(())
    }

    async fn cleanup(&self) -> Result<usize> {
        let Some(expires) = self.expires else {
            return Ok(0);
        };
        let keep_for = chrono::Duration::from_std(expires).unwrap_or(chrono::Duration::zero());
        let cutoff = self.clock.now() - keep_for;
        let mut inner = self.lock();
        let before = inner.tasks.len() + inner.groups.len();
        inner.tasks.retain(|_, (_, stored)| *stored > cutoff);
        inner.groups.retain(|_, (_, stored)| *stored > cutoff);
        let removed = before - inner.tasks.len() - inner.groups.len();
        if removed > 0 {
            info!(removed, "expired results removed");
        }
        Ok(removed)
    }

    async fn save_group(&self, group_id: &str, task_ids: Vec<String>) -> Result<()> {
        let now = self.clock.now();
        self.lock()
            .groups
            .insert(group_id.to_string(), (task_ids, now));
        Ok(())
    }

    async fn restore_group(&self, group_id: &str) -> Result<Option<Vec<String>>> {
        Ok(self.lock().groups.get(group_id).map(|(ids, _)| ids.clone()))
    }

    fn supports_cleanup(&self) -> bool {
        self.expires.is_some()
    }
}

// ── Handles ──

/// Handle on the eventual result of a sent task.
#[derive(Clone)]
pub struct AsyncResult {
    id: String,
    backend: Arc<dyn ResultBackend>,
    parent: Option<Box<AsyncResult>>,
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id.as_str()))
            .finish()
    }
}

impl PartialEq for AsyncResult {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl AsyncResult {
    pub fn new(id: impl Into<String>, backend: Arc<dyn ResultBackend>) -> Self {
        Self {
            id: id.into(),
            backend,
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: AsyncResult) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Result of the task that sent this one, if sent from inside a task.
    pub fn parent(&self) -> Option<&AsyncResult> {
        self.parent.as_deref()
    }

    pub fn backend(&self) -> &Arc<dyn ResultBackend> {
        &self.backend
    }

    pub async fn meta(&self) -> Result<TaskMeta> {
        self.backend.fetch(&self.id).await
    }

    pub async fn state(&self) -> Result<TaskState> {
        Ok(self.meta().await?.state)
    }

    pub async fn ready(&self) -> Result<bool> {
        Ok(self.state().await?.is_ready())
    }

    pub async fn successful(&self) -> Result<bool> {
        Ok(self.state().await? == TaskState::Success)
    }

    pub async fn failed(&self) -> Result<bool> {
        Ok(self.state().await? == TaskState::Failure)
    }

    /// Poll until the task is ready.
    ///
    /// A failed task surfaces as [`FahrplanError::TaskFailed`], a revoked
    /// one as [`FahrplanError::TaskRevoked`], and running out of time as
    /// [`FahrplanError::ResultTimeout`].
    pub async fn get(&self, timeout: Duration, interval: Duration) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let meta = self.meta().await?;
            match meta.state {
                TaskState::Success => return Ok(meta.result),
                TaskState::Failure => {
                    let reason = meta.traceback.unwrap_or_else(|| meta.result.to_string());
                    return Err(FahrplanError::TaskFailed(reason));
                }
                TaskState::Revoked => return Err(FahrplanError::TaskRevoked(self.id.clone())),
                _ => {}
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(FahrplanError::ResultTimeout(timeout));
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    pub async fn forget(&self) -> Result<()> {
        self.backend.forget(&self.id).await
    }

    /// Handles for the tasks this one sent while executing.
    pub async fn children(&self) -> Result<Vec<AsyncResult>> {
        Ok(self
            .meta()
            .await?
            .children
            .into_iter()
            .map(|id| AsyncResult::new(id, self.backend.clone()).with_parent(self.clone()))
            .collect())
    }
}

/// A set of results saved under one group id.
#[derive(Debug, Clone)]
pub struct GroupResult {
    id: String,
    results: Vec<AsyncResult>,
}

impl GroupResult {
    pub fn new(id: impl Into<String>, results: Vec<AsyncResult>) -> Self {
        Self {
            id: id.into(),
            results,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn results(&self) -> &[AsyncResult] {
        &self.results
    }

    pub async fn save(&self, backend: &dyn ResultBackend) -> Result<()> {
        let ids = self.results.iter().map(|r| r.id.clone()).collect();
        backend.save_group(&self.id, ids).await
    }

    pub async fn restore(backend: Arc<dyn ResultBackend>, id: &str) -> Result<Option<Self>> {
        let ids = backend.restore_group(id).await?;
        Ok(ids.map(|ids| {
            let results = ids
                .into_iter()
                .map(|task_id| AsyncResult::new(task_id, backend.clone()))
                .collect();
            Self::new(id, results)
        }))
    }

    pub async fn completed_count(&self) -> Result<usize> {
        let mut done = 0;
        for r in &self.results {
            if r.successful().await? {
                done += 1;
            }
        }
        Ok(done)
    }

    pub async fn ready(&self) -> Result<bool> {
        for r in &self.results {
            if !r.ready().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Result of a task executed in-process by `App::apply`.
#[derive(Debug, Clone, PartialEq)]
pub struct EagerResult {
    pub id: String,
    pub state: TaskState,
    pub value: Value,
    /// Retries consumed before the final outcome.
    pub retries: u32,
}

impl EagerResult {
    pub fn successful(&self) -> bool {
        self.state == TaskState::Success
    }

    pub fn get(&self) -> Result<Value> {
        match self.state {
            TaskState::Success => Ok(self.value.clone()),
            _ => Err(FahrplanError::TaskFailed(match &self.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
        }
    }
}
