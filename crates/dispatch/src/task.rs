//! Task bodies, the request they receive and the outcome they return.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fahrplan_core::{Signature, TaskMessage};
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::result::AsyncResult;

/// Boxed future returned by a task body.
pub type TaskFuture = BoxFuture<'static, TaskOutcome>;

/// A task body.
pub type TaskFn = Arc<dyn Fn(TaskRequest) -> TaskFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Wrap a synchronous closure as a [`TaskFn`].
pub fn sync_task_fn<F>(f: F) -> TaskFn
where
    F: Fn(&TaskRequest) -> TaskOutcome + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |req| {
        let f = f.clone();
        Box::pin(async move { f(&req) })
    })
}

// ── Request ─────────────────────────────────────────────────────────

/// What a running task knows about its own invocation.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub id: String,
    pub task: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub retries: u32,
    pub eta: Option<String>,
    pub expires: Option<String>,
    pub group_id: Option<String>,
    pub chord: Option<Signature>,
    pub callbacks: Vec<Signature>,
    pub errbacks: Vec<Signature>,
    pub timelimit: (Option<f64>, Option<f64>),
    /// Executed in-process by `apply` rather than from a broker message.
    pub is_eager: bool,
    children: Arc<Mutex<Vec<AsyncResult>>>,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            retries: 0,
            eta: None,
            expires: None,
            group_id: None,
            chord: None,
            callbacks: Vec::new(),
            errbacks: Vec::new(),
            timelimit: (None, None),
            is_eager: false,
            children: Arc::default(),
        }
    }

    pub fn from_message(msg: &TaskMessage) -> Self {
        Self {
            id: msg.id.clone(),
            task: msg.task.clone(),
            args: msg.args.clone(),
            kwargs: msg.kwargs.clone(),
            retries: msg.retries,
            eta: msg.eta.clone(),
            expires: msg.expires.clone(),
            group_id: msg.group_id.clone(),
            chord: msg.chord.clone(),
            callbacks: msg.callbacks.clone().unwrap_or_default(),
            errbacks: msg.errbacks.clone().unwrap_or_default(),
            timelimit: msg.timelimit,
            is_eager: false,
            children: Arc::default(),
        }
    }

    /// Results of tasks sent while this one was executing.
    pub fn children(&self) -> Vec<AsyncResult> {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn add_child(&self, child: AsyncResult) {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(child);
    }

    /// Start building a retry of this request.
    pub fn retry(&self) -> RetryRequest {
        RetryRequest::default()
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// How a task body finished.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(Value),
    /// Ask to be re-sent with `retries + 1`.
    Retry(RetryRequest),
    Failure(String),
}

impl TaskOutcome {
    pub fn ok(value: impl Into<Value>) -> Self {
        Self::Success(value.into())
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::Failure(error.into())
    }
}

impl From<RetryRequest> for TaskOutcome {
    fn from(r: RetryRequest) -> Self {
        Self::Retry(r)
    }
}

/// Parameters of a requested retry. Unset fields fall back to the task's
/// options and the original request.
#[derive(Debug, Clone, Default)]
pub struct RetryRequest {
    pub countdown: Option<f64>,
    pub eta: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Map<String, Value>>,
    pub reason: Option<String>,
}

impl RetryRequest {
    pub fn countdown(mut self, secs: f64) -> Self {
        self.countdown = Some(secs);
        self
    }

    pub fn eta(mut self, at: DateTime<Utc>) -> Self {
        self.eta = Some(at);
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
