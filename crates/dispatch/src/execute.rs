//! Running task bodies: eagerly with [`App::apply`] or from a received
//! message with [`App::execute_message`].

use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use fahrplan_core::{
    new_task_id, Expires, FahrplanError, PublishOptions, Result, Signature, TaskMessage, TaskState,
};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::app::{call_args, App};
use crate::context::scope_task;
use crate::registry::TaskDescriptor;
use crate::result::{AsyncResult, EagerResult, TaskMeta};
use crate::signals::{TaskFailure, TaskPostrun, TaskPrerun, TaskRetry, TaskSuccess};
use crate::task::{RetryRequest, TaskOutcome, TaskRequest};

/// What happened when a message was executed.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub task_id: String,
    pub state: TaskState,
    pub result: Value,
    /// Handle on the re-sent message when the task asked to retry.
    pub retry: Option<AsyncResult>,
}

impl App {
    /// Run a task in-process and wait for it.
    ///
    /// Retries run immediately, without honoring countdowns, until the
    /// task's `max_retries` is used up. Nothing touches the broker or the
    /// result backend.
    pub async fn apply(
        &self,
        name: &str,
        args: Value,
        kwargs: Value,
        options: PublishOptions,
    ) -> Result<EagerResult> {
        let desc = self.get_task(name)?;
        let (args, kwargs) = call_args(args, kwargs)?;

        let mut request = TaskRequest::new(name, options.task_id.clone().unwrap_or_else(new_task_id));
        request.args = args;
        request.kwargs = kwargs;
        request.retries = options.retries;
        request.callbacks = options.link.clone();
        request.errbacks = options.link_error.clone();
        request.group_id = options.group_id.clone();
        request.is_eager = true;

        loop {
            match run_body(self, &desc, request.clone()).await {
                TaskOutcome::Success(value) => {
                    self.notify_success(&request, &value);
                    return Ok(eager(&request, TaskState::Success, value));
                }
                TaskOutcome::Failure(error) => {
                    self.notify_failure(&request, &error);
                    return Ok(eager(&request, TaskState::Failure, Value::String(error)));
                }
                TaskOutcome::Retry(retry) => {
                    let max_retries = retry.max_retries.unwrap_or(desc.max_retries());
                    if request.retries >= max_retries {
                        let error = exhausted(&request, max_retries).to_string();
                        self.notify_failure(&request, &error);
                        return Ok(eager(&request, TaskState::Failure, Value::String(error)));
                    }
                    self.notify_retry(&request, &retry);
                    request = retried(&request, retry);
                }
            }
        }
    }

    /// Execute a received task message and record the outcome in the
    /// result backend.
    ///
    /// A retry request re-sends the message with the same id and
    /// `retries + 1`. Once the retry limit is reached the task is stored as
    /// failed and [`FahrplanError::TaskRetriesExhausted`] is returned.
    pub async fn execute_message(&self, message: &TaskMessage) -> Result<ExecutionReport> {
        let desc = self.get_task(&message.task)?;
        let opts = desc.resolved_options().clone();
        let backend = self.backend()?;
        let request = TaskRequest::from_message(message);
        let task_id = request.id.clone();

        if let Some(expires) = message.expires_datetime()? {
            if expires <= self.now() {
                info!(task = %message.task, task_id = %task_id, "message expired, revoking");
                backend
                    .store(TaskMeta::new(&task_id, TaskState::Revoked, Value::Null))
                    .await?;
                return Ok(report(&task_id, TaskState::Revoked, Value::Null));
            }
        }

        if opts.track_started.unwrap_or(false) {
            backend
                .store(TaskMeta::new(&task_id, TaskState::Started, Value::Null))
                .await?;
        }

        match run_body(self, &desc, request.clone()).await {
            TaskOutcome::Success(value) => {
                if !opts.ignore_result.unwrap_or(false) {
                    let mut meta = TaskMeta::new(&task_id, TaskState::Success, value.clone());
                    if opts.trail.unwrap_or(true) {
                        meta = meta.with_children(
                            request.children().iter().map(|c| c.id().to_string()).collect(),
                        );
                    }
                    backend.store(meta).await?;
                }
                self.notify_success(&request, &value);
                for callback in &request.callbacks {
                    if let Err(e) = self.send_signature(callback, Some(value.clone())).await {
                        warn!(task_id = %task_id, callback = %callback.task, error = %e, "failed to send callback");
                    }
                }
                debug!(task = %request.task, task_id = %task_id, "task succeeded");
                Ok(report(&task_id, TaskState::Success, value))
            }
            TaskOutcome::Failure(error) => {
                self.record_failure(&desc, &request, &error).await?;
                Ok(report(&task_id, TaskState::Failure, Value::String(error)))
            }
            TaskOutcome::Retry(retry) => {
                let max_retries = retry.max_retries.unwrap_or(desc.max_retries());
                if request.retries >= max_retries {
                    let err = exhausted(&request, max_retries);
                    self.record_failure(&desc, &request, &err.to_string()).await?;
                    return Err(err);
                }

                let reason = retry_reason(&retry);
                let mut options = PublishOptions {
                    task_id: Some(task_id.clone()),
                    retries: request.retries + 1,
                    link: request.callbacks.clone(),
                    link_error: request.errbacks.clone(),
                    group_id: request.group_id.clone(),
                    chord: request.chord.clone(),
                    time_limit: request.timelimit.0,
                    soft_time_limit: request.timelimit.1,
                    add_to_parent: false,
                    ..PublishOptions::default()
                };
                match retry.eta {
                    Some(eta) => options.eta = Some(eta),
                    None => {
                        options.countdown =
                            Some(retry.countdown.unwrap_or(desc.default_retry_delay()))
                    }
                }
                if let Some(expires) = message.expires_datetime()? {
                    options.expires = Some(Expires::At(expires.with_timezone(&Utc)));
                }

                self.notify_retry(&request, &retry);
                let next = retried(&request, retry);
                let handle = self
                    .send_task_parts(&request.task, next.args, next.kwargs, options)
                    .await?;
                backend
                    .store(TaskMeta::new(&task_id, TaskState::Retry, Value::String(reason.clone())))
                    .await?;
                info!(task = %request.task, task_id = %task_id, retries = request.retries + 1, reason = %reason, "task retry scheduled");
                Ok(ExecutionReport {
                    retry: Some(handle),
                    ..report(&task_id, TaskState::Retry, Value::String(reason))
                })
            }
        }
    }

    async fn record_failure(
        &self,
        desc: &TaskDescriptor,
        request: &TaskRequest,
        error: &str,
    ) -> Result<()> {
        let opts = desc.resolved_options();
        let store = !opts.ignore_result.unwrap_or(false)
            || opts.store_errors_even_if_ignored.unwrap_or(false);
        if store {
            let meta = TaskMeta::new(&request.id, TaskState::Failure, Value::from(error))
                .with_traceback(error);
            self.backend()?.store(meta).await?;
        }
        self.notify_failure(request, error);
        for errback in &request.errbacks {
            if let Err(e) = self
                .send_signature(errback, Some(Value::from(request.id.clone())))
                .await
            {
                warn!(task_id = %request.id, errback = %errback.task, error = %e, "failed to send errback");
            }
        }
        warn!(task = %request.task, task_id = %request.id, error = %error, "task failed");
        Ok(())
    }

    /// Send a callback. Mutable signatures get `parent` prepended to their
    /// arguments.
    async fn send_signature(&self, sig: &Signature, parent: Option<Value>) -> Result<AsyncResult> {
        let mut args = sig.args.clone();
        if let (false, Some(parent)) = (sig.immutable, parent) {
            args.insert(0, parent);
        }
        let mut options = PublishOptions::new().add_to_parent(false);
        if let Some(queue) = sig.options.get("queue").and_then(Value::as_str) {
            options.queue = Some(queue.to_string());
        }
        if let Some(key) = sig.options.get("routing_key").and_then(Value::as_str) {
            options.routing_key = Some(key.to_string());
        }
        if let Some(countdown) = sig.options.get("countdown").and_then(Value::as_f64) {
            options.countdown = Some(countdown);
        }
        self.send_task_parts(&sig.task, args, sig.kwargs.clone(), options)
            .await
    }

    fn notify_success(&self, request: &TaskRequest, value: &Value) {
        self.signals().task_success.send(
            &request.task,
            &TaskSuccess {
                task_id: request.id.clone(),
                result: value.clone(),
            },
        );
    }

    fn notify_failure(&self, request: &TaskRequest, error: &str) {
        self.signals().task_failure.send(
            &request.task,
            &TaskFailure {
                task_id: request.id.clone(),
                error: error.to_string(),
                args: request.args.clone(),
                kwargs: request.kwargs.clone(),
            },
        );
    }

    fn notify_retry(&self, request: &TaskRequest, retry: &RetryRequest) {
        self.signals().task_retry.send(
            &request.task,
            &TaskRetry {
                task_id: request.id.clone(),
                reason: retry_reason(retry),
            },
        );
    }
}

/// Run one invocation of a task body inside the task scope, with the
/// prerun and postrun signals around it. Panics become failures.
async fn run_body(app: &App, desc: &TaskDescriptor, request: TaskRequest) -> TaskOutcome {
    let signals = app.signals();
    signals.task_prerun.send(
        desc.name(),
        &TaskPrerun {
            task_id: request.id.clone(),
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
        },
    );

    let callable = desc.callable().clone();
    let body = {
        let request = request.clone();
        async move { callable(request).await }
    };
    let outcome = match AssertUnwindSafe(scope_task(app.clone(), request.clone(), body))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(payload) => TaskOutcome::Failure(panic_message(payload.as_ref())),
    };

    let (retval, state) = match &outcome {
        TaskOutcome::Success(value) => (value.clone(), TaskState::Success),
        TaskOutcome::Retry(retry) => (Value::String(retry_reason(retry)), TaskState::Retry),
        TaskOutcome::Failure(error) => (Value::String(error.clone()), TaskState::Failure),
    };
    signals.task_postrun.send(
        desc.name(),
        &TaskPostrun {
            task_id: request.id.clone(),
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
            retval,
            state,
        },
    );
    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

fn retry_reason(retry: &RetryRequest) -> String {
    if let Some(reason) = &retry.reason {
        return reason.clone();
    }
    match (retry.eta, retry.countdown) {
        (Some(eta), _) => format!("Retry at {eta}"),
        (None, Some(countdown)) => format!("Retry in {countdown}s"),
        (None, None) => "Retry requested".to_string(),
    }
}

fn exhausted(request: &TaskRequest, max_retries: u32) -> FahrplanError {
    FahrplanError::TaskRetriesExhausted {
        task: request.task.clone(),
        id: request.id.clone(),
        max_retries,
    }
}

/// The next request after a retry: one more retry, optionally new arguments.
fn retried(request: &TaskRequest, retry: RetryRequest) -> TaskRequest {
    let mut next = request.clone();
    next.retries += 1;
    if let Some(args) = retry.args {
        next.args = args;
    }
    if let Some(kwargs) = retry.kwargs {
        next.kwargs = kwargs;
    }
    next
}

fn eager(request: &TaskRequest, state: TaskState, value: Value) -> EagerResult {
    EagerResult {
        id: request.id.clone(),
        state,
        value,
        retries: request.retries,
    }
}

fn report(task_id: &str, state: TaskState, result: Value) -> ExecutionReport {
    ExecutionReport {
        task_id: task_id.to_string(),
        state,
        result,
        retry: None,
    }
}
