//! Synchronous in-process observer bus.
//!
//! A [`Signal`] holds receivers in registration order. Receivers connected
//! for a specific sender run before generic ones. A failing or panicking
//! receiver is logged and its error captured in the result list; it never
//! stops the remaining receivers or the operation that sent the signal.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, Weak};

use fahrplan_core::{MessageProperties, QueueSpec, RetryPolicy, TaskState};
use serde_json::{Map, Value};
use tracing::warn;

/// A receiver callable: `(sender, args) -> result`.
pub type ReceiverFn<A> = dyn Fn(&str, &A) -> anyhow::Result<Value> + Send + Sync;

/// Identity of a connected receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiverKey {
    id: KeyId,
    sender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyId {
    Uid(String),
    Ptr(usize),
}

impl fmt::Display for ReceiverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            KeyId::Uid(uid) => write!(f, "{uid}")?,
            KeyId::Ptr(addr) => write!(f, "receiver@{addr:#x}")?,
        }
        if let Some(sender) = &self.sender {
            write!(f, " (sender={sender})")?;
        }
        Ok(())
    }
}

/// Options for [`Signal::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Only receive sends from this sender.
    pub sender: Option<String>,
    /// Hold the receiver weakly; it is dropped once its last `Arc` goes.
    pub weak: bool,
    /// Connecting twice with the same uid is a no-op.
    pub dispatch_uid: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            sender: None,
            weak: true,
            dispatch_uid: None,
        }
    }
}

impl ConnectOptions {
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn strong(mut self) -> Self {
        self.weak = false;
        self
    }

    pub fn dispatch_uid(mut self, uid: impl Into<String>) -> Self {
        self.dispatch_uid = Some(uid.into());
        self
    }
}

enum Slot<A: 'static> {
    Strong(Arc<ReceiverFn<A>>),
    Weak(Weak<ReceiverFn<A>>),
}

impl<A: 'static> Slot<A> {
    fn upgrade(&self) -> Option<Arc<ReceiverFn<A>>> {
        match self {
            Self::Strong(f) => Some(f.clone()),
            Self::Weak(w) => w.upgrade(),
        }
    }
}

struct Receiver<A: 'static> {
    key: ReceiverKey,
    slot: Slot<A>,
}

/// A named signal carrying arguments of type `A`.
pub struct Signal<A: 'static> {
    name: &'static str,
    receivers: RwLock<Vec<Receiver<A>>>,
}

impl<A: 'static> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("receivers", &self.receiver_count())
            .finish()
    }
}

impl<A: 'static> Signal<A> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            receivers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Connect a receiver. Returns its key; connecting an already connected
    /// receiver (same uid, or same callable and sender) returns the
    /// existing key.
    pub fn connect(&self, receiver: &Arc<ReceiverFn<A>>, opts: ConnectOptions) -> ReceiverKey {
        let id = match opts.dispatch_uid {
            Some(uid) => KeyId::Uid(uid),
            None => KeyId::Ptr(Arc::as_ptr(receiver) as *const () as usize),
        };
        let key = ReceiverKey {
            id,
            sender: opts.sender,
        };

        let mut receivers = self.receivers.write().unwrap_or_else(|e| e.into_inner());
        receivers.retain(|r| r.slot.upgrade().is_some());
        if receivers.iter().any(|r| r.key == key) {
            return key;
        }
        let slot = if opts.weak {
            Slot::Weak(Arc::downgrade(receiver))
        } else {
            Slot::Strong(receiver.clone())
        };
        receivers.push(Receiver {
            key: key.clone(),
            slot,
        });
        key
    }

    /// Connect a closure, held strongly.
    pub fn connect_fn<F>(&self, f: F) -> ReceiverKey
    where
        F: Fn(&str, &A) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let receiver: Arc<ReceiverFn<A>> = Arc::new(f);
        self.connect(&receiver, ConnectOptions::default().strong())
    }

    /// Remove a receiver. Returns whether it was connected.
    pub fn disconnect(&self, key: &ReceiverKey) -> bool {
        let mut receivers = self.receivers.write().unwrap_or_else(|e| e.into_inner());
        let before = receivers.len();
        receivers.retain(|r| &r.key != key);
        receivers.len() != before
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.receivers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.slot.upgrade().is_some())
            .count()
    }

    pub fn has_listeners(&self) -> bool {
        self.receiver_count() > 0
    }

    /// Invoke every matching receiver and collect their results.
    pub fn send(&self, sender: &str, args: &A) -> Vec<(ReceiverKey, anyhow::Result<Value>)> {
        let (live, dead) = {
            let receivers = self.receivers.read().unwrap_or_else(|e| e.into_inner());
            let mut specific = Vec::new();
            let mut generic = Vec::new();
            let mut dead = 0usize;
            for r in receivers.iter() {
                let Some(f) = r.slot.upgrade() else {
                    dead += 1;
                    continue;
                };
                match r.key.sender.as_deref() {
                    Some(s) if s == sender => specific.push((r.key.clone(), f)),
                    Some(_) => {}
                    None => generic.push((r.key.clone(), f)),
                }
            }
            specific.extend(generic);
            (specific, dead)
        };

        if dead > 0 {
            let mut receivers = self.receivers.write().unwrap_or_else(|e| e.into_inner());
            receivers.retain(|r| r.slot.upgrade().is_some());
        }

        let mut results = Vec::with_capacity(live.len());
        for (key, f) in live {
            let outcome = match catch_unwind(AssertUnwindSafe(|| f(sender, args))) {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!("receiver panicked: {}", panic_message(&panic))),
            };
            if let Err(e) = &outcome {
                warn!(signal = self.name, receiver = %key, error = %e, "signal receiver failed");
            }
            results.push((key, outcome));
        }
        results
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Signal arguments ────────────────────────────────────────────────

/// Sent before a task message is handed to the broker. Sender: task name.
#[derive(Debug, Clone)]
pub struct BeforeTaskPublish {
    pub body: Value,
    pub exchange: String,
    pub routing_key: String,
    pub declare: Vec<QueueSpec>,
    pub headers: Map<String, Value>,
    pub properties: MessageProperties,
    pub retry_policy: Option<RetryPolicy>,
}

/// Sent after the broker accepted a task message. Sender: task name.
#[derive(Debug, Clone)]
pub struct AfterTaskPublish {
    pub body: Value,
    pub exchange: String,
    pub routing_key: String,
}

/// Sent before a task body runs. Sender: task name.
#[derive(Debug, Clone)]
pub struct TaskPrerun {
    pub task_id: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

/// Sent after a task body returned. Sender: task name.
#[derive(Debug, Clone)]
pub struct TaskPostrun {
    pub task_id: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub retval: Value,
    pub state: TaskState,
}

#[derive(Debug, Clone)]
pub struct TaskRetry {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct TaskSuccess {
    pub task_id: String,
    pub result: Value,
}

#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task_id: String,
    pub error: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

/// Sent when a beat service starts. Sender: the service name.
#[derive(Debug, Clone)]
pub struct BeatInit {
    pub schedule_entries: usize,
}

/// Sent once an app has finalized its registry. Sender: app name.
#[derive(Debug, Clone)]
pub struct AppFinalized {
    pub tasks: usize,
}

/// Sent after an app reset its pools for a new process or thread.
#[derive(Debug, Clone)]
pub struct AfterFork;

/// The signal catalogue of an app.
#[derive(Debug)]
pub struct Signals {
    pub before_task_publish: Signal<BeforeTaskPublish>,
    pub after_task_publish: Signal<AfterTaskPublish>,
    pub task_prerun: Signal<TaskPrerun>,
    pub task_postrun: Signal<TaskPostrun>,
    pub task_retry: Signal<TaskRetry>,
    pub task_success: Signal<TaskSuccess>,
    pub task_failure: Signal<TaskFailure>,
    pub beat_init: Signal<BeatInit>,
    pub app_finalized: Signal<AppFinalized>,
    pub after_fork: Signal<AfterFork>,
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

impl Signals {
    pub fn new() -> Self {
        Self {
            before_task_publish: Signal::new("before_task_publish"),
            after_task_publish: Signal::new("after_task_publish"),
            task_prerun: Signal::new("task_prerun"),
            task_postrun: Signal::new("task_postrun"),
            task_retry: Signal::new("task_retry"),
            task_success: Signal::new("task_success"),
            task_failure: Signal::new("task_failure"),
            beat_init: Signal::new("beat_init"),
            app_finalized: Signal::new("app_finalized"),
            after_fork: Signal::new("after_fork"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<ReceiverFn<u32>> {
        let log = log.clone();
        Arc::new(move |sender: &str, n: &u32| {
            log.lock().unwrap().push(format!("{tag}:{sender}:{n}"));
            Ok(Value::from(*n))
        })
    }

    #[test]
    fn specific_receivers_run_before_generic() {
        let signal: Signal<u32> = Signal::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let generic = recorder(&log, "generic");
        let specific = recorder(&log, "specific");
        let other = recorder(&log, "other");

        signal.connect(&generic, ConnectOptions::default());
        signal.connect(&specific, ConnectOptions::default().sender("add"));
        signal.connect(&other, ConnectOptions::default().sender("mul"));

        let results = signal.send("add", &1);
        assert_eq!(results.len(), 2);
        assert_eq!(*log.lock().unwrap(), ["specific:add:1", "generic:add:1"]);
    }

    #[test]
    fn registration_order_and_send_order() {
        let signal: Signal<u32> = Signal::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&log, "a");
        let b = recorder(&log, "b");
        signal.connect(&a, ConnectOptions::default());
        signal.connect(&b, ConnectOptions::default());

        signal.send("s", &1);
        signal.send("s", &2);
        assert_eq!(*log.lock().unwrap(), ["a:s:1", "b:s:1", "a:s:2", "b:s:2"]);
    }

    #[test]
    fn connect_is_idempotent() {
        let signal: Signal<u32> = Signal::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&log, "a");
        let b = recorder(&log, "b");

        let k1 = signal.connect(&a, ConnectOptions::default());
        let k2 = signal.connect(&a, ConnectOptions::default());
        assert_eq!(k1, k2);

        signal.connect(&a, ConnectOptions::default().dispatch_uid("uid"));
        signal.connect(&b, ConnectOptions::default().dispatch_uid("uid"));
        assert_eq!(signal.receiver_count(), 2);
    }

    #[test]
    fn weak_receivers_are_dropped_with_their_referent() {
        let signal: Signal<u32> = Signal::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let weak = recorder(&log, "weak");
        let strong = recorder(&log, "strong");
        signal.connect(&weak, ConnectOptions::default());
        signal.connect(&strong, ConnectOptions::default().strong());
        drop(weak);
        drop(strong);

        signal.send("s", &7);
        assert_eq!(*log.lock().unwrap(), ["strong:s:7"]);
        assert_eq!(signal.receiver_count(), 1);
    }

    #[test]
    fn errors_and_panics_are_captured() {
        let signal: Signal<u32> = Signal::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        signal.connect_fn(|_, _| Err(anyhow::anyhow!("boom")));
        signal.connect_fn(|_, _| panic!("kaboom"));
        let tail = recorder(&log, "tail");
        signal.connect(&tail, ConnectOptions::default());

        let results = signal.send("s", &3);
        assert_eq!(results.len(), 3);
        assert!(results[0].1.as_ref().unwrap_err().to_string().contains("boom"));
        assert!(results[1].1.as_ref().unwrap_err().to_string().contains("kaboom"));
        assert_eq!(results[2].1.as_ref().unwrap(), &Value::from(3));
        assert_eq!(*log.lock().unwrap(), ["tail:s:3"]);
    }

    #[test]
    fn disconnect_removes_receiver() {
        let signal: Signal<u32> = Signal::new("test");
        let key = signal.connect_fn(|_, _| Ok(Value::Null));
        assert!(signal.has_listeners());
        assert!(signal.disconnect(&key));
        assert!(!signal.disconnect(&key));
        assert!(signal.send("s", &0).is_empty());
    }
}
