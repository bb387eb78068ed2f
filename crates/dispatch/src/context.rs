//! Process runtime, the current-app stack and the current task.
//!
//! Within an executing task both the app and the request are task-local,
//! so they follow the task across `.await` points. Outside of tasks,
//! [`push_app`] gives a per-thread stack. When nothing is set,
//! [`current_app`] falls back to the runtime's default app.

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tracing::{debug, info};

use crate::app::{App, AppInner};
use crate::registry::TaskDescriptor;
use crate::task::TaskRequest;

tokio::task_local! {
    static CURRENT_APP: App;
    static CURRENT_TASK: TaskRequest;
}

thread_local! {
    static APP_STACK: RefCell<Vec<App>> = const { RefCell::new(Vec::new()) };
}

/// The app in effect: the executing task's app, then the innermost
/// [`push_app`] on this thread, then the runtime default.
pub fn current_app() -> App {
    if let Ok(app) = CURRENT_APP.try_with(App::clone) {
        return app;
    }
    APP_STACK
        .with(|stack| stack.borrow().last().cloned())
        .unwrap_or_else(|| Runtime::global().default_app())
}

/// The request of the task executing on this tokio task, if any.
pub fn current_task() -> Option<TaskRequest> {
    CURRENT_TASK.try_with(TaskRequest::clone).ok()
}

/// Pops the pushed app when dropped. Bound to the pushing thread.
#[must_use = "the app is popped as soon as the guard is dropped"]
pub struct AppGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for AppGuard {
    fn drop(&mut self) {
        APP_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Make `app` current on this thread until the guard drops.
pub fn push_app(app: &App) -> AppGuard {
    APP_STACK.with(|stack| stack.borrow_mut().push(app.clone()));
    AppGuard {
        _not_send: PhantomData,
    }
}

/// Run `fut` with `app` and `request` as the current app and task.
pub(crate) async fn scope_task<F>(app: App, request: TaskRequest, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_APP
        .scope(app, CURRENT_TASK.scope(request, fut))
        .await
}

// ── Runtime ─────────────────────────────────────────────────────────

/// Builds a task for a given app; see [`Runtime::shared_task`].
pub type SharedTaskCtor = Arc<dyn Fn(&App) -> TaskDescriptor + Send + Sync>;

/// Process-wide registry of live apps.
///
/// Apps are held weakly so the runtime never keeps one alive.
pub struct Runtime {
    apps: Mutex<Vec<Weak<AppInner>>>,
    shared: Mutex<Vec<SharedTaskCtor>>,
    default: Mutex<Option<App>>,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    pub fn global() -> &'static Runtime {
        RUNTIME.get_or_init(|| Runtime {
            apps: Mutex::new(Vec::new()),
            shared: Mutex::new(Vec::new()),
            default: Mutex::new(None),
        })
    }

    pub(crate) fn register_app(&self, app: &App) {
        let mut apps = lock(&self.apps);
        apps.retain(|w| w.strong_count() > 0);
        apps.push(app.downgrade());
    }

    /// Every app still alive, in creation order.
    pub fn apps(&self) -> Vec<App> {
        let mut apps = lock(&self.apps);
        apps.retain(|w| w.strong_count() > 0);
        apps.iter().filter_map(App::upgrade).collect()
    }

    /// Register a task constructor for every app.
    ///
    /// Apps that already finalized get the task now; the others pick it
    /// up when they finalize.
    pub fn shared_task<F>(&self, ctor: F)
    where
        F: Fn(&App) -> TaskDescriptor + Send + Sync + 'static,
    {
        let ctor: SharedTaskCtor = Arc::new(ctor);
        let mut shared = lock(&self.shared);
        for app in self.apps() {
            if app.is_finalized() {
                let handle = app.register(ctor(&app));
                debug!(app = %app.name(), task = %handle.name(), "shared task added to finalized app");
            }
        }
        shared.push(ctor);
    }

    /// Run `f` over the shared constructors while no new one can be added.
    pub(crate) fn with_shared_tasks<R>(&self, f: impl FnOnce(&[SharedTaskCtor]) -> R) -> R {
        let shared = lock(&self.shared);
        f(&shared)
    }

    /// Reset connection pools of every live app, as after a fork.
    pub fn on_fork(&self) {
        let apps = self.apps();
        info!(apps = apps.len(), "resetting apps after fork");
        for app in apps {
            app.after_fork();
        }
    }

    /// The fallback app, created on first use.
    pub fn default_app(&self) -> App {
        lock(&self.default)
            .get_or_insert_with(|| App::builder().name("default").build())
            .clone()
    }

    pub fn set_default_app(&self, app: App) {
        *lock(&self.default) = Some(app);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
