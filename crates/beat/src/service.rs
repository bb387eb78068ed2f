//! The beat loop: tick, sleep, sync, until told to stop.

use std::thread;
use std::time::Duration;

use fahrplan_dispatch::signals::BeatInit;
use fahrplan_dispatch::App;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{BeatError, Result};
use crate::scheduler::BeatScheduler;

/// Subtracted from every sleep so ticks land slightly before the deadline.
const DEFAULT_DRIFT: Duration = Duration::from_millis(10);

/// Stops a running [`BeatService`] and waits for it to finish.
#[derive(Debug, Clone)]
pub struct BeatHandle {
    shutdown: watch::Sender<bool>,
    stopped: watch::Receiver<bool>,
}

/// The service side of a [`BeatHandle`].
#[derive(Debug)]
struct Control {
    shutdown: watch::Receiver<bool>,
    stopped: watch::Sender<bool>,
}

fn control_pair() -> (BeatHandle, Control) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stopped_tx, stopped_rx) = watch::channel(false);
    (
        BeatHandle {
            shutdown: shutdown_tx,
            stopped: stopped_rx,
        },
        Control {
            shutdown: shutdown_rx,
            stopped: stopped_tx,
        },
    )
}

impl BeatHandle {
    /// Ask the service to stop after the current tick. With `wait`, also
    /// wait until it has closed its scheduler.
    pub async fn stop(&self, wait: bool) {
        self.shutdown.send_replace(true);
        if wait {
            self.stopped().await;
        }
    }

    /// Resolves once the service loop has exited.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        // An error means the service was dropped, which also counts.
        let _ = stopped.wait_for(|done| *done).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }
}

/// Drives a [`BeatScheduler`] until stopped.
///
/// Shutdown is cooperative: a tick in progress completes, then the
/// scheduler is closed (final sync) and the stopped event fires.
#[derive(Debug)]
pub struct BeatService<S> {
    name: String,
    app: App,
    scheduler: S,
    drift: Duration,
    control: Control,
    handle: BeatHandle,
}

impl<S: BeatScheduler> BeatService<S> {
    pub fn new(app: App, scheduler: S) -> Self {
        let (handle, control) = control_pair();
        Self::with_control(app, scheduler, handle, control)
    }

    fn with_control(app: App, scheduler: S, handle: BeatHandle, control: Control) -> Self {
        Self {
            name: format!("beat@{}", app.name()),
            app,
            scheduler,
            drift: DEFAULT_DRIFT,
            control,
            handle,
        }
    }

    pub fn with_drift(mut self, drift: Duration) -> Self {
        self.drift = drift;
        self
    }

    pub fn handle(&self) -> BeatHandle {
        self.handle.clone()
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Run until stopped, then close the scheduler.
    pub async fn run(mut self) -> Result<S> {
        let entries = self.scheduler.scheduler().len();
        info!(
            service = %self.name,
            entries,
            max_interval = ?self.scheduler.scheduler().max_interval(),
            "beat: starting"
        );
        self.app.signals().beat_init.send(
            &self.name,
            &BeatInit {
                schedule_entries: entries,
            },
        );

        while !*self.control.shutdown.borrow() {
            let interval = self.scheduler.scheduler_mut().tick().await;
            let sleep = interval.saturating_sub(self.drift);
            debug!(service = %self.name, "beat: waking up in {:?}", sleep);

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.control.shutdown.changed() => {}
            }

            if self.scheduler.scheduler().should_sync() {
                if let Err(e) = self.scheduler.sync() {
                    error!(service = %self.name, error = %e, "beat: sync failed");
                }
            }
        }

        let closed = self.scheduler.close();
        self.control.stopped.send_replace(true);
        info!(service = %self.name, "beat: stopped");
        closed.map(|()| self.scheduler)
    }
}

// ── Embedded mode ───────────────────────────────────────────────────

/// A beat service running on its own OS thread and runtime.
#[derive(Debug)]
pub struct EmbeddedBeat {
    handle: BeatHandle,
    thread: thread::JoinHandle<Result<()>>,
}

impl EmbeddedBeat {
    pub fn handle(&self) -> BeatHandle {
        self.handle.clone()
    }

    /// Signal the thread to stop. With `wait`, block until it exits and
    /// return its outcome.
    pub fn stop(self, wait: bool) -> Result<()> {
        self.handle.shutdown.send_replace(true);
        if !wait {
            return Ok(());
        }
        self.thread
            .join()
            .map_err(|_| BeatError::Runtime("beat thread panicked".into()))?
    }
}

/// Start a beat service on a dedicated thread.
///
/// The service publishes through its own broker connections, so the
/// caller's pool keeps working. `make` builds the scheduler on the new
/// thread.
pub fn spawn_embedded<S, F>(app: App, make: F) -> Result<EmbeddedBeat>
where
    S: BeatScheduler + 'static,
    F: FnOnce(App) -> Result<S> + Send + 'static,
{
    let (handle, control) = control_pair();
    let service_handle = handle.clone();
    let app = app.with_own_connections();
    let thread = thread::Builder::new()
        .name(format!("fahrplan-beat-{}", app.name()))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let scheduler = match make(app.clone()) {
                Ok(scheduler) => scheduler,
                Err(e) => {
                    control.stopped.send_replace(true);
                    return Err(e);
                }
            };
            let service = BeatService::with_control(app, scheduler, service_handle, control);
            runtime.block_on(service.run()).map(|_| ())
        })?;
    Ok(EmbeddedBeat { handle, thread })
}
