//! [`Scheduler`]: evaluates entries on each tick and dispatches the due ones.

use std::time::Duration;

use fahrplan_core::{Config, Timezone};
use fahrplan_dispatch::App;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::entry::ScheduleEntry;
use crate::error::Result;

/// What [`crate::BeatService`] needs from a scheduler.
pub trait BeatScheduler: Send {
    fn scheduler(&self) -> &Scheduler;

    fn scheduler_mut(&mut self) -> &mut Scheduler;

    /// Flush state to durable storage, if any.
    fn sync(&mut self) -> Result<()> {
        self.scheduler_mut().mark_synced();
        Ok(())
    }

    /// Final sync before the service exits.
    fn close(&mut self) -> Result<()> {
        self.sync()
    }
}

/// In-memory periodic scheduler.
///
/// Entries are evaluated in insertion order. Dispatch errors are logged and
/// the entry waits for its next due time; nothing is re-queued.
#[derive(Debug)]
pub struct Scheduler {
    app: App,
    entries: IndexMap<String, ScheduleEntry>,
    timezone: Timezone,
    max_interval: Duration,
    sync_every_tasks: u32,
    sync_interval: Duration,
    /// Monotonic clock reading at the last sync.
    last_sync: Option<Duration>,
    tasks_since_sync: u32,
}

impl Scheduler {
    /// A scheduler with the app's `beat_schedule` entries, all stamped as
    /// last run now.
    pub fn new(app: App) -> Result<Self> {
        let conf = app.conf()?;
        let now = app.now();
        let mut scheduler = Self::empty(app, &conf);
        for (name, config) in &conf.beat_schedule {
            scheduler.add(ScheduleEntry::from_config(name, config, now)?);
        }
        Ok(scheduler)
    }

    /// A scheduler with no entries, tuned from `conf`.
    pub fn empty(app: App, conf: &Config) -> Self {
        Self {
            app,
            entries: IndexMap::new(),
            timezone: conf.timezone,
            max_interval: conf.beat_max_loop_interval(),
            sync_every_tasks: conf.beat_sync_every,
            sync_interval: conf.beat_sync_interval(),
            last_sync: None,
            tasks_since_sync: 0,
        }
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn timezone(&self) -> Timezone {
        self.timezone
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Insert or replace the entry with the same name.
    pub fn add(&mut self, entry: ScheduleEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<ScheduleEntry> {
        self.entries.shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ScheduleEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn entries(&self) -> &IndexMap<String, ScheduleEntry> {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut IndexMap<String, ScheduleEntry> {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run one scheduling pass and return how long to wait before the next.
    ///
    /// Every due entry is reserved (last run = now, count + 1) and sent.
    /// The wait is the smallest time-to-next-check, capped by the maximum
    /// loop interval.
    pub async fn tick(&mut self) -> Duration {
        let now = self.app.now();
        let mut wait = self.max_interval;

        for entry in self.entries.values_mut() {
            let due = entry.is_due(now, self.timezone);
            if due.is_due {
                let entry = entry.reserve(now);
                info!(entry = %entry.name, task = %entry.task, "scheduler: sending due task");
                let sent = self
                    .app
                    .send_task(
                        &entry.task,
                        Value::Array(entry.args.clone()),
                        Value::Object(entry.kwargs.clone()),
                        entry.publish_options(),
                    )
                    .await;
                match sent {
                    Ok(result) => {
                        self.tasks_since_sync += 1;
                        debug!(entry = %entry.name, id = %result.id(), "scheduled task sent");
                    }
                    Err(e) => {
                        error!(entry = %entry.name, task = %entry.task, error = %e, "message error");
                    }
                }
            }
            wait = wait.min(due.next);
        }
        wait
    }

    /// Whether enough time or enough dispatches have passed since the last
    /// sync.
    pub fn should_sync(&self) -> bool {
        let Some(last) = self.last_sync else {
            return true;
        };
        let elapsed = self.app.clock().monotonic().saturating_sub(last);
        elapsed > self.sync_interval
            || (self.sync_every_tasks > 0 && self.tasks_since_sync >= self.sync_every_tasks)
    }

    pub(crate) fn mark_synced(&mut self) {
        self.last_sync = Some(self.app.clock().monotonic());
        self.tasks_since_sync = 0;
    }

    pub fn tasks_since_sync(&self) -> u32 {
        self.tasks_since_sync
    }
}

impl BeatScheduler for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }

    fn scheduler_mut(&mut self) -> &mut Scheduler {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use fahrplan_core::{Clock, ManualClock};
    use fahrplan_dispatch::MemoryBroker;

    use super::*;
    use crate::schedule::Schedule;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup(config: Config) -> (Scheduler, Arc<ManualClock>, MemoryBroker) {
        let clock = Arc::new(ManualClock::new(start()));
        let broker = MemoryBroker::new();
        let app = App::builder()
            .name("sched")
            .config(config)
            .clock(clock.clone())
            .broker(broker.clone())
            .build();
        (Scheduler::new(app).unwrap(), clock, broker)
    }

    #[tokio::test]
    async fn empty_schedule_sleeps_max_interval() {
        let (mut sched, _, _) = setup(Config::default());
        assert_eq!(sched.tick().await, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn interval_entries_fire_once_per_period() {
        let (mut sched, clock, broker) = setup(Config::default());
        sched.add(ScheduleEntry::new("ping", "t.ping", Schedule::every(Duration::from_secs(10)), start()));

        assert_eq!(sched.tick().await, Duration::from_secs(10));
        assert!(broker.published().is_empty());

        clock.advance(Duration::from_secs(10));
        assert_eq!(sched.tick().await, Duration::from_secs(10));
        assert_eq!(broker.published().len(), 1);
        assert_eq!(sched.get("ping").unwrap().total_run_count, 1);

        clock.advance(Duration::from_secs(4));
        assert_eq!(sched.tick().await, Duration::from_secs(6));
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn failed_dispatch_is_not_requeued() {
        let (mut sched, clock, broker) = setup(Config {
            task_publish_retry: false,
            ..Config::default()
        });
        sched.add(ScheduleEntry::new("ping", "t.ping", Schedule::every(Duration::from_secs(10)), start()));
        broker.fail_next_publishes(1);

        clock.advance(Duration::from_secs(10));
        sched.tick().await;
        assert!(broker.published().is_empty());
        let entry = sched.get("ping").unwrap();
        assert_eq!(entry.total_run_count, 1);
        assert_eq!(entry.last_run_at, clock.now());
        assert_eq!(sched.tasks_since_sync(), 0);

        sched.tick().await;
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn sync_triggers_on_time_or_task_count() {
        let (mut sched, clock, _) = setup(Config {
            beat_sync_every: 2,
            beat_sync_interval: 60.0,
            ..Config::default()
        });
        sched.add(ScheduleEntry::new("ping", "t.ping", Schedule::every(Duration::from_secs(1)), start()));
        assert!(sched.should_sync());
        sched.mark_synced();
        assert!(!sched.should_sync());

        for _ in 0..2 {
            clock.advance(Duration::from_secs(1));
            sched.tick().await;
        }
        assert_eq!(sched.tasks_since_sync(), 2);
        assert!(sched.should_sync());
        sched.mark_synced();
        assert!(!sched.should_sync());

        clock.advance(Duration::from_secs(61));
        assert!(sched.should_sync());
    }

    #[test]
    fn invalid_configured_entry_fails_construction() {
        let config = Config::from_toml(
            "[beat_schedule.bad]\ntask = \"t\"\nschedule = { minute = \"99\" }\n",
        )
        .unwrap();
        let app = App::builder().name("bad").config(config).build();
        assert!(Scheduler::new(app).is_err());
    }
}
