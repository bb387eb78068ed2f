//! [`PersistentScheduler`]: a [`Scheduler`] whose run history survives
//! restarts.

use fahrplan_core::Config;
use fahrplan_dispatch::{App, BACKEND_CLEANUP_TASK};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::entry::ScheduleEntry;
use crate::error::{BeatError, Result};
use crate::schedule::{Crontab, Schedule};
use crate::scheduler::{BeatScheduler, Scheduler};
use crate::store::{FileStore, ScheduleStore, StoredSchedule};

/// Format version written to every store. A stored schedule with any other
/// version is discarded.
pub const SCHEDULE_VERSION: u32 = 1;

/// Name of the default entry that purges expired results.
pub const BACKEND_CLEANUP_ENTRY: &str = "backend_cleanup";

/// Seconds after which a queued cleanup message expires.
const CLEANUP_EXPIRES_SECS: f64 = 12.0 * 3600.0;

/// Scheduler backed by a [`ScheduleStore`].
///
/// On open the stored history is merged into the configured schedule:
/// configured entries keep the last-run instant and run count they had in
/// the store, stored entries that are no longer configured are dropped.
/// History is discarded when the store was written by another format
/// version, another timezone or another UTC setting.
#[derive(Debug)]
pub struct PersistentScheduler {
    inner: Scheduler,
    store: Box<dyn ScheduleStore>,
    utc_enabled: bool,
}

impl PersistentScheduler {
    /// Open with the app's configured schedule.
    pub fn open(app: App, store: impl ScheduleStore + 'static) -> Result<Self> {
        Self::open_with(app, store, Vec::new())
    }

    /// Open with the configured schedule plus `extra` entries defined in
    /// code. Extra entries replace configured ones of the same name.
    pub fn open_with(
        app: App,
        store: impl ScheduleStore + 'static,
        extra: Vec<ScheduleEntry>,
    ) -> Result<Self> {
        let conf = app.conf()?;
        let mut inner = Scheduler::new(app)?;
        for entry in extra {
            inner.add(entry);
        }
        install_default_entries(&mut inner, &conf)?;

        let mut this = Self {
            inner,
            store: Box::new(store),
            utc_enabled: conf.enable_utc,
        };
        let stored = this.load_compatible(&conf)?;
        this.merge(stored);
        this.sync()?;
        info!(
            entries = this.inner.len(),
            timezone = %conf.timezone,
            "beat: schedule opened"
        );
        Ok(this)
    }

    /// Open a [`FileStore`] at the configured `beat_schedule_filename`.
    pub fn open_file(app: App) -> Result<Self> {
        let conf = app.conf()?;
        Self::open(app, FileStore::new(&conf.beat_schedule_filename))
    }

    /// Stored history that is still valid for `conf`. Corrupt or
    /// mismatched stores are cleared.
    fn load_compatible(&mut self, conf: &Config) -> Result<Option<StoredSchedule>> {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(BeatError::StoreCorrupt { path, reason }) => {
                warn!(path = %path, reason = %reason, "removing corrupted schedule store");
                self.store.clear()?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let Some(stored) = stored else {
            return Ok(None);
        };

        let timezone = conf.timezone.name();
        if stored.version != SCHEDULE_VERSION {
            warn!(
                found = stored.version,
                expected = SCHEDULE_VERSION,
                "schedule store version changed, resetting"
            );
        } else if stored.timezone != timezone {
            warn!(
                found = %stored.timezone,
                expected = %timezone,
                "timezone changed, resetting schedule"
            );
        } else if stored.utc_enabled != conf.enable_utc {
            warn!(
                found = stored.utc_enabled,
                expected = conf.enable_utc,
                "utc setting changed, resetting schedule"
            );
        } else {
            return Ok(Some(stored));
        }
        self.store.clear()?;
        Ok(None)
    }

    fn merge(&mut self, stored: Option<StoredSchedule>) {
        let Some(stored) = stored else {
            return;
        };
        let mut dropped = 0usize;
        for (name, record) in &stored.entries {
            let Some(current) = self.inner.entries_mut().get_mut(name) else {
                dropped += 1;
                continue;
            };
            match ScheduleEntry::from_record(name, record) {
                Some(mut restored) => {
                    restored.update_from(current);
                    *current = restored;
                }
                None => {
                    current.last_run_at = record.last_run_at;
                    current.total_run_count = record.total_run_count;
                }
            }
        }
        debug!(
            restored = stored.entries.len() - dropped,
            dropped, "merged stored schedule"
        );
    }

    fn snapshot(&self) -> StoredSchedule {
        StoredSchedule {
            version: SCHEDULE_VERSION,
            timezone: self.inner.timezone().name(),
            utc_enabled: self.utc_enabled,
            entries: self
                .inner
                .entries()
                .iter()
                .map(|(name, entry)| (name.clone(), entry.to_record()))
                .collect::<IndexMap<_, _>>(),
        }
    }
}

impl BeatScheduler for PersistentScheduler {
    fn scheduler(&self) -> &Scheduler {
        &self.inner
    }

    fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.inner
    }

    fn sync(&mut self) -> Result<()> {
        let snapshot = self.snapshot();
        self.store.save(&snapshot)?;
        self.inner.mark_synced();
        debug!(entries = snapshot.entries.len(), "beat: synced schedule");
        Ok(())
    }
}

/// Add the cleanup entry when results expire and the backend can purge
/// them, unless the schedule already has an entry of that name.
fn install_default_entries(scheduler: &mut Scheduler, conf: &Config) -> Result<()> {
    if scheduler.contains(BACKEND_CLEANUP_ENTRY) || conf.result_expires.is_none() {
        return Ok(());
    }
    if !scheduler.app().backend()?.supports_cleanup() {
        return Ok(());
    }
    let cron = Crontab::new("0", "4", "*", "*", "*")?;
    let mut entry = ScheduleEntry::new(
        BACKEND_CLEANUP_ENTRY,
        BACKEND_CLEANUP_TASK,
        Schedule::Crontab(cron),
        scheduler.app().now(),
    );
    entry.options.expires = Some(CLEANUP_EXPIRES_SECS);
    scheduler.add(entry);
    Ok(())
}
