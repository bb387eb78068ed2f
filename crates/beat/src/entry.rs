//! A named periodic task and its run bookkeeping.

use chrono::{DateTime, Utc};
use fahrplan_core::{BeatEntryConfig, PublishOptions, TaskOptions, Timezone};
use serde_json::{Map, Value};

use crate::error::{BeatError, Result};
use crate::schedule::{DueCheck, Schedule};
use crate::store::EntryRecord;

/// Scheduling state for a single periodic task.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    /// Unique key within the schedule.
    pub name: String,
    /// Task name passed to `send_task`.
    pub task: String,
    pub schedule: Schedule,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub options: TaskOptions,
    /// Defaults to the creation time, so a new entry waits one period.
    pub last_run_at: DateTime<Utc>,
    pub total_run_count: u64,
}

impl ScheduleEntry {
    pub fn new(
        name: impl Into<String>,
        task: impl Into<String>,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            schedule,
            args: Vec::new(),
            kwargs: Map::new(),
            options: TaskOptions::default(),
            last_run_at: now,
            total_run_count: 0,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_last_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_run_at = at;
        self
    }

    /// Build from a `beat_schedule` table entry.
    pub fn from_config(name: &str, config: &BeatEntryConfig, now: DateTime<Utc>) -> Result<Self> {
        let schedule =
            Schedule::from_spec(&config.schedule, config.relative).map_err(|e| e.in_entry(name))?;
        if config.task.is_empty() {
            return Err(BeatError::InvalidSchedule {
                entry: name.to_string(),
                reason: "no task name".into(),
            });
        }
        Ok(Self::new(name, config.task.clone(), schedule, now)
            .with_args(config.args.clone())
            .with_kwargs(config.kwargs.clone())
            .with_options(config.options.clone()))
    }

    pub fn is_due(&self, now: DateTime<Utc>, tz: Timezone) -> DueCheck {
        self.schedule.is_due(self.last_run_at, now, tz)
    }

    /// Claim this run: stamp `now` as the last run and count it.
    pub fn reserve(&mut self, now: DateTime<Utc>) -> &Self {
        self.last_run_at = now;
        self.total_run_count += 1;
        self
    }

    /// Take the definition (task, schedule, arguments, options) from
    /// `other`, keeping this entry's run history.
    pub fn update_from(&mut self, other: &ScheduleEntry) {
        self.task = other.task.clone();
        self.schedule = other.schedule.clone();
        self.args = other.args.clone();
        self.kwargs = other.kwargs.clone();
        self.options = other.options.clone();
    }

    /// Publish options for one dispatch of this entry.
    pub fn publish_options(&self) -> PublishOptions {
        PublishOptions::from(&self.options)
    }

    pub(crate) fn to_record(&self) -> EntryRecord {
        EntryRecord {
            task: self.task.clone(),
            schedule: self.schedule.to_spec(),
            relative: self.schedule.is_relative(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            options: self.options.clone(),
            last_run_at: self.last_run_at,
            total_run_count: self.total_run_count,
        }
    }

    /// Rebuild from a stored record. `None` when the record has no
    /// schedule that can be restored (custom schedules).
    pub(crate) fn from_record(name: &str, record: &EntryRecord) -> Option<Self> {
        let spec = record.schedule.as_ref()?;
        let schedule = Schedule::from_spec(spec, record.relative).ok()?;
        let mut entry = Self::new(name, record.task.clone(), schedule, record.last_run_at)
            .with_args(record.args.clone())
            .with_kwargs(record.kwargs.clone())
            .with_options(record.options.clone());
        entry.total_run_count = record.total_run_count;
        Some(entry)
    }
}
