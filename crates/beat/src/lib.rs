//! Periodic task scheduler ("beat").
//!
//! A [`Scheduler`] owns named [`ScheduleEntry`] values and, on every tick,
//! dispatches the entries that are due through a
//! [`fahrplan_dispatch::App`]. [`PersistentScheduler`] mirrors run counts
//! and last-run instants into a [`ScheduleStore`] so restarts do not replay
//! or skip work. [`BeatService`] drives either one in a loop until stopped.

pub mod entry;
pub mod error;
pub mod persistent;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod store;

pub use entry::ScheduleEntry;
pub use error::{BeatError, Result};
pub use persistent::{PersistentScheduler, BACKEND_CLEANUP_ENTRY, SCHEDULE_VERSION};
pub use schedule::{Crontab, CrontabParser, CustomSchedule, DueCheck, Schedule};
pub use scheduler::{BeatScheduler, Scheduler};
pub use service::{spawn_embedded, BeatHandle, BeatService, EmbeddedBeat};
pub use store::{EntryRecord, FileStore, MemoryStore, ScheduleStore, StoredSchedule};
