//! Durable storage for schedule state.
//!
//! A store holds one [`StoredSchedule`] document: the entries plus the tags
//! (format version, timezone, UTC flag) that decide whether the stored run
//! history is still meaningful.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fahrplan_core::{ScheduleSpec, TaskOptions};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{BeatError, Result};

/// The persisted form of a [`crate::ScheduleEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub task: String,
    /// Absent for custom schedules.
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub relative: bool,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub options: TaskOptions,
    pub last_run_at: DateTime<Utc>,
    #[serde(default)]
    pub total_run_count: u64,
}

/// Everything a store keeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSchedule {
    #[serde(rename = "__version__")]
    pub version: u32,
    #[serde(rename = "tz")]
    pub timezone: String,
    pub utc_enabled: bool,
    #[serde(default)]
    pub entries: IndexMap<String, EntryRecord>,
}

/// Key-value backing for [`crate::PersistentScheduler`].
pub trait ScheduleStore: Send + fmt::Debug {
    /// The stored document, `None` when nothing was stored yet.
    /// Undecodable content yields [`BeatError::StoreCorrupt`].
    fn load(&mut self) -> Result<Option<StoredSchedule>>;

    /// Replace the stored document. Either the old or the new document
    /// survives a crash, never a mix.
    fn save(&mut self, schedule: &StoredSchedule) -> Result<()>;

    /// Remove everything, including the underlying files.
    fn clear(&mut self) -> Result<()>;
}

impl<S: ScheduleStore + ?Sized> ScheduleStore for Box<S> {
    fn load(&mut self) -> Result<Option<StoredSchedule>> {
        (**self).load()
    }

    fn save(&mut self, schedule: &StoredSchedule) -> Result<()> {
        (**self).save(schedule)
    }

    fn clear(&mut self) -> Result<()> {
        (**self).clear()
    }
}

// ── File store ──────────────────────────────────────────────────────

/// A single JSON document on disk, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ScheduleStore for FileStore {
    fn load(&mut self) -> Result<Option<StoredSchedule>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| BeatError::StoreCorrupt {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })
    }

    fn save(&mut self, schedule: &StoredSchedule) -> Result<()> {
        let json = serde_json::to_vec_pretty(schedule)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        // Persist the rename itself.
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
                debug!(dir = %dir.display(), error = %e, "directory sync skipped");
            }
        }
        debug!(path = %self.path.display(), entries = schedule.entries.len(), "schedule saved");
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        for path in [self.path.clone(), self.temp_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "schedule file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// ── Memory store ────────────────────────────────────────────────────

/// In-process store. Clones share the same document.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Option<StoredSchedule>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current document, if any.
    pub fn snapshot(&self) -> Option<StoredSchedule> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ScheduleStore for MemoryStore {
    fn load(&mut self) -> Result<Option<StoredSchedule>> {
        Ok(self.snapshot())
    }

    fn save(&mut self, schedule: &StoredSchedule) -> Result<()> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(schedule.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
