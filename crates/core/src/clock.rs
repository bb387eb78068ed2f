//! Wall and monotonic time sources plus fixed-offset timezones.
//!
//! [`SystemClock`] is the default. [`ManualClock`] never moves on its own and
//! is advanced explicitly, which keeps schedule and ETA tests deterministic.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{FahrplanError, Result};

/// Source of "now" for the dispatcher and the scheduler.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock instant.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time elapsed since the clock was created.
    fn monotonic(&self) -> Duration;
}

/// Clock backed by the operating system.
#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    elapsed: Duration,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                elapsed: Duration::ZERO,
            }),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        state.elapsed += by;
    }

    /// Jump to an absolute instant. Going backwards leaves the monotonic
    /// reading untouched.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(delta) = (to - state.now).to_std() {
            state.elapsed += delta;
        }
        state.now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).now
    }

    fn monotonic(&self) -> Duration {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).elapsed
    }
}

// ── Timezone ────────────────────────────────────────────────────────

/// A configured timezone: `UTC` or a fixed offset such as `+05:30`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timezone {
    offset: FixedOffset,
    named_utc: bool,
}

impl Timezone {
    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
            named_utc: true,
        }
    }

    pub fn fixed(offset: FixedOffset) -> Self {
        Self {
            offset,
            named_utc: false,
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn is_utc(&self) -> bool {
        self.offset.local_minus_utc() == 0
    }

    /// Convert a UTC instant into this timezone.
    pub fn localize(&self, dt: DateTime<Utc>) -> DateTime<FixedOffset> {
        dt.with_timezone(&self.offset)
    }

    /// Canonical name, as stored in persisted schedules.
    pub fn name(&self) -> String {
        if self.named_utc {
            return "UTC".to_string();
        }
        let secs = self.offset.local_minus_utc();
        let sign = if secs < 0 { '-' } else { '+' };
        let secs = secs.abs();
        format!("{sign}{:02}:{:02}", secs / 3600, (secs % 3600) / 60)
    }
}

impl Default for Timezone {
    fn default() -> Self {
        Self::utc()
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Timezone {
    type Err = FahrplanError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "UTC" | "Z" | "GMT" | "ETC/UTC" | "ETC/GMT" | "" => return Ok(Self::utc()),
            _ => {}
        }

        let invalid = || FahrplanError::ImproperlyConfigured(format!("unknown timezone '{s}'"));

        let (sign, rest) = match trimmed.as_bytes().first() {
            Some(b'+') => (1, &trimmed[1..]),
            Some(b'-') => (-1, &trimmed[1..]),
            _ => return Err(invalid()),
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let (hours, minutes) = if digits.len() <= 2 {
            (digits.parse::<i32>().map_err(|_| invalid())?, 0)
        } else {
            let split = digits.len() - 2;
            (
                digits[..split].parse::<i32>().map_err(|_| invalid())?,
                digits[split..].parse::<i32>().map_err(|_| invalid())?,
            )
        };
        if hours > 23 || minutes > 59 {
            return Err(invalid());
        }
        let offset =
            FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)?;
        Ok(Self::fixed(offset))
    }
}

impl Serialize for Timezone {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for Timezone {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Format as ISO-8601 with offset, microseconds only when non-zero.
///
/// `2024-01-01T00:01:00+00:00`, `2024-01-01T00:01:00.250000+00:00`.
pub fn isoformat(dt: &DateTime<FixedOffset>) -> String {
    if dt.nanosecond() == 0 {
        dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
    }
}
