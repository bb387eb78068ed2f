//! When an entry runs: fixed intervals, crontabs, or caller-supplied logic.
//!
//! The scheduler only ever asks two questions of a [`Schedule`]: is it due
//! given the last run ([`Schedule::is_due`]), and when is the next run
//! after a given instant ([`Schedule::next_after`]).

mod crontab;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use fahrplan_core::{ScheduleSpec, Timezone};

use crate::error::{BeatError, Result};

pub use self::crontab::{Crontab, CrontabParser};

/// Outcome of a due check: whether to run now, and how long until the
/// schedule should be checked again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueCheck {
    pub is_due: bool,
    pub next: Duration,
}

impl DueCheck {
    pub fn due(next: Duration) -> Self {
        Self { is_due: true, next }
    }

    pub fn not_due(next: Duration) -> Self {
        Self {
            is_due: false,
            next,
        }
    }
}

/// A schedule with caller-defined semantics.
pub trait CustomSchedule: Send + Sync + fmt::Debug {
    fn is_due(&self, last_run_at: DateTime<Utc>, now: DateTime<Utc>) -> DueCheck;

    /// Next run after `last_run_at`, if the schedule can tell.
    fn next_after(&self, _last_run_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }
}

#[derive(Debug, Clone)]
pub enum Schedule {
    /// Run every `run_every`. With `relative`, the last run is rounded down
    /// to the resolution of `run_every` (days, hours or minutes) first.
    Interval { run_every: Duration, relative: bool },
    Crontab(Crontab),
    Custom(Arc<dyn CustomSchedule>),
}

impl Schedule {
    pub fn every(run_every: Duration) -> Self {
        Self::Interval {
            run_every,
            relative: false,
        }
    }

    pub fn custom(schedule: impl CustomSchedule + 'static) -> Self {
        Self::Custom(Arc::new(schedule))
    }

    /// Build from a configured schedule.
    pub fn from_spec(spec: &ScheduleSpec, relative: bool) -> Result<Self> {
        match spec {
            ScheduleSpec::Every(secs) => {
                let run_every = Duration::try_from_secs_f64(*secs)
                    .ok()
                    .filter(|d| !d.is_zero())
                    .ok_or_else(|| BeatError::InvalidSchedule {
                        entry: String::new(),
                        reason: format!("interval must be positive, got {secs}"),
                    })?;
                Ok(Self::Interval {
                    run_every,
                    relative,
                })
            }
            ScheduleSpec::Crontab(cron) => Ok(Self::Crontab(Crontab::parse(cron)?)),
        }
    }

    /// The configured form, for persistence. Custom schedules have none.
    pub fn to_spec(&self) -> Option<ScheduleSpec> {
        match self {
            Self::Interval { run_every, .. } => Some(ScheduleSpec::Every(run_every.as_secs_f64())),
            Self::Crontab(cron) => Some(ScheduleSpec::Crontab(cron.spec().clone())),
            Self::Custom(_) => None,
        }
    }

    pub fn is_relative(&self) -> bool {
        matches!(self, Self::Interval { relative: true, .. })
    }

    /// The first run strictly after `last_run_at`.
    pub fn next_after(&self, last_run_at: DateTime<Utc>, tz: Timezone) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval {
                run_every,
                relative,
            } => {
                let start = if *relative {
                    round_down(last_run_at, *run_every, tz)
                } else {
                    last_run_at
                };
                let step = chrono::Duration::from_std(*run_every).ok()?;
                start.checked_add_signed(step)
            }
            Self::Crontab(cron) => cron.next_after(last_run_at, tz),
            Self::Custom(custom) => custom.next_after(last_run_at),
        }
    }

    /// Whether a run is due at `now` given the previous run.
    ///
    /// When due, `next` is the wait until the run after this one.
    pub fn is_due(&self, last_run_at: DateTime<Utc>, now: DateTime<Utc>, tz: Timezone) -> DueCheck {
        match self {
            Self::Interval { run_every, .. } => match self.next_after(last_run_at, tz) {
                Some(at) if at > now => DueCheck::not_due(until(now, at)),
                Some(_) => DueCheck::due(*run_every),
                None => DueCheck::not_due(Duration::MAX),
            },
            Self::Crontab(cron) => match cron.next_after(last_run_at, tz) {
                Some(at) if at <= now => {
                    let next = cron
                        .next_after(now, tz)
                        .map_or(Duration::MAX, |next| until(now, next));
                    DueCheck::due(next)
                }
                Some(at) => DueCheck::not_due(until(now, at)),
                None => DueCheck::not_due(Duration::MAX),
            },
            Self::Custom(custom) => custom.is_due(last_run_at, now),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { run_every, .. } => write!(f, "<freq: {}>", humanize(*run_every)),
            Self::Crontab(cron) => fmt::Display::fmt(cron, f),
            Self::Custom(custom) => write!(f, "<custom: {custom:?}>"),
        }
    }
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Truncate `dt` (in `tz`) to the coarsest unit that fits in `resolution`.
fn round_down(dt: DateTime<Utc>, resolution: Duration, tz: Timezone) -> DateTime<Utc> {
    let secs = resolution.as_secs();
    let local = tz.localize(dt);
    let truncated = if secs >= 86_400 {
        local.date_naive().and_hms_opt(0, 0, 0).and_then(|naive| {
            naive
                .and_local_timezone(tz.offset())
                .single()
                .map(|d| d.with_timezone(&Utc))
        })
    } else if secs >= 3_600 {
        local
            .with_nanosecond(0)
            .and_then(|d| d.with_second(0))
            .and_then(|d| d.with_minute(0))
            .map(|d| d.with_timezone(&Utc))
    } else if secs >= 60 {
        local
            .with_nanosecond(0)
            .and_then(|d| d.with_second(0))
            .map(|d| d.with_timezone(&Utc))
    } else {
        None
    };
    truncated.unwrap_or(dt)
}

fn humanize(d: Duration) -> String {
    let secs = d.as_secs_f64();
    for (unit, size) in [("day", 86_400.0), ("hour", 3_600.0), ("minute", 60.0)] {
        if secs >= size {
            let n = secs / size;
            let plural = if n == 1.0 { "" } else { "s" };
            return format!("{} {unit}{plural}", trim_float(n));
        }
    }
    format!("{} seconds", trim_float(secs))
}

fn trim_float(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{n:.0}")
    } else {
        format!("{n:.2}")
    }
}
