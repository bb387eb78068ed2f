//! Crontab fields and their next match.
//!
//! Each field accepts `*`, numbers, ranges (`1-5`, wrapping `11-1`), steps
//! (`*/15`, `2-30/4`), comma groups and, for the weekday and month fields,
//! names (`mon`, `sunday`, `jan`). Day-of-week counts from 0 = Sunday. A
//! date matches only when both its day-of-month and its day-of-week are in
//! their sets.
//!
//! Fields are expanded here and handed to the `cron` crate as explicit
//! lists, which finds the next match.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use fahrplan_core::{CrontabSpec, Timezone};

use crate::error::{BeatError, Result};

const WEEKDAYS: &[(&str, u32)] = &[
    ("sun", 0),
    ("sunday", 0),
    ("mon", 1),
    ("monday", 1),
    ("tue", 2),
    ("tues", 2),
    ("tuesday", 2),
    ("wed", 3),
    ("wednesday", 3),
    ("thu", 4),
    ("thur", 4),
    ("thurs", 4),
    ("thursday", 4),
    ("fri", 5),
    ("friday", 5),
    ("sat", 6),
    ("saturday", 6),
];

const MONTHS: &[(&str, u32)] = &[
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

// ── Field parser ────────────────────────────────────────────────────

/// Parser for one crontab field covering `min..min + max`.
#[derive(Debug, Clone, Copy)]
pub struct CrontabParser {
    field: &'static str,
    max: u32,
    min: u32,
    names: &'static [(&'static str, u32)],
}

impl CrontabParser {
    /// A field of `max` consecutive values starting at `min`.
    pub const fn new(field: &'static str, max: u32, min: u32) -> Self {
        Self {
            field,
            max,
            min,
            names: &[],
        }
    }

    pub const fn minute() -> Self {
        Self::new("minute", 60, 0)
    }

    pub const fn hour() -> Self {
        Self::new("hour", 24, 0)
    }

    pub const fn day_of_week() -> Self {
        Self {
            names: WEEKDAYS,
            ..Self::new("day_of_week", 7, 0)
        }
    }

    pub const fn day_of_month() -> Self {
        Self::new("day_of_month", 31, 1)
    }

    pub const fn month_of_year() -> Self {
        Self {
            names: MONTHS,
            ..Self::new("month_of_year", 12, 1)
        }
    }

    /// Expand `spec` into the set of values it selects.
    pub fn parse(&self, spec: &str) -> Result<BTreeSet<u32>> {
        if spec.trim().is_empty() {
            return Err(self.error(spec, "empty field"));
        }
        let mut values = BTreeSet::new();
        for group in spec.split(',') {
            let group = group.trim();
            if group.is_empty() {
                return Err(self.error(spec, "empty group"));
            }
            values.extend(self.parse_group(group)?);
        }
        Ok(values)
    }

    fn parse_group(&self, group: &str) -> Result<Vec<u32>> {
        if let Some((base, step)) = group.split_once('/') {
            let step = step.trim();
            if step.is_empty() {
                return Err(self.error(group, "empty step"));
            }
            let step: usize = step
                .parse()
                .map_err(|_| self.error(group, "step is not a number"))?;
            if step == 0 {
                return Err(self.error(group, "step must be positive"));
            }
            let base = base.trim();
            let expanded = if base == "*" {
                self.star()
            } else if base.contains('-') {
                self.range(base)?
            } else {
                return Err(self.error(group, "steps apply to '*' or a range"));
            };
            return Ok(expanded.into_iter().step_by(step).collect());
        }
        if group == "*" {
            return Ok(self.star());
        }
        if group.starts_with('-') {
            return Err(self.error(group, "negative numbers are not supported"));
        }
        if group.contains('-') {
            return self.range(group);
        }
        Ok(vec![self.number(group)?])
    }

    fn star(&self) -> Vec<u32> {
        (self.min..self.min + self.max).collect()
    }

    /// `a-b`, wrapping past the top of the field when `b < a`.
    fn range(&self, token: &str) -> Result<Vec<u32>> {
        if token.starts_with('-') {
            return Err(self.error(token, "negative numbers are not supported"));
        }
        let (from, to) = token
            .split_once('-')
            .ok_or_else(|| self.error(token, "invalid range"))?;
        let from = self.number(from)?;
        let to = self.number(to)?;
        if to < from {
            return Ok((from..self.min + self.max).chain(self.min..=to).collect());
        }
        Ok((from..=to).collect())
    }

    fn number(&self, token: &str) -> Result<u32> {
        let token = token.trim();
        if token.starts_with('-') {
            return Err(self.error(token, "negative numbers are not supported"));
        }
        let value = match token.parse::<u32>() {
            Ok(n) => n,
            Err(_) => {
                let lower = token.to_ascii_lowercase();
                self.names
                    .iter()
                    .find(|(name, _)| *name == lower)
                    .map(|(_, n)| *n)
                    .ok_or_else(|| self.error(token, "invalid literal"))?
            }
        };
        let max_value = self.min + self.max - 1;
        if value > max_value {
            return Err(self.error(token, &format!("{value} > {max_value}")));
        }
        if value < self.min {
            return Err(self.error(token, &format!("{value} < {}", self.min)));
        }
        Ok(value)
    }

    fn error(&self, value: &str, reason: &str) -> BeatError {
        BeatError::Crontab {
            field: self.field,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ── Crontab ─────────────────────────────────────────────────────────

/// A parsed crontab. Equality compares the expanded sets, so `1-2` equals
/// `1, 2`.
#[derive(Debug, Clone)]
pub struct Crontab {
    spec: CrontabSpec,
    minute: BTreeSet<u32>,
    hour: BTreeSet<u32>,
    day_of_week: BTreeSet<u32>,
    day_of_month: BTreeSet<u32>,
    month_of_year: BTreeSet<u32>,
    schedule: Schedule,
}

impl Crontab {
    pub fn parse(spec: &CrontabSpec) -> Result<Self> {
        let minute = CrontabParser::minute().parse(&spec.minute)?;
        let hour = CrontabParser::hour().parse(&spec.hour)?;
        let day_of_week = CrontabParser::day_of_week().parse(&spec.day_of_week)?;
        let day_of_month = CrontabParser::day_of_month().parse(&spec.day_of_month)?;
        let month_of_year = CrontabParser::month_of_year().parse(&spec.month_of_year)?;

        // `cron` wants `sec min hour day-of-month month day-of-week`, with
        // Sunday = 1.
        let expression = format!(
            "0 {} {} {} {} {}",
            cron_list(&minute, 0),
            cron_list(&hour, 0),
            cron_list(&day_of_month, 0),
            cron_list(&month_of_year, 0),
            cron_list(&day_of_week, 1),
        );
        let schedule = Schedule::from_str(&expression).map_err(|e| BeatError::Crontab {
            field: "expression",
            value: expression.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            spec: spec.clone(),
            minute,
            hour,
            day_of_week,
            day_of_month,
            month_of_year,
            schedule,
        })
    }

    /// Fields in crontab order: minute, hour, day-of-week, day-of-month,
    /// month-of-year.
    pub fn new(
        minute: &str,
        hour: &str,
        day_of_week: &str,
        day_of_month: &str,
        month_of_year: &str,
    ) -> Result<Self> {
        Self::parse(&CrontabSpec {
            minute: minute.into(),
            hour: hour.into(),
            day_of_week: day_of_week.into(),
            day_of_month: day_of_month.into(),
            month_of_year: month_of_year.into(),
        })
    }

    /// The textual fields this crontab was parsed from.
    pub fn spec(&self) -> &CrontabSpec {
        &self.spec
    }

    pub fn minutes(&self) -> &BTreeSet<u32> {
        &self.minute
    }

    pub fn hours(&self) -> &BTreeSet<u32> {
        &self.hour
    }

    pub fn days_of_week(&self) -> &BTreeSet<u32> {
        &self.day_of_week
    }

    pub fn days_of_month(&self) -> &BTreeSet<u32> {
        &self.day_of_month
    }

    pub fn months_of_year(&self) -> &BTreeSet<u32> {
        &self.month_of_year
    }

    /// The least whole minute strictly after `after` that matches every
    /// field, evaluated in `tz`. `None` when nothing ever matches (e.g.
    /// February 30th).
    pub fn next_after(&self, after: DateTime<Utc>, tz: Timezone) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&tz.localize(after))
            .next()
            .map(|hit| hit.with_timezone(&Utc))
    }
}

impl PartialEq for Crontab {
    fn eq(&self, other: &Self) -> bool {
        self.minute == other.minute
            && self.hour == other.hour
            && self.day_of_week == other.day_of_week
            && self.day_of_month == other.day_of_month
            && self.month_of_year == other.month_of_year
    }
}

impl Eq for Crontab {}

impl fmt::Display for Crontab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<crontab: {} {} {} {} {} (m/h/d/dM/MY)>",
            self.spec.minute,
            self.spec.hour,
            self.spec.day_of_week,
            self.spec.day_of_month,
            self.spec.month_of_year
        )
    }
}

fn cron_list(values: &BTreeSet<u32>, shift: u32) -> String {
    values
        .iter()
        .map(|v| (v + shift).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Duration, TimeZone, Timelike};

    use super::*;

    fn set(values: impl IntoIterator<Item = u32>) -> BTreeSet<u32> {
        values.into_iter().collect()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn next(cron: &Crontab, after: DateTime<Utc>) -> DateTime<Utc> {
        cron.next_after(after, Timezone::utc()).unwrap()
    }

    // -- parser ------------------------------------------------------------

    #[test]
    fn parse_star() {
        assert_eq!(CrontabParser::minute().parse("*").unwrap(), set(0..60));
        assert_eq!(CrontabParser::hour().parse("*").unwrap(), set(0..24));
        assert_eq!(CrontabParser::day_of_week().parse("*").unwrap(), set(0..7));
        assert_eq!(CrontabParser::day_of_month().parse("*").unwrap(), set(1..=31));
        assert_eq!(CrontabParser::month_of_year().parse("*").unwrap(), set(1..=12));
    }

    #[test]
    fn parse_range() {
        assert_eq!(CrontabParser::minute().parse("1-10").unwrap(), set(1..=10));
        assert_eq!(CrontabParser::hour().parse("0-20").unwrap(), set(0..=20));
        assert_eq!(CrontabParser::new("t", 60, 1).parse("1-10").unwrap(), set(1..=10));
    }

    #[test]
    fn parse_range_wraps() {
        assert_eq!(CrontabParser::new("t", 12, 0).parse("11-1").unwrap(), set([11, 0, 1]));
        assert_eq!(CrontabParser::new("t", 60, 1).parse("2-1").unwrap(), set(1..=60));
    }

    #[test]
    fn parse_groups() {
        assert_eq!(CrontabParser::minute().parse("1,2,3,4").unwrap(), set([1, 2, 3, 4]));
        assert_eq!(
            CrontabParser::minute().parse("0,15,30,45").unwrap(),
            set([0, 15, 30, 45])
        );
        assert_eq!(CrontabParser::day_of_week().parse("1, 2").unwrap(), set([1, 2]));
    }

    #[test]
    fn parse_steps() {
        assert_eq!(CrontabParser::new("t", 8, 0).parse("*/2").unwrap(), set([0, 2, 4, 6]));
        assert_eq!(CrontabParser::new("t", 8, 1).parse("*/2").unwrap(), set([1, 3, 5, 7]));
        assert_eq!(
            CrontabParser::minute().parse("*/3").unwrap(),
            set((0..20).map(|i| i * 3))
        );
        assert_eq!(
            CrontabParser::new("t", 60, 1).parse("*/2").unwrap(),
            set((0..30).map(|i| i * 2 + 1))
        );
    }

    #[test]
    fn parse_composite() {
        let minute = CrontabParser::minute();
        assert_eq!(minute.parse("2-9/5").unwrap(), set([2, 7]));
        assert_eq!(minute.parse("2-10/5").unwrap(), set([2, 7]));
        assert_eq!(minute.parse("2-11/5,3").unwrap(), set([2, 3, 7]));
        assert_eq!(minute.parse("1-9/2").unwrap(), set([1, 3, 5, 7, 9]));
        assert_eq!(
            minute.parse("2-4/3,*/5,0-21/4").unwrap(),
            set([0, 2, 4, 5, 8, 10, 12, 15, 16, 20, 25, 30, 35, 40, 45, 50, 55])
        );
        assert_eq!(
            CrontabParser::new("t", 60, 1).parse("55-5/3").unwrap(),
            set([55, 58, 1, 4])
        );
    }

    #[test]
    fn parse_names() {
        let dow = CrontabParser::day_of_week();
        assert_eq!(dow.parse("fri").unwrap(), set([5]));
        assert_eq!(dow.parse("tuesday,sunday,fri").unwrap(), set([0, 2, 5]));
        assert_eq!(dow.parse("mon-fri").unwrap(), set(1..=5));
        assert_eq!(
            CrontabParser::month_of_year().parse("jan,Jun-aug").unwrap(),
            set([1, 6, 7, 8])
        );
    }

    #[test]
    fn parse_errors() {
        let minute = CrontabParser::minute();
        for bad in ["", "1,,2", "*/", "-20", "*/0", "5/2", "61-0", "60"] {
            assert!(minute.parse(bad).is_err(), "'{bad}' should not parse");
        }
        assert!(CrontabParser::new("t", 12, 1).parse("0").is_err());
        assert!(CrontabParser::new("t", 24, 1).parse("12-0").is_err());
        assert!(CrontabParser::new("t", 1, 0).parse("0").is_ok());
        assert!(CrontabParser::new("t", 1, 0).parse("1").is_err());

        let dow = CrontabParser::day_of_week();
        for bad in ["fooday-barday", "1,4,foo", "7", "12"] {
            assert!(dow.parse(bad).is_err(), "'{bad}' should not parse");
        }
        let dom = CrontabParser::day_of_month();
        for bad in ["0", "0-10", "32", "31,32"] {
            assert!(dom.parse(bad).is_err(), "'{bad}' should not parse");
        }
        let moy = CrontabParser::month_of_year();
        for bad in ["0", "0-5", "13", "12,13"] {
            assert!(moy.parse(bad).is_err(), "'{bad}' should not parse");
        }
    }

    #[test]
    fn parse_error_names_the_field() {
        let err = CrontabParser::hour().parse("24").unwrap_err();
        assert!(err.to_string().contains("hour"));
    }

    #[test]
    fn field_formats() {
        assert_eq!(
            CrontabParser::day_of_month().parse("*/5").unwrap(),
            set([1, 6, 11, 16, 21, 26, 31])
        );
        assert_eq!(
            CrontabParser::month_of_year().parse("*/2").unwrap(),
            set([1, 3, 5, 7, 9, 11])
        );
        assert_eq!(
            CrontabParser::month_of_year().parse("2-12/2").unwrap(),
            set([2, 4, 6, 8, 10, 12])
        );
        assert_eq!(CrontabParser::day_of_week().parse("*/2").unwrap(), set([0, 2, 4, 6]));
    }

    #[test]
    fn equality_uses_expanded_sets() {
        assert_eq!(
            Crontab::new("*", "*", "1, 2", "*", "*").unwrap(),
            Crontab::new("*", "*", "1-2", "*", "*").unwrap()
        );
        assert_eq!(
            Crontab::new("*", "*", "*", "1, 16, 31", "*").unwrap(),
            Crontab::new("*", "*", "*", "*/15", "*").unwrap()
        );
        assert_ne!(
            Crontab::new("1", "*", "*", "*", "*").unwrap(),
            Crontab::new("2", "*", "*", "*", "*").unwrap()
        );
    }

    #[test]
    fn display_shows_source_fields() {
        let cron = Crontab::new("0", "4", "*", "*", "*").unwrap();
        assert_eq!(cron.to_string(), "<crontab: 0 4 * * * (m/h/d/dM/MY)>");
    }

    // -- next match --------------------------------------------------------

    #[test]
    fn next_minute() {
        let every = Crontab::new("*", "*", "*", "*", "*").unwrap();
        assert_eq!(next(&every, at(2010, 9, 11, 14, 30, 15)), at(2010, 9, 11, 14, 31, 0));
        assert_eq!(next(&every, at(2010, 9, 11, 14, 59, 15)), at(2010, 9, 11, 15, 0, 0));
    }

    #[test]
    fn next_within_and_past_the_hour() {
        let this_hour = Crontab::new("5,42", "*", "*", "*", "*").unwrap();
        assert_eq!(next(&this_hour, at(2010, 9, 11, 14, 30, 15)), at(2010, 9, 11, 14, 42, 0));

        let next_hour = Crontab::new("5,10,15", "*", "*", "*", "*").unwrap();
        assert_eq!(next(&next_hour, at(2010, 9, 11, 14, 30, 15)), at(2010, 9, 11, 15, 5, 0));
    }

    #[test]
    fn next_today_and_tomorrow() {
        let today = Crontab::new("5,42", "12,17", "*", "*", "*").unwrap();
        assert_eq!(next(&today, at(2010, 9, 11, 14, 30, 15)), at(2010, 9, 11, 17, 5, 0));

        let tomorrow = Crontab::new("5,42", "12", "*", "*", "*").unwrap();
        assert_eq!(next(&tomorrow, at(2010, 9, 11, 14, 30, 15)), at(2010, 9, 12, 12, 5, 0));
    }

    #[test]
    fn next_weekday() {
        let saturday = Crontab::new("30", "14", "sat", "*", "*").unwrap();
        assert_eq!(next(&saturday, at(2010, 9, 11, 14, 30, 15)), at(2010, 9, 18, 14, 30, 0));

        let workdays = Crontab::new("5,42", "*", "mon-fri", "*", "*").unwrap();
        assert_eq!(next(&workdays, at(2010, 9, 11, 14, 30, 15)), at(2010, 9, 13, 0, 5, 0));
    }

    #[test]
    fn next_month_day() {
        let eighteenth = Crontab::new("30", "14", "*", "18", "*").unwrap();
        assert_eq!(next(&eighteenth, at(2010, 9, 11, 14, 30, 15)), at(2010, 9, 18, 14, 30, 0));

        let twenty_ninth = Crontab::new("5,42", "*", "*", "29", "*").unwrap();
        assert_eq!(next(&twenty_ninth, at(2010, 1, 22, 14, 30, 15)), at(2010, 1, 29, 0, 5, 0));
    }

    #[test]
    fn weekday_and_month_day_must_both_match() {
        let monday_18th = Crontab::new("30", "14", "mon", "18", "*").unwrap();
        assert_eq!(next(&monday_18th, at(2010, 1, 18, 14, 30, 15)), at(2010, 10, 18, 14, 30, 0));

        let saturday_29th = Crontab::new("5,42", "*", "sat", "29", "*").unwrap();
        assert_eq!(next(&saturday_29th, at(2010, 1, 29, 0, 5, 15)), at(2010, 5, 29, 0, 5, 0));

        let monday_18th = Crontab::new("5,42", "*", "mon", "18", "*").unwrap();
        assert_eq!(next(&monday_18th, at(2010, 1, 11, 0, 5, 15)), at(2010, 1, 18, 0, 5, 0));
        assert_eq!(next(&monday_18th, at(2010, 1, 10, 0, 5, 15)), at(2010, 1, 18, 0, 5, 0));
    }

    /// Minute-by-minute scan used to cross-check `next_after`.
    fn scan(cron: &Crontab, after: DateTime<Utc>, limit: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        while t <= limit {
            if cron.minutes().contains(&t.minute())
                && cron.hours().contains(&t.hour())
                && cron.days_of_month().contains(&t.day())
                && cron.months_of_year().contains(&t.month())
                && cron
                    .days_of_week()
                    .contains(&t.weekday().num_days_from_sunday())
            {
                return Some(t);
            }
            t += Duration::minutes(1);
        }
        None
    }

    #[test]
    fn weekday_and_month_day_agree_with_a_full_scan() {
        let limit = at(2028, 1, 1, 0, 0, 0);
        for (dow, dom) in [
            ("fri", "13"),
            ("sun", "1-7"),
            ("mon-wed", "*/10"),
            ("sat,sun", "15,31"),
            ("*", "29"),
            ("tue", "*"),
        ] {
            let cron = Crontab::new("15", "9,21", dow, dom, "*").unwrap();
            let mut after = at(2024, 1, 1, 0, 0, 0);
            for _ in 0..4 {
                let expected = scan(&cron, after, limit).unwrap();
                let got = next(&cron, after);
                assert_eq!(got, expected, "{dow} / {dom} after {after}");
                after = got;
            }
        }
    }

    #[test]
    fn leap_days() {
        let twenty_ninth = Crontab::new("30", "14", "*", "29", "*").unwrap();
        assert_eq!(next(&twenty_ninth, at(2012, 1, 29, 14, 30, 15)), at(2012, 2, 29, 14, 30, 0));
        assert_eq!(next(&twenty_ninth, at(2010, 1, 29, 14, 30, 15)), at(2010, 3, 29, 14, 30, 0));
    }

    #[test]
    fn thirty_first_skips_short_months() {
        let last = Crontab::new("0", "0", "*", "31", "*").unwrap();
        assert_eq!(next(&last, at(2024, 2, 1, 0, 0, 0)), at(2024, 3, 31, 0, 0, 0));
        assert_eq!(next(&last, at(2024, 4, 1, 0, 0, 0)), at(2024, 5, 31, 0, 0, 0));
    }

    #[test]
    fn impossible_date_never_matches() {
        let feb_30 = Crontab::new("0", "0", "*", "30", "feb").unwrap();
        assert!(feb_30.next_after(at(2024, 1, 1, 0, 0, 0), Timezone::utc()).is_none());
    }

    #[test]
    fn next_is_strictly_after() {
        let on_the_hour = Crontab::new("0", "*", "*", "*", "*").unwrap();
        assert_eq!(next(&on_the_hour, at(2024, 1, 1, 0, 0, 0)), at(2024, 1, 1, 1, 0, 0));
    }

    #[test]
    fn evaluated_in_configured_offset() {
        let plus2: Timezone = "+02:00".parse().unwrap();
        let four_am = Crontab::new("0", "4", "*", "*", "*").unwrap();
        let hit = four_am.next_after(at(2024, 1, 1, 0, 0, 0), plus2).unwrap();
        assert_eq!(hit, at(2024, 1, 1, 2, 0, 0));
    }
}
