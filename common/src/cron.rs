// Cron expression parsing and evaluation.
//
// Seven whitespace-separated fields: second, minute, hour, day-of-month,
// month, day-of-week and an optional year, with `* ? , - / L W #` semantics
// and JAN-DEC / SUN-SAT names. Exactly one of day-of-month and day-of-week
// must be `?`. Evaluation happens in a configured time zone: local times
// skipped by a DST spring-forward resolve to the first existing instant at
// or after the nominal one, and ambiguous fall-back times fire on their
// first occurrence only.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::errors::ScheduleError;
use crate::time::{MAX_YEAR, MIN_YEAR};

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// A parsed, immutable cron expression bound to a time zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    time_zone: Tz,
    seconds: BTreeSet<u32>,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    years: Option<BTreeSet<i32>>,
    day_of_month_spec: bool,
    day_of_week_spec: bool,
    last_day_of_month: bool,
    last_day_offset: u32,
    nearest_weekday: bool,
    last_day_of_week: bool,
    nth_day_of_week: u32,
}

impl CronExpression {
    /// Parse an expression, evaluating in UTC.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        Self::parse_in_zone(expression, chrono_tz::UTC)
    }

    pub fn parse_in_zone(expression: &str, time_zone: Tz) -> Result<Self, ScheduleError> {
        Parser::new(expression).parse(time_zone)
    }

    pub fn expression(&self) -> &str {
        &self.source
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    pub fn with_time_zone(mut self, time_zone: Tz) -> Self {
        self.time_zone = time_zone;
        self
    }

    /// Whether the instant (truncated to seconds) matches the expression.
    pub fn is_satisfied_by(&self, t: DateTime<Utc>) -> bool {
        let truncated = t - Duration::nanoseconds(t.timestamp_subsec_nanos() as i64);
        match self.next_valid_time_after(truncated - Duration::seconds(1)) {
            Some(next) => next == truncated,
            None => false,
        }
    }

    /// First matching instant strictly after `after`, or None when the
    /// expression has no further fire times before the search bound.
    pub fn next_valid_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after + Duration::seconds(1);
        let local = start.with_timezone(&self.time_zone);

        let mut year = local.year();
        let mut month = local.month();
        let mut day = local.day();
        let mut hour = local.hour();
        let mut minute = local.minute();
        let mut second = local.second();

        // Bounded search; each pass either returns or strictly advances a
        // calendar field.
        loop {
            if year > MAX_YEAR {
                return None;
            }

            if let Some(years) = &self.years {
                if !years.contains(&year) {
                    match years.range(year + 1..).next() {
                        Some(&next_year) => {
                            year = next_year;
                            month = 1;
                            day = 1;
                            hour = 0;
                            minute = 0;
                            second = 0;
                        }
                        None => return None,
                    }
                }
            }

            if !self.months.contains(&month) {
                match self.months.range(month + 1..).next() {
                    Some(&next_month) => {
                        month = next_month;
                    }
                    None => {
                        year += 1;
                        month = *self.months.iter().next()?;
                    }
                }
                day = 1;
                hour = 0;
                minute = 0;
                second = 0;
                continue;
            }

            let days = self.matching_days(year, month);
            match days.iter().find(|&&d| d >= day) {
                Some(&matched) => {
                    if matched > day {
                        day = matched;
                        hour = 0;
                        minute = 0;
                        second = 0;
                    }
                }
                None => {
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                    day = 1;
                    hour = 0;
                    minute = 0;
                    second = 0;
                    continue;
                }
            }

            if !self.hours.contains(&hour) {
                match self.hours.range(hour + 1..).next() {
                    Some(&next_hour) => {
                        hour = next_hour;
                        minute = 0;
                        second = 0;
                    }
                    None => {
                        self.roll_day(&mut year, &mut month, &mut day);
                        hour = 0;
                        minute = 0;
                        second = 0;
                        continue;
                    }
                }
            }

            if !self.minutes.contains(&minute) {
                match self.minutes.range(minute + 1..).next() {
                    Some(&next_minute) => {
                        minute = next_minute;
                        second = 0;
                    }
                    None => {
                        minute = 0;
                        second = 0;
                        hour += 1;
                        if hour > 23 {
                            self.roll_day(&mut year, &mut month, &mut day);
                            hour = 0;
                        }
                        continue;
                    }
                }
            }

            if !self.seconds.contains(&second) {
                match self.seconds.range(second + 1..).next() {
                    Some(&next_second) => {
                        second = next_second;
                    }
                    None => {
                        second = 0;
                        minute += 1;
                        if minute > 59 {
                            minute = 0;
                            hour += 1;
                            if hour > 23 {
                                self.roll_day(&mut year, &mut month, &mut day);
                                hour = 0;
                            }
                        }
                        continue;
                    }
                }
            }

            let date = match NaiveDate::from_ymd_opt(year, month, day) {
                Some(d) => d,
                None => {
                    self.roll_day(&mut year, &mut month, &mut day);
                    hour = 0;
                    minute = 0;
                    second = 0;
                    continue;
                }
            };
            let naive = match date.and_hms_opt(hour, minute, second) {
                Some(n) => n,
                None => return None,
            };

            match self.resolve_local(naive) {
                Some(instant) if instant > after => return Some(instant),
                // The resolved instant can land at or before `after` when a
                // DST gap pushed it backwards relative to local ordering;
                // keep searching from the next second.
                _ => {
                    second += 1;
                    if second > 59 {
                        second = 0;
                        minute += 1;
                        if minute > 59 {
                            minute = 0;
                            hour += 1;
                            if hour > 23 {
                                self.roll_day(&mut year, &mut month, &mut day);
                                hour = 0;
                            }
                        }
                    }
                    continue;
                }
            }
        }
    }

    fn roll_day(&self, year: &mut i32, month: &mut u32, day: &mut u32) {
        *day += 1;
        if *day > days_in_month(*year, *month) {
            *day = 1;
            *month += 1;
            if *month > 12 {
                *month = 1;
                *year += 1;
            }
        }
    }

    /// Map a local wall-clock time to an instant: ambiguous times take their
    /// first occurrence, skipped times advance to the first existing instant.
    fn resolve_local(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.time_zone.from_local_datetime(&naive) {
            chrono::LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(first, _second) => Some(first.with_timezone(&Utc)),
            chrono::LocalResult::None => {
                // Inside a spring-forward gap. Walk forward minute by minute
                // until the local clock exists again (gaps are at most a few
                // hours in any zone).
                let mut probe = naive;
                for _ in 0..(4 * 60) {
                    probe += Duration::minutes(1);
                    if let chrono::LocalResult::Single(t) =
                        self.time_zone.from_local_datetime(&probe)
                    {
                        return Some(t.with_timezone(&Utc));
                    }
                }
                None
            }
        }
    }

    /// Days of the given month that satisfy the day-of-month/day-of-week
    /// constraints, ascending.
    fn matching_days(&self, year: i32, month: u32) -> Vec<u32> {
        let last = days_in_month(year, month);

        if self.day_of_month_spec {
            if self.last_day_of_month {
                let target = last.saturating_sub(self.last_day_offset);
                if target == 0 {
                    return Vec::new();
                }
                let day = if self.nearest_weekday {
                    nearest_weekday_in_month(year, month, target, last)
                } else {
                    target
                };
                return vec![day];
            }
            if self.nearest_weekday {
                return match self.days_of_month.iter().next() {
                    Some(&target) if target <= last => {
                        vec![nearest_weekday_in_month(year, month, target, last)]
                    }
                    _ => Vec::new(),
                };
            }
            return self
                .days_of_month
                .iter()
                .copied()
                .filter(|&d| d <= last)
                .collect();
        }

        if self.day_of_week_spec {
            return (1..=last)
                .filter(|&d| self.day_matches_dow(year, month, d, last))
                .collect();
        }

        (1..=last).collect()
    }

    fn day_matches_dow(&self, year: i32, month: u32, day: u32, last: u32) -> bool {
        let date = match NaiveDate::from_ymd_opt(year, month, day) {
            Some(d) => d,
            None => return false,
        };
        let dow = date.weekday().num_days_from_sunday() + 1;

        if self.last_day_of_week {
            return self.days_of_week.contains(&dow) && day + 7 > last;
        }
        if self.nth_day_of_week > 0 {
            return self.days_of_week.contains(&dow)
                && (day - 1) / 7 + 1 == self.nth_day_of_week;
        }
        self.days_of_week.contains(&dow)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl Serialize for CronExpression {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Repr<'a> {
            expression: &'a str,
            time_zone: String,
        }
        Repr {
            expression: &self.source,
            time_zone: self.time_zone.to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CronExpression {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            expression: String,
            time_zone: String,
        }
        let repr = Repr::deserialize(deserializer)?;
        let tz = Tz::from_str(&repr.time_zone).map_err(serde::de::Error::custom)?;
        CronExpression::parse_in_zone(&repr.expression, tz).map_err(serde::de::Error::custom)
    }
}

/// Nearest weekday to `target` within the month: Saturdays pull back to
/// Friday and Sundays push to Monday, unless that would leave the month.
fn nearest_weekday_in_month(year: i32, month: u32, target: u32, last: u32) -> u32 {
    let date = match NaiveDate::from_ymd_opt(year, month, target) {
        Some(d) => d,
        None => return target,
    };
    match date.weekday() {
        chrono::Weekday::Sat => {
            if target == 1 {
                3
            } else {
                target - 1
            }
        }
        chrono::Weekday::Sun => {
            if target == last {
                target - 2
            } else {
                target + 1
            }
        }
        _ => target,
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
        _ => 0,
    }
}

// ----------------------------------------------------------------------------
// Parsing
// ----------------------------------------------------------------------------

struct Parser<'a> {
    source: &'a str,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: Option<&'static [&'static str]>,
    name_base: u32,
}

const SECONDS_FIELD: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
    names: None,
    name_base: 0,
};
const MINUTES_FIELD: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: None,
    name_base: 0,
};
const HOURS_FIELD: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: None,
    name_base: 0,
};
const DOM_FIELD: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: None,
    name_base: 0,
};
const MONTH_FIELD: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: Some(&MONTH_NAMES),
    name_base: 1,
};
const DOW_FIELD: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 1,
    max: 7,
    names: Some(&DAY_NAMES),
    name_base: 1,
};

#[derive(Default)]
struct DayOfMonthFlags {
    last: bool,
    last_offset: u32,
    nearest_weekday: bool,
}

#[derive(Default)]
struct DayOfWeekFlags {
    last: bool,
    nth: u32,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self { source }
    }

    fn err(&self, reason: impl Into<String>) -> ScheduleError {
        ScheduleError::InvalidCronExpression {
            expression: self.source.to_string(),
            reason: reason.into(),
        }
    }

    fn parse(&self, time_zone: Tz) -> Result<CronExpression, ScheduleError> {
        let fields: Vec<&str> = self.source.split_whitespace().collect();
        if fields.len() != 6 && fields.len() != 7 {
            return Err(self.err(format!(
                "expected 6 or 7 fields, found {}",
                fields.len()
            )));
        }

        let seconds = self.parse_plain_field(fields[0], &SECONDS_FIELD)?;
        let minutes = self.parse_plain_field(fields[1], &MINUTES_FIELD)?;
        let hours = self.parse_plain_field(fields[2], &HOURS_FIELD)?;
        let (days_of_month, dom_spec, dom_flags) = self.parse_dom_field(fields[3])?;
        let months = self.parse_plain_field(fields[4], &MONTH_FIELD)?;
        let (days_of_week, dow_spec, dow_flags) = self.parse_dow_field(fields[5])?;

        let years = if fields.len() == 7 && fields[6] != "*" {
            let mut set = BTreeSet::new();
            for item in fields[6].split(',') {
                self.parse_year_item(item, &mut set)?;
            }
            Some(set)
        } else {
            None
        };

        if dom_spec && dow_spec {
            return Err(self.err(
                "specifying both a day-of-month and a day-of-week is not supported; \
                 use '?' in one of the two fields",
            ));
        }
        if !dom_spec && !dow_spec && fields[3] == "?" && fields[5] == "?" {
            return Err(self.err("'?' cannot be used in both day-of-month and day-of-week"));
        }

        Ok(CronExpression {
            source: self.source.to_string(),
            time_zone,
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            years,
            day_of_month_spec: dom_spec,
            day_of_week_spec: dow_spec,
            last_day_of_month: dom_flags.last,
            last_day_offset: dom_flags.last_offset,
            nearest_weekday: dom_flags.nearest_weekday,
            last_day_of_week: dow_flags.last,
            nth_day_of_week: dow_flags.nth,
        })
    }

    fn parse_plain_field(
        &self,
        field: &str,
        spec: &FieldSpec,
    ) -> Result<BTreeSet<u32>, ScheduleError> {
        let mut set = BTreeSet::new();
        for item in field.split(',') {
            self.parse_item(item, spec, &mut set)?;
        }
        if set.is_empty() {
            return Err(self.err(format!("empty {} field", spec.name)));
        }
        Ok(set)
    }

    fn parse_dom_field(
        &self,
        field: &str,
    ) -> Result<(BTreeSet<u32>, bool, DayOfMonthFlags), ScheduleError> {
        let mut flags = DayOfMonthFlags::default();

        if field == "?" {
            return Ok((BTreeSet::new(), false, flags));
        }

        if field == "L" || field.starts_with("L-") || field == "LW" {
            flags.last = true;
            if field == "LW" {
                flags.nearest_weekday = true;
            } else if let Some(offset) = field.strip_prefix("L-") {
                flags.last_offset = offset
                    .parse::<u32>()
                    .map_err(|_| self.err("invalid offset after 'L-'"))?;
                if flags.last_offset > 30 {
                    return Err(self.err("offset after 'L-' must be <= 30"));
                }
            }
            return Ok((BTreeSet::new(), true, flags));
        }

        if let Some(day) = field.strip_suffix('W') {
            let value = day
                .parse::<u32>()
                .map_err(|_| self.err("'W' must follow a day number"))?;
            if !(1..=31).contains(&value) {
                return Err(self.err("day before 'W' must be between 1 and 31"));
            }
            flags.nearest_weekday = true;
            let mut set = BTreeSet::new();
            set.insert(value);
            return Ok((set, true, flags));
        }

        if field.contains('L') || field.contains('W') {
            return Err(self.err("'L' and 'W' cannot be combined with lists in day-of-month"));
        }

        let set = self.parse_plain_field(field, &DOM_FIELD)?;
        Ok((set, true, flags))
    }

    fn parse_dow_field(
        &self,
        field: &str,
    ) -> Result<(BTreeSet<u32>, bool, DayOfWeekFlags), ScheduleError> {
        let mut flags = DayOfWeekFlags::default();

        if field == "?" {
            return Ok((BTreeSet::new(), false, flags));
        }

        if field == "L" {
            // bare 'L' in day-of-week means Saturday
            let mut set = BTreeSet::new();
            set.insert(7);
            return Ok((set, true, flags));
        }

        if let Some(day) = field.strip_suffix('L') {
            flags.last = true;
            let value = self.parse_single_value(day, &DOW_FIELD)?;
            let mut set = BTreeSet::new();
            set.insert(value);
            return Ok((set, true, flags));
        }

        if let Some((day, nth)) = field.split_once('#') {
            let value = self.parse_single_value(day, &DOW_FIELD)?;
            flags.nth = nth
                .parse::<u32>()
                .map_err(|_| self.err("invalid ordinal after '#'"))?;
            if !(1..=5).contains(&flags.nth) {
                return Err(self.err("ordinal after '#' must be between 1 and 5"));
            }
            let mut set = BTreeSet::new();
            set.insert(value);
            return Ok((set, true, flags));
        }

        let set = self.parse_plain_field(field, &DOW_FIELD)?;
        Ok((set, true, flags))
    }

    fn parse_year_item(&self, item: &str, set: &mut BTreeSet<i32>) -> Result<(), ScheduleError> {
        let parse_year = |s: &str| -> Result<i32, ScheduleError> {
            let y = s
                .parse::<i32>()
                .map_err(|_| self.err(format!("invalid year '{}'", s)))?;
            if !(MIN_YEAR..=MAX_YEAR).contains(&y) {
                return Err(self.err(format!(
                    "year must be between {} and {}",
                    MIN_YEAR, MAX_YEAR
                )));
            }
            Ok(y)
        };

        if let Some((start, end)) = item.split_once('-') {
            let start = parse_year(start)?;
            let end = parse_year(end)?;
            if end < start {
                return Err(self.err("year range must be ascending"));
            }
            set.extend(start..=end);
        } else {
            set.insert(parse_year(item)?);
        }
        Ok(())
    }

    fn parse_single_value(&self, s: &str, spec: &FieldSpec) -> Result<u32, ScheduleError> {
        if let Some(names) = spec.names {
            let upper = s.to_ascii_uppercase();
            if let Some(idx) = names.iter().position(|n| *n == upper) {
                return Ok(idx as u32 + spec.name_base);
            }
        }
        let value = s
            .parse::<u32>()
            .map_err(|_| self.err(format!("invalid {} value '{}'", spec.name, s)))?;
        if value < spec.min || value > spec.max {
            return Err(self.err(format!(
                "{} value {} out of range [{}, {}]",
                spec.name, value, spec.min, spec.max
            )));
        }
        Ok(value)
    }

    fn parse_item(
        &self,
        item: &str,
        spec: &FieldSpec,
        set: &mut BTreeSet<u32>,
    ) -> Result<(), ScheduleError> {
        let (body, step) = match item.split_once('/') {
            Some((body, step)) => {
                let step = step
                    .parse::<u32>()
                    .map_err(|_| self.err(format!("invalid step '{}'", step)))?;
                if step == 0 {
                    return Err(self.err("step must be greater than zero"));
                }
                (body, step)
            }
            None => (item, 1),
        };

        let (start, end) = if body == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = split_range(body) {
            let lo = self.parse_single_value(lo, spec)?;
            let hi = self.parse_single_value(hi, spec)?;
            (lo, hi)
        } else {
            let value = self.parse_single_value(body, spec)?;
            if item.contains('/') {
                // "a/b" runs from a to the top of the range
                (value, spec.max)
            } else {
                set.insert(value);
                return Ok(());
            }
        };

        if start <= end {
            let mut v = start;
            while v <= end {
                set.insert(v);
                v += step;
            }
        } else {
            // wrap-around range, e.g. hours 22-2
            let span = spec.max - spec.min + 1;
            if step >= span {
                set.insert(start);
                return Ok(());
            }
            let mut v = start;
            loop {
                set.insert(v);
                let mut next = v + step;
                if next > spec.max {
                    next = spec.min + (next - spec.max - 1);
                }
                // stepping landed in the excluded gap, or closed the cycle
                if (next > end && next < start) || next == start {
                    break;
                }
                v = next;
            }
        }
        Ok(())
    }
}

fn split_range(body: &str) -> Option<(&str, &str)> {
    // a leading '-' would be a malformed value, not a range
    let idx = body.find('-')?;
    if idx == 0 {
        return None;
    }
    Some((&body[..idx], &body[idx + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        assert!(CronExpression::parse("* * * *").is_err());
        assert!(CronExpression::parse("0 0 0 * * ?").is_ok());
        assert!(CronExpression::parse("0 0 0 * * ? 2024").is_ok());
    }

    #[test]
    fn test_parse_rejects_both_day_fields_restricted() {
        assert!(CronExpression::parse("0 0 0 1 * MON").is_err());
        assert!(CronExpression::parse("0 0 0 * * *").is_err());
        assert!(CronExpression::parse("0 0 0 ? * ?").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_values() {
        assert!(CronExpression::parse("60 0 0 * * ?").is_err());
        assert!(CronExpression::parse("0 60 0 * * ?").is_err());
        assert!(CronExpression::parse("0 0 24 * * ?").is_err());
        assert!(CronExpression::parse("0 0 0 32 * ?").is_err());
        assert!(CronExpression::parse("0 0 0 * 13 ?").is_err());
        assert!(CronExpression::parse("0 0 0 ? * 8").is_err());
        assert!(CronExpression::parse("0 0 0 * * ? 1969").is_err());
    }

    #[test]
    fn test_every_second() {
        let expr = CronExpression::parse("* * * * * ?").unwrap();
        let t = utc(2024, 1, 1, 0, 0, 0);
        assert_eq!(expr.next_valid_time_after(t), Some(utc(2024, 1, 1, 0, 0, 1)));
    }

    #[test]
    fn test_daily_midnight() {
        let expr = CronExpression::parse("0 0 0 * * ?").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 1, 15, 12, 30, 0)),
            Some(utc(2024, 1, 16, 0, 0, 0))
        );
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 1, 31, 0, 0, 0)),
            Some(utc(2024, 2, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_lists_and_ranges() {
        let expr = CronExpression::parse("0 15,45 9-17 * * ?").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 3, 5, 8, 50, 0)),
            Some(utc(2024, 3, 5, 9, 15, 0))
        );
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 3, 5, 9, 15, 0)),
            Some(utc(2024, 3, 5, 9, 45, 0))
        );
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 3, 5, 17, 45, 0)),
            Some(utc(2024, 3, 6, 9, 15, 0))
        );
    }

    #[test]
    fn test_step_values() {
        let expr = CronExpression::parse("0/15 * * * * ?").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 1, 1, 0, 0, 0)),
            Some(utc(2024, 1, 1, 0, 0, 15))
        );
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 1, 1, 0, 0, 46)),
            Some(utc(2024, 1, 1, 0, 1, 0))
        );
    }

    #[test]
    fn test_month_and_day_names() {
        let expr = CronExpression::parse("0 0 12 ? MAR WED").unwrap();
        // 2024-03-06 is the first Wednesday of March 2024
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 1, 1, 0, 0, 0)),
            Some(utc(2024, 3, 6, 12, 0, 0))
        );
    }

    #[test]
    fn test_last_day_of_month() {
        let expr = CronExpression::parse("0 0 0 L * ?").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 2, 1, 0, 0, 0)),
            Some(utc(2024, 2, 29, 0, 0, 0))
        );
        assert_eq!(
            expr.next_valid_time_after(utc(2023, 2, 1, 0, 0, 0)),
            Some(utc(2023, 2, 28, 0, 0, 0))
        );
    }

    #[test]
    fn test_last_day_offset() {
        let expr = CronExpression::parse("0 0 0 L-2 * ?").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 1, 1, 0, 0, 0)),
            Some(utc(2024, 1, 29, 0, 0, 0))
        );
    }

    #[test]
    fn test_nearest_weekday() {
        // 2024-06-15 is a Saturday; 15W resolves to Friday the 14th
        let expr = CronExpression::parse("0 0 0 15W 6 ? 2024").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 6, 1, 0, 0, 0)),
            Some(utc(2024, 6, 14, 0, 0, 0))
        );
        // 2024-09-15 is a Sunday; 15W resolves to Monday the 16th
        let expr = CronExpression::parse("0 0 0 15W 9 ? 2024").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 9, 1, 0, 0, 0)),
            Some(utc(2024, 9, 16, 0, 0, 0))
        );
    }

    #[test]
    fn test_last_weekday_of_month() {
        // last weekday of June 2024 is Friday the 28th
        let expr = CronExpression::parse("0 0 0 LW 6 ? 2024").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 6, 1, 0, 0, 0)),
            Some(utc(2024, 6, 28, 0, 0, 0))
        );
    }

    #[test]
    fn test_last_dow_of_month() {
        // 6L = last Friday; last Friday of 2024-03 is the 29th
        let expr = CronExpression::parse("0 0 0 ? 3 6L 2024").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 3, 1, 0, 0, 0)),
            Some(utc(2024, 3, 29, 0, 0, 0))
        );
    }

    #[test]
    fn test_nth_dow_of_month() {
        // 2#3 = third Monday; third Monday of 2024-01 is the 15th
        let expr = CronExpression::parse("0 0 0 ? 1 2#3 2024").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 1, 1, 0, 0, 0)),
            Some(utc(2024, 1, 15, 0, 0, 0))
        );
    }

    #[test]
    fn test_year_field_exhaustion() {
        let expr = CronExpression::parse("0 0 0 1 1 ? 2024").unwrap();
        assert_eq!(
            expr.next_valid_time_after(utc(2024, 6, 1, 0, 0, 0)),
            None
        );
    }

    #[test]
    fn test_dst_spring_forward_vienna() {
        // Vienna springs forward 2024-03-31 02:00 -> 03:00. Midnight exists
        // on both sides of the transition; offsets differ.
        let expr = CronExpression::parse_in_zone("0 0 0 * * ?", chrono_tz::Europe::Vienna)
            .unwrap();
        // 2024-03-30T23:59:59+01:00 == 22:59:59 UTC
        let after = utc(2024, 3, 30, 22, 59, 59);
        let first = expr.next_valid_time_after(after).unwrap();
        // 2024-03-31T00:00:00+01:00 == 23:00 UTC on the 30th
        assert_eq!(first, utc(2024, 3, 30, 23, 0, 0));
        let second = expr.next_valid_time_after(first).unwrap();
        // 2024-04-01T00:00:00+02:00 == 22:00 UTC on the 31st
        assert_eq!(second, utc(2024, 3, 31, 22, 0, 0));
    }

    #[test]
    fn test_dst_skipped_hour_advances() {
        // 02:30 does not exist in Vienna on 2024-03-31; the fire lands on
        // the first existing instant at or after it (03:00 local).
        let expr =
            CronExpression::parse_in_zone("0 30 2 * * ?", chrono_tz::Europe::Vienna).unwrap();
        let after = utc(2024, 3, 30, 12, 0, 0);
        let next = expr.next_valid_time_after(after).unwrap();
        // 03:00+02:00 local == 01:00 UTC
        assert_eq!(next, utc(2024, 3, 31, 1, 0, 0));
    }

    #[test]
    fn test_dst_fall_back_fires_once() {
        // Vienna falls back 2024-10-27 03:00 -> 02:00; 02:30 occurs twice.
        let expr =
            CronExpression::parse_in_zone("0 30 2 * * ?", chrono_tz::Europe::Vienna).unwrap();
        let after = utc(2024, 10, 26, 12, 0, 0);
        let first = expr.next_valid_time_after(after).unwrap();
        // first occurrence is at +02:00: 00:30 UTC
        assert_eq!(first, utc(2024, 10, 27, 0, 30, 0));
        let second = expr.next_valid_time_after(first).unwrap();
        // the repeated hour is not fired again; next day instead
        assert_eq!(second, utc(2024, 10, 28, 1, 30, 0));
    }

    #[test]
    fn test_monotonicity() {
        let expr = CronExpression::parse("0 7 3,9 ? * MON-FRI").unwrap();
        let mut t = utc(2024, 5, 1, 0, 0, 0);
        let mut prev = None;
        for _ in 0..50 {
            let next = expr.next_valid_time_after(t).unwrap();
            if let Some(p) = prev {
                assert!(next > p);
            }
            prev = Some(next);
            t = next;
        }
    }

    #[test]
    fn test_is_satisfied_by() {
        let expr = CronExpression::parse("0 0 12 * * ?").unwrap();
        assert!(expr.is_satisfied_by(utc(2024, 1, 1, 12, 0, 0)));
        assert!(!expr.is_satisfied_by(utc(2024, 1, 1, 12, 0, 1)));
    }

    #[test]
    fn test_serde_round_trip() {
        let expr =
            CronExpression::parse_in_zone("0 0 9 ? * MON-FRI", chrono_tz::Europe::Vienna).unwrap();
        let json = serde_json::to_string(&expr).unwrap();
        let back: CronExpression = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expr);
        assert_eq!(back.time_zone(), chrono_tz::Europe::Vienna);
    }
}
