// Exclusion calendars: predicates that remove instants from a trigger's
// eligible fire-time set. Calendars chain through an optional base; an
// instant is included only when every calendar in the chain includes it.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::cron::CronExpression;
use crate::models::{deserialize_tz, serialize_tz, TimeOfDay};

/// Upper bound on exclusion-skipping steps before giving up; generous enough
/// for years of contiguous excluded days.
const MAX_SKIP_STEPS: usize = 5 * 366 * 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExclusionCalendar {
    /// Excludes a set of (month, day) dates every year.
    Annual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<Box<ExclusionCalendar>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        time_zone: Tz,
        excluded_days: BTreeSet<(u32, u32)>,
    },
    /// Excludes whole weekdays (1=Sunday..7=Saturday).
    Weekly {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<Box<ExclusionCalendar>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        time_zone: Tz,
        excluded_days: BTreeSet<u8>,
    },
    /// Excludes whole days of every month (1..31).
    Monthly {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<Box<ExclusionCalendar>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        time_zone: Tz,
        excluded_days: BTreeSet<u32>,
    },
    /// Excludes a daily wall-clock window, or everything outside it when
    /// inverted.
    Daily {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<Box<ExclusionCalendar>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        time_zone: Tz,
        range_start: TimeOfDay,
        range_end: TimeOfDay,
        #[serde(default)]
        invert: bool,
    },
    /// Excludes every instant matching a cron expression.
    Cron {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<Box<ExclusionCalendar>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        expression: CronExpression,
    },
    /// Excludes an explicit set of dates.
    Holiday {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<Box<ExclusionCalendar>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        time_zone: Tz,
        excluded_dates: BTreeSet<NaiveDate>,
    },
}

impl ExclusionCalendar {
    /// Weekly calendar with the conventional Saturday + Sunday exclusion.
    pub fn weekend(time_zone: Tz) -> Self {
        ExclusionCalendar::Weekly {
            base: None,
            description: None,
            time_zone,
            excluded_days: [crate::time::SUNDAY, crate::time::SATURDAY]
                .into_iter()
                .collect(),
        }
    }

    pub fn base(&self) -> Option<&ExclusionCalendar> {
        match self {
            ExclusionCalendar::Annual { base, .. }
            | ExclusionCalendar::Weekly { base, .. }
            | ExclusionCalendar::Monthly { base, .. }
            | ExclusionCalendar::Daily { base, .. }
            | ExclusionCalendar::Cron { base, .. }
            | ExclusionCalendar::Holiday { base, .. } => base.as_deref(),
        }
    }

    pub fn with_base(mut self, new_base: ExclusionCalendar) -> Self {
        let slot = match &mut self {
            ExclusionCalendar::Annual { base, .. }
            | ExclusionCalendar::Weekly { base, .. }
            | ExclusionCalendar::Monthly { base, .. }
            | ExclusionCalendar::Daily { base, .. }
            | ExclusionCalendar::Cron { base, .. }
            | ExclusionCalendar::Holiday { base, .. } => base,
        };
        *slot = Some(Box::new(new_base));
        self
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            ExclusionCalendar::Annual { description, .. }
            | ExclusionCalendar::Weekly { description, .. }
            | ExclusionCalendar::Monthly { description, .. }
            | ExclusionCalendar::Daily { description, .. }
            | ExclusionCalendar::Cron { description, .. }
            | ExclusionCalendar::Holiday { description, .. } => description.as_deref(),
        }
    }

    /// Whether the whole chain includes the instant.
    pub fn is_time_included(&self, t: DateTime<Utc>) -> bool {
        if let Some(base) = self.base() {
            if !base.is_time_included(t) {
                return false;
            }
        }
        !self.excludes(t)
    }

    /// First instant at or after `t` included by the whole chain, or None
    /// when no such instant is found within the search bound.
    pub fn next_included_time(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = t;
        for _ in 0..MAX_SKIP_STEPS {
            if let Some(base) = self.base() {
                if !base.is_time_included(candidate) {
                    let advanced = base.next_included_time(candidate)?;
                    // a base stuck on the same instant cannot make progress
                    if advanced <= candidate {
                        return None;
                    }
                    candidate = advanced;
                    continue;
                }
            }
            if self.excludes(candidate) {
                candidate = self.advance_past_exclusion(candidate)?;
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// This calendar's own exclusion predicate (base not consulted).
    fn excludes(&self, t: DateTime<Utc>) -> bool {
        match self {
            ExclusionCalendar::Annual {
                time_zone,
                excluded_days,
                ..
            } => {
                let local = t.with_timezone(time_zone);
                excluded_days.contains(&(local.month(), local.day()))
            }
            ExclusionCalendar::Weekly {
                time_zone,
                excluded_days,
                ..
            } => {
                let local = t.with_timezone(time_zone);
                let dow = local.weekday().num_days_from_sunday() as u8 + 1;
                excluded_days.contains(&dow)
            }
            ExclusionCalendar::Monthly {
                time_zone,
                excluded_days,
                ..
            } => {
                let local = t.with_timezone(time_zone);
                excluded_days.contains(&local.day())
            }
            ExclusionCalendar::Daily {
                time_zone,
                range_start,
                range_end,
                invert,
                ..
            } => {
                let local = t.with_timezone(time_zone);
                let seconds = local.num_seconds_from_midnight();
                let in_range =
                    seconds >= range_start.seconds_of_day() && seconds <= range_end.seconds_of_day();
                if *invert {
                    !in_range
                } else {
                    in_range
                }
            }
            ExclusionCalendar::Cron { expression, .. } => expression.is_satisfied_by(t),
            ExclusionCalendar::Holiday {
                time_zone,
                excluded_dates,
                ..
            } => {
                let local = t.with_timezone(time_zone);
                excluded_dates.contains(&local.date_naive())
            }
        }
    }

    /// Smallest useful jump past this calendar's own exclusion at `t`.
    fn advance_past_exclusion(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ExclusionCalendar::Annual { time_zone, .. }
            | ExclusionCalendar::Weekly { time_zone, .. }
            | ExclusionCalendar::Monthly { time_zone, .. }
            | ExclusionCalendar::Holiday { time_zone, .. } => {
                next_local_midnight(t, *time_zone)
            }
            ExclusionCalendar::Daily {
                time_zone,
                range_start,
                range_end,
                invert,
                ..
            } => {
                let local = t.with_timezone(time_zone);
                if *invert {
                    // excluded outside the window: jump to the window start,
                    // today if still ahead, otherwise tomorrow
                    let seconds = local.num_seconds_from_midnight();
                    let date = if seconds < range_start.seconds_of_day() {
                        local.date_naive()
                    } else {
                        local.date_naive().succ_opt()?
                    };
                    let naive = date.and_hms_opt(
                        range_start.hour as u32,
                        range_start.minute as u32,
                        range_start.second as u32,
                    )?;
                    resolve_local(naive, *time_zone)
                } else {
                    // excluded inside the window: jump just past its end
                    let naive = local.date_naive().and_hms_opt(
                        range_end.hour as u32,
                        range_end.minute as u32,
                        range_end.second as u32,
                    )?;
                    let end = resolve_local(naive, *time_zone)?;
                    Some(end + Duration::seconds(1))
                }
            }
            ExclusionCalendar::Cron { .. } => Some(t + Duration::seconds(1)),
        }
    }
}

fn next_local_midnight(t: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let local = t.with_timezone(&tz);
    let next_day = local.date_naive().succ_opt()?;
    resolve_local(next_day.and_hms_opt(0, 0, 0)?, tz)
}

fn resolve_local(naive: chrono::NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        chrono::LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        chrono::LocalResult::None => {
            let mut probe = naive;
            for _ in 0..(4 * 60) {
                probe += Duration::minutes(1);
                if let chrono::LocalResult::Single(t) = tz.from_local_datetime(&probe) {
                    return Some(t.with_timezone(&Utc));
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::UTC;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_weekly_excludes_weekend() {
        let cal = ExclusionCalendar::weekend(UTC);
        // 2011-01-01 was a Saturday
        assert!(!cal.is_time_included(utc(2011, 1, 1, 10, 0, 0)));
        assert!(!cal.is_time_included(utc(2011, 1, 2, 10, 0, 0)));
        assert!(cal.is_time_included(utc(2011, 1, 3, 10, 0, 0)));
        assert_eq!(
            cal.next_included_time(utc(2011, 1, 1, 10, 0, 0)),
            Some(utc(2011, 1, 3, 0, 0, 0))
        );
    }

    #[test]
    fn test_annual_exclusion() {
        let cal = ExclusionCalendar::Annual {
            base: None,
            description: None,
            time_zone: UTC,
            excluded_days: [(12, 25), (1, 1)].into_iter().collect(),
        };
        assert!(!cal.is_time_included(utc(2024, 12, 25, 9, 0, 0)));
        assert!(!cal.is_time_included(utc(2030, 12, 25, 9, 0, 0)));
        assert!(cal.is_time_included(utc(2024, 12, 24, 9, 0, 0)));
    }

    #[test]
    fn test_monthly_exclusion() {
        let cal = ExclusionCalendar::Monthly {
            base: None,
            description: None,
            time_zone: UTC,
            excluded_days: [1, 15].into_iter().collect(),
        };
        assert!(!cal.is_time_included(utc(2024, 3, 15, 12, 0, 0)));
        assert!(cal.is_time_included(utc(2024, 3, 16, 12, 0, 0)));
        assert_eq!(
            cal.next_included_time(utc(2024, 3, 15, 12, 0, 0)),
            Some(utc(2024, 3, 16, 0, 0, 0))
        );
    }

    #[test]
    fn test_daily_window_exclusion() {
        let cal = ExclusionCalendar::Daily {
            base: None,
            description: None,
            time_zone: UTC,
            range_start: TimeOfDay::new(8, 0, 0).unwrap(),
            range_end: TimeOfDay::new(17, 0, 0).unwrap(),
            invert: false,
        };
        assert!(!cal.is_time_included(utc(2024, 3, 5, 12, 0, 0)));
        assert!(cal.is_time_included(utc(2024, 3, 5, 7, 59, 59)));
        assert!(cal.is_time_included(utc(2024, 3, 5, 17, 0, 1)));
        assert_eq!(
            cal.next_included_time(utc(2024, 3, 5, 12, 0, 0)),
            Some(utc(2024, 3, 5, 17, 0, 1))
        );
    }

    #[test]
    fn test_daily_inverted_window() {
        let cal = ExclusionCalendar::Daily {
            base: None,
            description: None,
            time_zone: UTC,
            range_start: TimeOfDay::new(8, 0, 0).unwrap(),
            range_end: TimeOfDay::new(17, 0, 0).unwrap(),
            invert: true,
        };
        assert!(cal.is_time_included(utc(2024, 3, 5, 12, 0, 0)));
        assert!(!cal.is_time_included(utc(2024, 3, 5, 18, 0, 0)));
        // past today's window: next inclusion is tomorrow's window start
        assert_eq!(
            cal.next_included_time(utc(2024, 3, 5, 18, 0, 0)),
            Some(utc(2024, 3, 6, 8, 0, 0))
        );
    }

    #[test]
    fn test_holiday_exclusion() {
        let cal = ExclusionCalendar::Holiday {
            base: None,
            description: Some("public holidays".to_string()),
            time_zone: UTC,
            excluded_dates: [NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()]
                .into_iter()
                .collect(),
        };
        assert!(!cal.is_time_included(utc(2024, 5, 1, 10, 0, 0)));
        assert_eq!(
            cal.next_included_time(utc(2024, 5, 1, 10, 0, 0)),
            Some(utc(2024, 5, 2, 0, 0, 0))
        );
    }

    #[test]
    fn test_cron_calendar_exclusion() {
        let cal = ExclusionCalendar::Cron {
            base: None,
            description: None,
            expression: CronExpression::parse("* * 12 * * ?").unwrap(),
        };
        assert!(!cal.is_time_included(utc(2024, 3, 5, 12, 30, 0)));
        assert!(cal.is_time_included(utc(2024, 3, 5, 13, 0, 0)));
        assert_eq!(
            cal.next_included_time(utc(2024, 3, 5, 12, 59, 59)),
            Some(utc(2024, 3, 5, 13, 0, 0))
        );
    }

    #[test]
    fn test_chained_calendars_intersect() {
        // weekends excluded, plus May 1st excluded via the base
        let base = ExclusionCalendar::Annual {
            base: None,
            description: None,
            time_zone: UTC,
            excluded_days: [(5, 1)].into_iter().collect(),
        };
        let cal = ExclusionCalendar::weekend(UTC).with_base(base);

        // 2024-05-01 is a Wednesday: excluded by the base only
        assert!(!cal.is_time_included(utc(2024, 5, 1, 10, 0, 0)));
        // 2024-05-04 is a Saturday: excluded by the outer calendar only
        assert!(!cal.is_time_included(utc(2024, 5, 4, 10, 0, 0)));
        assert!(cal.is_time_included(utc(2024, 5, 2, 10, 0, 0)));
        assert_eq!(
            cal.next_included_time(utc(2024, 5, 1, 10, 0, 0)),
            Some(utc(2024, 5, 2, 0, 0, 0))
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let cal = ExclusionCalendar::weekend(chrono_tz::Europe::Vienna)
            .with_base(ExclusionCalendar::Annual {
                base: None,
                description: None,
                time_zone: chrono_tz::Europe::Vienna,
                excluded_days: [(12, 25)].into_iter().collect(),
            });
        let json = serde_json::to_string(&cal).unwrap();
        let back: ExclusionCalendar = serde_json::from_str(&json).unwrap();
        assert!(!back.is_time_included(utc(2024, 12, 25, 9, 0, 0)));
        assert!(back.base().is_some());
    }
}
