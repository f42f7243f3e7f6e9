// Calendar arithmetic helpers used by schedule evaluators and client code
// building fire times aligned to even boundaries.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::errors::ValidationError;

pub const SUNDAY: u8 = 1;
pub const MONDAY: u8 = 2;
pub const TUESDAY: u8 = 3;
pub const WEDNESDAY: u8 = 4;
pub const THURSDAY: u8 = 5;
pub const FRIDAY: u8 = 6;
pub const SATURDAY: u8 = 7;

/// Years accepted anywhere a year field is validated. The lower bound is the
/// epoch; the upper bound keeps schedule searches finite.
pub const MIN_YEAR: i32 = 1970;
pub const MAX_YEAR: i32 = 2299;

/// Epoch milliseconds for a timestamp; the persisted representation of every
/// fire time.
pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Next even hour boundary strictly above any sub-hour component; a time
/// already on the boundary is returned unchanged.
pub fn even_hour_date(t: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = truncate_to_hour(t);
    if truncated == t {
        t
    } else {
        truncated + Duration::hours(1)
    }
}

/// Even hour boundary at or below the given time.
pub fn even_hour_date_before(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_hour(t)
}

pub fn even_minute_date(t: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = truncate_to_minute(t);
    if truncated == t {
        t
    } else {
        truncated + Duration::minutes(1)
    }
}

pub fn even_minute_date_before(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(t)
}

pub fn even_second_date(t: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = truncate_to_second(t);
    if truncated == t {
        t
    } else {
        truncated + Duration::seconds(1)
    }
}

pub fn even_second_date_before(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_second(t)
}

/// Round up to the next multiple of `minute_base` within the hour. A base of
/// zero advances to the next hour boundary; a multiple that would reach 60
/// rolls up to the next hour.
pub fn next_given_minute_date(
    t: DateTime<Utc>,
    minute_base: u8,
) -> Result<DateTime<Utc>, ValidationError> {
    if minute_base > 59 {
        return Err(ValidationError::InvalidFieldValue {
            field: "minute_base".to_string(),
            reason: "must be >= 0 and <= 59".to_string(),
        });
    }

    if minute_base == 0 {
        return Ok(truncate_to_hour(t) + Duration::hours(1));
    }

    let truncated = truncate_to_minute(t);
    let minute = truncated.minute();
    let next_minute = minute + minute_base as u32 - (minute % minute_base as u32);

    if next_minute >= 60 {
        Ok(truncate_to_hour(truncated) + Duration::hours(1))
    } else {
        Ok(truncated.with_minute(next_minute).unwrap_or(truncated))
    }
}

/// Same rounding rules as [`next_given_minute_date`], applied to seconds
/// within the minute.
pub fn next_given_second_date(
    t: DateTime<Utc>,
    second_base: u8,
) -> Result<DateTime<Utc>, ValidationError> {
    if second_base > 59 {
        return Err(ValidationError::InvalidFieldValue {
            field: "second_base".to_string(),
            reason: "must be >= 0 and <= 59".to_string(),
        });
    }

    if second_base == 0 {
        return Ok(truncate_to_minute(t) + Duration::minutes(1));
    }

    let truncated = truncate_to_second(t);
    let second = truncated.second();
    let next_second = second + second_base as u32 - (second % second_base as u32);

    if next_second >= 60 {
        Ok(truncate_to_minute(truncated) + Duration::minutes(1))
    } else {
        Ok(truncated.with_second(next_second).unwrap_or(truncated))
    }
}

/// Shift an instant by the zone-offset difference between `src` and `dest`
/// at that instant, preserving the wall-clock reading across zones.
pub fn translate_time(t: DateTime<Utc>, src: Tz, dest: Tz) -> DateTime<Utc> {
    let src_offset_ms = zone_offset_millis(t, src);
    let dest_offset_ms = zone_offset_millis(t, dest);
    t - Duration::milliseconds(dest_offset_ms - src_offset_ms)
}

fn zone_offset_millis(t: DateTime<Utc>, tz: Tz) -> i64 {
    use chrono::Offset;
    let local = t.with_timezone(&tz);
    local.offset().fix().local_minus_utc() as i64 * 1000
}

fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t - Duration::nanoseconds(t.timestamp_subsec_nanos() as i64)
        - Duration::seconds(t.second() as i64)
        - Duration::minutes(t.minute() as i64)
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t - Duration::nanoseconds(t.timestamp_subsec_nanos() as i64)
        - Duration::seconds(t.second() as i64)
}

fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    t - Duration::nanoseconds(t.timestamp_subsec_nanos() as i64)
}

pub fn validate_second(second: i64) -> Result<(), ValidationError> {
    bounded("second", second, 0, 59)
}

pub fn validate_minute(minute: i64) -> Result<(), ValidationError> {
    bounded("minute", minute, 0, 59)
}

pub fn validate_hour(hour: i64) -> Result<(), ValidationError> {
    bounded("hour", hour, 0, 23)
}

pub fn validate_day_of_month(day: i64) -> Result<(), ValidationError> {
    bounded("day_of_month", day, 1, 31)
}

pub fn validate_month(month: i64) -> Result<(), ValidationError> {
    bounded("month", month, 1, 12)
}

pub fn validate_year(year: i64) -> Result<(), ValidationError> {
    bounded("year", year, MIN_YEAR as i64, MAX_YEAR as i64)
}

/// Day-of-week runs 1=Sunday through 7=Saturday.
pub fn validate_day_of_week(day: i64) -> Result<(), ValidationError> {
    bounded("day_of_week", day, SUNDAY as i64, SATURDAY as i64)
}

fn bounded(field: &str, value: i64, min: i64, max: i64) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::InvalidFieldValue {
            field: field.to_string(),
            reason: format!("must be >= {} and <= {}", min, max),
        });
    }
    Ok(())
}

/// Day-of-week of a UTC instant in the 1=Sunday..7=Saturday convention.
pub fn day_of_week_utc(t: DateTime<Utc>) -> u8 {
    use chrono::Datelike;
    t.weekday().num_days_from_sunday() as u8 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2011, 6, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_even_hour_rounding() {
        assert_eq!(even_hour_date(at(11, 52, 41)), at(12, 0, 0));
        assert_eq!(even_hour_date(at(11, 0, 0)), at(11, 0, 0));
        assert_eq!(even_hour_date_before(at(11, 52, 41)), at(11, 0, 0));
    }

    #[test]
    fn test_even_minute_rounding() {
        assert_eq!(even_minute_date(at(11, 52, 41)), at(11, 53, 0));
        assert_eq!(even_minute_date(at(11, 53, 0)), at(11, 53, 0));
        assert_eq!(even_minute_date_before(at(11, 52, 41)), at(11, 52, 0));
    }

    #[test]
    fn test_even_second_rounding() {
        let with_nanos = at(11, 52, 41) + Duration::milliseconds(250);
        assert_eq!(even_second_date(with_nanos), at(11, 52, 42));
        assert_eq!(even_second_date(at(11, 52, 41)), at(11, 52, 41));
        assert_eq!(even_second_date_before(with_nanos), at(11, 52, 41));
    }

    #[test]
    fn test_rounding_is_idempotent() {
        let t = at(11, 52, 41) + Duration::milliseconds(777);
        assert_eq!(
            even_second_date_before(even_second_date_before(t)),
            even_second_date_before(t)
        );
        assert_eq!(
            even_minute_date_before(even_minute_date_before(t)),
            even_minute_date_before(t)
        );
        assert_eq!(
            even_hour_date_before(even_hour_date_before(t)),
            even_hour_date_before(t)
        );
    }

    #[test]
    fn test_next_given_minute_date() {
        // 11:52:41 with base 17 rolls up past 51 to the next hour
        assert_eq!(
            next_given_minute_date(at(11, 52, 41), 17).unwrap(),
            at(12, 0, 0)
        );
        // base 0 always advances to the next hour boundary
        assert_eq!(
            next_given_minute_date(at(11, 17, 41), 0).unwrap(),
            at(12, 0, 0)
        );
        // base 1 advances to the next whole minute
        assert_eq!(
            next_given_minute_date(at(11, 17, 41), 1).unwrap(),
            at(11, 18, 0)
        );
        assert_eq!(
            next_given_minute_date(at(11, 52, 41), 5).unwrap(),
            at(11, 55, 0)
        );
        assert_eq!(
            next_given_minute_date(at(11, 57, 41), 5).unwrap(),
            at(12, 0, 0)
        );
        assert!(next_given_minute_date(at(11, 0, 0), 60).is_err());
    }

    #[test]
    fn test_next_given_second_date() {
        assert_eq!(
            next_given_second_date(at(11, 52, 41), 15).unwrap(),
            at(11, 52, 45)
        );
        assert_eq!(
            next_given_second_date(at(11, 52, 56), 15).unwrap(),
            at(11, 53, 0)
        );
        assert_eq!(
            next_given_second_date(at(11, 52, 41), 0).unwrap(),
            at(11, 53, 0)
        );
    }

    #[test]
    fn test_translate_time() {
        // New York is 6 hours behind Vienna at this instant; translating a
        // New York wall-clock reading into Vienna shifts the instant back.
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let translated = translate_time(
            t,
            chrono_tz::America::New_York,
            chrono_tz::Europe::Vienna,
        );
        assert_eq!(translated, t - Duration::hours(6));
    }

    #[test]
    fn test_validators_accept_and_reject_bounds() {
        assert!(validate_second(0).is_ok());
        assert!(validate_second(59).is_ok());
        assert!(validate_second(60).is_err());
        assert!(validate_minute(-1).is_err());
        assert!(validate_hour(23).is_ok());
        assert!(validate_hour(24).is_err());
        assert!(validate_day_of_month(1).is_ok());
        assert!(validate_day_of_month(32).is_err());
        assert!(validate_month(12).is_ok());
        assert!(validate_month(0).is_err());
        assert!(validate_year(1969).is_err());
        assert!(validate_year(2024).is_ok());
        assert!(validate_day_of_week(SUNDAY as i64).is_ok());
        assert!(validate_day_of_week(8).is_err());
    }

    #[test]
    fn test_day_of_week_convention() {
        // 2011-01-01 was a Saturday, 2011-01-03 a Monday
        let sat = Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap();
        let mon = Utc.with_ymd_and_hms(2011, 1, 3, 0, 0, 0).unwrap();
        assert_eq!(day_of_week_utc(sat), SATURDAY);
        assert_eq!(day_of_week_utc(mon), MONDAY);
    }
}
