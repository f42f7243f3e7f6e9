// Trigger persistence delegates: the extension point for storing
// per-schedule-type properties in auxiliary tables. Simple and cron
// schedules own dedicated tables; calendar-interval and daily-time-interval
// ride the generic simple-properties table, which accommodates arbitrary
// trigger types needing up to 3 strings, 2 ints, 2 longs, 2 decimals and
// 2 booleans without a custom schema.

use async_trait::async_trait;
use chrono_tz::Tz;
use sqlx::{PgConnection, Row};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::errors::{ScheduleError, StoreError};
use crate::models::{IntervalUnit, TimeOfDay, TriggerKey};
use crate::schedule::{Trigger, TriggerSchedule};

#[async_trait]
pub trait TriggerPersistenceDelegate: Send + Sync {
    fn can_handle(&self, schedule: &TriggerSchedule) -> bool;

    /// Single-character discriminator stored in the triggers table.
    fn discriminator(&self) -> char;

    async fn insert_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        trigger: &Trigger,
    ) -> Result<(), StoreError>;

    async fn update_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        trigger: &Trigger,
    ) -> Result<(), StoreError>;

    async fn delete_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<(), StoreError>;

    async fn load_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<TriggerSchedule, StoreError>;
}

// ----------------------------------------------------------------------------
// Simple triggers
// ----------------------------------------------------------------------------

pub struct SimpleTriggerDelegate {
    insert_sql: String,
    update_sql: String,
    delete_sql: String,
    select_sql: String,
}

impl SimpleTriggerDelegate {
    pub fn new(table_prefix: &str) -> Self {
        let table = format!("{}simple_triggers", table_prefix);
        Self {
            insert_sql: format!(
                "INSERT INTO {} (sched_name, trigger_name, trigger_group, repeat_count, \
                 repeat_interval, times_triggered) VALUES ($1, $2, $3, $4, $5, $6)",
                table
            ),
            update_sql: format!(
                "UPDATE {} SET repeat_count = $4, repeat_interval = $5, times_triggered = $6 \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
                table
            ),
            delete_sql: format!(
                "DELETE FROM {} WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
                table
            ),
            select_sql: format!(
                "SELECT repeat_count, repeat_interval, times_triggered FROM {} \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
                table
            ),
        }
    }
}

#[async_trait]
impl TriggerPersistenceDelegate for SimpleTriggerDelegate {
    fn can_handle(&self, schedule: &TriggerSchedule) -> bool {
        matches!(schedule, TriggerSchedule::Simple { .. })
    }

    fn discriminator(&self) -> char {
        'S'
    }

    async fn insert_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        trigger: &Trigger,
    ) -> Result<(), StoreError> {
        let TriggerSchedule::Simple {
            repeat_interval_ms,
            repeat_count,
            times_triggered,
        } = &trigger.schedule
        else {
            return Err(StoreError::Fatal("delegate/schedule mismatch".to_string()));
        };
        sqlx::query(&self.insert_sql)
            .bind(sched_name)
            .bind(&trigger.key.name)
            .bind(&trigger.key.group)
            .bind(*repeat_count as i64)
            .bind(*repeat_interval_ms)
            .bind(*times_triggered as i64)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn update_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        trigger: &Trigger,
    ) -> Result<(), StoreError> {
        let TriggerSchedule::Simple {
            repeat_interval_ms,
            repeat_count,
            times_triggered,
        } = &trigger.schedule
        else {
            return Err(StoreError::Fatal("delegate/schedule mismatch".to_string()));
        };
        sqlx::query(&self.update_sql)
            .bind(sched_name)
            .bind(&trigger.key.name)
            .bind(&trigger.key.group)
            .bind(*repeat_count as i64)
            .bind(*repeat_interval_ms)
            .bind(*times_triggered as i64)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn delete_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.delete_sql)
            .bind(sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn load_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<TriggerSchedule, StoreError> {
        let row = sqlx::query(&self.select_sql)
            .bind(sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_one(conn)
            .await?;
        Ok(TriggerSchedule::Simple {
            repeat_count: row.try_get::<i64, _>("repeat_count")? as i32,
            repeat_interval_ms: row.try_get("repeat_interval")?,
            times_triggered: row.try_get::<i64, _>("times_triggered")? as i32,
        })
    }
}

// ----------------------------------------------------------------------------
// Cron triggers
// ----------------------------------------------------------------------------

pub struct CronTriggerDelegate {
    insert_sql: String,
    update_sql: String,
    delete_sql: String,
    select_sql: String,
}

impl CronTriggerDelegate {
    pub fn new(table_prefix: &str) -> Self {
        let table = format!("{}cron_triggers", table_prefix);
        Self {
            insert_sql: format!(
                "INSERT INTO {} (sched_name, trigger_name, trigger_group, cron_expression, \
                 time_zone_id) VALUES ($1, $2, $3, $4, $5)",
                table
            ),
            update_sql: format!(
                "UPDATE {} SET cron_expression = $4, time_zone_id = $5 \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
                table
            ),
            delete_sql: format!(
                "DELETE FROM {} WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
                table
            ),
            select_sql: format!(
                "SELECT cron_expression, time_zone_id FROM {} \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
                table
            ),
        }
    }

    fn bind_args<'q>(
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        sched_name: &'q str,
        trigger: &'q Trigger,
    ) -> Result<sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>, StoreError>
    {
        let TriggerSchedule::Cron { expression } = &trigger.schedule else {
            return Err(StoreError::Fatal("delegate/schedule mismatch".to_string()));
        };
        Ok(query
            .bind(sched_name)
            .bind(&trigger.key.name)
            .bind(&trigger.key.group)
            .bind(expression.expression())
            .bind(expression.time_zone().to_string()))
    }
}

#[async_trait]
impl TriggerPersistenceDelegate for CronTriggerDelegate {
    fn can_handle(&self, schedule: &TriggerSchedule) -> bool {
        matches!(schedule, TriggerSchedule::Cron { .. })
    }

    fn discriminator(&self) -> char {
        'C'
    }

    async fn insert_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        trigger: &Trigger,
    ) -> Result<(), StoreError> {
        Self::bind_args(sqlx::query(&self.insert_sql), sched_name, trigger)?
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn update_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        trigger: &Trigger,
    ) -> Result<(), StoreError> {
        Self::bind_args(sqlx::query(&self.update_sql), sched_name, trigger)?
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn delete_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.delete_sql)
            .bind(sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn load_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<TriggerSchedule, StoreError> {
        let row = sqlx::query(&self.select_sql)
            .bind(sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_one(conn)
            .await?;
        let expression: String = row.try_get("cron_expression")?;
        let zone: String = row.try_get("time_zone_id")?;
        let tz = Tz::from_str(&zone)
            .map_err(|_| StoreError::Schedule(ScheduleError::InvalidTimezone(zone)))?;
        let expression = crate::cron::CronExpression::parse_in_zone(&expression, tz)?;
        Ok(TriggerSchedule::Cron { expression })
    }
}

// ----------------------------------------------------------------------------
// Generic simple-properties storage
// ----------------------------------------------------------------------------

/// Property bag matching the simprop table's columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimpleTriggerProperties {
    pub str_prop_1: Option<String>,
    pub str_prop_2: Option<String>,
    pub str_prop_3: Option<String>,
    pub int_prop_1: Option<i32>,
    pub int_prop_2: Option<i32>,
    pub long_prop_1: Option<i64>,
    pub long_prop_2: Option<i64>,
    pub dec_prop_1: Option<f64>,
    pub dec_prop_2: Option<f64>,
    pub bool_prop_1: Option<bool>,
    pub bool_prop_2: Option<bool>,
}

/// Shared plumbing for delegates persisting through the simprop table.
pub struct SimplePropertiesSupport {
    insert_sql: String,
    update_sql: String,
    delete_sql: String,
    select_sql: String,
}

impl SimplePropertiesSupport {
    pub fn new(table_prefix: &str) -> Self {
        let table = format!("{}simprop_triggers", table_prefix);
        Self {
            insert_sql: format!(
                "INSERT INTO {} (sched_name, trigger_name, trigger_group, str_prop_1, \
                 str_prop_2, str_prop_3, int_prop_1, int_prop_2, long_prop_1, long_prop_2, \
                 dec_prop_1, dec_prop_2, bool_prop_1, bool_prop_2) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
                table
            ),
            update_sql: format!(
                "UPDATE {} SET str_prop_1 = $4, str_prop_2 = $5, str_prop_3 = $6, \
                 int_prop_1 = $7, int_prop_2 = $8, long_prop_1 = $9, long_prop_2 = $10, \
                 dec_prop_1 = $11, dec_prop_2 = $12, bool_prop_1 = $13, bool_prop_2 = $14 \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
                table
            ),
            delete_sql: format!(
                "DELETE FROM {} WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
                table
            ),
            select_sql: format!(
                "SELECT str_prop_1, str_prop_2, str_prop_3, int_prop_1, int_prop_2, \
                 long_prop_1, long_prop_2, dec_prop_1, dec_prop_2, bool_prop_1, bool_prop_2 \
                 FROM {} WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
                table
            ),
        }
    }

    async fn write(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        sched_name: &str,
        key: &TriggerKey,
        props: &SimpleTriggerProperties,
    ) -> Result<(), StoreError> {
        sqlx::query(sql)
            .bind(sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .bind(&props.str_prop_1)
            .bind(&props.str_prop_2)
            .bind(&props.str_prop_3)
            .bind(props.int_prop_1)
            .bind(props.int_prop_2)
            .bind(props.long_prop_1)
            .bind(props.long_prop_2)
            .bind(props.dec_prop_1)
            .bind(props.dec_prop_2)
            .bind(props.bool_prop_1)
            .bind(props.bool_prop_2)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn insert(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
        props: &SimpleTriggerProperties,
    ) -> Result<(), StoreError> {
        self.write(conn, &self.insert_sql, sched_name, key, props)
            .await
    }

    pub async fn update(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
        props: &SimpleTriggerProperties,
    ) -> Result<(), StoreError> {
        self.write(conn, &self.update_sql, sched_name, key, props)
            .await
    }

    pub async fn delete(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.delete_sql)
            .bind(sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn load(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<SimpleTriggerProperties, StoreError> {
        let row = sqlx::query(&self.select_sql)
            .bind(sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_one(conn)
            .await?;
        Ok(SimpleTriggerProperties {
            str_prop_1: row.try_get("str_prop_1")?,
            str_prop_2: row.try_get("str_prop_2")?,
            str_prop_3: row.try_get("str_prop_3")?,
            int_prop_1: row.try_get("int_prop_1")?,
            int_prop_2: row.try_get("int_prop_2")?,
            long_prop_1: row.try_get("long_prop_1")?,
            long_prop_2: row.try_get("long_prop_2")?,
            dec_prop_1: row.try_get("dec_prop_1")?,
            dec_prop_2: row.try_get("dec_prop_2")?,
            bool_prop_1: row.try_get("bool_prop_1")?,
            bool_prop_2: row.try_get("bool_prop_2")?,
        })
    }
}

fn parse_unit(s: &str) -> Result<IntervalUnit, StoreError> {
    IntervalUnit::parse(s)
        .ok_or_else(|| StoreError::Fatal(format!("unknown interval unit '{}'", s)))
}

fn parse_zone(s: &str) -> Result<Tz, StoreError> {
    Tz::from_str(s)
        .map_err(|_| StoreError::Schedule(ScheduleError::InvalidTimezone(s.to_string())))
}

// ----------------------------------------------------------------------------
// Calendar-interval triggers (via simprop)
// ----------------------------------------------------------------------------

pub struct CalendarIntervalDelegate {
    support: SimplePropertiesSupport,
}

impl CalendarIntervalDelegate {
    pub fn new(table_prefix: &str) -> Self {
        Self {
            support: SimplePropertiesSupport::new(table_prefix),
        }
    }

    fn to_props(trigger: &Trigger) -> Result<SimpleTriggerProperties, StoreError> {
        let TriggerSchedule::CalendarInterval {
            interval,
            unit,
            time_zone,
            preserve_hour_across_dst,
            skip_day_if_hour_does_not_exist,
        } = &trigger.schedule
        else {
            return Err(StoreError::Fatal("delegate/schedule mismatch".to_string()));
        };
        Ok(SimpleTriggerProperties {
            str_prop_1: Some(unit.as_str().to_string()),
            str_prop_2: Some(time_zone.to_string()),
            int_prop_1: Some(*interval),
            bool_prop_1: Some(*preserve_hour_across_dst),
            bool_prop_2: Some(*skip_day_if_hour_does_not_exist),
            ..Default::default()
        })
    }

    fn from_props(props: SimpleTriggerProperties) -> Result<TriggerSchedule, StoreError> {
        let unit = parse_unit(props.str_prop_1.as_deref().unwrap_or_default())?;
        let time_zone = parse_zone(props.str_prop_2.as_deref().unwrap_or("UTC"))?;
        Ok(TriggerSchedule::CalendarInterval {
            interval: props.int_prop_1.unwrap_or(1),
            unit,
            time_zone,
            preserve_hour_across_dst: props.bool_prop_1.unwrap_or(false),
            skip_day_if_hour_does_not_exist: props.bool_prop_2.unwrap_or(false),
        })
    }
}

#[async_trait]
impl TriggerPersistenceDelegate for CalendarIntervalDelegate {
    fn can_handle(&self, schedule: &TriggerSchedule) -> bool {
        matches!(schedule, TriggerSchedule::CalendarInterval { .. })
    }

    fn discriminator(&self) -> char {
        'I'
    }

    async fn insert_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        trigger: &Trigger,
    ) -> Result<(), StoreError> {
        let props = Self::to_props(trigger)?;
        self.support
            .insert(conn, sched_name, &trigger.key, &props)
            .await
    }

    async fn update_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        trigger: &Trigger,
    ) -> Result<(), StoreError> {
        let props = Self::to_props(trigger)?;
        self.support
            .update(conn, sched_name, &trigger.key, &props)
            .await
    }

    async fn delete_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<(), StoreError> {
        self.support.delete(conn, sched_name, key).await
    }

    async fn load_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<TriggerSchedule, StoreError> {
        let props = self.support.load(conn, sched_name, key).await?;
        Self::from_props(props)
    }
}

// ----------------------------------------------------------------------------
// Daily-time-interval triggers (via simprop)
// ----------------------------------------------------------------------------

pub struct DailyTimeIntervalDelegate {
    support: SimplePropertiesSupport,
}

impl DailyTimeIntervalDelegate {
    pub fn new(table_prefix: &str) -> Self {
        Self {
            support: SimplePropertiesSupport::new(table_prefix),
        }
    }

    fn to_props(trigger: &Trigger) -> Result<SimpleTriggerProperties, StoreError> {
        let TriggerSchedule::DailyTimeInterval {
            interval,
            unit,
            days_of_week,
            start_time_of_day,
            end_time_of_day,
            repeat_count,
            times_triggered,
            time_zone,
        } = &trigger.schedule
        else {
            return Err(StoreError::Fatal("delegate/schedule mismatch".to_string()));
        };
        let days = days_of_week
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Ok(SimpleTriggerProperties {
            str_prop_1: Some(unit.as_str().to_string()),
            str_prop_2: Some(days),
            str_prop_3: Some(time_zone.to_string()),
            int_prop_1: Some(start_time_of_day.seconds_of_day() as i32),
            int_prop_2: Some(end_time_of_day.seconds_of_day() as i32),
            long_prop_1: Some(*interval as i64),
            long_prop_2: Some(*repeat_count as i64),
            dec_prop_1: Some(*times_triggered as f64),
            ..Default::default()
        })
    }

    fn from_props(props: SimpleTriggerProperties) -> Result<TriggerSchedule, StoreError> {
        let unit = parse_unit(props.str_prop_1.as_deref().unwrap_or_default())?;
        let time_zone = parse_zone(props.str_prop_3.as_deref().unwrap_or("UTC"))?;
        let days_of_week: BTreeSet<u8> = props
            .str_prop_2
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect();
        let start = seconds_to_time_of_day(props.int_prop_1.unwrap_or(0));
        let end = seconds_to_time_of_day(props.int_prop_2.unwrap_or(24 * 3600 - 1));
        Ok(TriggerSchedule::DailyTimeInterval {
            interval: props.long_prop_1.unwrap_or(1) as i32,
            unit,
            days_of_week,
            start_time_of_day: start,
            end_time_of_day: end,
            repeat_count: props.long_prop_2.unwrap_or(-1) as i32,
            times_triggered: props.dec_prop_1.unwrap_or(0.0) as i32,
            time_zone,
        })
    }
}

fn seconds_to_time_of_day(seconds: i32) -> TimeOfDay {
    let seconds = seconds.clamp(0, 24 * 3600 - 1) as u32;
    TimeOfDay {
        hour: (seconds / 3600) as u8,
        minute: ((seconds % 3600) / 60) as u8,
        second: (seconds % 60) as u8,
    }
}

#[async_trait]
impl TriggerPersistenceDelegate for DailyTimeIntervalDelegate {
    fn can_handle(&self, schedule: &TriggerSchedule) -> bool {
        matches!(schedule, TriggerSchedule::DailyTimeInterval { .. })
    }

    fn discriminator(&self) -> char {
        'D'
    }

    async fn insert_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        trigger: &Trigger,
    ) -> Result<(), StoreError> {
        let props = Self::to_props(trigger)?;
        self.support
            .insert(conn, sched_name, &trigger.key, &props)
            .await
    }

    async fn update_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        trigger: &Trigger,
    ) -> Result<(), StoreError> {
        let props = Self::to_props(trigger)?;
        self.support
            .update(conn, sched_name, &trigger.key, &props)
            .await
    }

    async fn delete_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<(), StoreError> {
        self.support.delete(conn, sched_name, key).await
    }

    async fn load_extended(
        &self,
        conn: &mut PgConnection,
        sched_name: &str,
        key: &TriggerKey,
    ) -> Result<TriggerSchedule, StoreError> {
        let props = self.support.load(conn, sched_name, key).await?;
        Self::from_props(props)
    }
}

/// The delegates every clustered store ships with, covering the built-in
/// schedule variants.
pub fn standard_delegates(table_prefix: &str) -> Vec<Box<dyn TriggerPersistenceDelegate>> {
    vec![
        Box::new(SimpleTriggerDelegate::new(table_prefix)),
        Box::new(CronTriggerDelegate::new(table_prefix)),
        Box::new(CalendarIntervalDelegate::new(table_prefix)),
        Box::new(DailyTimeIntervalDelegate::new(table_prefix)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Key;
    use chrono_tz::UTC;

    #[test]
    fn test_discriminators_are_distinct() {
        let delegates = standard_delegates("sched_");
        let mut seen = std::collections::HashSet::new();
        for d in &delegates {
            assert!(seen.insert(d.discriminator()));
        }
    }

    #[test]
    fn test_can_handle_routing() {
        let delegates = standard_delegates("sched_");
        let simple = TriggerSchedule::Simple {
            repeat_interval_ms: 1000,
            repeat_count: 0,
            times_triggered: 0,
        };
        let handlers: Vec<char> = delegates
            .iter()
            .filter(|d| d.can_handle(&simple))
            .map(|d| d.discriminator())
            .collect();
        assert_eq!(handlers, vec!['S']);
    }

    #[test]
    fn test_daily_props_round_trip() {
        let schedule = TriggerSchedule::DailyTimeInterval {
            interval: 72,
            unit: IntervalUnit::Minute,
            days_of_week: [2u8, 3, 4, 5, 6].into_iter().collect(),
            start_time_of_day: TimeOfDay::new(8, 0, 0).unwrap(),
            end_time_of_day: TimeOfDay::new(17, 30, 15).unwrap(),
            repeat_count: 10,
            times_triggered: 3,
            time_zone: chrono_tz::Europe::Vienna,
        };
        let trigger = Trigger::new(Key::of("t"), Key::of("j"), schedule.clone());
        let props = DailyTimeIntervalDelegate::to_props(&trigger).unwrap();
        let back = DailyTimeIntervalDelegate::from_props(props).unwrap();
        match (schedule, back) {
            (
                TriggerSchedule::DailyTimeInterval {
                    interval: a_int,
                    days_of_week: a_days,
                    start_time_of_day: a_start,
                    end_time_of_day: a_end,
                    repeat_count: a_rc,
                    times_triggered: a_tt,
                    time_zone: a_tz,
                    ..
                },
                TriggerSchedule::DailyTimeInterval {
                    interval: b_int,
                    days_of_week: b_days,
                    start_time_of_day: b_start,
                    end_time_of_day: b_end,
                    repeat_count: b_rc,
                    times_triggered: b_tt,
                    time_zone: b_tz,
                    ..
                },
            ) => {
                assert_eq!(a_int, b_int);
                assert_eq!(a_days, b_days);
                assert_eq!(a_start, b_start);
                assert_eq!(a_end, b_end);
                assert_eq!(a_rc, b_rc);
                assert_eq!(a_tt, b_tt);
                assert_eq!(a_tz, b_tz);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_calendar_interval_props_round_trip() {
        let schedule = TriggerSchedule::CalendarInterval {
            interval: 3,
            unit: IntervalUnit::Month,
            time_zone: UTC,
            preserve_hour_across_dst: true,
            skip_day_if_hour_does_not_exist: false,
        };
        let trigger = Trigger::new(Key::of("t"), Key::of("j"), schedule);
        let props = CalendarIntervalDelegate::to_props(&trigger).unwrap();
        assert_eq!(props.str_prop_1.as_deref(), Some("MONTH"));
        assert_eq!(props.int_prop_1, Some(3));
        let back = CalendarIntervalDelegate::from_props(props).unwrap();
        assert!(matches!(
            back,
            TriggerSchedule::CalendarInterval {
                interval: 3,
                unit: IntervalUnit::Month,
                preserve_hour_across_dst: true,
                ..
            }
        ));
    }
}
