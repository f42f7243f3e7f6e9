// Trigger model and per-variant schedule evaluation: first/next fire time
// computation, calendar filtering, misfire remediation and the completion
// instruction derived after a job has run.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::calendar::ExclusionCalendar;
use crate::cron::CronExpression;
use crate::errors::{JobExecutionError, ScheduleError, ValidationError};
use crate::models::{
    deserialize_tz, serialize_tz, CompletedExecutionInstruction, IntervalUnit, JobDataMap, JobKey,
    MisfirePolicy, TimeOfDay, TriggerKey,
};

/// Default trigger priority; higher fires first among same-instant triggers.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Repeat count meaning "repeat forever".
pub const REPEAT_INDEFINITELY: i32 = -1;

/// Bound on schedule-vs-calendar fixed-point iterations.
const MAX_CALENDAR_STEPS: usize = 100_000;

/// Schedule variant carried by a trigger. Counters that advance as the
/// trigger fires (`times_triggered`) live here so the store can persist them
/// alongside the schedule parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSchedule {
    Simple {
        repeat_interval_ms: i64,
        /// -1 repeats indefinitely; otherwise fires 1 + repeat_count times.
        repeat_count: i32,
        #[serde(default)]
        times_triggered: i32,
    },
    Cron {
        expression: CronExpression,
    },
    CalendarInterval {
        interval: i32,
        unit: IntervalUnit,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        time_zone: Tz,
        #[serde(default)]
        preserve_hour_across_dst: bool,
        #[serde(default)]
        skip_day_if_hour_does_not_exist: bool,
    },
    DailyTimeInterval {
        interval: i32,
        unit: IntervalUnit,
        /// 1=Sunday..7=Saturday; empty means every day.
        days_of_week: BTreeSet<u8>,
        start_time_of_day: TimeOfDay,
        end_time_of_day: TimeOfDay,
        /// -1 repeats indefinitely.
        repeat_count: i32,
        #[serde(default)]
        times_triggered: i32,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        time_zone: Tz,
    },
}

impl TriggerSchedule {
    /// Single-character discriminator persisted in the triggers table.
    pub fn discriminator(&self) -> char {
        match self {
            TriggerSchedule::Simple { .. } => 'S',
            TriggerSchedule::Cron { .. } => 'C',
            TriggerSchedule::CalendarInterval { .. } => 'I',
            TriggerSchedule::DailyTimeInterval { .. } => 'D',
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TriggerSchedule::Simple { .. } => "simple",
            TriggerSchedule::Cron { .. } => "cron",
            TriggerSchedule::CalendarInterval { .. } => "calendar-interval",
            TriggerSchedule::DailyTimeInterval { .. } => "daily-time-interval",
        }
    }
}

/// A firing rule bound to a job. Fire-time fields are mutated only by the
/// owning store (via `triggered` / `update_after_misfire`); clients treat
/// triggers as values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub misfire_policy: MisfirePolicy,
    pub calendar_name: Option<String>,
    pub data: JobDataMap,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub fire_instance_id: Option<String>,
    pub schedule: TriggerSchedule,
}

impl Trigger {
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: TriggerSchedule) -> Self {
        Self {
            key,
            job_key,
            description: None,
            start_time: Utc::now(),
            end_time: None,
            priority: DEFAULT_PRIORITY,
            misfire_policy: MisfirePolicy::default(),
            calendar_name: None,
            data: JobDataMap::new(),
            next_fire_time: None,
            previous_fire_time: None,
            fire_instance_id: None,
            schedule,
        }
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn with_calendar(mut self, calendar_name: impl Into<String>) -> Self {
        self.calendar_name = Some(calendar_name.into());
        self
    }

    pub fn with_data(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.key
            .validate()
            .map_err(|e: ValidationError| ScheduleError::InvalidConfiguration(e.to_string()))?;
        self.job_key
            .validate()
            .map_err(|e: ValidationError| ScheduleError::InvalidConfiguration(e.to_string()))?;

        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(ScheduleError::InvalidConfiguration(
                    "end_time must not precede start_time".to_string(),
                ));
            }
        }

        match &self.schedule {
            TriggerSchedule::Simple {
                repeat_interval_ms,
                repeat_count,
                ..
            } => {
                if *repeat_count < REPEAT_INDEFINITELY {
                    return Err(ScheduleError::InvalidConfiguration(
                        "repeat_count must be >= -1".to_string(),
                    ));
                }
                if *repeat_count != 0 && *repeat_interval_ms < 1 {
                    return Err(ScheduleError::InvalidConfiguration(
                        "repeat_interval_ms must be >= 1".to_string(),
                    ));
                }
            }
            TriggerSchedule::Cron { .. } => {}
            TriggerSchedule::CalendarInterval { interval, .. } => {
                if *interval < 1 {
                    return Err(ScheduleError::InvalidConfiguration(
                        "interval must be >= 1".to_string(),
                    ));
                }
            }
            TriggerSchedule::DailyTimeInterval {
                interval,
                unit,
                days_of_week,
                start_time_of_day,
                end_time_of_day,
                repeat_count,
                ..
            } => {
                if *interval < 1 {
                    return Err(ScheduleError::InvalidConfiguration(
                        "interval must be >= 1".to_string(),
                    ));
                }
                if *repeat_count < REPEAT_INDEFINITELY {
                    return Err(ScheduleError::InvalidConfiguration(
                        "repeat_count must be >= -1".to_string(),
                    ));
                }
                let unit_seconds = match unit {
                    IntervalUnit::Second => 1,
                    IntervalUnit::Minute => 60,
                    IntervalUnit::Hour => 3600,
                    other => {
                        return Err(ScheduleError::InvalidConfiguration(format!(
                            "daily-time-interval unit must be SECOND, MINUTE or HOUR, got {}",
                            other.as_str()
                        )))
                    }
                };
                if (*interval as i64) * unit_seconds > 24 * 3600 {
                    return Err(ScheduleError::InvalidConfiguration(
                        "interval must not span more than 24 hours".to_string(),
                    ));
                }
                if end_time_of_day < start_time_of_day {
                    return Err(ScheduleError::InvalidConfiguration(
                        "end_time_of_day must not precede start_time_of_day".to_string(),
                    ));
                }
                for day in days_of_week {
                    crate::time::validate_day_of_week(*day as i64)
                        .map_err(|e| ScheduleError::InvalidConfiguration(e.to_string()))?;
                }
            }
        }

        self.validate_misfire_policy()
    }

    fn validate_misfire_policy(&self) -> Result<(), ScheduleError> {
        let reschedule_counts = matches!(
            self.misfire_policy,
            MisfirePolicy::RescheduleNowWithExistingCount
                | MisfirePolicy::RescheduleNowWithRemainingCount
                | MisfirePolicy::RescheduleNextWithExistingCount
                | MisfirePolicy::RescheduleNextWithRemainingCount
        );
        if reschedule_counts && !matches!(self.schedule, TriggerSchedule::Simple { .. }) {
            return Err(ScheduleError::MisfirePolicyMismatch {
                policy: format!("{:?}", self.misfire_policy),
                trigger_type: self.schedule.type_name().to_string(),
            });
        }
        Ok(())
    }

    /// Compute and record the first fire time at or after the start time,
    /// filtered through the calendar. Returns the computed time.
    pub fn compute_first_fire_time(
        &mut self,
        calendar: Option<&ExclusionCalendar>,
    ) -> Option<DateTime<Utc>> {
        let first = self.fire_time_after(self.start_time - Duration::milliseconds(1), calendar);
        self.next_fire_time = first;
        first
    }

    /// First fire time strictly after `after`, satisfying the calendar and
    /// the end-time bound.
    pub fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        calendar: Option<&ExclusionCalendar>,
    ) -> Option<DateTime<Utc>> {
        let mut candidate = self.fire_time_after_raw(after)?;
        let Some(cal) = calendar else {
            return Some(candidate);
        };

        // Excluded candidates jump to the calendar's next included instant
        // and re-enter the schedule until the two agree.
        for _ in 0..MAX_CALENDAR_STEPS {
            if cal.is_time_included(candidate) {
                return Some(candidate);
            }
            let included = cal.next_included_time(candidate)?;
            if let Some(end) = self.end_time {
                if included > end {
                    return None;
                }
            }
            candidate = self.fire_time_after_raw(included - Duration::milliseconds(1))?;
        }
        None
    }

    /// Schedule-only next fire time, ignoring any calendar.
    fn fire_time_after_raw(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.schedule {
            TriggerSchedule::Simple {
                repeat_interval_ms,
                repeat_count,
                times_triggered,
            } => self.simple_fire_time_after(
                after,
                *repeat_interval_ms,
                *repeat_count,
                *times_triggered,
            ),
            TriggerSchedule::Cron { expression } => {
                let after = if after < self.start_time {
                    self.start_time - Duration::seconds(1)
                } else {
                    after
                };
                if let Some(end) = self.end_time {
                    if after >= end {
                        return None;
                    }
                }
                let next = expression.next_valid_time_after(after)?;
                match self.end_time {
                    Some(end) if next > end => None,
                    _ => Some(next),
                }
            }
            TriggerSchedule::CalendarInterval {
                interval,
                unit,
                time_zone,
                preserve_hour_across_dst: _,
                skip_day_if_hour_does_not_exist,
            } => self.calendar_interval_fire_time_after(
                after,
                *interval,
                *unit,
                *time_zone,
                *skip_day_if_hour_does_not_exist,
            ),
            TriggerSchedule::DailyTimeInterval {
                interval,
                unit,
                days_of_week,
                start_time_of_day,
                end_time_of_day,
                ..
            } => self.daily_fire_time_after(
                after,
                *interval,
                *unit,
                days_of_week,
                *start_time_of_day,
                *end_time_of_day,
            ),
        }
    }

    fn simple_fire_time_after(
        &self,
        after: DateTime<Utc>,
        interval_ms: i64,
        repeat_count: i32,
        times_triggered: i32,
    ) -> Option<DateTime<Utc>> {
        if repeat_count != REPEAT_INDEFINITELY && times_triggered > repeat_count {
            return None;
        }
        if after < self.start_time {
            return Some(self.start_time);
        }
        if repeat_count == 0 || interval_ms < 1 {
            // one-shot already in the past relative to `after`
            return None;
        }

        let elapsed_ms = (after - self.start_time).num_milliseconds();
        let times_executed = elapsed_ms / interval_ms + 1;
        if repeat_count != REPEAT_INDEFINITELY && times_executed > repeat_count as i64 {
            return None;
        }

        let time = self.start_time + Duration::milliseconds(times_executed * interval_ms);
        match self.end_time {
            Some(end) if time >= end => None,
            _ => Some(time),
        }
    }

    fn calendar_interval_fire_time_after(
        &self,
        after: DateTime<Utc>,
        interval: i32,
        unit: IntervalUnit,
        time_zone: Tz,
        skip_day_if_hour_does_not_exist: bool,
    ) -> Option<DateTime<Utc>> {
        if after < self.start_time {
            return self.bounded_by_end(self.start_time);
        }

        if let Some(unit_ms) = unit.fixed_millis() {
            let step_ms = unit_ms * interval as i64;
            let elapsed_ms = (after - self.start_time).num_milliseconds();
            let jumps = elapsed_ms / step_ms + 1;
            let time = self.start_time + Duration::milliseconds(jumps * step_ms);
            return self.bounded_by_end(time);
        }

        // Date-based units walk the local calendar step by step, preserving
        // the wall-clock time. A short month clamps the day and the clamped
        // day carries forward into later steps.
        let mut current = self.start_time.with_timezone(&time_zone).naive_local();

        // coarse initial jump for day/week units to avoid a long walk
        if matches!(unit, IntervalUnit::Day | IntervalUnit::Week) {
            let unit_days = if unit == IntervalUnit::Week { 7 } else { 1 };
            let per_step = unit_days * interval as i64;
            let elapsed_days = (after - self.start_time).num_days();
            let whole_steps = elapsed_days / per_step;
            if whole_steps > 1 {
                current = add_date_interval(current, unit, interval as i64 * (whole_steps - 1))?;
            }
        }

        for _ in 0..MAX_CALENDAR_STEPS {
            current = add_date_interval(current, unit, interval as i64)?;
            match resolve_local_in_zone(current, time_zone) {
                Some(candidate) if candidate > after => {
                    return self.bounded_by_end(candidate);
                }
                Some(_) => {}
                None => {
                    // wall-clock hour does not exist on that day
                    if !skip_day_if_hour_does_not_exist {
                        if let Some(shifted) = resolve_local_shifted(current, time_zone) {
                            if shifted > after {
                                return self.bounded_by_end(shifted);
                            }
                        }
                    }
                    // otherwise fall through and take the next interval
                }
            }
        }
        None
    }

    fn bounded_by_end(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.end_time {
            Some(end) if t > end => None,
            _ => Some(t),
        }
    }

    fn daily_fire_time_after(
        &self,
        after: DateTime<Utc>,
        interval: i32,
        unit: IntervalUnit,
        days_of_week: &BTreeSet<u8>,
        start_tod: TimeOfDay,
        end_tod: TimeOfDay,
    ) -> Option<DateTime<Utc>> {
        let time_zone = match &self.schedule {
            TriggerSchedule::DailyTimeInterval { time_zone, .. } => *time_zone,
            _ => chrono_tz::UTC,
        };
        let interval_ms = unit.fixed_millis()? * interval as i64;

        let mut fire = after + Duration::milliseconds(1);
        if fire < self.start_time {
            fire = self.start_time;
        }

        // walk at most a little over a year of days looking for an allowed one
        for _ in 0..370 {
            if let Some(end) = self.end_time {
                if fire > end {
                    return None;
                }
            }

            let local = fire.with_timezone(&time_zone);
            let date = local.date_naive();
            let day_start = at_time_of_day(date, start_tod, time_zone)?;
            let day_end = at_time_of_day(date, end_tod, time_zone)?;

            if fire > day_end {
                fire = next_day_start(date, start_tod, time_zone)?;
                continue;
            }

            let dow = date.weekday().num_days_from_sunday() as u8 + 1;
            if !days_of_week.is_empty() && !days_of_week.contains(&dow) {
                fire = next_day_start(date, start_tod, time_zone)?;
                continue;
            }

            let candidate = if fire <= day_start {
                day_start
            } else {
                let elapsed_ms = (fire - day_start).num_milliseconds();
                let mut times = elapsed_ms / interval_ms;
                if elapsed_ms % interval_ms != 0 {
                    times += 1;
                }
                day_start + Duration::milliseconds(times * interval_ms)
            };

            if candidate > day_end {
                fire = next_day_start(date, start_tod, time_zone)?;
                continue;
            }

            return self.bounded_by_end(candidate);
        }
        None
    }

    /// Advance past a fire: record the previous time, compute the next and
    /// bump per-variant counters. Called by stores inside the fire path.
    pub fn triggered(&mut self, calendar: Option<&ExclusionCalendar>) {
        let fired_at = self.next_fire_time;
        self.previous_fire_time = fired_at;

        match &mut self.schedule {
            TriggerSchedule::Simple {
                times_triggered, ..
            }
            | TriggerSchedule::DailyTimeInterval {
                times_triggered, ..
            } => {
                *times_triggered += 1;
            }
            _ => {}
        }

        self.next_fire_time = match fired_at {
            Some(t) => self.fire_time_after(t, calendar),
            None => None,
        };

        // daily repeat bound is enforced on advance, not on raw evaluation
        if let TriggerSchedule::DailyTimeInterval {
            repeat_count,
            times_triggered,
            ..
        } = &self.schedule
        {
            if *repeat_count != REPEAT_INDEFINITELY && *times_triggered > *repeat_count {
                self.next_fire_time = None;
            }
        }
    }

    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }

    /// Remediate a missed fire according to the trigger's misfire policy.
    /// `now` comes from the store's clock.
    pub fn update_after_misfire(
        &mut self,
        calendar: Option<&ExclusionCalendar>,
        now: DateTime<Utc>,
    ) {
        if self.misfire_policy == MisfirePolicy::IgnoreMisfires {
            return;
        }
        match self.schedule {
            TriggerSchedule::Simple { .. } => self.simple_update_after_misfire(calendar, now),
            _ => self.advance_style_update_after_misfire(calendar, now),
        }
    }

    fn simple_update_after_misfire(
        &mut self,
        calendar: Option<&ExclusionCalendar>,
        now: DateTime<Utc>,
    ) {
        let (repeat_count, times_triggered) = match self.schedule {
            TriggerSchedule::Simple {
                repeat_count,
                times_triggered,
                ..
            } => (repeat_count, times_triggered),
            _ => return,
        };

        let mut policy = self.misfire_policy;
        if policy == MisfirePolicy::Smart {
            policy = if repeat_count == 0 {
                MisfirePolicy::FireNow
            } else if repeat_count == REPEAT_INDEFINITELY {
                MisfirePolicy::RescheduleNextWithRemainingCount
            } else {
                MisfirePolicy::RescheduleNowWithExistingCount
            };
        } else if policy == MisfirePolicy::FireNow && repeat_count != 0 {
            // FireNow only makes sense for one-shots; repeating triggers
            // degrade to an immediate reschedule with the remaining count.
            policy = MisfirePolicy::RescheduleNowWithRemainingCount;
        }

        match policy {
            MisfirePolicy::FireNow => {
                self.next_fire_time = Some(now);
            }
            MisfirePolicy::DoNothing | MisfirePolicy::RescheduleNextWithExistingCount => {
                self.next_fire_time = self.fire_time_after(now, calendar);
            }
            MisfirePolicy::RescheduleNextWithRemainingCount => {
                let missed_until = self.fire_time_after(now, calendar);
                if let (Some(old_next), Some(new_next)) = (self.next_fire_time, missed_until) {
                    let times_missed = self.times_fired_between(old_next, new_next);
                    if let TriggerSchedule::Simple {
                        times_triggered, ..
                    } = &mut self.schedule
                    {
                        *times_triggered += times_missed;
                    }
                }
                self.next_fire_time = missed_until;
            }
            MisfirePolicy::RescheduleNowWithExistingCount => {
                if repeat_count != 0 && repeat_count != REPEAT_INDEFINITELY {
                    if let TriggerSchedule::Simple {
                        repeat_count: rc,
                        times_triggered: tt,
                        ..
                    } = &mut self.schedule
                    {
                        *rc -= times_triggered;
                        *tt = 0;
                    }
                }
                self.restart_at(now);
            }
            MisfirePolicy::RescheduleNowWithRemainingCount => {
                let times_missed = match self.next_fire_time {
                    Some(old_next) => self.times_fired_between(old_next, now),
                    None => 0,
                };
                if repeat_count != 0 && repeat_count != REPEAT_INDEFINITELY {
                    let remaining = (repeat_count - (times_triggered + times_missed)).max(0);
                    if let TriggerSchedule::Simple {
                        repeat_count: rc,
                        times_triggered: tt,
                        ..
                    } = &mut self.schedule
                    {
                        *rc = remaining;
                        *tt = 0;
                    }
                }
                self.restart_at(now);
            }
            _ => {}
        }
    }

    fn restart_at(&mut self, now: DateTime<Utc>) {
        if let Some(end) = self.end_time {
            if end < now {
                self.next_fire_time = None;
                return;
            }
        }
        self.start_time = now;
        self.next_fire_time = Some(now);
    }

    fn times_fired_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i32 {
        match self.schedule {
            TriggerSchedule::Simple {
                repeat_interval_ms, ..
            } if repeat_interval_ms > 0 => {
                ((to - from).num_milliseconds() / repeat_interval_ms) as i32
            }
            _ => 0,
        }
    }

    /// Cron, calendar-interval and daily-time-interval triggers share the
    /// fire-once-now / skip-to-next misfire repertoire.
    fn advance_style_update_after_misfire(
        &mut self,
        calendar: Option<&ExclusionCalendar>,
        now: DateTime<Utc>,
    ) {
        let mut policy = self.misfire_policy;
        if policy == MisfirePolicy::Smart {
            policy = MisfirePolicy::FireNow;
        }
        match policy {
            MisfirePolicy::FireNow => {
                self.next_fire_time = Some(now);
            }
            MisfirePolicy::DoNothing => {
                self.next_fire_time = self.fire_time_after(now, calendar);
            }
            _ => {}
        }
    }

    /// Final instruction for the scheduler once the job has run.
    pub fn execution_complete(
        &self,
        result: Option<&JobExecutionError>,
    ) -> CompletedExecutionInstruction {
        if let Some(err) = result {
            if err.refire_immediately {
                return CompletedExecutionInstruction::ReExecuteJob;
            }
            if err.unschedule_firing_trigger {
                return CompletedExecutionInstruction::SetTriggerComplete;
            }
            if err.unschedule_all_triggers {
                return CompletedExecutionInstruction::SetAllJobTriggersComplete;
            }
        }
        if !self.may_fire_again() {
            return CompletedExecutionInstruction::DeleteTrigger;
        }
        CompletedExecutionInstruction::Noop
    }
}

/// Fire times a trigger would produce, for inspection and tests. The trigger
/// is advanced on a clone; the original is untouched.
pub fn compute_fire_times(
    trigger: &Trigger,
    calendar: Option<&ExclusionCalendar>,
    count: usize,
) -> Vec<DateTime<Utc>> {
    let mut t = trigger.clone();
    let mut times = Vec::new();
    let mut next = t.compute_first_fire_time(calendar);
    while let Some(fire) = next {
        if times.len() >= count {
            break;
        }
        times.push(fire);
        t.triggered(calendar);
        next = t.next_fire_time;
    }
    times
}

fn at_time_of_day(date: NaiveDate, tod: TimeOfDay, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(tod.hour as u32, tod.minute as u32, tod.second as u32)?;
    resolve_local_shifted(naive, tz)
}

fn next_day_start(date: NaiveDate, tod: TimeOfDay, tz: Tz) -> Option<DateTime<Utc>> {
    at_time_of_day(date.succ_opt()?, tod, tz)
}

/// Local-to-instant mapping that fails on DST gaps.
fn resolve_local_in_zone(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        chrono::LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        chrono::LocalResult::None => None,
    }
}

/// Local-to-instant mapping that slides through DST gaps to the first
/// existing instant.
fn resolve_local_shifted(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
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

/// Add `n` date-based units to a local wall-clock time, clamping the day of
/// month when the target month is shorter.
fn add_date_interval(start: NaiveDateTime, unit: IntervalUnit, n: i64) -> Option<NaiveDateTime> {
    match unit {
        IntervalUnit::Day => start.checked_add_signed(Duration::days(n)),
        IntervalUnit::Week => start.checked_add_signed(Duration::days(7 * n)),
        IntervalUnit::Month => {
            let date = add_months_clamped(start.date(), n)?;
            Some(date.and_time(start.time()))
        }
        IntervalUnit::Year => {
            let date = add_months_clamped(start.date(), 12 * n)?;
            Some(date.and_time(start.time()))
        }
        _ => None,
    }
}

fn add_months_clamped(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let zero_based = date.year() as i64 * 12 + date.month0() as i64 + months;
    let year = zero_based.div_euclid(12) as i32;
    let month = zero_based.rem_euclid(12) as u32 + 1;
    let last = last_day_of_month(year, month);
    NaiveDate::from_ymd_opt(year, month, date.day().min(last))
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::UTC;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn simple_trigger(start: DateTime<Utc>, interval_ms: i64, repeat_count: i32) -> Trigger {
        Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::Simple {
                repeat_interval_ms: interval_ms,
                repeat_count,
                times_triggered: 0,
            },
        )
        .with_start_time(start)
    }

    #[test]
    fn test_simple_fire_times_every_three_seconds() {
        let start = utc(2011, 1, 1, 0, 0, 0);
        let trigger = simple_trigger(start, 3_000, 9);
        let times = compute_fire_times(&trigger, None, 48);
        assert_eq!(times.len(), 10);
        assert_eq!(times[0], utc(2011, 1, 1, 0, 0, 0));
        assert_eq!(times[1], utc(2011, 1, 1, 0, 0, 3));
        assert_eq!(times[9], utc(2011, 1, 1, 0, 0, 27));
    }

    #[test]
    fn test_simple_repeat_count_is_additional_fires() {
        let start = utc(2011, 1, 1, 0, 0, 0);
        let trigger = simple_trigger(start, 1_000, 2);
        let times = compute_fire_times(&trigger, None, 48);
        // first fire plus two repeats
        assert_eq!(times.len(), 3);
        assert_eq!(times[2], utc(2011, 1, 1, 0, 0, 2));
    }

    #[test]
    fn test_simple_one_shot() {
        let start = utc(2011, 1, 1, 0, 0, 0);
        let trigger = simple_trigger(start, 0, 0);
        let times = compute_fire_times(&trigger, None, 48);
        assert_eq!(times, vec![start]);
    }

    #[test]
    fn test_simple_indefinite_honors_end_time() {
        let start = utc(2011, 1, 1, 0, 0, 0);
        let trigger = simple_trigger(start, 1_000, REPEAT_INDEFINITELY)
            .with_end_time(utc(2011, 1, 1, 0, 0, 5));
        let times = compute_fire_times(&trigger, None, 48);
        // the fire exactly at end_time is excluded for simple triggers
        assert_eq!(times.len(), 5);
        assert_eq!(*times.last().unwrap(), utc(2011, 1, 1, 0, 0, 4));
    }

    #[test]
    fn test_simple_monotonic_fire_time_after() {
        let start = utc(2011, 1, 1, 0, 0, 0);
        let trigger = simple_trigger(start, 7_000, REPEAT_INDEFINITELY);
        let t1 = trigger.fire_time_after(utc(2011, 1, 1, 0, 0, 10), None);
        let t2 = trigger.fire_time_after(utc(2011, 1, 1, 0, 0, 20), None);
        assert!(t1.unwrap() <= t2.unwrap());
    }

    #[test]
    fn test_cron_trigger_fire_times() {
        let trigger = Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::Cron {
                expression: CronExpression::parse("0 0 12 * * ?").unwrap(),
            },
        )
        .with_start_time(utc(2024, 1, 1, 0, 0, 0));
        let times = compute_fire_times(&trigger, None, 3);
        assert_eq!(times[0], utc(2024, 1, 1, 12, 0, 0));
        assert_eq!(times[1], utc(2024, 1, 2, 12, 0, 0));
        assert_eq!(times[2], utc(2024, 1, 3, 12, 0, 0));
    }

    #[test]
    fn test_cron_vienna_dst_boundary() {
        let trigger = Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::Cron {
                expression: CronExpression::parse_in_zone(
                    "0 0 0 * * ?",
                    chrono_tz::Europe::Vienna,
                )
                .unwrap(),
            },
        )
        .with_start_time(utc(2024, 3, 30, 0, 0, 0));
        // after 2024-03-30T23:59:59+01:00
        let next = trigger
            .fire_time_after(utc(2024, 3, 30, 22, 59, 59), None)
            .unwrap();
        assert_eq!(next, utc(2024, 3, 30, 23, 0, 0)); // 03-31 00:00 +01:00
        let following = trigger.fire_time_after(next, None).unwrap();
        assert_eq!(following, utc(2024, 3, 31, 22, 0, 0)); // 04-01 00:00 +02:00
    }

    #[test]
    fn test_calendar_interval_months_preserve_day_with_clamp() {
        let trigger = Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::CalendarInterval {
                interval: 1,
                unit: IntervalUnit::Month,
                time_zone: UTC,
                preserve_hour_across_dst: false,
                skip_day_if_hour_does_not_exist: false,
            },
        )
        .with_start_time(utc(2024, 1, 31, 9, 0, 0));
        let times = compute_fire_times(&trigger, None, 4);
        assert_eq!(times[0], utc(2024, 1, 31, 9, 0, 0));
        // February clamps to its last day and the clamp carries forward
        assert_eq!(times[1], utc(2024, 2, 29, 9, 0, 0));
        assert_eq!(times[2], utc(2024, 3, 29, 9, 0, 0));
        assert_eq!(times[3], utc(2024, 4, 29, 9, 0, 0));
    }

    #[test]
    fn test_calendar_interval_hours_are_fixed_length() {
        let trigger = Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::CalendarInterval {
                interval: 6,
                unit: IntervalUnit::Hour,
                time_zone: UTC,
                preserve_hour_across_dst: false,
                skip_day_if_hour_does_not_exist: false,
            },
        )
        .with_start_time(utc(2024, 1, 1, 0, 0, 0));
        let times = compute_fire_times(&trigger, None, 3);
        assert_eq!(times[1], utc(2024, 1, 1, 6, 0, 0));
        assert_eq!(times[2], utc(2024, 1, 1, 12, 0, 0));
    }

    fn daily_trigger(start: DateTime<Utc>, days: &[u8]) -> Trigger {
        Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::DailyTimeInterval {
                interval: 60,
                unit: IntervalUnit::Minute,
                days_of_week: days.iter().copied().collect(),
                start_time_of_day: TimeOfDay::new(8, 0, 0).unwrap(),
                end_time_of_day: TimeOfDay::new(17, 0, 0).unwrap(),
                repeat_count: REPEAT_INDEFINITELY,
                times_triggered: 0,
                time_zone: UTC,
            },
        )
        .with_start_time(start)
    }

    #[test]
    fn test_daily_time_interval_weekdays() {
        use crate::time::{FRIDAY, MONDAY, THURSDAY, TUESDAY, WEDNESDAY};
        // 2011-01-01 is a Saturday; Mon-Fri window 8:00-17:00 every hour
        let trigger = daily_trigger(
            utc(2011, 1, 1, 0, 0, 0),
            &[MONDAY, TUESDAY, WEDNESDAY, THURSDAY, FRIDAY],
        );
        let times = compute_fire_times(&trigger, None, 48);
        assert_eq!(times.len(), 48);
        // first fire is Monday the 3rd at the window start
        assert_eq!(times[0], utc(2011, 1, 3, 8, 0, 0));
        // ten fires per day; the 11th opens Tuesday
        assert_eq!(times[10], utc(2011, 1, 4, 8, 0, 0));
        // the 48th fire lands on Friday the 7th at 15:00
        assert_eq!(times[47], utc(2011, 1, 7, 15, 0, 0));
    }

    #[test]
    fn test_daily_time_interval_hourly_window() {
        let trigger = Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::DailyTimeInterval {
                interval: 60,
                unit: IntervalUnit::Minute,
                days_of_week: BTreeSet::new(),
                start_time_of_day: TimeOfDay::new(8, 0, 0).unwrap(),
                end_time_of_day: TimeOfDay::new(17, 0, 0).unwrap(),
                repeat_count: REPEAT_INDEFINITELY,
                times_triggered: 0,
                time_zone: UTC,
            },
        )
        .with_start_time(utc(2011, 1, 1, 0, 0, 0));
        let times = compute_fire_times(&trigger, None, 48);
        assert_eq!(times[0], utc(2011, 1, 1, 8, 0, 0));
        // the 10th fire of the day is the window end itself
        assert_eq!(times[9], utc(2011, 1, 1, 17, 0, 0));
        assert_eq!(times[10], utc(2011, 1, 2, 8, 0, 0));
        assert_eq!(times[47], utc(2011, 1, 5, 15, 0, 0));
    }

    #[test]
    fn test_daily_repeat_count_limits_total_fires() {
        let mut trigger = daily_trigger(utc(2011, 1, 1, 0, 0, 0), &[]);
        if let TriggerSchedule::DailyTimeInterval { repeat_count, .. } = &mut trigger.schedule {
            *repeat_count = 4;
        }
        let times = compute_fire_times(&trigger, None, 48);
        assert_eq!(times.len(), 5);
    }

    #[test]
    fn test_calendar_filter_skips_excluded_days() {
        let weekend = ExclusionCalendar::weekend(UTC);
        // daily at noon starting Friday 2024-06-07
        let trigger = Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::Cron {
                expression: CronExpression::parse("0 0 12 * * ?").unwrap(),
            },
        )
        .with_start_time(utc(2024, 6, 7, 0, 0, 0));
        let times = compute_fire_times(&trigger, Some(&weekend), 3);
        assert_eq!(times[0], utc(2024, 6, 7, 12, 0, 0));
        // Saturday and Sunday excluded
        assert_eq!(times[1], utc(2024, 6, 10, 12, 0, 0));
        assert_eq!(times[2], utc(2024, 6, 11, 12, 0, 0));
        for t in &times {
            assert!(weekend.is_time_included(*t));
        }
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let t = simple_trigger(start, 0, 5);
        assert!(t.validate().is_err());

        let t = simple_trigger(start, 1000, -2);
        assert!(t.validate().is_err());

        let t = simple_trigger(start, 1000, 5).with_end_time(utc(2023, 1, 1, 0, 0, 0));
        assert!(t.validate().is_err());

        // daily interval over 24h
        let t = Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::DailyTimeInterval {
                interval: 25,
                unit: IntervalUnit::Hour,
                days_of_week: BTreeSet::new(),
                start_time_of_day: TimeOfDay::start_of_day(),
                end_time_of_day: TimeOfDay::end_of_day(),
                repeat_count: REPEAT_INDEFINITELY,
                times_triggered: 0,
                time_zone: UTC,
            },
        );
        assert!(t.validate().is_err());

        // count-based reschedule policies are a simple-trigger concept
        let t = Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::Cron {
                expression: CronExpression::parse("0 0 12 * * ?").unwrap(),
            },
        )
        .with_misfire_policy(MisfirePolicy::RescheduleNowWithRemainingCount);
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_simple_misfire_fire_now_one_shot() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let mut t = simple_trigger(start, 0, 0).with_misfire_policy(MisfirePolicy::Smart);
        t.next_fire_time = Some(start);
        let now = utc(2024, 1, 1, 1, 0, 0);
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, Some(now));
    }

    #[test]
    fn test_simple_misfire_reschedule_now_with_remaining_count() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let mut t = simple_trigger(start, 60_000, 10)
            .with_misfire_policy(MisfirePolicy::RescheduleNowWithRemainingCount);
        t.next_fire_time = Some(start);
        // five intervals missed
        let now = utc(2024, 1, 1, 0, 5, 0);
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, Some(now));
        assert_eq!(t.start_time, now);
        match t.schedule {
            TriggerSchedule::Simple {
                repeat_count,
                times_triggered,
                ..
            } => {
                assert_eq!(repeat_count, 5);
                assert_eq!(times_triggered, 0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_simple_misfire_do_nothing_advances_past_now() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let mut t = simple_trigger(start, 60_000, REPEAT_INDEFINITELY)
            .with_misfire_policy(MisfirePolicy::DoNothing);
        t.next_fire_time = Some(start);
        let now = utc(2024, 1, 1, 0, 10, 30);
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, Some(utc(2024, 1, 1, 0, 11, 0)));
    }

    #[test]
    fn test_ignore_misfire_policy_leaves_trigger_alone() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let mut t =
            simple_trigger(start, 60_000, 5).with_misfire_policy(MisfirePolicy::IgnoreMisfires);
        t.next_fire_time = Some(start);
        t.update_after_misfire(None, utc(2024, 1, 1, 2, 0, 0));
        assert_eq!(t.next_fire_time, Some(start));
    }

    #[test]
    fn test_cron_misfire_smart_fires_once_now() {
        let mut t = Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::Cron {
                expression: CronExpression::parse("0 0 12 * * ?").unwrap(),
            },
        )
        .with_start_time(utc(2024, 1, 1, 0, 0, 0));
        t.next_fire_time = Some(utc(2024, 1, 1, 12, 0, 0));
        let now = utc(2024, 1, 2, 9, 0, 0);
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, Some(now));
    }

    #[test]
    fn test_cron_misfire_do_nothing_skips_to_next() {
        let mut t = Trigger::new(
            TriggerKey::of("t"),
            JobKey::of("j"),
            TriggerSchedule::Cron {
                expression: CronExpression::parse("0 0 12 * * ?").unwrap(),
            },
        )
        .with_start_time(utc(2024, 1, 1, 0, 0, 0))
        .with_misfire_policy(MisfirePolicy::DoNothing);
        t.next_fire_time = Some(utc(2024, 1, 1, 12, 0, 0));
        let now = utc(2024, 1, 2, 9, 0, 0);
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, Some(utc(2024, 1, 2, 12, 0, 0)));
    }

    #[test]
    fn test_execution_complete_instructions() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let mut t = simple_trigger(start, 1000, REPEAT_INDEFINITELY);
        t.next_fire_time = Some(start);

        assert_eq!(
            t.execution_complete(None),
            CompletedExecutionInstruction::Noop
        );
        let refire = JobExecutionError::new("x").with_refire_immediately();
        assert_eq!(
            t.execution_complete(Some(&refire)),
            CompletedExecutionInstruction::ReExecuteJob
        );
        let unschedule = JobExecutionError::new("x").with_unschedule_firing_trigger();
        assert_eq!(
            t.execution_complete(Some(&unschedule)),
            CompletedExecutionInstruction::SetTriggerComplete
        );

        t.next_fire_time = None;
        assert_eq!(
            t.execution_complete(None),
            CompletedExecutionInstruction::DeleteTrigger
        );
    }

    #[test]
    fn test_triggered_advances_previous_and_counters() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let mut t = simple_trigger(start, 1000, 5);
        t.compute_first_fire_time(None);
        assert_eq!(t.next_fire_time, Some(start));

        t.triggered(None);
        assert_eq!(t.previous_fire_time, Some(start));
        assert_eq!(t.next_fire_time, Some(utc(2024, 1, 1, 0, 0, 1)));
        match t.schedule {
            TriggerSchedule::Simple {
                times_triggered, ..
            } => assert_eq!(times_triggered, 1),
            _ => unreachable!(),
        }
        assert!(t.previous_fire_time.unwrap() < t.next_fire_time.unwrap());
    }

    #[test]
    fn test_trigger_serde_round_trip() {
        let t = daily_trigger(utc(2011, 1, 1, 0, 0, 0), &[2, 3]);
        let json = serde_json::to_string(&t).unwrap();
        let back: Trigger = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, t.key);
        assert_eq!(back.schedule.discriminator(), 'D');
    }
}
