use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::ValidationError;

/// Group assigned to keys created without an explicit group.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Group under which failover recovery triggers are created.
pub const RECOVERING_JOBS_GROUP: &str = "RECOVERING_JOBS";

// Helper functions for Tz serialization
pub(crate) fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&tz.to_string())
}

pub(crate) fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

// ============================================================================
// Keys
// ============================================================================

/// Structural `(name, group)` identifier shared by jobs and triggers.
///
/// An empty group normalizes to [`DEFAULT_GROUP`]; an empty name is rejected
/// by `validate()` before any store mutation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub name: String,
    pub group: String,
}

impl Key {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        let group = group.into();
        Self {
            name: name.into(),
            group: if group.is_empty() {
                DEFAULT_GROUP.to_string()
            } else {
                group
            },
        }
    }

    /// Key in the default group.
    pub fn of(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyKeyName);
        }
        Ok(())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

pub type JobKey = Key;
pub type TriggerKey = Key;

// ============================================================================
// Group matching
// ============================================================================

/// Predicate over group names, used by group queries, bulk pause/resume and
/// listener registrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupMatcher {
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    Any,
}

impl GroupMatcher {
    pub fn matches(&self, group: &str) -> bool {
        match self {
            GroupMatcher::Equals(g) => group == g,
            GroupMatcher::StartsWith(p) => group.starts_with(p.as_str()),
            GroupMatcher::EndsWith(s) => group.ends_with(s.as_str()),
            GroupMatcher::Contains(s) => group.contains(s.as_str()),
            GroupMatcher::Any => true,
        }
    }

    pub fn matches_key(&self, key: &Key) -> bool {
        self.matches(&key.group)
    }
}

// ============================================================================
// Job data
// ============================================================================

/// String-keyed bag of values carried by jobs and triggers and handed to the
/// executing job. Mutations flip a dirty flag so stores can decide whether a
/// write-back is needed after execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobDataMap {
    #[serde(flatten)]
    entries: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    dirty: bool,
}

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.entries.insert(key.into(), value.into());
        self.dirty = true;
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|v| v.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(|v| v.as_i64())
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.entries.iter()
    }

    /// Entries of `other` layered over `self` (other wins on key clash).
    pub fn merged_with(&self, other: &JobDataMap) -> JobDataMap {
        let mut entries = self.entries.clone();
        entries.extend(other.entries.clone());
        JobDataMap {
            entries,
            dirty: false,
        }
    }

    /// Whether every value is a plain string; required in properties mode.
    pub fn all_values_strings(&self) -> Result<(), ValidationError> {
        for (k, v) in &self.entries {
            if !v.is_string() {
                return Err(ValidationError::NonStringJobData(k.clone()));
            }
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty_flag(&mut self) {
        self.dirty = false;
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for JobDataMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            dirty: false,
        }
    }
}

// ============================================================================
// Job definitions
// ============================================================================

/// Execution flags a job runner declares about itself. Registry-declared
/// capabilities override whatever the job definition carries, mirroring the
/// precedence of runner-level markers over per-definition settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCapabilities {
    pub disallow_concurrent_execution: bool,
    pub persist_data_after_execution: bool,
}

/// Definition of a unit of work, identified by key and bound to a registered
/// runner type by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    pub job_type: String,
    pub description: Option<String>,
    pub data: JobDataMap,
    pub durable: bool,
    pub requests_recovery: bool,
    pub disallow_concurrent_execution: bool,
    pub persist_data_after_execution: bool,
}

impl JobDetail {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            description: None,
            data: JobDataMap::new(),
            durable: false,
            requests_recovery: false,
            disallow_concurrent_execution: false,
            persist_data_after_execution: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn requests_recovery(mut self, requests_recovery: bool) -> Self {
        self.requests_recovery = requests_recovery;
        self
    }

    pub fn disallow_concurrent(mut self, disallow: bool) -> Self {
        self.disallow_concurrent_execution = disallow;
        self
    }

    pub fn persist_data(mut self, persist: bool) -> Self {
        self.persist_data_after_execution = persist;
        self
    }

    /// Overlay runner-declared capabilities; the declared value wins.
    pub fn apply_capabilities(&mut self, caps: JobCapabilities) {
        if caps.disallow_concurrent_execution {
            self.disallow_concurrent_execution = true;
        }
        if caps.persist_data_after_execution {
            self.persist_data_after_execution = true;
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.key.validate()?;
        if self.job_type.is_empty() {
            return Err(ValidationError::MissingField("job_type".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Trigger states and policies
// ============================================================================

/// Persisted trigger lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    Waiting,
    Acquired,
    Executing,
    Complete,
    Paused,
    PausedBlocked,
    Blocked,
    Error,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Executing => "EXECUTING",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Paused => "PAUSED",
            TriggerState::PausedBlocked => "PAUSED_BLOCKED",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(TriggerState::Waiting),
            "ACQUIRED" => Some(TriggerState::Acquired),
            "EXECUTING" => Some(TriggerState::Executing),
            "COMPLETE" => Some(TriggerState::Complete),
            "PAUSED" => Some(TriggerState::Paused),
            "PAUSED_BLOCKED" => Some(TriggerState::PausedBlocked),
            "BLOCKED" => Some(TriggerState::Blocked),
            "ERROR" => Some(TriggerState::Error),
            _ => None,
        }
    }
}

/// Client-visible projection of [`TriggerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerStateView {
    None,
    Normal,
    Paused,
    Complete,
    Error,
    Blocked,
}

impl From<TriggerState> for TriggerStateView {
    fn from(state: TriggerState) -> Self {
        match state {
            TriggerState::Waiting | TriggerState::Acquired | TriggerState::Executing => {
                TriggerStateView::Normal
            }
            TriggerState::Complete => TriggerStateView::Complete,
            TriggerState::Paused | TriggerState::PausedBlocked => TriggerStateView::Paused,
            TriggerState::Blocked => TriggerStateView::Blocked,
            TriggerState::Error => TriggerStateView::Error,
        }
    }
}

/// How a late trigger is remediated once it is more than the misfire
/// threshold overdue. Validity of the reschedule-count variants depends on
/// the trigger type and is checked by `Trigger::validate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Resolve to a type-specific default at misfire time.
    Smart,
    /// Treat late fires as on-time; skip misfire handling entirely.
    IgnoreMisfires,
    FireNow,
    DoNothing,
    RescheduleNowWithExistingCount,
    RescheduleNowWithRemainingCount,
    RescheduleNextWithExistingCount,
    RescheduleNextWithRemainingCount,
}

impl Default for MisfirePolicy {
    fn default() -> Self {
        MisfirePolicy::Smart
    }
}

impl MisfirePolicy {
    /// Stable wire code persisted in the triggers table.
    pub fn code(&self) -> i16 {
        match self {
            MisfirePolicy::IgnoreMisfires => -1,
            MisfirePolicy::Smart => 0,
            MisfirePolicy::FireNow => 1,
            MisfirePolicy::DoNothing => 2,
            MisfirePolicy::RescheduleNowWithExistingCount => 3,
            MisfirePolicy::RescheduleNowWithRemainingCount => 4,
            MisfirePolicy::RescheduleNextWithExistingCount => 5,
            MisfirePolicy::RescheduleNextWithRemainingCount => 6,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            -1 => Some(MisfirePolicy::IgnoreMisfires),
            0 => Some(MisfirePolicy::Smart),
            1 => Some(MisfirePolicy::FireNow),
            2 => Some(MisfirePolicy::DoNothing),
            3 => Some(MisfirePolicy::RescheduleNowWithExistingCount),
            4 => Some(MisfirePolicy::RescheduleNowWithRemainingCount),
            5 => Some(MisfirePolicy::RescheduleNextWithExistingCount),
            6 => Some(MisfirePolicy::RescheduleNextWithRemainingCount),
            _ => None,
        }
    }
}

/// Final instruction derived from a trigger after its job has executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletedExecutionInstruction {
    Noop,
    ReExecuteJob,
    SetTriggerComplete,
    DeleteTrigger,
    SetAllJobTriggersComplete,
    SetTriggerError,
    SetAllJobTriggersError,
}

// ============================================================================
// Time-of-day and interval units
// ============================================================================

/// Wall-clock time within a day, used by daily-time-interval schedules and
/// the daily exclusion calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8, second: u8) -> Result<Self, ValidationError> {
        if hour > 23 {
            return Err(ValidationError::InvalidFieldValue {
                field: "hour".to_string(),
                reason: "must be >= 0 and <= 23".to_string(),
            });
        }
        if minute > 59 {
            return Err(ValidationError::InvalidFieldValue {
                field: "minute".to_string(),
                reason: "must be >= 0 and <= 59".to_string(),
            });
        }
        if second > 59 {
            return Err(ValidationError::InvalidFieldValue {
                field: "second".to_string(),
                reason: "must be >= 0 and <= 59".to_string(),
            });
        }
        Ok(Self {
            hour,
            minute,
            second,
        })
    }

    pub fn start_of_day() -> Self {
        Self {
            hour: 0,
            minute: 0,
            second: 0,
        }
    }

    pub fn end_of_day() -> Self {
        Self {
            hour: 23,
            minute: 59,
            second: 59,
        }
    }

    pub fn seconds_of_day(&self) -> u32 {
        self.hour as u32 * 3600 + self.minute as u32 * 60 + self.second as u32
    }
}

/// Unit of a repeat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Millisecond => "MILLISECOND",
            IntervalUnit::Second => "SECOND",
            IntervalUnit::Minute => "MINUTE",
            IntervalUnit::Hour => "HOUR",
            IntervalUnit::Day => "DAY",
            IntervalUnit::Week => "WEEK",
            IntervalUnit::Month => "MONTH",
            IntervalUnit::Year => "YEAR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MILLISECOND" => Some(IntervalUnit::Millisecond),
            "SECOND" => Some(IntervalUnit::Second),
            "MINUTE" => Some(IntervalUnit::Minute),
            "HOUR" => Some(IntervalUnit::Hour),
            "DAY" => Some(IntervalUnit::Day),
            "WEEK" => Some(IntervalUnit::Week),
            "MONTH" => Some(IntervalUnit::Month),
            "YEAR" => Some(IntervalUnit::Year),
            _ => None,
        }
    }

    /// Milliseconds per unit for the fixed-length units; the calendar
    /// units (day and larger) have no fixed span and return None.
    pub fn fixed_millis(&self) -> Option<i64> {
        match self {
            IntervalUnit::Millisecond => Some(1),
            IntervalUnit::Second => Some(1_000),
            IntervalUnit::Minute => Some(60_000),
            IntervalUnit::Hour => Some(3_600_000),
            _ => None,
        }
    }
}

// ============================================================================
// Fired-trigger and cluster records
// ============================================================================

/// State of an in-flight fire claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FiredState {
    Acquired,
    Executing,
}

impl FiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FiredState::Acquired => "ACQUIRED",
            FiredState::Executing => "EXECUTING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACQUIRED" => Some(FiredState::Acquired),
            "EXECUTING" => Some(FiredState::Executing),
            _ => None,
        }
    }
}

/// Persisted evidence that an instance has claimed a fire; exists only
/// between acquire and completion and drives crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub fire_instance_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: Option<JobKey>,
    pub instance_id: String,
    pub fired_time: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
    pub state: FiredState,
    pub disallow_concurrent_execution: bool,
    pub requests_recovery: bool,
    pub priority: i32,
}

/// One row per live scheduler instance; heartbeats drive failover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval_ms: i64,
}
