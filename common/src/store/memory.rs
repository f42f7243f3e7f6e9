// In-process job store: the whole dataset behind one mutex, with an ordered
// queue over (next_fire_time, priority desc, key) giving O(log n) acquire.
// No persistence; state dies with the process.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::calendar::ExclusionCalendar;
use crate::errors::{StoreError, ValidationError};
use crate::models::{
    CompletedExecutionInstruction, FiredState, FiredTriggerRecord, GroupMatcher, JobDetail, JobKey,
    MisfirePolicy, TriggerKey, TriggerState, TriggerStateView,
};
use crate::schedule::Trigger;
use crate::store::{
    JobStore, NullSignaler, SchedulerSignaler, TriggerFiredBundle, TriggerFiredResult,
};

/// Default tolerance before a late trigger counts as misfired.
pub const DEFAULT_MISFIRE_THRESHOLD_MS: i64 = 5_000;

/// Queue key ordering acquisition: earliest fire time first, then highest
/// priority, then key order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKey {
    next_fire_time: DateTime<Utc>,
    priority: i32,
    key: TriggerKey,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.next_fire_time
            .cmp(&other.next_fire_time)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct TriggerRecord {
    trigger: Trigger,
    state: TriggerState,
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, TriggerRecord>,
    queue: BTreeSet<QueueKey>,
    calendars: HashMap<String, ExclusionCalendar>,
    paused_trigger_groups: HashSet<String>,
    paused_job_groups: HashSet<String>,
    blocked_jobs: HashSet<JobKey>,
    fired: HashMap<String, FiredTriggerRecord>,
}

impl StoreState {
    fn queue_key(record: &TriggerRecord) -> Option<QueueKey> {
        record.trigger.next_fire_time.map(|t| QueueKey {
            next_fire_time: t,
            priority: record.trigger.priority,
            key: record.trigger.key.clone(),
        })
    }

    fn enqueue(&mut self, key: &TriggerKey) {
        if let Some(record) = self.triggers.get(key) {
            if let Some(qk) = Self::queue_key(record) {
                self.queue.insert(qk);
            }
        }
    }

    fn dequeue(&mut self, key: &TriggerKey) {
        self.queue.retain(|qk| &qk.key != key);
    }

    fn triggers_for_job(&self, job_key: &JobKey) -> Vec<TriggerKey> {
        self.triggers
            .values()
            .filter(|r| &r.trigger.job_key == job_key)
            .map(|r| r.trigger.key.clone())
            .collect()
    }

    fn calendar_for(&self, trigger: &Trigger) -> Option<ExclusionCalendar> {
        trigger
            .calendar_name
            .as_ref()
            .and_then(|name| self.calendars.get(name).cloned())
    }
}

/// Deferred listener notifications, emitted after the mutex is released.
enum Notice {
    Misfired(Trigger),
    Finalized(Trigger),
    SchedulingChanged(Option<DateTime<Utc>>),
}

pub struct MemoryJobStore {
    misfire_threshold: Duration,
    signaler: RwLock<Arc<dyn SchedulerSignaler>>,
    state: Mutex<StoreState>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(Duration::milliseconds(DEFAULT_MISFIRE_THRESHOLD_MS))
    }
}

impl MemoryJobStore {
    pub fn new(misfire_threshold: Duration) -> Self {
        Self {
            misfire_threshold,
            signaler: RwLock::new(Arc::new(NullSignaler)),
            state: Mutex::new(StoreState::default()),
        }
    }

    fn signaler(&self) -> Arc<dyn SchedulerSignaler> {
        Arc::clone(&self.signaler.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn emit(&self, notices: Vec<Notice>) {
        let signaler = self.signaler();
        for notice in notices {
            match notice {
                Notice::Misfired(t) => signaler.notify_trigger_listeners_misfired(&t).await,
                Notice::Finalized(t) => signaler.notify_scheduler_listeners_finalized(&t).await,
                Notice::SchedulingChanged(candidate) => {
                    signaler.signal_scheduling_change(candidate)
                }
            }
        }
    }

    /// Remediate a misfired trigger in place. Returns false when the trigger
    /// was not actually misfired (within threshold or ignoring misfires).
    fn apply_misfire(
        state: &mut StoreState,
        key: &TriggerKey,
        misfire_threshold: Duration,
        now: DateTime<Utc>,
        notices: &mut Vec<Notice>,
    ) -> bool {
        let misfire_time = now - misfire_threshold;

        let (next, calendar) = match state.triggers.get(key) {
            Some(record) => match record.trigger.next_fire_time {
                Some(next)
                    if next <= misfire_time
                        && record.trigger.misfire_policy != MisfirePolicy::IgnoreMisfires =>
                {
                    (next, state.calendar_for(&record.trigger))
                }
                _ => return false,
            },
            None => return false,
        };

        let mut finalized = false;
        let mut moved = false;
        if let Some(record) = state.triggers.get_mut(key) {
            notices.push(Notice::Misfired(record.trigger.clone()));
            record.trigger.update_after_misfire(calendar.as_ref(), now);
            if record.trigger.next_fire_time.is_none() {
                record.state = TriggerState::Complete;
                notices.push(Notice::Finalized(record.trigger.clone()));
                finalized = true;
            } else {
                moved = record.trigger.next_fire_time != Some(next);
            }
        }
        if finalized {
            state.dequeue(key);
        }
        finalized || moved
    }

    /// State a newly stored trigger starts in, honoring sticky paused groups
    /// and blocked jobs.
    fn initial_state(state: &StoreState, trigger: &Trigger) -> TriggerState {
        let paused = state.paused_trigger_groups.contains(&trigger.key.group)
            || state.paused_job_groups.contains(&trigger.job_key.group);
        let blocked = state.blocked_jobs.contains(&trigger.job_key);
        match (paused, blocked) {
            (true, true) => TriggerState::PausedBlocked,
            (true, false) => TriggerState::Paused,
            (false, true) => TriggerState::Blocked,
            (false, false) => TriggerState::Waiting,
        }
    }

    fn remove_trigger_internal(
        state: &mut StoreState,
        key: &TriggerKey,
        remove_orphaned_job: bool,
    ) -> bool {
        let Some(record) = state.triggers.remove(key) else {
            return false;
        };
        state.dequeue(key);

        if remove_orphaned_job {
            let job_key = record.trigger.job_key;
            let orphaned = state.triggers_for_job(&job_key).is_empty();
            if orphaned {
                if let Some(job) = state.jobs.get(&job_key) {
                    if !job.durable {
                        state.jobs.remove(&job_key);
                        state.blocked_jobs.remove(&job_key);
                        debug!(job = %job_key, "Removed non-durable job with no remaining triggers");
                    }
                }
            }
        }
        true
    }

    fn matching_groups<'a>(
        groups: impl Iterator<Item = &'a String>,
        matcher: &GroupMatcher,
    ) -> Vec<String> {
        let mut matched: Vec<String> = groups
            .filter(|g| matcher.matches(g))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        matched.sort();
        matched
    }

    fn pause_trigger_internal(state: &mut StoreState, key: &TriggerKey) {
        let Some(record) = state.triggers.get_mut(key) else {
            return;
        };
        match record.state {
            TriggerState::Complete | TriggerState::Paused | TriggerState::PausedBlocked => {}
            TriggerState::Blocked => {
                record.state = TriggerState::PausedBlocked;
            }
            _ => {
                record.state = TriggerState::Paused;
            }
        }
        state.dequeue(key);
    }

    fn resume_trigger_internal(
        state: &mut StoreState,
        key: &TriggerKey,
        misfire_threshold: Duration,
        now: DateTime<Utc>,
        notices: &mut Vec<Notice>,
    ) {
        let Some(record) = state.triggers.get(key) else {
            return;
        };
        if !matches!(
            record.state,
            TriggerState::Paused | TriggerState::PausedBlocked
        ) {
            return;
        }
        let blocked = state.blocked_jobs.contains(&record.trigger.job_key);
        let new_state = if blocked {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        };
        let key_cloned = key.clone();
        if let Some(record) = state.triggers.get_mut(&key_cloned) {
            record.state = new_state;
        }
        Self::apply_misfire(state, &key_cloned, misfire_threshold, now, notices);
        let requeue = state
            .triggers
            .get(&key_cloned)
            .map(|r| r.state == TriggerState::Waiting)
            .unwrap_or(false);
        if requeue {
            state.enqueue(&key_cloned);
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> Result<(), StoreError> {
        *self.signaler.write().unwrap_or_else(|e| e.into_inner()) = signaler;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn store_job(&self, job: JobDetail, replace: bool) -> Result<(), StoreError> {
        job.validate()?;
        let mut state = self.lock();
        if state.jobs.contains_key(&job.key) && !replace {
            return Err(StoreError::AlreadyExists {
                kind: "Job",
                key: job.key.to_string(),
            });
        }
        state.jobs.insert(job.key.clone(), job);
        Ok(())
    }

    async fn store_trigger(&self, mut trigger: Trigger, replace: bool) -> Result<(), StoreError> {
        trigger.validate()?;
        let mut notices = Vec::new();
        {
            let mut state = self.lock();
            if state.triggers.contains_key(&trigger.key) && !replace {
                return Err(StoreError::AlreadyExists {
                    kind: "Trigger",
                    key: trigger.key.to_string(),
                });
            }
            if !state.jobs.contains_key(&trigger.job_key) {
                return Err(StoreError::JobNotFound(trigger.job_key.to_string()));
            }
            if let Some(name) = &trigger.calendar_name {
                if !state.calendars.contains_key(name) {
                    return Err(StoreError::CalendarNotFound(name.clone()));
                }
            }

            if trigger.next_fire_time.is_none() {
                let calendar = state.calendar_for(&trigger);
                if trigger.compute_first_fire_time(calendar.as_ref()).is_none() {
                    return Err(ValidationError::InvalidFieldValue {
                        field: "schedule".to_string(),
                        reason: "trigger will never fire".to_string(),
                    }
                    .into());
                }
            }

            let initial = Self::initial_state(&state, &trigger);
            let key = trigger.key.clone();
            let candidate = trigger.next_fire_time;
            state.dequeue(&key);
            state.triggers.insert(
                key.clone(),
                TriggerRecord {
                    trigger,
                    state: initial,
                },
            );
            if initial == TriggerState::Waiting {
                state.enqueue(&key);
                notices.push(Notice::SchedulingChanged(candidate));
            }
        }
        self.emit(notices).await;
        Ok(())
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let trigger_keys = state.triggers_for_job(key);
        for tk in &trigger_keys {
            Self::remove_trigger_internal(&mut state, tk, false);
        }
        state.blocked_jobs.remove(key);
        Ok(state.jobs.remove(key).is_some() || !trigger_keys.is_empty())
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let mut state = self.lock();
        Ok(Self::remove_trigger_internal(&mut state, key, true))
    }

    async fn replace_trigger(
        &self,
        key: &TriggerKey,
        new_trigger: Trigger,
    ) -> Result<bool, StoreError> {
        let existing_job = {
            let state = self.lock();
            match state.triggers.get(key) {
                Some(record) => record.trigger.job_key.clone(),
                None => return Ok(false),
            }
        };
        if existing_job != new_trigger.job_key {
            return Err(ValidationError::InvalidFieldValue {
                field: "job_key".to_string(),
                reason: "replacement trigger must reference the same job".to_string(),
            }
            .into());
        }
        {
            let mut state = self.lock();
            Self::remove_trigger_internal(&mut state, key, false);
        }
        self.store_trigger(new_trigger, false).await?;
        Ok(true)
    }

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError> {
        Ok(self.lock().jobs.get(key).cloned())
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        Ok(self.lock().triggers.get(key).map(|r| r.trigger.clone()))
    }

    async fn check_job_exists(&self, key: &JobKey) -> Result<bool, StoreError> {
        Ok(self.lock().jobs.contains_key(key))
    }

    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        Ok(self.lock().triggers.contains_key(key))
    }

    async fn clear_all_scheduling_data(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        *state = StoreState::default();
        Ok(())
    }

    async fn get_job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>, StoreError> {
        let state = self.lock();
        let mut keys: Vec<JobKey> = state
            .jobs
            .keys()
            .filter(|k| matcher.matches_key(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>, StoreError> {
        let state = self.lock();
        let mut keys: Vec<TriggerKey> = state
            .triggers
            .keys()
            .filter(|k| matcher.matches_key(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_job_group_names(&self) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        let mut groups: Vec<String> = state
            .jobs
            .keys()
            .map(|k| k.group.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        groups.sort();
        Ok(groups)
    }

    async fn get_trigger_group_names(&self) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        let mut groups: Vec<String> = state
            .triggers
            .keys()
            .map(|k| k.group.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        groups.sort();
        Ok(groups)
    }

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, StoreError> {
        let state = self.lock();
        let mut triggers: Vec<Trigger> = state
            .triggers
            .values()
            .filter(|r| &r.trigger.job_key == key)
            .map(|r| r.trigger.clone())
            .collect();
        triggers.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(triggers)
    }

    async fn store_calendar(
        &self,
        name: &str,
        calendar: ExclusionCalendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<(), StoreError> {
        let mut notices = Vec::new();
        {
            let mut state = self.lock();
            if state.calendars.contains_key(name) && !replace {
                return Err(StoreError::AlreadyExists {
                    kind: "Calendar",
                    key: name.to_string(),
                });
            }
            state.calendars.insert(name.to_string(), calendar.clone());

            if update_triggers {
                let affected: Vec<TriggerKey> = state
                    .triggers
                    .values()
                    .filter(|r| r.trigger.calendar_name.as_deref() == Some(name))
                    .map(|r| r.trigger.key.clone())
                    .collect();
                for key in affected {
                    let (next, was_waiting) = {
                        let Some(record) = state.triggers.get_mut(&key) else {
                            continue;
                        };
                        record.trigger.compute_first_fire_time(Some(&calendar));
                        (
                            record.trigger.next_fire_time,
                            record.state == TriggerState::Waiting,
                        )
                    };
                    state.dequeue(&key);
                    match next {
                        None => {
                            if let Some(record) = state.triggers.get_mut(&key) {
                                record.state = TriggerState::Complete;
                                notices.push(Notice::Finalized(record.trigger.clone()));
                            }
                        }
                        Some(t) if was_waiting => {
                            state.enqueue(&key);
                            notices.push(Notice::SchedulingChanged(Some(t)));
                        }
                        Some(_) => {}
                    }
                }
            }
        }
        self.emit(notices).await;
        Ok(())
    }

    async fn remove_calendar(&self, name: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let referenced = state
            .triggers
            .values()
            .any(|r| r.trigger.calendar_name.as_deref() == Some(name));
        if referenced {
            return Err(StoreError::CalendarInUse(name.to_string()));
        }
        Ok(state.calendars.remove(name).is_some())
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<ExclusionCalendar>, StoreError> {
        Ok(self.lock().calendars.get(name).cloned())
    }

    async fn get_calendar_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.lock().calendars.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<TriggerStateView, StoreError> {
        let state = self.lock();
        Ok(state
            .triggers
            .get(key)
            .map(|r| TriggerStateView::from(r.state))
            .unwrap_or(TriggerStateView::None))
    }

    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut state = self.lock();
        match state.triggers.get(key) {
            None => return Err(StoreError::TriggerNotFound(key.to_string())),
            Some(record) if record.state != TriggerState::Error => return Ok(()),
            Some(_) => {}
        }
        let paused = state.paused_trigger_groups.contains(&key.group);
        let mut requeue = false;
        if let Some(record) = state.triggers.get_mut(key) {
            record.state = if paused {
                TriggerState::Paused
            } else {
                TriggerState::Waiting
            };
            requeue = record.state == TriggerState::Waiting;
        }
        if requeue {
            state.enqueue(key);
        }
        Ok(())
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::pause_trigger_internal(&mut state, key);
        Ok(())
    }

    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut state = self.lock();
        let mut groups = match matcher {
            GroupMatcher::Equals(group) => vec![group.clone()],
            _ => Self::matching_groups(state.triggers.keys().map(|k| &k.group), matcher),
        };
        groups.sort();
        for group in &groups {
            state.paused_trigger_groups.insert(group.clone());
        }
        let keys: Vec<TriggerKey> = state
            .triggers
            .keys()
            .filter(|k| groups.contains(&k.group))
            .cloned()
            .collect();
        for key in keys {
            Self::pause_trigger_internal(&mut state, &key);
        }
        Ok(groups)
    }

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut notices = Vec::new();
        {
            let mut state = self.lock();
            let now = Utc::now();
            Self::resume_trigger_internal(&mut state, key, self.misfire_threshold, now, &mut notices);
        }
        self.emit(notices).await;
        Ok(())
    }

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut notices = Vec::new();
        let groups;
        {
            let mut state = self.lock();
            let now = Utc::now();
            let mut matched: Vec<String> = state
                .paused_trigger_groups
                .iter()
                .filter(|g| matcher.matches(g))
                .cloned()
                .collect();
            matched.extend(Self::matching_groups(
                state.triggers.keys().map(|k| &k.group),
                matcher,
            ));
            matched.sort();
            matched.dedup();
            groups = matched;

            for group in &groups {
                state.paused_trigger_groups.remove(group);
            }
            let keys: Vec<TriggerKey> = state
                .triggers
                .keys()
                .filter(|k| groups.contains(&k.group))
                .cloned()
                .collect();
            for key in keys {
                Self::resume_trigger_internal(
                    &mut state,
                    &key,
                    self.misfire_threshold,
                    now,
                    &mut notices,
                );
            }
        }
        self.emit(notices).await;
        Ok(groups)
    }

    async fn pause_job(&self, key: &JobKey) -> Result<(), StoreError> {
        let mut state = self.lock();
        for tk in state.triggers_for_job(key) {
            Self::pause_trigger_internal(&mut state, &tk);
        }
        Ok(())
    }

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut state = self.lock();
        let mut groups = match matcher {
            GroupMatcher::Equals(group) => vec![group.clone()],
            _ => Self::matching_groups(state.jobs.keys().map(|k| &k.group), matcher),
        };
        groups.sort();
        for group in &groups {
            state.paused_job_groups.insert(group.clone());
        }
        let job_keys: Vec<JobKey> = state
            .jobs
            .keys()
            .filter(|k| groups.contains(&k.group))
            .cloned()
            .collect();
        for jk in job_keys {
            for tk in state.triggers_for_job(&jk) {
                Self::pause_trigger_internal(&mut state, &tk);
            }
        }
        Ok(groups)
    }

    async fn resume_job(&self, key: &JobKey) -> Result<(), StoreError> {
        let mut notices = Vec::new();
        {
            let mut state = self.lock();
            let now = Utc::now();
            for tk in state.triggers_for_job(key) {
                Self::resume_trigger_internal(
                    &mut state,
                    &tk,
                    self.misfire_threshold,
                    now,
                    &mut notices,
                );
            }
        }
        self.emit(notices).await;
        Ok(())
    }

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut notices = Vec::new();
        let groups;
        {
            let mut state = self.lock();
            let now = Utc::now();
            let mut matched: Vec<String> = state
                .paused_job_groups
                .iter()
                .filter(|g| matcher.matches(g))
                .cloned()
                .collect();
            matched.extend(Self::matching_groups(
                state.jobs.keys().map(|k| &k.group),
                matcher,
            ));
            matched.sort();
            matched.dedup();
            groups = matched;

            for group in &groups {
                state.paused_job_groups.remove(group);
            }
            let job_keys: Vec<JobKey> = state
                .jobs
                .keys()
                .filter(|k| groups.contains(&k.group))
                .cloned()
                .collect();
            for jk in job_keys {
                for tk in state.triggers_for_job(&jk) {
                    Self::resume_trigger_internal(
                        &mut state,
                        &tk,
                        self.misfire_threshold,
                        now,
                        &mut notices,
                    );
                }
            }
        }
        self.emit(notices).await;
        Ok(groups)
    }

    async fn pause_all(&self) -> Result<(), StoreError> {
        self.pause_triggers(&GroupMatcher::Any).await?;
        Ok(())
    }

    async fn resume_all(&self) -> Result<(), StoreError> {
        self.resume_triggers(&GroupMatcher::Any).await?;
        Ok(())
    }

    async fn get_paused_trigger_groups(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.lock().paused_trigger_groups.clone())
    }

    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>, StoreError> {
        let mut notices = Vec::new();
        let acquired = {
            let mut state = self.lock();
            let now = Utc::now();
            let mut acquired: Vec<Trigger> = Vec::new();
            let mut skipped: Vec<QueueKey> = Vec::new();
            let mut jobs_claimed: HashSet<JobKey> = HashSet::new();
            let mut batch_end: Option<DateTime<Utc>> = None;

            while acquired.len() < max_count {
                let Some(qk) = state.queue.iter().next().cloned() else {
                    break;
                };
                state.queue.remove(&qk);

                let Some(record) = state.triggers.get(&qk.key) else {
                    continue;
                };
                if record.state != TriggerState::Waiting
                    || record.trigger.next_fire_time.is_none()
                {
                    continue;
                }

                if Self::apply_misfire(&mut state, &qk.key, self.misfire_threshold, now, &mut notices)
                {
                    // the schedule moved; requeue under its new time
                    if let Some(record) = state.triggers.get(&qk.key) {
                        if record.state == TriggerState::Waiting
                            && record.trigger.next_fire_time.is_some()
                        {
                            state.enqueue(&qk.key);
                        }
                    }
                    continue;
                }

                let (next, job_key) = match state.triggers.get(&qk.key) {
                    Some(record) => match record.trigger.next_fire_time {
                        Some(next) => (next, record.trigger.job_key.clone()),
                        None => continue,
                    },
                    None => continue,
                };

                if next > no_later_than + time_window {
                    state.queue.insert(qk);
                    break;
                }
                if let Some(end) = batch_end {
                    if next > end {
                        state.queue.insert(qk);
                        break;
                    }
                }

                let disallow_concurrent = state
                    .jobs
                    .get(&job_key)
                    .map(|j| j.disallow_concurrent_execution)
                    .unwrap_or(false);
                if disallow_concurrent && jobs_claimed.contains(&job_key) {
                    skipped.push(qk);
                    continue;
                }
                if disallow_concurrent {
                    jobs_claimed.insert(job_key.clone());
                }

                let fire_instance_id = Uuid::new_v4().to_string();
                let trigger = match state.triggers.get_mut(&qk.key) {
                    Some(record) => {
                        record.state = TriggerState::Acquired;
                        record.trigger.fire_instance_id = Some(fire_instance_id.clone());
                        record.trigger.clone()
                    }
                    None => continue,
                };

                state.fired.insert(
                    fire_instance_id.clone(),
                    FiredTriggerRecord {
                        fire_instance_id,
                        trigger_key: trigger.key.clone(),
                        job_key: Some(trigger.job_key.clone()),
                        instance_id: "local".to_string(),
                        fired_time: now,
                        scheduled_time: next,
                        state: FiredState::Acquired,
                        disallow_concurrent_execution: disallow_concurrent,
                        requests_recovery: false,
                        priority: trigger.priority,
                    },
                );

                if batch_end.is_none() {
                    batch_end = Some(next.max(now) + time_window);
                }
                acquired.push(trigger);
            }

            for qk in skipped {
                state.queue.insert(qk);
            }
            acquired
        };
        self.emit(notices).await;
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(id) = &trigger.fire_instance_id {
            state.fired.remove(id);
        }
        if let Some(record) = state.triggers.get_mut(&trigger.key) {
            if record.state == TriggerState::Acquired {
                record.state = TriggerState::Waiting;
                record.trigger.fire_instance_id = None;
                state.enqueue(&trigger.key);
            }
        }
        Ok(())
    }

    async fn triggers_fired(
        &self,
        triggers: &[Trigger],
    ) -> Result<Vec<TriggerFiredResult>, StoreError> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut results = Vec::with_capacity(triggers.len());

        for trigger in triggers {
            let (calendar, job) = match state.triggers.get(&trigger.key) {
                Some(record) if record.state == TriggerState::Acquired => {
                    let calendar = state.calendar_for(&record.trigger);
                    if record.trigger.calendar_name.is_some() && calendar.is_none() {
                        results.push(TriggerFiredResult { bundle: None });
                        continue;
                    }
                    match state.jobs.get(&record.trigger.job_key).cloned() {
                        Some(job) => (calendar, job),
                        None => {
                            results.push(TriggerFiredResult { bundle: None });
                            continue;
                        }
                    }
                }
                _ => {
                    results.push(TriggerFiredResult { bundle: None });
                    continue;
                }
            };

            let (fired_trigger, prev_fire_time) = {
                let Some(record) = state.triggers.get_mut(&trigger.key) else {
                    results.push(TriggerFiredResult { bundle: None });
                    continue;
                };
                let prev_fire_time = record.trigger.previous_fire_time;
                record.trigger.triggered(calendar.as_ref());
                record.state = TriggerState::Waiting;
                (record.trigger.clone(), prev_fire_time)
            };
            let scheduled_fire_time = fired_trigger.previous_fire_time.unwrap_or(now);

            if let Some(id) = &fired_trigger.fire_instance_id {
                if let Some(fr) = state.fired.get_mut(id) {
                    fr.state = FiredState::Executing;
                    fr.fired_time = now;
                }
            }

            let mut job_now_blocked = false;
            if job.disallow_concurrent_execution {
                job_now_blocked = true;
                let job_key = job.key.clone();
                for tk in state.triggers_for_job(&job_key) {
                    if let Some(sibling) = state.triggers.get_mut(&tk) {
                        match sibling.state {
                            TriggerState::Waiting => sibling.state = TriggerState::Blocked,
                            TriggerState::Paused => sibling.state = TriggerState::PausedBlocked,
                            _ => {}
                        }
                    }
                    state.dequeue(&tk);
                }
                state.blocked_jobs.insert(job_key);
            } else if fired_trigger.next_fire_time.is_some() {
                state.enqueue(&trigger.key);
            }

            // an exhausted schedule completes the trigger even when blocked
            if fired_trigger.next_fire_time.is_none() {
                if let Some(record) = state.triggers.get_mut(&trigger.key) {
                    record.state = TriggerState::Complete;
                }
            }

            let next_fire_time = state
                .triggers
                .get(&trigger.key)
                .and_then(|r| r.trigger.next_fire_time);
            results.push(TriggerFiredResult {
                bundle: Some(TriggerFiredBundle {
                    job,
                    trigger: fired_trigger,
                    calendar,
                    job_is_recovering: false,
                    job_now_blocked,
                    fire_time: now,
                    scheduled_fire_time,
                    prev_fire_time,
                    next_fire_time,
                }),
            });
        }
        Ok(results)
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job_detail: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StoreError> {
        let mut notices = Vec::new();
        {
            let mut state = self.lock();

            if let Some(id) = &trigger.fire_instance_id {
                state.fired.remove(id);
            }

            // write back mutated job data when the job persists it
            if let Some(stored) = state.jobs.get_mut(&job_detail.key) {
                if stored.persist_data_after_execution {
                    let mut data = job_detail.data.clone();
                    data.clear_dirty_flag();
                    stored.data = data;
                }
            }

            // unblock the job's other triggers
            if job_detail.disallow_concurrent_execution {
                state.blocked_jobs.remove(&job_detail.key);
                let sibling_keys = state.triggers_for_job(&job_detail.key);
                for tk in sibling_keys {
                    let unblocked = {
                        let Some(sibling) = state.triggers.get_mut(&tk) else {
                            continue;
                        };
                        match sibling.state {
                            TriggerState::Blocked => {
                                sibling.state = TriggerState::Waiting;
                                true
                            }
                            TriggerState::PausedBlocked => {
                                sibling.state = TriggerState::Paused;
                                false
                            }
                            _ => false,
                        }
                    };
                    if unblocked {
                        state.enqueue(&tk);
                    }
                }
                notices.push(Notice::SchedulingChanged(None));
            }

            match instruction {
                CompletedExecutionInstruction::DeleteTrigger => {
                    let stored_next = state
                        .triggers
                        .get(&trigger.key)
                        .and_then(|r| r.trigger.next_fire_time);
                    // if the stored copy has a next fire time but the
                    // executing copy does not, a misfire rescheduled it
                    // while we were running; leave it alone
                    if trigger.next_fire_time.is_none() && stored_next.is_some() {
                        // keep
                    } else {
                        if let Some(record) = state.triggers.get(&trigger.key) {
                            notices.push(Notice::Finalized(record.trigger.clone()));
                        }
                        Self::remove_trigger_internal(&mut state, &trigger.key, true);
                    }
                }
                CompletedExecutionInstruction::SetTriggerComplete => {
                    if let Some(record) = state.triggers.get_mut(&trigger.key) {
                        record.state = TriggerState::Complete;
                        notices.push(Notice::Finalized(record.trigger.clone()));
                    }
                    state.dequeue(&trigger.key);
                    notices.push(Notice::SchedulingChanged(None));
                }
                CompletedExecutionInstruction::SetTriggerError => {
                    if let Some(record) = state.triggers.get_mut(&trigger.key) {
                        record.state = TriggerState::Error;
                    }
                    state.dequeue(&trigger.key);
                    notices.push(Notice::SchedulingChanged(None));
                }
                CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                    for tk in state.triggers_for_job(&job_detail.key) {
                        if let Some(record) = state.triggers.get_mut(&tk) {
                            record.state = TriggerState::Complete;
                            notices.push(Notice::Finalized(record.trigger.clone()));
                        }
                        state.dequeue(&tk);
                    }
                    notices.push(Notice::SchedulingChanged(None));
                }
                CompletedExecutionInstruction::SetAllJobTriggersError => {
                    for tk in state.triggers_for_job(&job_detail.key) {
                        if let Some(record) = state.triggers.get_mut(&tk) {
                            record.state = TriggerState::Error;
                        }
                        state.dequeue(&tk);
                    }
                    notices.push(Notice::SchedulingChanged(None));
                }
                CompletedExecutionInstruction::Noop
                | CompletedExecutionInstruction::ReExecuteJob => {}
            }
        }
        self.emit(notices).await;
        Ok(())
    }
}
