// Job store contract: the persistence boundary between the scheduling loop
// and trigger/job state. Two implementations share it, the in-process
// memory store and the clustered SQL store.

pub mod delegate;
pub mod lock;
pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::calendar::ExclusionCalendar;
use crate::errors::StoreError;
use crate::models::{
    CompletedExecutionInstruction, GroupMatcher, JobDetail, JobKey, TriggerKey, TriggerStateView,
};
use crate::schedule::Trigger;

/// Data-map keys carried by synthesized recovery triggers, letting the
/// recovered job see the original firing's identity and times.
pub const RECOVERY_ORIG_TRIGGER_NAME: &str = "recovery_orig_trigger_name";
pub const RECOVERY_ORIG_TRIGGER_GROUP: &str = "recovery_orig_trigger_group";
pub const RECOVERY_ORIG_FIRE_TIME_MS: &str = "recovery_orig_fire_time_ms";
pub const RECOVERY_ORIG_SCHEDULED_FIRE_TIME_MS: &str = "recovery_orig_scheduled_fire_time_ms";

/// Everything the worker needs to run one fire of a trigger.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job: JobDetail,
    pub trigger: Trigger,
    pub calendar: Option<ExclusionCalendar>,
    pub job_is_recovering: bool,
    /// True when this fire moved the job's other triggers into the blocked
    /// state (concurrent execution disallowed).
    pub job_now_blocked: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub prev_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// Outcome of firing one acquired trigger. A missing bundle means the
/// trigger became unfireable between acquire and fire (vanished, paused,
/// claimed by a peer) and the slot is skipped silently.
#[derive(Debug)]
pub struct TriggerFiredResult {
    pub bundle: Option<TriggerFiredBundle>,
}

/// Backchannel from the store into the running scheduler: state mutations
/// that create earlier fire times wake the loop, and misfires/finalized
/// triggers reach the listener fan-out.
#[async_trait]
pub trait SchedulerSignaler: Send + Sync {
    /// A mutation produced a trigger that may fire earlier than anything
    /// the loop is currently waiting on.
    fn signal_scheduling_change(&self, candidate_next_fire_time: Option<DateTime<Utc>>);

    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger);

    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger);

    async fn notify_scheduler_listeners_error(&self, message: &str);
}

/// A signaler that drops everything, for tests and store bring-up before
/// the scheduler attaches.
pub struct NullSignaler;

#[async_trait]
impl SchedulerSignaler for NullSignaler {
    fn signal_scheduling_change(&self, _candidate_next_fire_time: Option<DateTime<Utc>>) {}
    async fn notify_trigger_listeners_misfired(&self, _trigger: &Trigger) {}
    async fn notify_scheduler_listeners_finalized(&self, _trigger: &Trigger) {}
    async fn notify_scheduler_listeners_error(&self, _message: &str) {}
}

/// Persistence contract for jobs, triggers, calendars and the
/// acquire→fire→complete pipeline.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Bind the signaler and perform startup work (schema checks, recovery
    /// of orphaned state). Called once before the scheduler starts.
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> Result<(), StoreError>;

    async fn shutdown(&self) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Job and trigger CRUD
    // ------------------------------------------------------------------

    async fn store_job(&self, job: JobDetail, replace: bool) -> Result<(), StoreError>;

    /// Store a trigger. Computes the first fire time when unset; a trigger
    /// that will never fire is rejected.
    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<(), StoreError>;

    async fn store_job_and_trigger(
        &self,
        job: JobDetail,
        trigger: Trigger,
    ) -> Result<(), StoreError> {
        self.store_job(job, false).await?;
        self.store_trigger(trigger, false).await
    }

    /// Remove a job and all of its triggers. False when absent.
    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError>;

    /// Remove a trigger. A non-durable job losing its last trigger is
    /// removed along with it. False when absent.
    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError>;

    /// Swap a trigger for a new one bound to the same job, keeping the key's
    /// identity. False when the old trigger is absent.
    async fn replace_trigger(
        &self,
        key: &TriggerKey,
        new_trigger: Trigger,
    ) -> Result<bool, StoreError>;

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError>;

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError>;

    async fn check_job_exists(&self, key: &JobKey) -> Result<bool, StoreError>;

    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool, StoreError>;

    async fn clear_all_scheduling_data(&self) -> Result<(), StoreError>;

    async fn get_job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>, StoreError>;

    async fn get_trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>, StoreError>;

    async fn get_job_group_names(&self) -> Result<Vec<String>, StoreError>;

    async fn get_trigger_group_names(&self) -> Result<Vec<String>, StoreError>;

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, StoreError>;

    // ------------------------------------------------------------------
    // Calendars
    // ------------------------------------------------------------------

    /// Store a calendar. With `update_triggers`, fire times of triggers
    /// referencing it are recomputed against the new exclusions.
    async fn store_calendar(
        &self,
        name: &str,
        calendar: ExclusionCalendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<(), StoreError>;

    /// Remove a calendar; fails while triggers still reference it.
    async fn remove_calendar(&self, name: &str) -> Result<bool, StoreError>;

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<ExclusionCalendar>, StoreError>;

    async fn get_calendar_names(&self) -> Result<Vec<String>, StoreError>;

    // ------------------------------------------------------------------
    // Pause / resume
    // ------------------------------------------------------------------

    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<TriggerStateView, StoreError>;

    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<(), StoreError>;

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError>;

    /// Pause all triggers in matching groups. Groups matched by equality are
    /// remembered: triggers later stored into them start paused. Returns the
    /// affected group names.
    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError>;

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StoreError>;

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError>;

    async fn pause_job(&self, key: &JobKey) -> Result<(), StoreError>;

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError>;

    async fn resume_job(&self, key: &JobKey) -> Result<(), StoreError>;

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError>;

    async fn pause_all(&self) -> Result<(), StoreError>;

    async fn resume_all(&self) -> Result<(), StoreError>;

    async fn get_paused_trigger_groups(&self) -> Result<HashSet<String>, StoreError>;

    // ------------------------------------------------------------------
    // Acquire → fire → complete
    // ------------------------------------------------------------------

    /// Claim up to `max_count` triggers due no later than
    /// `no_later_than + time_window`, ordered by
    /// (next_fire_time, priority desc, key). Claimed triggers move
    /// WAITING → ACQUIRED; misfired ones are remediated on the way.
    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>, StoreError>;

    /// Hand back a claim that will not be fired (shutdown, obsoleted batch).
    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<(), StoreError>;

    /// Move claims into execution: advance each trigger's schedule, apply
    /// blocking for concurrent-disallowed jobs, and produce fire bundles.
    async fn triggers_fired(
        &self,
        triggers: &[Trigger],
    ) -> Result<Vec<TriggerFiredResult>, StoreError>;

    /// Finalize one fire with the instruction derived from the trigger,
    /// persisting job data when the job asks for it and unblocking the job
    /// if this was its last running execution.
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job_detail: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StoreError>;

    /// Whether this store coordinates with cluster peers.
    fn is_clustered(&self) -> bool {
        false
    }
}
