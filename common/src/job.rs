// Job runner abstraction: the trait a unit of work implements, the registry
// binding job type names to runner factories, and the execution context
// handed to a running job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::{JobExecutionError, SchedulerError};
use crate::models::{JobCapabilities, JobDataMap, JobDetail};
use crate::schedule::Trigger;

/// A unit of work. Implementations are constructed fresh for every fire by
/// the registered factory.
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError>;

    /// Best-effort cancellation hook. The default does nothing; the
    /// scheduler never preempts a running job.
    async fn interrupt(&self) {}
}

pub type JobFactory = Arc<dyn Fn() -> Arc<dyn Job> + Send + Sync>;

struct Registration {
    factory: JobFactory,
    capabilities: JobCapabilities,
}

/// Maps job type names to runner factories and their declared capabilities.
/// Stores resolve `JobDetail` flags against this at submission time.
#[derive(Default)]
pub struct JobRegistry {
    entries: RwLock<HashMap<String, Registration>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, job_type: impl Into<String>, capabilities: JobCapabilities, factory: F)
    where
        F: Fn() -> Arc<dyn Job> + Send + Sync + 'static,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            job_type.into(),
            Registration {
                factory: Arc::new(factory),
                capabilities,
            },
        );
    }

    pub fn capabilities(&self, job_type: &str) -> Option<JobCapabilities> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(job_type).map(|r| r.capabilities)
    }

    pub fn instantiate(&self, job_type: &str) -> Result<Arc<dyn Job>, SchedulerError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(job_type)
            .map(|r| (r.factory)())
            .ok_or_else(|| SchedulerError::UnknownJobType(job_type.to_string()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(job_type)
    }
}

/// Everything a job sees while executing. `data` starts as the job's map
/// overlaid with the trigger's; mutations are written back to the job detail
/// after execution when the job persists its data.
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    pub job_detail: JobDetail,
    pub trigger: Trigger,
    pub data: JobDataMap,
    pub fire_instance_id: String,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub refire_count: u32,
    pub recovering: bool,
}

impl JobExecutionContext {
    pub fn new(
        job_detail: JobDetail,
        trigger: Trigger,
        fire_instance_id: String,
        fire_time: DateTime<Utc>,
        scheduled_fire_time: DateTime<Utc>,
        recovering: bool,
    ) -> Self {
        let data = job_detail.data.merged_with(&trigger.data);
        let previous_fire_time = trigger.previous_fire_time;
        let next_fire_time = trigger.next_fire_time;
        Self {
            job_detail,
            trigger,
            data,
            fire_instance_id,
            fire_time,
            scheduled_fire_time,
            previous_fire_time,
            next_fire_time,
            refire_count: 0,
            recovering,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Key;
    use crate::schedule::{TriggerSchedule, REPEAT_INDEFINITELY};

    struct NoopJob;

    #[async_trait]
    impl Job for NoopJob {
        async fn execute(&self, _ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup_and_capabilities() {
        let registry = JobRegistry::new();
        registry.register(
            "noop",
            JobCapabilities {
                disallow_concurrent_execution: true,
                persist_data_after_execution: false,
            },
            || Arc::new(NoopJob),
        );

        assert!(registry.contains("noop"));
        assert!(registry.instantiate("noop").is_ok());
        assert!(registry
            .capabilities("noop")
            .unwrap()
            .disallow_concurrent_execution);

        assert!(matches!(
            registry.instantiate("missing"),
            Err(SchedulerError::UnknownJobType(_))
        ));
    }

    #[test]
    fn test_context_merges_trigger_data_over_job_data() {
        let job = JobDetail::new(Key::of("j"), "noop")
            .with_data([("shared", "job"), ("job_only", "j")].into_iter().collect());
        let trigger = Trigger::new(
            Key::of("t"),
            Key::of("j"),
            TriggerSchedule::Simple {
                repeat_interval_ms: 1000,
                repeat_count: REPEAT_INDEFINITELY,
                times_triggered: 0,
            },
        )
        .with_data([("shared", "trigger")].into_iter().collect());

        let now = Utc::now();
        let ctx = JobExecutionContext::new(job, trigger, "f1".to_string(), now, now, false);
        assert_eq!(ctx.data.get_string("shared"), Some("trigger"));
        assert_eq!(ctx.data.get_string("job_only"), Some("j"));
        assert!(!ctx.recovering);
    }
}
