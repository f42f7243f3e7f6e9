// Worker pool: a bounded set of runners consuming fire bundles from the
// scheduling loop. Each bundle runs the listener-veto / execute / complete
// shell and reports back to the store exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::JobExecutionError;
use crate::job::{Job, JobExecutionContext, JobRegistry};
use crate::listeners::ListenerManager;
use crate::models::{CompletedExecutionInstruction, JobKey};
use crate::retry::DbRetryPolicy;
use crate::store::{JobStore, TriggerFiredBundle};

struct WorkItem {
    bundle: TriggerFiredBundle,
    _permit: OwnedSemaphorePermit,
}

struct PoolShared {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    listeners: Arc<ListenerManager>,
    retry: DbRetryPolicy,
    running: Mutex<HashMap<JobKey, Vec<Arc<dyn Job>>>>,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    semaphore: Arc<Semaphore>,
    tx: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkerPool {
    pub fn new(
        worker_count: usize,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        listeners: Arc<ListenerManager>,
        retry: DbRetryPolicy,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            store,
            registry,
            listeners,
            retry,
            running: Mutex::new(HashMap::new()),
        });
        let semaphore = Arc::new(Semaphore::new(worker_count));
        let (tx, rx) = mpsc::unbounded_channel::<WorkItem>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let shared = Arc::clone(&shared);
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    match item {
                        Some(item) => run_shell(&shared, item).await,
                        None => break,
                    }
                }
                debug!(worker_id, "Worker stopped");
            }));
        }

        info!(worker_count, "Worker pool started");
        Self {
            shared,
            semaphore,
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn available_workers(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Block until at least one worker slot is free.
    pub async fn wait_for_available_worker(&self) {
        if self.semaphore.available_permits() == 0 {
            if let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await {
                drop(permit);
            }
        }
    }

    /// Hand one fire bundle to the pool, waiting for a free worker slot.
    pub async fn dispatch(&self, bundle: TriggerFiredBundle) -> Result<(), JobExecutionError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| JobExecutionError::new("worker pool is shut down"))?;
        let tx = {
            let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        match tx {
            Some(tx) => tx
                .send(WorkItem {
                    bundle,
                    _permit: permit,
                })
                .map_err(|_| JobExecutionError::new("worker pool is shut down")),
            None => Err(JobExecutionError::new("worker pool is shut down")),
        }
    }

    /// Best-effort interruption of every running execution of a job.
    pub async fn interrupt(&self, job_key: &JobKey) -> bool {
        let jobs: Vec<Arc<dyn Job>> = {
            let running = self.shared.running.lock().unwrap_or_else(|e| e.into_inner());
            running.get(job_key).cloned().unwrap_or_default()
        };
        let interrupted = !jobs.is_empty();
        for job in jobs {
            job.interrupt().await;
        }
        interrupted
    }

    /// Stop accepting work. With `wait_for_jobs_to_complete`, in-flight
    /// executions finish before this returns; otherwise they continue in
    /// the background.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, wait_for_jobs_to_complete: bool) {
        {
            let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take();
        }
        if wait_for_jobs_to_complete {
            let handles: Vec<JoinHandle<()>> = {
                let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
                guard.drain(..).collect()
            };
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Worker task ended abnormally during shutdown");
                }
            }
        }
        info!(waited = wait_for_jobs_to_complete, "Worker pool shut down");
    }
}

/// One fire, start to finish: veto, listener fan-out, execution, completion
/// instruction and the store callback. Re-executes in place when the
/// instruction asks for it.
async fn run_shell(shared: &PoolShared, item: WorkItem) {
    let bundle = item.bundle;
    let trigger = bundle.trigger.clone();
    let job_detail = bundle.job.clone();

    let fire_instance_id = trigger
        .fire_instance_id
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let mut ctx = JobExecutionContext::new(
        job_detail.clone(),
        trigger.clone(),
        fire_instance_id,
        bundle.fire_time,
        bundle.scheduled_fire_time,
        bundle.job_is_recovering,
    );

    let job = match shared.registry.instantiate(&job_detail.job_type) {
        Ok(job) => job,
        Err(e) => {
            let message = format!(
                "Cannot instantiate job '{}' of type '{}': {}",
                job_detail.key, job_detail.job_type, e
            );
            shared.listeners.notify_scheduler_error(&message).await;
            complete_with_retry(
                shared,
                &trigger,
                &job_detail,
                CompletedExecutionInstruction::SetAllJobTriggersError,
            )
            .await;
            return;
        }
    };

    // vetoed executions skip the job but still settle with the store; the
    // vetoed fire surfaces on the misfire channel
    if shared
        .listeners
        .notify_veto_job_execution(&trigger, &ctx)
        .await
    {
        debug!(trigger = %trigger.key, "Job execution vetoed");
        metrics::counter!("scheduler_jobs_vetoed_total").increment(1);
        shared.listeners.notify_trigger_misfired(&trigger).await;
        shared.listeners.notify_job_execution_vetoed(&ctx).await;
        if trigger.next_fire_time.is_none() {
            shared.listeners.notify_trigger_finalized(&trigger).await;
        }
        complete_with_retry(
            shared,
            &trigger,
            &job_detail,
            CompletedExecutionInstruction::Noop,
        )
        .await;
        return;
    }

    shared.listeners.notify_trigger_fired(&trigger, &ctx).await;

    loop {
        shared.listeners.notify_job_to_be_executed(&ctx).await;

        {
            let mut running = shared.running.lock().unwrap_or_else(|e| e.into_inner());
            running
                .entry(job_detail.key.clone())
                .or_default()
                .push(Arc::clone(&job));
        }
        metrics::gauge!("scheduler_executing_jobs").increment(1.0);
        let started = Instant::now();

        let result = job.execute(&mut ctx).await;

        metrics::gauge!("scheduler_executing_jobs").decrement(1.0);
        metrics::histogram!("scheduler_job_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::counter!("scheduler_jobs_executed_total").increment(1);
        {
            let mut running = shared.running.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(jobs) = running.get_mut(&job_detail.key) {
                if let Some(pos) = jobs.iter().position(|j| Arc::ptr_eq(j, &job)) {
                    jobs.remove(pos);
                }
                if jobs.is_empty() {
                    running.remove(&job_detail.key);
                }
            }
        }

        let error = match &result {
            Ok(()) => None,
            Err(e) => {
                metrics::counter!("scheduler_jobs_failed_total").increment(1);
                error!(
                    job = %job_detail.key,
                    trigger = %trigger.key,
                    error = %e,
                    "Job execution failed"
                );
                Some(e)
            }
        };

        let instruction = trigger.execution_complete(error);
        shared.listeners.notify_job_was_executed(&ctx, error).await;
        shared
            .listeners
            .notify_trigger_complete(&trigger, &ctx, instruction)
            .await;

        if instruction == CompletedExecutionInstruction::ReExecuteJob {
            ctx.refire_count += 1;
            debug!(
                job = %job_detail.key,
                refire_count = ctx.refire_count,
                "Re-executing job immediately"
            );
            continue;
        }

        if instruction == CompletedExecutionInstruction::DeleteTrigger {
            shared.listeners.notify_trigger_finalized(&trigger).await;
        }

        // persist any job-data mutations through the completion callback
        let mut completed_detail = job_detail.clone();
        if completed_detail.persist_data_after_execution {
            completed_detail.data = ctx.data.clone();
        }
        complete_with_retry(shared, &trigger, &completed_detail, instruction).await;
        return;
    }
}

/// The completion callback must land exactly once; transient store failures
/// back off and retry rather than dropping the claim.
async fn complete_with_retry(
    shared: &PoolShared,
    trigger: &crate::schedule::Trigger,
    job_detail: &crate::models::JobDetail,
    instruction: CompletedExecutionInstruction,
) {
    loop {
        match shared
            .store
            .triggered_job_complete(trigger, job_detail, instruction)
            .await
        {
            Ok(()) => return,
            Err(e) if e.is_transient() => {
                metrics::counter!("scheduler_store_retries_total").increment(1);
                let delay = shared.retry.next_delay();
                warn!(
                    trigger = %trigger.key,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Completion callback failed transiently, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                shared
                    .listeners
                    .notify_scheduler_error(&format!(
                        "Completion callback for trigger '{}' failed: {}",
                        trigger.key, e
                    ))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::JobExecutionError;
    use crate::models::{JobCapabilities, JobDetail, Key};
    use crate::schedule::{Trigger, TriggerSchedule, REPEAT_INDEFINITELY};
    use crate::store::memory::MemoryJobStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingJob {
        executions: Arc<AtomicUsize>,
        fail_first: bool,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            let n = self.executions.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 && ctx.refire_count == 0 {
                return Err(JobExecutionError::new("first attempt fails")
                    .with_refire_immediately());
            }
            Ok(())
        }
    }

    async fn pool_with_job(
        executions: Arc<AtomicUsize>,
        fail_first: bool,
    ) -> (WorkerPool, Arc<MemoryJobStore>, Arc<JobRegistry>) {
        let store = Arc::new(MemoryJobStore::default());
        let registry = Arc::new(JobRegistry::new());
        registry.register("counting", JobCapabilities::default(), move || {
            Arc::new(CountingJob {
                executions: Arc::clone(&executions),
                fail_first,
            })
        });
        let listeners = Arc::new(ListenerManager::new());
        let pool = WorkerPool::new(
            2,
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::clone(&registry),
            listeners,
            DbRetryPolicy::new(Duration::from_millis(10)),
        );
        (pool, store, registry)
    }

    async fn fired_bundle(store: &MemoryJobStore) -> TriggerFiredBundle {
        store
            .store_job(
                JobDetail::new(Key::of("j"), "counting").durable(true),
                false,
            )
            .await
            .unwrap();
        store
            .store_trigger(
                Trigger::new(
                    Key::of("t"),
                    Key::of("j"),
                    TriggerSchedule::Simple {
                        repeat_interval_ms: 60_000,
                        repeat_count: REPEAT_INDEFINITELY,
                        times_triggered: 0,
                    },
                )
                .with_start_time(Utc::now() - ChronoDuration::seconds(1)),
                false,
            )
            .await
            .unwrap();
        let acquired = store
            .acquire_next_triggers(
                Utc::now() + ChronoDuration::seconds(30),
                1,
                ChronoDuration::zero(),
            )
            .await
            .unwrap();
        store
            .triggers_fired(&acquired)
            .await
            .unwrap()
            .remove(0)
            .bundle
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_executes_job() {
        let executions = Arc::new(AtomicUsize::new(0));
        let (pool, store, _registry) = pool_with_job(Arc::clone(&executions), false).await;
        let bundle = fired_bundle(&store).await;

        pool.dispatch(bundle).await.unwrap();
        pool.shutdown(true).await;
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refire_immediately_runs_job_again() {
        let executions = Arc::new(AtomicUsize::new(0));
        let (pool, store, _registry) = pool_with_job(Arc::clone(&executions), true).await;
        let bundle = fired_bundle(&store).await;

        pool.dispatch(bundle).await.unwrap();
        pool.shutdown(true).await;
        // failed once with refire-immediately, then succeeded
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let executions = Arc::new(AtomicUsize::new(0));
        let (pool, store, _registry) = pool_with_job(executions, false).await;
        let bundle = fired_bundle(&store).await;

        pool.shutdown(true).await;
        assert!(pool.dispatch(bundle).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_availability_tracking() {
        let executions = Arc::new(AtomicUsize::new(0));
        let (pool, _store, _registry) = pool_with_job(executions, false).await;
        assert_eq!(pool.available_workers(), 2);
        pool.wait_for_available_worker().await;
        pool.shutdown(false).await;
    }
}
