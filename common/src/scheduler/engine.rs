// Scheduling loop: repeatedly claims due triggers from the store, waits out
// the gap to their fire times (interruptible by scheduling-change signals),
// fires them and hands the bundles to the worker pool.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::listeners::ListenerManager;
use crate::models::JobKey;
use crate::retry::DbRetryPolicy;
use crate::schedule::Trigger;
use crate::store::{JobStore, SchedulerSignaler};
use crate::worker::WorkerPool;

/// Fires closer than this to now are taken immediately rather than slept on.
const IMMEDIATE_FIRE_MARGIN_MS: i64 = 2;

/// A signaled earlier candidate only abandons the current batch when the
/// batch's fire time is still at least this far away.
const BATCH_ABANDON_MARGIN_MS: i64 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Created,
    Standby,
    Started,
    ShuttingDown,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Acquire look-ahead and the longest the loop sleeps with nothing due.
    pub idle_wait: Duration,
    pub batch_max_count: usize,
    pub batch_time_window: Duration,
    pub db_retry_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_secs(30),
            batch_max_count: 1,
            batch_time_window: Duration::ZERO,
            db_retry_interval: Duration::from_secs(15),
        }
    }
}

/// Wakes the loop when a store mutation may have produced an earlier fire
/// time than whatever it is sleeping towards.
pub struct SchedulingSignal {
    notify: Notify,
    candidate: Mutex<Option<DateTime<Utc>>>,
}

impl SchedulingSignal {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            candidate: Mutex::new(None),
        }
    }

    pub fn signal(&self, candidate: Option<DateTime<Utc>>) {
        if let Some(c) = candidate {
            let mut guard = self.candidate.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(guard.map_or(c, |existing| existing.min(c)));
        }
        self.notify.notify_one();
    }

    fn take_candidate(&self) -> Option<DateTime<Utc>> {
        self.candidate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// The store-facing signaler: scheduling changes reach the loop, listener
/// notifications reach the fan-out.
struct EngineSignaler {
    signal: Arc<SchedulingSignal>,
    listeners: Arc<ListenerManager>,
}

#[async_trait]
impl SchedulerSignaler for EngineSignaler {
    fn signal_scheduling_change(&self, candidate_next_fire_time: Option<DateTime<Utc>>) {
        self.signal.signal(candidate_next_fire_time);
    }

    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
        self.listeners.notify_trigger_misfired(trigger).await;
    }

    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
        self.listeners.notify_trigger_finalized(trigger).await;
    }

    async fn notify_scheduler_listeners_error(&self, message: &str) {
        self.listeners.notify_scheduler_error(message).await;
    }
}

pub struct SchedulerEngine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    listeners: Arc<ListenerManager>,
    signal: Arc<SchedulingSignal>,
    retry: DbRetryPolicy,
    state_tx: watch::Sender<SchedulerState>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        pool: Arc<WorkerPool>,
        listeners: Arc<ListenerManager>,
    ) -> Arc<Self> {
        let retry = DbRetryPolicy::new(config.db_retry_interval);
        let (state_tx, _) = watch::channel(SchedulerState::Created);
        Arc::new(Self {
            config,
            store,
            pool,
            listeners,
            signal: Arc::new(SchedulingSignal::new()),
            retry,
            state_tx,
            loop_handle: Mutex::new(None),
        })
    }

    /// The signaler to hand to `JobStore::initialize`.
    pub fn signaler(&self) -> Arc<dyn SchedulerSignaler> {
        Arc::new(EngineSignaler {
            signal: Arc::clone(&self.signal),
            listeners: Arc::clone(&self.listeners),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    pub fn listeners(&self) -> Arc<ListenerManager> {
        Arc::clone(&self.listeners)
    }

    /// Move into STARTED and (on first start) launch the loop task.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) {
        let previous = self.state();
        if matches!(
            previous,
            SchedulerState::ShuttingDown | SchedulerState::Shutdown
        ) {
            warn!("Cannot start a scheduler that has been shut down");
            return;
        }
        let _ = self.state_tx.send(SchedulerState::Started);
        self.signal.signal(None);

        let mut handle = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_none() {
            let engine = Arc::clone(self);
            *handle = Some(tokio::spawn(async move { engine.run().await }));
        }
        drop(handle);

        self.listeners.notify_scheduler_started().await;
        info!("Scheduler started");
    }

    /// Stop firing without shutting down; `start` resumes.
    pub fn standby(&self) {
        let _ = self.state_tx.send(SchedulerState::Standby);
        self.signal.signal(None);
        info!("Scheduler in standby");
    }

    /// Stop the loop and the pool, then close the store. With `wait`,
    /// in-flight jobs finish first.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, wait_for_jobs_to_complete: bool) {
        let _ = self.state_tx.send(SchedulerState::ShuttingDown);
        self.signal.signal(None);

        let handle = {
            let mut guard = self.loop_handle.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduling loop ended abnormally");
            }
        }

        self.pool.shutdown(wait_for_jobs_to_complete).await;
        if let Err(e) = self.store.shutdown().await {
            warn!(error = %e, "Store shutdown reported an error");
        }

        let _ = self.state_tx.send(SchedulerState::Shutdown);
        self.listeners.notify_scheduler_shutdown().await;
        info!("Scheduler shut down");
    }

    /// Best-effort interruption of a running job.
    pub async fn interrupt(&self, job_key: &JobKey) -> bool {
        self.pool.interrupt(job_key).await
    }

    async fn run(self: Arc<Self>) {
        let mut state_rx = self.state_tx.subscribe();
        debug!("Scheduling loop running");

        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                SchedulerState::Started => {}
                SchedulerState::Created | SchedulerState::Standby => {
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                SchedulerState::ShuttingDown | SchedulerState::Shutdown => break,
            }

            tokio::select! {
                _ = self.pool.wait_for_available_worker() => {}
                _ = state_rx.changed() => continue,
            }
            if self.state() != SchedulerState::Started {
                continue;
            }

            let batch_size = self
                .pool
                .available_workers()
                .max(1)
                .min(self.config.batch_max_count);
            let now = Utc::now();
            let no_later_than = now + chrono_from_std(self.config.idle_wait);
            let window = chrono_from_std(self.config.batch_time_window);

            let triggers = match self
                .store
                .acquire_next_triggers(no_later_than, batch_size, window)
                .await
            {
                Ok(triggers) => triggers,
                Err(e) if e.is_transient() => {
                    metrics::counter!("scheduler_store_retries_total").increment(1);
                    let delay = self.retry.next_delay();
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Acquire failed transiently, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Acquire failed");
                    self.listeners
                        .notify_scheduler_error(&format!("Trigger acquisition failed: {}", e))
                        .await;
                    self.idle_sleep().await;
                    continue;
                }
            };

            if triggers.is_empty() {
                self.idle_sleep().await;
                continue;
            }

            debug!(batch = triggers.len(), "Acquired trigger batch");
            if self.wait_for_fire_time(&triggers).await {
                // batch abandoned; slots returned, loop re-acquires
                continue;
            }
            if self.state() != SchedulerState::Started {
                self.release_batch(&triggers).await;
                continue;
            }

            let results = match self.store.triggers_fired(&triggers).await {
                Ok(results) => results,
                Err(e) => {
                    if e.is_transient() {
                        metrics::counter!("scheduler_store_retries_total").increment(1);
                        warn!(error = %e, "Fire failed transiently, releasing batch");
                    } else {
                        self.listeners
                            .notify_scheduler_error(&format!("Trigger fire failed: {}", e))
                            .await;
                    }
                    self.release_batch(&triggers).await;
                    tokio::time::sleep(self.retry.next_delay()).await;
                    continue;
                }
            };

            for result in results {
                // a missing bundle means the trigger became unfireable
                // between acquire and fire; skip it silently
                let Some(bundle) = result.bundle else {
                    continue;
                };
                if let Err(e) = self.pool.dispatch(bundle).await {
                    error!(error = %e, "Dispatch to worker pool failed");
                }
            }
        }
        debug!("Scheduling loop exited");
    }

    /// Sleep until the batch's first fire time, waking early for signals.
    /// Returns true when the batch was released in favor of re-acquiring.
    async fn wait_for_fire_time(&self, triggers: &[Trigger]) -> bool {
        let Some(first_fire) = triggers.iter().filter_map(|t| t.next_fire_time).min() else {
            return false;
        };

        loop {
            let now = Utc::now();
            let until_fire = first_fire - now;
            if until_fire.num_milliseconds() <= IMMEDIATE_FIRE_MARGIN_MS {
                return false;
            }
            let sleep_for = until_fire
                .to_std()
                .unwrap_or_else(|_| Duration::from_millis(0));

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => return false,
                _ = self.signal.wait() => {
                    if self.state() != SchedulerState::Started {
                        self.release_batch(triggers).await;
                        return true;
                    }
                    if let Some(candidate) = self.signal.take_candidate() {
                        let remaining = first_fire - Utc::now();
                        if candidate < first_fire
                            && remaining.num_milliseconds() > BATCH_ABANDON_MARGIN_MS
                        {
                            debug!(
                                candidate = %candidate,
                                batch_fire = %first_fire,
                                "Earlier trigger appeared, abandoning batch"
                            );
                            self.release_batch(triggers).await;
                            return true;
                        }
                    }
                }
            }
        }
    }

    async fn release_batch(&self, triggers: &[Trigger]) {
        for trigger in triggers {
            if let Err(e) = self.store.release_acquired_trigger(trigger).await {
                warn!(trigger = %trigger.key, error = %e, "Failed to release acquired trigger");
            }
        }
    }

    /// Idle wait, ±3% jitter so cluster peers drift out of lockstep, cut
    /// short by any scheduling-change signal.
    async fn idle_sleep(&self) {
        let base = self.config.idle_wait.as_millis() as f64;
        let jitter = rand::thread_rng().gen_range(-0.03..=0.03);
        let sleep_for = Duration::from_millis((base * (1.0 + jitter)) as u64);
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = self.signal.wait() => {
                self.signal.take_candidate();
            }
        }
    }
}

fn chrono_from_std(d: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::JobExecutionError;
    use crate::job::{Job, JobExecutionContext, JobRegistry};
    use crate::models::{JobCapabilities, JobDetail, Key};
    use crate::schedule::TriggerSchedule;
    use crate::store::memory::MemoryJobStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        executions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn execute(&self, _ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn engine_fixture(
        executions: Arc<AtomicUsize>,
    ) -> (Arc<SchedulerEngine>, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new(ChronoDuration::milliseconds(5_000)));
        let registry = Arc::new(JobRegistry::new());
        registry.register("counting", JobCapabilities::default(), move || {
            Arc::new(CountingJob {
                executions: Arc::clone(&executions),
            })
        });
        let listeners = Arc::new(ListenerManager::new());
        let pool = Arc::new(WorkerPool::new(
            2,
            Arc::clone(&store) as Arc<dyn JobStore>,
            registry,
            Arc::clone(&listeners),
            DbRetryPolicy::new(Duration::from_millis(50)),
        ));
        let engine = SchedulerEngine::new(
            EngineConfig {
                idle_wait: Duration::from_millis(200),
                batch_max_count: 2,
                batch_time_window: Duration::ZERO,
                db_retry_interval: Duration::from_millis(50),
            },
            Arc::clone(&store) as Arc<dyn JobStore>,
            pool,
            listeners,
        );
        store.initialize(engine.signaler()).await.unwrap();
        (engine, store)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_engine_fires_due_trigger() {
        let executions = Arc::new(AtomicUsize::new(0));
        let (engine, store) = engine_fixture(Arc::clone(&executions)).await;

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
                        repeat_interval_ms: 0,
                        repeat_count: 0,
                        times_triggered: 0,
                    },
                )
                .with_start_time(Utc::now() + ChronoDuration::milliseconds(50)),
                false,
            )
            .await
            .unwrap();

        engine.start().await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        engine.shutdown(true).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        // one-shot trigger deleted after its only fire
        assert!(!store.check_trigger_exists(&Key::of("t")).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_engine_fires_repeating_trigger_multiple_times() {
        let executions = Arc::new(AtomicUsize::new(0));
        let (engine, store) = engine_fixture(Arc::clone(&executions)).await;

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
                        repeat_interval_ms: 100,
                        repeat_count: 2,
                        times_triggered: 0,
                    },
                )
                .with_start_time(Utc::now()),
                false,
            )
            .await
            .unwrap();

        engine.start().await;
        tokio::time::sleep(Duration::from_millis(900)).await;
        engine.shutdown(true).await;

        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_standby_stops_firing() {
        let executions = Arc::new(AtomicUsize::new(0));
        let (engine, store) = engine_fixture(Arc::clone(&executions)).await;

        store
            .store_job(
                JobDetail::new(Key::of("j"), "counting").durable(true),
                false,
            )
            .await
            .unwrap();

        engine.start().await;
        engine.standby();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // scheduled while in standby: must not fire
        store
            .store_trigger(
                Trigger::new(
                    Key::of("t"),
                    Key::of("j"),
                    TriggerSchedule::Simple {
                        repeat_interval_ms: 0,
                        repeat_count: 0,
                        times_triggered: 0,
                    },
                )
                .with_start_time(Utc::now()),
                false,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(executions.load(Ordering::SeqCst), 0);

        // resuming fires it
        engine.start().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        engine.shutdown(true).await;
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_signal_wakes_idle_loop_early() {
        let executions = Arc::new(AtomicUsize::new(0));
        let (engine, store) = engine_fixture(Arc::clone(&executions)).await;

        store
            .store_job(
                JobDetail::new(Key::of("j"), "counting").durable(true),
                false,
            )
            .await
            .unwrap();
        engine.start().await;
        // let the loop settle into its idle wait
        tokio::time::sleep(Duration::from_millis(100)).await;

        // storing a due trigger signals the loop; it must fire well before
        // a full idle period elapses
        store
            .store_trigger(
                Trigger::new(
                    Key::of("t"),
                    Key::of("j"),
                    TriggerSchedule::Simple {
                        repeat_interval_ms: 0,
                        repeat_count: 0,
                        times_triggered: 0,
                    },
                )
                .with_start_time(Utc::now()),
                false,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        engine.shutdown(true).await;
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }
}
