// Listener registries and event fan-out. Registrations keep insertion
// order; every dispatch is fault-isolated so one failing listener cannot
// suppress the rest or derail the firing job's completion path.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

use crate::job::JobExecutionContext;
use crate::models::{
    CompletedExecutionInstruction, GroupMatcher, JobKey, Key, TriggerKey,
};
use crate::schedule::Trigger;

pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[async_trait]
pub trait TriggerListener: Send + Sync {
    fn name(&self) -> &str;

    async fn trigger_fired(&self, _trigger: &Trigger, _ctx: &JobExecutionContext) -> ListenerResult {
        Ok(())
    }

    /// Return true to veto the job execution for this fire.
    async fn veto_job_execution(
        &self,
        _trigger: &Trigger,
        _ctx: &JobExecutionContext,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        Ok(false)
    }

    async fn trigger_misfired(&self, _trigger: &Trigger) -> ListenerResult {
        Ok(())
    }

    async fn trigger_complete(
        &self,
        _trigger: &Trigger,
        _ctx: &JobExecutionContext,
        _instruction: CompletedExecutionInstruction,
    ) -> ListenerResult {
        Ok(())
    }
}

#[async_trait]
pub trait JobListener: Send + Sync {
    fn name(&self) -> &str;

    async fn job_to_be_executed(&self, _ctx: &JobExecutionContext) -> ListenerResult {
        Ok(())
    }

    async fn job_execution_vetoed(&self, _ctx: &JobExecutionContext) -> ListenerResult {
        Ok(())
    }

    async fn job_was_executed(
        &self,
        _ctx: &JobExecutionContext,
        _error: Option<&crate::errors::JobExecutionError>,
    ) -> ListenerResult {
        Ok(())
    }
}

#[async_trait]
pub trait SchedulerListener: Send + Sync {
    async fn job_scheduled(&self, _trigger: &Trigger) -> ListenerResult {
        Ok(())
    }

    async fn job_unscheduled(&self, _trigger_key: &TriggerKey) -> ListenerResult {
        Ok(())
    }

    async fn trigger_finalized(&self, _trigger: &Trigger) -> ListenerResult {
        Ok(())
    }

    async fn trigger_paused(&self, _trigger_key: &TriggerKey) -> ListenerResult {
        Ok(())
    }

    async fn trigger_resumed(&self, _trigger_key: &TriggerKey) -> ListenerResult {
        Ok(())
    }

    async fn triggers_paused(&self, _group: &str) -> ListenerResult {
        Ok(())
    }

    async fn triggers_resumed(&self, _group: &str) -> ListenerResult {
        Ok(())
    }

    async fn job_added(&self, _job_key: &JobKey) -> ListenerResult {
        Ok(())
    }

    async fn job_deleted(&self, _job_key: &JobKey) -> ListenerResult {
        Ok(())
    }

    async fn scheduler_error(&self, _message: &str) -> ListenerResult {
        Ok(())
    }

    async fn scheduler_started(&self) -> ListenerResult {
        Ok(())
    }

    async fn scheduler_shutdown(&self) -> ListenerResult {
        Ok(())
    }
}

struct Registration<L: ?Sized> {
    listener: Arc<L>,
    matchers: Vec<GroupMatcher>,
}

impl<L: ?Sized> Registration<L> {
    /// A registration applies when every matcher accepts the key; an empty
    /// matcher list accepts everything.
    fn applies_to(&self, key: &Key) -> bool {
        self.matchers.iter().all(|m| m.matches_key(key))
    }
}

/// Insertion-ordered registries for the three listener kinds.
#[derive(Default)]
pub struct ListenerManager {
    trigger_listeners: RwLock<Vec<Registration<dyn TriggerListener>>>,
    job_listeners: RwLock<Vec<Registration<dyn JobListener>>>,
    scheduler_listeners: RwLock<Vec<Arc<dyn SchedulerListener>>>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_trigger_listener(
        &self,
        listener: Arc<dyn TriggerListener>,
        matchers: Vec<GroupMatcher>,
    ) {
        let mut listeners = self
            .trigger_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        listeners.push(Registration { listener, matchers });
    }

    pub fn remove_trigger_listener(&self, name: &str) -> bool {
        let mut listeners = self
            .trigger_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|r| r.listener.name() != name);
        listeners.len() != before
    }

    pub fn add_job_listener(&self, listener: Arc<dyn JobListener>, matchers: Vec<GroupMatcher>) {
        let mut listeners = self
            .job_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        listeners.push(Registration { listener, matchers });
    }

    pub fn remove_job_listener(&self, name: &str) -> bool {
        let mut listeners = self
            .job_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|r| r.listener.name() != name);
        listeners.len() != before
    }

    pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        let mut listeners = self
            .scheduler_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    fn trigger_listeners_for(&self, key: &TriggerKey) -> Vec<Arc<dyn TriggerListener>> {
        let listeners = self
            .trigger_listeners
            .read()
            .unwrap_or_else(|e| e.into_inner());
        listeners
            .iter()
            .filter(|r| r.applies_to(key))
            .map(|r| Arc::clone(&r.listener))
            .collect()
    }

    fn job_listeners_for(&self, key: &JobKey) -> Vec<Arc<dyn JobListener>> {
        let listeners = self
            .job_listeners
            .read()
            .unwrap_or_else(|e| e.into_inner());
        listeners
            .iter()
            .filter(|r| r.applies_to(key))
            .map(|r| Arc::clone(&r.listener))
            .collect()
    }

    fn scheduler_listeners_snapshot(&self) -> Vec<Arc<dyn SchedulerListener>> {
        self.scheduler_listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ------------------------------------------------------------------
    // Fan-out. Listener failures become scheduler-error events and never
    // abort the remaining listeners.
    // ------------------------------------------------------------------

    pub async fn notify_trigger_fired(&self, trigger: &Trigger, ctx: &JobExecutionContext) {
        for listener in self.trigger_listeners_for(&trigger.key) {
            if let Err(e) = listener.trigger_fired(trigger, ctx).await {
                self.listener_failed("trigger_fired", listener.name(), e).await;
            }
        }
    }

    /// True when any applicable listener vetoes. A failing listener counts
    /// as "no veto".
    pub async fn notify_veto_job_execution(
        &self,
        trigger: &Trigger,
        ctx: &JobExecutionContext,
    ) -> bool {
        let mut vetoed = false;
        for listener in self.trigger_listeners_for(&trigger.key) {
            match listener.veto_job_execution(trigger, ctx).await {
                Ok(true) => vetoed = true,
                Ok(false) => {}
                Err(e) => {
                    self.listener_failed("veto_job_execution", listener.name(), e)
                        .await
                }
            }
        }
        vetoed
    }

    pub async fn notify_trigger_misfired(&self, trigger: &Trigger) {
        for listener in self.trigger_listeners_for(&trigger.key) {
            if let Err(e) = listener.trigger_misfired(trigger).await {
                self.listener_failed("trigger_misfired", listener.name(), e)
                    .await;
            }
        }
    }

    pub async fn notify_trigger_complete(
        &self,
        trigger: &Trigger,
        ctx: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    ) {
        for listener in self.trigger_listeners_for(&trigger.key) {
            if let Err(e) = listener.trigger_complete(trigger, ctx, instruction).await {
                self.listener_failed("trigger_complete", listener.name(), e)
                    .await;
            }
        }
    }

    pub async fn notify_job_to_be_executed(&self, ctx: &JobExecutionContext) {
        for listener in self.job_listeners_for(&ctx.job_detail.key) {
            if let Err(e) = listener.job_to_be_executed(ctx).await {
                self.listener_failed("job_to_be_executed", listener.name(), e)
                    .await;
            }
        }
    }

    pub async fn notify_job_execution_vetoed(&self, ctx: &JobExecutionContext) {
        for listener in self.job_listeners_for(&ctx.job_detail.key) {
            if let Err(e) = listener.job_execution_vetoed(ctx).await {
                self.listener_failed("job_execution_vetoed", listener.name(), e)
                    .await;
            }
        }
    }

    pub async fn notify_job_was_executed(
        &self,
        ctx: &JobExecutionContext,
        error: Option<&crate::errors::JobExecutionError>,
    ) {
        for listener in self.job_listeners_for(&ctx.job_detail.key) {
            if let Err(e) = listener.job_was_executed(ctx, error).await {
                self.listener_failed("job_was_executed", listener.name(), e)
                    .await;
            }
        }
    }

    pub async fn notify_scheduler_error(&self, message: &str) {
        error!(message, "Scheduler error");
        for listener in self.scheduler_listeners_snapshot() {
            if let Err(e) = listener.scheduler_error(message).await {
                // do not recurse into the error channel
                warn!(error = %e, "Scheduler listener failed handling scheduler_error");
            }
        }
    }

    pub async fn notify_job_scheduled(&self, trigger: &Trigger) {
        for listener in self.scheduler_listeners_snapshot() {
            if let Err(e) = listener.job_scheduled(trigger).await {
                self.listener_failed("job_scheduled", "scheduler listener", e)
                    .await;
            }
        }
    }

    pub async fn notify_job_unscheduled(&self, trigger_key: &TriggerKey) {
        for listener in self.scheduler_listeners_snapshot() {
            if let Err(e) = listener.job_unscheduled(trigger_key).await {
                self.listener_failed("job_unscheduled", "scheduler listener", e)
                    .await;
            }
        }
    }

    pub async fn notify_trigger_finalized(&self, trigger: &Trigger) {
        for listener in self.scheduler_listeners_snapshot() {
            if let Err(e) = listener.trigger_finalized(trigger).await {
                self.listener_failed("trigger_finalized", "scheduler listener", e)
                    .await;
            }
        }
    }

    pub async fn notify_scheduler_started(&self) {
        for listener in self.scheduler_listeners_snapshot() {
            if let Err(e) = listener.scheduler_started().await {
                self.listener_failed("scheduler_started", "scheduler listener", e)
                    .await;
            }
        }
    }

    pub async fn notify_scheduler_shutdown(&self) {
        for listener in self.scheduler_listeners_snapshot() {
            if let Err(e) = listener.scheduler_shutdown().await {
                self.listener_failed("scheduler_shutdown", "scheduler listener", e)
                    .await;
            }
        }
    }

    async fn listener_failed(
        &self,
        event: &str,
        listener: &str,
        e: Box<dyn std::error::Error + Send + Sync>,
    ) {
        let message = format!("Listener '{}' failed during {}: {}", listener, event, e);
        self.notify_scheduler_error(&message).await;
    }
}
