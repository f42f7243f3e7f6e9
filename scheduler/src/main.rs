// Scheduler daemon entry point

use common::bootstrap;
use common::cluster::ClusterManager;
use common::config::{Settings, StoreKind};
use common::db::DbPool;
use common::errors::JobExecutionError;
use common::job::{Job, JobExecutionContext, JobRegistry};
use common::listeners::ListenerManager;
use common::scheduler::{EngineConfig, SchedulerEngine};
use common::store::memory::MemoryJobStore;
use common::store::sql::ClusteredJobStore;
use common::store::JobStore;
use common::worker::WorkerPool;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Built-in job that just logs its firing; deployments register their own
/// runner types against the registry before starting the engine.
struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
        info!(
            job = %ctx.job_detail.key,
            trigger = %ctx.trigger.key,
            fire_time = %ctx.fire_time,
            recovering = ctx.recovering,
            "Job fired"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    bootstrap::init_telemetry(&settings)?;

    let instance_id = settings.resolve_instance_id();
    info!(
        instance_name = %settings.scheduler.instance_name,
        instance_id = %instance_id,
        "Starting scheduler"
    );

    let registry = Arc::new(JobRegistry::new());
    registry.register("log", Default::default(), || Arc::new(LogJob));

    let mut db_pool: Option<DbPool> = None;
    let mut clustered: Option<Arc<ClusteredJobStore>> = None;
    let store: Arc<dyn JobStore> = match settings.job_store.kind {
        StoreKind::Memory => {
            info!("Using in-memory job store");
            Arc::new(MemoryJobStore::new(ChronoDuration::milliseconds(
                settings.job_store.misfire_threshold_ms,
            )))
        }
        StoreKind::Clustered => {
            let pool = bootstrap::init_database_pool(&settings).await?;
            let cfg = bootstrap::clustered_store_config(&settings, instance_id.clone());
            info!(
                table_prefix = %cfg.table_prefix,
                is_clustered = cfg.is_clustered,
                "Using clustered job store"
            );
            let store = Arc::new(ClusteredJobStore::new(pool.clone(), cfg));
            db_pool = Some(pool);
            clustered = Some(Arc::clone(&store));
            store
        }
    };

    let listeners = Arc::new(ListenerManager::new());
    let retry = bootstrap::db_retry_policy(&settings);
    let pool = Arc::new(WorkerPool::new(
        settings.thread_pool.worker_count,
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&listeners),
        retry.clone(),
    ));
    let engine = SchedulerEngine::new(
        EngineConfig {
            idle_wait: Duration::from_millis(settings.scheduler.idle_wait_ms),
            batch_max_count: settings.scheduler.batch_max_count,
            batch_time_window: Duration::from_millis(settings.scheduler.batch_time_window_ms),
            db_retry_interval: Duration::from_millis(settings.job_store.db_retry_interval_ms),
        },
        Arc::clone(&store),
        Arc::clone(&pool),
        Arc::clone(&listeners),
    );

    store.initialize(engine.signaler()).await?;

    let cluster_manager = match &clustered {
        Some(store) => {
            store.start_misfire_handler();
            if settings.job_store.is_clustered {
                Some(ClusterManager::start(Arc::clone(store), retry))
            } else {
                None
            }
        }
        None => None,
    };

    engine.start().await;
    info!("Scheduler running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    engine.shutdown(true).await;
    if let Some(cluster_manager) = cluster_manager {
        cluster_manager.stop().await;
    }
    if let Some(pool) = db_pool {
        pool.close().await;
    }

    info!("Scheduler stopped");
    Ok(())
}
