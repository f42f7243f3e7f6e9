// Bootstrap utilities for binary initialization

use crate::config::Settings;
use crate::db::DbPool;
use crate::retry::DbRetryPolicy;
use crate::store::sql::ClusteredStoreConfig;
use crate::telemetry;
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::info;

/// Initialize structured logging, trace export and the metrics endpoint.
pub fn init_telemetry(settings: &Settings) -> Result<()> {
    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )
    .context("Failed to initialize logging")?;
    telemetry::init_metrics(settings.observability.metrics_port)
        .context("Failed to initialize metrics")?;
    Ok(())
}

/// Initialize the PostgreSQL connection pool.
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database connection pool");
    let pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;
    pool.health_check()
        .await
        .context("Database health check failed")?;
    Ok(pool)
}

/// Store configuration derived from the settings and the resolved
/// instance id.
pub fn clustered_store_config(settings: &Settings, instance_id: String) -> ClusteredStoreConfig {
    ClusteredStoreConfig {
        sched_name: settings.scheduler.instance_name.clone(),
        instance_id,
        table_prefix: settings.job_store.table_prefix.clone(),
        is_clustered: settings.job_store.is_clustered,
        use_properties: settings.job_store.use_properties,
        misfire_threshold_ms: settings.job_store.misfire_threshold_ms,
        max_misfires_per_sweep: settings.job_store.max_misfires_per_sweep,
        cluster_checkin_interval_ms: settings.job_store.cluster_checkin_interval_ms,
        lock_max_retry: settings.job_store.lock_max_retry,
        lock_retry_period_ms: settings.job_store.lock_retry_period_ms,
        acquire_triggers_within_lock: settings.job_store.acquire_triggers_within_lock,
    }
}

/// Backoff policy for transient store failures, shared by the loop, the
/// worker pool and the cluster manager.
pub fn db_retry_policy(settings: &Settings) -> DbRetryPolicy {
    DbRetryPolicy::new(Duration::from_millis(settings.job_store.db_retry_interval_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_carries_settings_through() {
        let mut settings = Settings::default();
        settings.job_store.use_properties = true;
        settings.job_store.table_prefix = "qx_".to_string();
        let cfg = clustered_store_config(&settings, "node-1".to_string());
        assert!(cfg.use_properties);
        assert_eq!(cfg.table_prefix, "qx_");
        assert_eq!(cfg.instance_id, "node-1");
        assert_eq!(cfg.sched_name, settings.scheduler.instance_name);
    }
}
