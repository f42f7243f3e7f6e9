// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub scheduler: SchedulerConfig,
    pub thread_pool: ThreadPoolConfig,
    pub job_store: JobStoreConfig,
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Logical cluster name; peers sharing a database must agree on it.
    pub instance_name: String,
    /// Unique id of this instance, or "AUTO" to derive one from the host
    /// name and startup time.
    pub instance_id: String,
    /// How long the loop may idle before re-checking the store.
    pub idle_wait_ms: u64,
    /// Maximum triggers claimed per acquire round.
    pub batch_max_count: usize,
    /// Widening of the acquire window to batch near-simultaneous fires.
    pub batch_time_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    pub worker_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Clustered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreConfig {
    pub kind: StoreKind,
    pub misfire_threshold_ms: i64,
    pub table_prefix: String,
    pub is_clustered: bool,
    pub cluster_checkin_interval_ms: i64,
    pub use_properties: bool,
    pub acquire_triggers_within_lock: bool,
    pub lock_max_retry: u32,
    pub lock_retry_period_ms: u64,
    /// Backoff applied by the scheduling loop after a transient store
    /// failure.
    pub db_retry_interval_ms: u64,
    pub max_misfires_per_sweep: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("CADENCE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.instance_name.is_empty() {
            return Err("Scheduler instance_name cannot be empty".to_string());
        }
        if self.scheduler.instance_id.is_empty() {
            return Err("Scheduler instance_id cannot be empty (use AUTO)".to_string());
        }
        if self.scheduler.idle_wait_ms == 0 {
            return Err("Scheduler idle_wait_ms must be greater than 0".to_string());
        }
        if self.scheduler.batch_max_count == 0 {
            return Err("Scheduler batch_max_count must be greater than 0".to_string());
        }

        if self.thread_pool.worker_count == 0 {
            return Err("Thread pool worker_count must be greater than 0".to_string());
        }

        if self.job_store.misfire_threshold_ms <= 0 {
            return Err("Job store misfire_threshold_ms must be greater than 0".to_string());
        }
        if self.job_store.table_prefix.is_empty() {
            return Err("Job store table_prefix cannot be empty".to_string());
        }
        if self.job_store.cluster_checkin_interval_ms <= 0 {
            return Err("Job store cluster_checkin_interval_ms must be greater than 0".to_string());
        }
        if self.job_store.db_retry_interval_ms == 0 {
            return Err("Job store db_retry_interval_ms must be greater than 0".to_string());
        }
        if self.job_store.is_clustered && self.job_store.kind == StoreKind::Memory {
            return Err("Clustering requires the clustered job store".to_string());
        }

        if self.job_store.kind == StoreKind::Clustered {
            if self.database.url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
            if self.database.max_connections == 0 {
                return Err("Database max_connections must be greater than 0".to_string());
            }
        }

        Ok(())
    }

    /// The effective instance id: explicit, or host name plus startup
    /// millis when configured as AUTO.
    pub fn resolve_instance_id(&self) -> String {
        if self.scheduler.instance_id != "AUTO" {
            return self.scheduler.instance_id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        format!("{}{}", host, chrono::Utc::now().timestamp_millis())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig {
                instance_name: "CadenceScheduler".to_string(),
                instance_id: "AUTO".to_string(),
                idle_wait_ms: 30_000,
                batch_max_count: 1,
                batch_time_window_ms: 0,
            },
            thread_pool: ThreadPoolConfig { worker_count: 10 },
            job_store: JobStoreConfig {
                kind: StoreKind::Memory,
                misfire_threshold_ms: 60_000,
                table_prefix: "sched_".to_string(),
                is_clustered: false,
                cluster_checkin_interval_ms: 7_500,
                use_properties: false,
                acquire_triggers_within_lock: true,
                lock_max_retry: 3,
                lock_retry_period_ms: 1_000,
                db_retry_interval_ms: 15_000,
                max_misfires_per_sweep: 20,
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/cadence".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_zero_workers() {
        let mut settings = Settings::default();
        settings.thread_pool.worker_count = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_clustered_memory_store() {
        let mut settings = Settings::default();
        settings.job_store.is_clustered = true;
        settings.job_store.kind = StoreKind::Memory;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_requires_database_for_clustered_store() {
        let mut settings = Settings::default();
        settings.job_store.kind = StoreKind::Clustered;
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_auto_instance_id_resolves() {
        let settings = Settings::default();
        let id = settings.resolve_instance_id();
        assert!(!id.is_empty());
        assert_ne!(id, "AUTO");
    }

    #[test]
    fn test_explicit_instance_id_passes_through() {
        let mut settings = Settings::default();
        settings.scheduler.instance_id = "node-1".to_string();
        assert_eq!(settings.resolve_instance_id(), "node-1");
    }
}
