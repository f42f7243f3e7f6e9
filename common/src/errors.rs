// Error handling framework shared across the scheduler core

use thiserror::Error;

/// Schedule computation and validation errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Misfire policy {policy} is not valid for {trigger_type} triggers")]
    MisfirePolicyMismatch {
        policy: String,
        trigger_type: String,
    },
}

/// Validation errors raised before any state change
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Key name cannot be empty")]
    EmptyKeyName,

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Job '{0}' is not durable and has no trigger")]
    NonDurableJobWithoutTrigger(String),

    #[error("Job data values must be strings when the store runs in properties mode: key '{0}'")]
    NonStringJobData(String),
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),
}

/// Row-lock semaphore errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Failed to acquire lock '{lock_name}' after {attempts} attempts: {reason}")]
    AcquireFailed {
        lock_name: String,
        attempts: u32,
        reason: String,
    },

    #[error("Lock row query failed: {0}")]
    QueryFailed(String),
}

/// Job store errors, classified per the recovery strategy they demand
#[derive(Error, Debug)]
pub enum StoreError {
    /// Client error; the mutation was rejected with no state change.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("Calendar not found: {0}")]
    CalendarNotFound(String),

    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("Calendar '{0}' is referenced by triggers and cannot be removed")]
    CalendarInUse(String),

    /// Retryable; callers back off for the configured retry interval.
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// Not retryable; surfaced to the scheduler error channel.
    #[error("Fatal store failure: {0}")]
    Fatal(String),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StoreError {
    /// Whether the failed operation may be retried after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Lock(_))
    }
}

/// Errors thrown by job execution, carrying the completion directives
/// the firing trigger consults afterwards.
#[derive(Error, Debug)]
#[error("Job execution failed: {message}")]
pub struct JobExecutionError {
    pub message: String,
    pub refire_immediately: bool,
    pub unschedule_firing_trigger: bool,
    pub unschedule_all_triggers: bool,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            refire_immediately: false,
            unschedule_firing_trigger: false,
            unschedule_all_triggers: false,
        }
    }

    pub fn with_refire_immediately(mut self) -> Self {
        self.refire_immediately = true;
        self
    }

    pub fn with_unschedule_firing_trigger(mut self) -> Self {
        self.unschedule_firing_trigger = true;
        self
    }

    pub fn with_unschedule_all_triggers(mut self) -> Self {
        self.unschedule_all_triggers = true;
        self
    }
}

/// Scheduler-level errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler is shut down")]
    ShutDown,

    #[error("Scheduler is not started")]
    NotStarted,

    #[error("No job registered under type '{0}'")]
    UnknownJobType(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        "23503" => DatabaseError::ForeignKeyViolation(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionFailed(err.to_string())
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::from(err).into()
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        match err {
            // Connection-level failures are always retryable; everything else
            // is decided here conservatively and refined by callers.
            DatabaseError::ConnectionFailed(msg) | DatabaseError::HealthCheckFailed(msg) => {
                StoreError::Transient(msg)
            }
            DatabaseError::TransactionFailed(msg) => StoreError::Transient(msg),
            other => StoreError::Fatal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Fatal(format!("Serialization failed: {}", err))
    }
}
