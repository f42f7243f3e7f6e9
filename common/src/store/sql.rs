// Clustered job store over PostgreSQL. Every multi-row mutation runs inside
// one transaction under the TRIGGER_ACCESS row lock (STATE_ACCESS for
// cluster bookkeeping); reads go straight to the pool. Fire times persist as
// epoch milliseconds, and cross-instance time comparisons only ever use the
// database clock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::calendar::ExclusionCalendar;
use crate::db::DbPool;
use crate::errors::{StoreError, ValidationError};
use crate::models::{
    CompletedExecutionInstruction, FiredState, FiredTriggerRecord, GroupMatcher, JobDataMap,
    JobDetail, JobKey, Key, MisfirePolicy, SchedulerStateRecord, TriggerKey, TriggerState,
    TriggerStateView, RECOVERING_JOBS_GROUP,
};
use crate::schedule::{Trigger, TriggerSchedule};
use crate::store::delegate::{standard_delegates, TriggerPersistenceDelegate};
use crate::store::lock::{LockedTransaction, RowLockSemaphore, STATE_ACCESS, TRIGGER_ACCESS};
use crate::store::{
    JobStore, NullSignaler, SchedulerSignaler, TriggerFiredBundle, TriggerFiredResult,
    RECOVERY_ORIG_FIRE_TIME_MS, RECOVERY_ORIG_SCHEDULED_FIRE_TIME_MS, RECOVERY_ORIG_TRIGGER_GROUP,
    RECOVERY_ORIG_TRIGGER_NAME,
};
use crate::time::{from_millis, to_millis};

pub const DEFAULT_TABLE_PREFIX: &str = "sched_";

#[derive(Debug, Clone)]
pub struct ClusteredStoreConfig {
    pub sched_name: String,
    pub instance_id: String,
    pub table_prefix: String,
    pub is_clustered: bool,
    /// Store job data as a flat string-to-string map instead of opaque
    /// bytes. Must agree across cluster peers.
    pub use_properties: bool,
    pub misfire_threshold_ms: i64,
    pub max_misfires_per_sweep: i64,
    pub cluster_checkin_interval_ms: i64,
    pub lock_max_retry: u32,
    pub lock_retry_period_ms: u64,
    pub acquire_triggers_within_lock: bool,
}

impl Default for ClusteredStoreConfig {
    fn default() -> Self {
        Self {
            sched_name: "CadenceScheduler".to_string(),
            instance_id: "NON_CLUSTERED".to_string(),
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            is_clustered: false,
            use_properties: false,
            misfire_threshold_ms: 60_000,
            max_misfires_per_sweep: 20,
            cluster_checkin_interval_ms: 7_500,
            lock_max_retry: 3,
            lock_retry_period_ms: 1_000,
            acquire_triggers_within_lock: true,
        }
    }
}

/// SQL templates expanded once at construction with the table prefix; the
/// schedule name is always the first bind parameter.
struct SqlQueries {
    insert_job: String,
    update_job: String,
    update_job_data: String,
    select_job: String,
    delete_job: String,
    select_job_keys: String,
    select_job_groups: String,
    insert_trigger: String,
    update_trigger: String,
    select_trigger: String,
    delete_trigger: String,
    select_trigger_keys: String,
    select_trigger_groups: String,
    select_trigger_keys_for_job: String,
    count_triggers_for_job: String,
    select_trigger_state: String,
    update_trigger_state: String,
    update_trigger_state_from_states: String,
    update_trigger_states_for_job_from_states: String,
    select_trigger_keys_in_states: String,
    select_next_trigger_keys: String,
    select_misfired_trigger_keys: String,
    count_triggers_using_calendar: String,
    insert_calendar: String,
    update_calendar: String,
    select_calendar: String,
    delete_calendar: String,
    select_calendar_names: String,
    select_trigger_keys_using_calendar: String,
    insert_paused_group: String,
    delete_paused_group: String,
    select_paused_groups: String,
    delete_all_paused_groups: String,
    insert_fired_trigger: String,
    update_fired_trigger_executing: String,
    delete_fired_trigger: String,
    select_fired_triggers_for_instance: String,
    delete_fired_triggers_for_instance: String,
    insert_scheduler_state: String,
    update_scheduler_state: String,
    delete_scheduler_state: String,
    select_scheduler_states: String,
    delete_all: Vec<String>,
    db_now: String,
}

impl SqlQueries {
    fn new(p: &str) -> Self {
        Self {
            insert_job: format!(
                "INSERT INTO {p}job_details (sched_name, job_name, job_group, description, \
                 job_class_name, is_durable, is_nonconcurrent, is_update_data, \
                 requests_recovery, job_data) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
            ),
            update_job: format!(
                "UPDATE {p}job_details SET description = $4, job_class_name = $5, \
                 is_durable = $6, is_nonconcurrent = $7, is_update_data = $8, \
                 requests_recovery = $9, job_data = $10 \
                 WHERE sched_name = $1 AND job_name = $2 AND job_group = $3"
            ),
            update_job_data: format!(
                "UPDATE {p}job_details SET job_data = $4 \
                 WHERE sched_name = $1 AND job_name = $2 AND job_group = $3"
            ),
            select_job: format!(
                "SELECT job_name, job_group, description, job_class_name, is_durable, \
                 is_nonconcurrent, is_update_data, requests_recovery, job_data \
                 FROM {p}job_details WHERE sched_name = $1 AND job_name = $2 AND job_group = $3"
            ),
            delete_job: format!(
                "DELETE FROM {p}job_details \
                 WHERE sched_name = $1 AND job_name = $2 AND job_group = $3"
            ),
            select_job_keys: format!(
                "SELECT job_name, job_group FROM {p}job_details WHERE sched_name = $1"
            ),
            select_job_groups: format!(
                "SELECT DISTINCT job_group FROM {p}job_details WHERE sched_name = $1"
            ),
            insert_trigger: format!(
                "INSERT INTO {p}triggers (sched_name, trigger_name, trigger_group, job_name, \
                 job_group, description, next_fire_time, prev_fire_time, priority, \
                 trigger_state, trigger_type, start_time, end_time, calendar_name, \
                 misfire_instr, job_data) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
            ),
            update_trigger: format!(
                "UPDATE {p}triggers SET job_name = $4, job_group = $5, description = $6, \
                 next_fire_time = $7, prev_fire_time = $8, priority = $9, trigger_state = $10, \
                 trigger_type = $11, start_time = $12, end_time = $13, calendar_name = $14, \
                 misfire_instr = $15, job_data = $16 \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3"
            ),
            select_trigger: format!(
                "SELECT trigger_name, trigger_group, job_name, job_group, description, \
                 next_fire_time, prev_fire_time, priority, trigger_state, trigger_type, \
                 start_time, end_time, calendar_name, misfire_instr, job_data \
                 FROM {p}triggers \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3"
            ),
            delete_trigger: format!(
                "DELETE FROM {p}triggers \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3"
            ),
            select_trigger_keys: format!(
                "SELECT trigger_name, trigger_group FROM {p}triggers WHERE sched_name = $1"
            ),
            select_trigger_groups: format!(
                "SELECT DISTINCT trigger_group FROM {p}triggers WHERE sched_name = $1"
            ),
            select_trigger_keys_for_job: format!(
                "SELECT trigger_name, trigger_group FROM {p}triggers \
                 WHERE sched_name = $1 AND job_name = $2 AND job_group = $3"
            ),
            count_triggers_for_job: format!(
                "SELECT COUNT(*) AS cnt FROM {p}triggers \
                 WHERE sched_name = $1 AND job_name = $2 AND job_group = $3"
            ),
            select_trigger_state: format!(
                "SELECT trigger_state FROM {p}triggers \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3"
            ),
            update_trigger_state: format!(
                "UPDATE {p}triggers SET trigger_state = $4 \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3"
            ),
            update_trigger_state_from_states: format!(
                "UPDATE {p}triggers SET trigger_state = $4 \
                 WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3 \
                 AND trigger_state = ANY($5)"
            ),
            update_trigger_states_for_job_from_states: format!(
                "UPDATE {p}triggers SET trigger_state = $4 \
                 WHERE sched_name = $1 AND job_name = $2 AND job_group = $3 \
                 AND trigger_state = ANY($5)"
            ),
            select_trigger_keys_in_states: format!(
                "SELECT trigger_name, trigger_group FROM {p}triggers \
                 WHERE sched_name = $1 AND trigger_state = ANY($2)"
            ),
            select_next_trigger_keys: format!(
                "SELECT trigger_name, trigger_group FROM {p}triggers \
                 WHERE sched_name = $1 AND trigger_state = 'WAITING' \
                 AND next_fire_time <= $2 AND (misfire_instr = -1 OR next_fire_time >= $3) \
                 ORDER BY next_fire_time ASC, priority DESC, trigger_name ASC, \
                 trigger_group ASC LIMIT $4"
            ),
            select_misfired_trigger_keys: format!(
                "SELECT trigger_name, trigger_group FROM {p}triggers \
                 WHERE sched_name = $1 AND trigger_state = 'WAITING' \
                 AND misfire_instr <> -1 AND next_fire_time < $2 \
                 ORDER BY next_fire_time ASC, priority DESC LIMIT $3"
            ),
            count_triggers_using_calendar: format!(
                "SELECT COUNT(*) AS cnt FROM {p}triggers \
                 WHERE sched_name = $1 AND calendar_name = $2"
            ),
            insert_calendar: format!(
                "INSERT INTO {p}calendars (sched_name, calendar_name, calendar) \
                 VALUES ($1, $2, $3)"
            ),
            update_calendar: format!(
                "UPDATE {p}calendars SET calendar = $3 \
                 WHERE sched_name = $1 AND calendar_name = $2"
            ),
            select_calendar: format!(
                "SELECT calendar FROM {p}calendars \
                 WHERE sched_name = $1 AND calendar_name = $2"
            ),
            delete_calendar: format!(
                "DELETE FROM {p}calendars WHERE sched_name = $1 AND calendar_name = $2"
            ),
            select_calendar_names: format!(
                "SELECT calendar_name FROM {p}calendars WHERE sched_name = $1 \
                 ORDER BY calendar_name"
            ),
            select_trigger_keys_using_calendar: format!(
                "SELECT trigger_name, trigger_group FROM {p}triggers \
                 WHERE sched_name = $1 AND calendar_name = $2"
            ),
            insert_paused_group: format!(
                "INSERT INTO {p}paused_trigger_grps (sched_name, trigger_group) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING"
            ),
            delete_paused_group: format!(
                "DELETE FROM {p}paused_trigger_grps \
                 WHERE sched_name = $1 AND trigger_group = $2"
            ),
            select_paused_groups: format!(
                "SELECT trigger_group FROM {p}paused_trigger_grps WHERE sched_name = $1"
            ),
            delete_all_paused_groups: format!(
                "DELETE FROM {p}paused_trigger_grps WHERE sched_name = $1"
            ),
            insert_fired_trigger: format!(
                "INSERT INTO {p}fired_triggers (sched_name, entry_id, trigger_name, \
                 trigger_group, instance_name, fired_time, sched_time, priority, state, \
                 job_name, job_group, is_nonconcurrent, requests_recovery) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
            ),
            update_fired_trigger_executing: format!(
                "UPDATE {p}fired_triggers SET state = 'EXECUTING', fired_time = $3 \
                 WHERE sched_name = $1 AND entry_id = $2"
            ),
            delete_fired_trigger: format!(
                "DELETE FROM {p}fired_triggers WHERE sched_name = $1 AND entry_id = $2"
            ),
            select_fired_triggers_for_instance: format!(
                "SELECT entry_id, trigger_name, trigger_group, instance_name, fired_time, \
                 sched_time, priority, state, job_name, job_group, is_nonconcurrent, \
                 requests_recovery FROM {p}fired_triggers \
                 WHERE sched_name = $1 AND instance_name = $2"
            ),
            delete_fired_triggers_for_instance: format!(
                "DELETE FROM {p}fired_triggers WHERE sched_name = $1 AND instance_name = $2"
            ),
            insert_scheduler_state: format!(
                "INSERT INTO {p}scheduler_state (sched_name, instance_name, \
                 last_checkin_time, checkin_interval) VALUES ($1, $2, $3, $4)"
            ),
            update_scheduler_state: format!(
                "UPDATE {p}scheduler_state SET last_checkin_time = $3 \
                 WHERE sched_name = $1 AND instance_name = $2"
            ),
            delete_scheduler_state: format!(
                "DELETE FROM {p}scheduler_state WHERE sched_name = $1 AND instance_name = $2"
            ),
            select_scheduler_states: format!(
                "SELECT instance_name, last_checkin_time, checkin_interval \
                 FROM {p}scheduler_state WHERE sched_name = $1"
            ),
            delete_all: vec![
                format!("DELETE FROM {p}simple_triggers WHERE sched_name = $1"),
                format!("DELETE FROM {p}cron_triggers WHERE sched_name = $1"),
                format!("DELETE FROM {p}simprop_triggers WHERE sched_name = $1"),
                format!("DELETE FROM {p}blob_triggers WHERE sched_name = $1"),
                format!("DELETE FROM {p}triggers WHERE sched_name = $1"),
                format!("DELETE FROM {p}job_details WHERE sched_name = $1"),
                format!("DELETE FROM {p}calendars WHERE sched_name = $1"),
                format!("DELETE FROM {p}paused_trigger_grps WHERE sched_name = $1"),
                format!("DELETE FROM {p}fired_triggers WHERE sched_name = $1"),
            ],
            db_now: "SELECT (EXTRACT(EPOCH FROM clock_timestamp()) * 1000)::BIGINT AS now_ms"
                .to_string(),
        }
    }
}

pub struct ClusteredJobStore {
    pool: DbPool,
    cfg: ClusteredStoreConfig,
    q: SqlQueries,
    locks: RowLockSemaphore,
    delegates: Vec<Box<dyn TriggerPersistenceDelegate>>,
    signaler: RwLock<Arc<dyn SchedulerSignaler>>,
    misfire_handler_stop: RwLock<Option<watch::Sender<bool>>>,
}

impl ClusteredJobStore {
    pub fn new(pool: DbPool, cfg: ClusteredStoreConfig) -> Self {
        let locks = RowLockSemaphore::new(
            &cfg.table_prefix,
            cfg.sched_name.clone(),
            cfg.lock_max_retry,
            std::time::Duration::from_millis(cfg.lock_retry_period_ms),
        );
        let q = SqlQueries::new(&cfg.table_prefix);
        let delegates = standard_delegates(&cfg.table_prefix);
        Self {
            pool,
            cfg,
            q,
            locks,
            delegates,
            signaler: RwLock::new(Arc::new(NullSignaler)),
            misfire_handler_stop: RwLock::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.cfg.instance_id
    }

    pub fn cluster_checkin_interval(&self) -> Duration {
        Duration::milliseconds(self.cfg.cluster_checkin_interval_ms)
    }

    fn signaler(&self) -> Arc<dyn SchedulerSignaler> {
        Arc::clone(&self.signaler.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn misfire_threshold(&self) -> Duration {
        Duration::milliseconds(self.cfg.misfire_threshold_ms)
    }

    fn delegate_for(&self, schedule: &TriggerSchedule) -> Result<&dyn TriggerPersistenceDelegate, StoreError> {
        self.delegates
            .iter()
            .find(|d| d.can_handle(schedule))
            .map(|d| d.as_ref())
            .ok_or_else(|| {
                StoreError::Fatal(format!(
                    "no persistence delegate for trigger type '{}'",
                    schedule.type_name()
                ))
            })
    }

    fn delegate_by_discriminator(
        &self,
        discriminator: &str,
    ) -> Result<&dyn TriggerPersistenceDelegate, StoreError> {
        let c = discriminator.chars().next().unwrap_or('?');
        self.delegates
            .iter()
            .find(|d| d.discriminator() == c)
            .map(|d| d.as_ref())
            .ok_or_else(|| {
                StoreError::Fatal(format!(
                    "no persistence delegate for discriminator '{}'",
                    discriminator
                ))
            })
    }

    fn serialize_data(&self, data: &JobDataMap) -> Result<Vec<u8>, StoreError> {
        if self.cfg.use_properties {
            data.all_values_strings().map_err(StoreError::Validation)?;
        }
        Ok(serde_json::to_vec(data)?)
    }

    fn deserialize_data(&self, bytes: Option<Vec<u8>>) -> Result<JobDataMap, StoreError> {
        match bytes {
            None => Ok(JobDataMap::new()),
            Some(bytes) if bytes.is_empty() => Ok(JobDataMap::new()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Fatal(format!("Undeserializable job data: {}", e))),
        }
    }

    /// The only clock used for cross-instance comparisons.
    async fn db_now(&self, conn: &mut PgConnection) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query(&self.q.db_now).fetch_one(conn).await?;
        let ms: i64 = row.try_get("now_ms")?;
        Ok(from_millis(ms))
    }

    // ------------------------------------------------------------------
    // Row mapping
    // ------------------------------------------------------------------

    fn job_from_row(&self, row: &PgRow) -> Result<JobDetail, StoreError> {
        Ok(JobDetail {
            key: Key::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            ),
            job_type: row.try_get("job_class_name")?,
            description: row.try_get("description")?,
            data: self.deserialize_data(row.try_get("job_data")?)?,
            durable: row.try_get("is_durable")?,
            requests_recovery: row.try_get("requests_recovery")?,
            disallow_concurrent_execution: row.try_get("is_nonconcurrent")?,
            persist_data_after_execution: row.try_get("is_update_data")?,
        })
    }

    async fn load_job(
        &self,
        conn: &mut PgConnection,
        key: &JobKey,
    ) -> Result<Option<JobDetail>, StoreError> {
        let row = sqlx::query(&self.q.select_job)
            .bind(&self.cfg.sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_optional(conn)
            .await?;
        row.map(|r| self.job_from_row(&r)).transpose()
    }

    async fn load_trigger(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
    ) -> Result<Option<(Trigger, TriggerState)>, StoreError> {
        let Some(row) = sqlx::query(&self.q.select_trigger)
            .bind(&self.cfg.sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_optional(&mut *conn)
            .await?
        else {
            return Ok(None);
        };

        let trigger_type: String = row.try_get("trigger_type")?;
        let delegate = self.delegate_by_discriminator(&trigger_type)?;
        let schedule = delegate
            .load_extended(&mut *conn, &self.cfg.sched_name, key)
            .await?;

        let state_str: String = row.try_get("trigger_state")?;
        let state = TriggerState::parse(&state_str)
            .ok_or_else(|| StoreError::Fatal(format!("unknown trigger state '{}'", state_str)))?;

        let misfire_code: i16 = row.try_get("misfire_instr")?;
        let misfire_policy = MisfirePolicy::from_code(misfire_code)
            .ok_or_else(|| StoreError::Fatal(format!("unknown misfire code {}", misfire_code)))?;

        let trigger = Trigger {
            key: key.clone(),
            job_key: Key::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            ),
            description: row.try_get("description")?,
            start_time: from_millis(row.try_get("start_time")?),
            end_time: row.try_get::<Option<i64>, _>("end_time")?.map(from_millis),
            priority: row.try_get("priority")?,
            misfire_policy,
            calendar_name: row.try_get("calendar_name")?,
            data: self.deserialize_data(row.try_get("job_data")?)?,
            next_fire_time: row
                .try_get::<Option<i64>, _>("next_fire_time")?
                .map(from_millis),
            previous_fire_time: row
                .try_get::<Option<i64>, _>("prev_fire_time")?
                .map(from_millis),
            fire_instance_id: None,
            schedule,
        };
        Ok(Some((trigger, state)))
    }

    async fn insert_trigger_row(
        &self,
        conn: &mut PgConnection,
        trigger: &Trigger,
        state: TriggerState,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.q.insert_trigger)
            .bind(&self.cfg.sched_name)
            .bind(&trigger.key.name)
            .bind(&trigger.key.group)
            .bind(&trigger.job_key.name)
            .bind(&trigger.job_key.group)
            .bind(&trigger.description)
            .bind(trigger.next_fire_time.map(to_millis))
            .bind(trigger.previous_fire_time.map(to_millis))
            .bind(trigger.priority)
            .bind(state.as_str())
            .bind(trigger.schedule.discriminator().to_string())
            .bind(to_millis(trigger.start_time))
            .bind(trigger.end_time.map(to_millis))
            .bind(&trigger.calendar_name)
            .bind(trigger.misfire_policy.code())
            .bind(self.serialize_data(&trigger.data)?)
            .execute(&mut *conn)
            .await?;
        self.delegate_for(&trigger.schedule)?
            .insert_extended(conn, &self.cfg.sched_name, trigger)
            .await
    }

    async fn update_trigger_row(
        &self,
        conn: &mut PgConnection,
        trigger: &Trigger,
        state: TriggerState,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.q.update_trigger)
            .bind(&self.cfg.sched_name)
            .bind(&trigger.key.name)
            .bind(&trigger.key.group)
            .bind(&trigger.job_key.name)
            .bind(&trigger.job_key.group)
            .bind(&trigger.description)
            .bind(trigger.next_fire_time.map(to_millis))
            .bind(trigger.previous_fire_time.map(to_millis))
            .bind(trigger.priority)
            .bind(state.as_str())
            .bind(trigger.schedule.discriminator().to_string())
            .bind(to_millis(trigger.start_time))
            .bind(trigger.end_time.map(to_millis))
            .bind(&trigger.calendar_name)
            .bind(trigger.misfire_policy.code())
            .bind(self.serialize_data(&trigger.data)?)
            .execute(&mut *conn)
            .await?;
        self.delegate_for(&trigger.schedule)?
            .update_extended(conn, &self.cfg.sched_name, trigger)
            .await
    }

    async fn delete_trigger_rows(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
        schedule: &TriggerSchedule,
    ) -> Result<bool, StoreError> {
        self.delegate_for(schedule)?
            .delete_extended(&mut *conn, &self.cfg.sched_name, key)
            .await?;
        let result = sqlx::query(&self.q.delete_trigger)
            .bind(&self.cfg.sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn trigger_state_of(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
    ) -> Result<Option<TriggerState>, StoreError> {
        let row = sqlx::query(&self.q.select_trigger_state)
            .bind(&self.cfg.sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_optional(conn)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let s: String = row.try_get("trigger_state")?;
                Ok(TriggerState::parse(&s))
            }
        }
    }

    async fn set_trigger_state(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
        state: TriggerState,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(&self.q.update_trigger_state)
            .bind(&self.cfg.sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .bind(state.as_str())
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Guarded transition: only rows currently in one of `from` move to
    /// `to`. The returned count is how peers lose acquire races.
    async fn set_trigger_state_from(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
        to: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let result = sqlx::query(&self.q.update_trigger_state_from_states)
            .bind(&self.cfg.sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .bind(to.as_str())
            .bind(&from)
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn set_trigger_states_for_job_from(
        &self,
        conn: &mut PgConnection,
        job_key: &JobKey,
        to: TriggerState,
        from: &[TriggerState],
    ) -> Result<u64, StoreError> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let result = sqlx::query(&self.q.update_trigger_states_for_job_from_states)
            .bind(&self.cfg.sched_name)
            .bind(&job_key.name)
            .bind(&job_key.group)
            .bind(to.as_str())
            .bind(&from)
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn load_calendar_in_tx(
        &self,
        conn: &mut PgConnection,
        name: &str,
    ) -> Result<Option<ExclusionCalendar>, StoreError> {
        let row = sqlx::query(&self.q.select_calendar)
            .bind(&self.cfg.sched_name)
            .bind(name)
            .fetch_optional(conn)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let bytes: Vec<u8> = row.try_get("calendar")?;
                serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(|e| StoreError::Fatal(format!("Undeserializable calendar: {}", e)))
            }
        }
    }

    async fn calendar_for_trigger(
        &self,
        conn: &mut PgConnection,
        trigger: &Trigger,
    ) -> Result<Option<ExclusionCalendar>, StoreError> {
        match &trigger.calendar_name {
            None => Ok(None),
            Some(name) => self.load_calendar_in_tx(conn, name).await,
        }
    }

    async fn paused_groups_in_tx(
        &self,
        conn: &mut PgConnection,
    ) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(&self.q.select_paused_groups)
            .bind(&self.cfg.sched_name)
            .fetch_all(conn)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("trigger_group").map_err(Into::into))
            .collect()
    }

    async fn keys_from(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        name_col: &str,
        group_col: &str,
    ) -> Result<Vec<Key>, StoreError> {
        let rows = sqlx::query(sql)
            .bind(&self.cfg.sched_name)
            .fetch_all(conn)
            .await?;
        rows.iter()
            .map(|r| {
                Ok(Key::new(
                    r.try_get::<String, _>(name_col)?,
                    r.try_get::<String, _>(group_col)?,
                ))
            })
            .collect()
    }

    async fn trigger_keys_for_job(
        &self,
        conn: &mut PgConnection,
        job_key: &JobKey,
    ) -> Result<Vec<TriggerKey>, StoreError> {
        let rows = sqlx::query(&self.q.select_trigger_keys_for_job)
            .bind(&self.cfg.sched_name)
            .bind(&job_key.name)
            .bind(&job_key.group)
            .fetch_all(conn)
            .await?;
        rows.iter()
            .map(|r| {
                Ok(Key::new(
                    r.try_get::<String, _>("trigger_name")?,
                    r.try_get::<String, _>("trigger_group")?,
                ))
            })
            .collect()
    }

    /// Remove a trigger and, when its job is non-durable and unreferenced,
    /// the job as well.
    async fn remove_trigger_in_tx(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
        remove_orphaned_job: bool,
    ) -> Result<bool, StoreError> {
        let Some((trigger, _state)) = self.load_trigger(conn, key).await? else {
            return Ok(false);
        };
        let removed = self
            .delete_trigger_rows(conn, key, &trigger.schedule)
            .await?;

        if removed && remove_orphaned_job {
            let row = sqlx::query(&self.q.count_triggers_for_job)
                .bind(&self.cfg.sched_name)
                .bind(&trigger.job_key.name)
                .bind(&trigger.job_key.group)
                .fetch_one(&mut *conn)
                .await?;
            let remaining: i64 = row.try_get("cnt")?;
            if remaining == 0 {
                if let Some(job) = self.load_job(conn, &trigger.job_key).await? {
                    if !job.durable {
                        sqlx::query(&self.q.delete_job)
                            .bind(&self.cfg.sched_name)
                            .bind(&trigger.job_key.name)
                            .bind(&trigger.job_key.group)
                            .execute(conn)
                            .await?;
                        debug!(job = %trigger.job_key, "Removed non-durable job with no remaining triggers");
                    }
                }
            }
        }
        Ok(removed)
    }

    async fn store_trigger_in_tx(
        &self,
        conn: &mut PgConnection,
        mut trigger: Trigger,
        replace: bool,
        forced_state: Option<TriggerState>,
    ) -> Result<(), StoreError> {
        trigger.validate()?;

        let existing = self.trigger_state_of(conn, &trigger.key).await?;
        if existing.is_some() && !replace {
            return Err(StoreError::AlreadyExists {
                kind: "Trigger",
                key: trigger.key.to_string(),
            });
        }
        if self.load_job(conn, &trigger.job_key).await?.is_none() {
            return Err(StoreError::JobNotFound(trigger.job_key.to_string()));
        }

        let calendar = match &trigger.calendar_name {
            Some(name) => match self.load_calendar_in_tx(conn, name).await? {
                Some(cal) => Some(cal),
                None => return Err(StoreError::CalendarNotFound(name.clone())),
            },
            None => None,
        };

        if trigger.next_fire_time.is_none() {
            if trigger.compute_first_fire_time(calendar.as_ref()).is_none() {
                return Err(ValidationError::InvalidFieldValue {
                    field: "schedule".to_string(),
                    reason: "trigger will never fire".to_string(),
                }
                .into());
            }
        }

        let state = match forced_state {
            Some(state) => state,
            None => {
                let paused_groups = self.paused_groups_in_tx(conn).await?;
                if paused_groups.contains(&trigger.key.group) {
                    TriggerState::Paused
                } else {
                    TriggerState::Waiting
                }
            }
        };

        if existing.is_some() {
            // replacing swaps the schedule tables too, so clear the old
            // extended row under its previous type first
            if let Some((old, _)) = self.load_trigger(conn, &trigger.key).await? {
                self.delegate_for(&old.schedule)?
                    .delete_extended(&mut *conn, &self.cfg.sched_name, &trigger.key)
                    .await?;
            }
            sqlx::query(&self.q.delete_trigger)
                .bind(&self.cfg.sched_name)
                .bind(&trigger.key.name)
                .bind(&trigger.key.group)
                .execute(&mut *conn)
                .await?;
        }
        self.insert_trigger_row(conn, &trigger, state).await
    }

    // ------------------------------------------------------------------
    // Misfire sweep
    // ------------------------------------------------------------------

    /// Remediate a bounded batch of misfired WAITING triggers. Returns the
    /// earliest new fire time among the remediated, for loop signaling, and
    /// whether more misfires may remain.
    #[instrument(skip(self))]
    pub async fn recover_misfired_jobs(
        &self,
    ) -> Result<(usize, Option<DateTime<Utc>>, bool), StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;

        let now = self.db_now(ltx.conn()).await?;
        let misfire_time = now - self.misfire_threshold();
        let limit = self.cfg.max_misfires_per_sweep;

        let rows = sqlx::query(&self.q.select_misfired_trigger_keys)
            .bind(&self.cfg.sched_name)
            .bind(to_millis(misfire_time))
            .bind(limit + 1)
            .fetch_all(&mut *ltx.conn())
            .await?;
        let have_more = rows.len() as i64 > limit;

        let mut misfired_triggers = Vec::new();
        let mut earliest: Option<DateTime<Utc>> = None;
        let mut handled = 0usize;

        for row in rows.iter().take(limit as usize) {
            let key = Key::new(
                row.try_get::<String, _>("trigger_name")?,
                row.try_get::<String, _>("trigger_group")?,
            );
            let Some((mut trigger, state)) = self.load_trigger(ltx.conn(), &key).await? else {
                continue;
            };
            if state != TriggerState::Waiting {
                continue;
            }
            let calendar = self.calendar_for_trigger(ltx.conn(), &trigger).await?;
            misfired_triggers.push(trigger.clone());
            trigger.update_after_misfire(calendar.as_ref(), now);

            let new_state = if trigger.next_fire_time.is_none() {
                TriggerState::Complete
            } else {
                TriggerState::Waiting
            };
            self.update_trigger_row(ltx.conn(), &trigger, new_state).await?;
            if let Some(next) = trigger.next_fire_time {
                earliest = Some(earliest.map_or(next, |e: DateTime<Utc>| e.min(next)));
            }
            handled += 1;
        }

        ltx.commit().await?;

        let signaler = self.signaler();
        for t in &misfired_triggers {
            signaler.notify_trigger_listeners_misfired(t).await;
        }
        if handled > 0 {
            metrics::counter!("scheduler_misfires_handled_total").increment(handled as u64);
            info!(handled, have_more, "Misfired triggers remediated");
        }
        Ok((handled, earliest, have_more))
    }

    fn spawn_misfire_handler(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self
            .misfire_handler_stop
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(stop_tx);

        let store = Arc::clone(self);
        tokio::spawn(async move {
            let period =
                std::time::Duration::from_millis((store.cfg.misfire_threshold_ms as u64).max(1_000));
            loop {
                match store.recover_misfired_jobs().await {
                    Ok((_, candidate, have_more)) => {
                        if let Some(candidate) = candidate {
                            store.signaler().signal_scheduling_change(Some(candidate));
                        }
                        if have_more {
                            // keep draining without waiting a full period
                            continue;
                        }
                    }
                    Err(e) if e.is_transient() => {
                        warn!(error = %e, "Misfire sweep failed, will retry");
                    }
                    Err(e) => {
                        let signaler = store.signaler();
                        signaler
                            .notify_scheduler_listeners_error(&format!(
                                "Misfire sweep failed: {}",
                                e
                            ))
                            .await;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Misfire handler stopped");
        });
    }

    // ------------------------------------------------------------------
    // Startup and cluster recovery
    // ------------------------------------------------------------------

    /// Non-clustered startup recovery: release orphaned claims from a prior
    /// run of this instance and synthesize recovery triggers for jobs that
    /// request it.
    #[instrument(skip(self))]
    async fn recover_own_state(&self) -> Result<(), StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;

        // claims from a previous incarnation go back to the waiting pool
        let from: Vec<&str> = vec![
            TriggerState::Acquired.as_str(),
            TriggerState::Blocked.as_str(),
        ];
        sqlx::query(&format!(
            "UPDATE {}triggers SET trigger_state = 'WAITING' \
             WHERE sched_name = $1 AND trigger_state = ANY($2)",
            self.cfg.table_prefix
        ))
        .bind(&self.cfg.sched_name)
        .bind(&from)
        .execute(&mut *ltx.conn())
        .await?;
        sqlx::query(&format!(
            "UPDATE {}triggers SET trigger_state = 'PAUSED' \
             WHERE sched_name = $1 AND trigger_state = 'PAUSED_BLOCKED'",
            self.cfg.table_prefix
        ))
        .bind(&self.cfg.sched_name)
        .execute(&mut *ltx.conn())
        .await?;

        let recovered = self
            .recover_fired_records(ltx.conn(), &self.cfg.instance_id.clone())
            .await?;

        // lingering complete triggers are deleted
        let complete: Vec<&str> = vec![TriggerState::Complete.as_str()];
        let rows = sqlx::query(&self.q.select_trigger_keys_in_states)
            .bind(&self.cfg.sched_name)
            .bind(&complete)
            .fetch_all(&mut *ltx.conn())
            .await?;
        let mut removed = 0usize;
        for row in rows {
            let key = Key::new(
                row.try_get::<String, _>("trigger_name")?,
                row.try_get::<String, _>("trigger_group")?,
            );
            if self.remove_trigger_in_tx(ltx.conn(), &key, true).await? {
                removed += 1;
            }
        }

        ltx.commit().await?;
        info!(recovered, removed, "Startup state recovery finished");
        Ok(())
    }

    /// Recover the fired-trigger rows of one instance: release claims,
    /// unblock jobs and synthesize one-shot recovery triggers for jobs
    /// requesting recovery. Runs inside the caller's locked transaction.
    async fn recover_fired_records(
        &self,
        conn: &mut PgConnection,
        instance_id: &str,
    ) -> Result<usize, StoreError> {
        let rows = sqlx::query(&self.q.select_fired_triggers_for_instance)
            .bind(&self.cfg.sched_name)
            .bind(instance_id)
            .fetch_all(&mut *conn)
            .await?;

        let mut recovered = 0usize;
        for row in rows {
            let record = fired_record_from_row(&row)?;
            let trigger_key = record.trigger_key.clone();

            // release the claim
            self.set_trigger_state_from(
                conn,
                &trigger_key,
                TriggerState::Waiting,
                &[TriggerState::Acquired, TriggerState::Blocked],
            )
            .await?;
            self.set_trigger_state_from(
                conn,
                &trigger_key,
                TriggerState::Paused,
                &[TriggerState::PausedBlocked],
            )
            .await?;

            // unblock the job the dead instance was executing
            if record.disallow_concurrent_execution {
                if let Some(job_key) = &record.job_key {
                    self.set_trigger_states_for_job_from(
                        conn,
                        job_key,
                        TriggerState::Waiting,
                        &[TriggerState::Blocked],
                    )
                    .await?;
                    self.set_trigger_states_for_job_from(
                        conn,
                        job_key,
                        TriggerState::Paused,
                        &[TriggerState::PausedBlocked],
                    )
                    .await?;
                }
            }

            if record.state == FiredState::Executing && record.requests_recovery {
                if let Some(job_key) = record.job_key.clone() {
                    let trigger_data = self
                        .load_trigger(conn, &trigger_key)
                        .await?
                        .map(|(t, _)| t.data)
                        .unwrap_or_default();
                    let recovery =
                        self.build_recovery_trigger(&record, &job_key, trigger_data);
                    self.store_trigger_in_tx(conn, recovery, false, Some(TriggerState::Waiting))
                        .await?;
                    recovered += 1;
                }
            }

            // claims on spent triggers are simply discarded
            if self.trigger_state_of(conn, &trigger_key).await? == Some(TriggerState::Complete) {
                self.remove_trigger_in_tx(conn, &trigger_key, true).await?;
            }
        }

        sqlx::query(&self.q.delete_fired_triggers_for_instance)
            .bind(&self.cfg.sched_name)
            .bind(instance_id)
            .execute(&mut *conn)
            .await?;
        Ok(recovered)
    }

    fn build_recovery_trigger(
        &self,
        record: &FiredTriggerRecord,
        job_key: &JobKey,
        mut data: JobDataMap,
    ) -> Trigger {
        data.put(
            RECOVERY_ORIG_TRIGGER_NAME,
            record.trigger_key.name.clone(),
        );
        data.put(
            RECOVERY_ORIG_TRIGGER_GROUP,
            record.trigger_key.group.clone(),
        );
        data.put(
            RECOVERY_ORIG_FIRE_TIME_MS,
            to_millis(record.fired_time).to_string(),
        );
        data.put(
            RECOVERY_ORIG_SCHEDULED_FIRE_TIME_MS,
            to_millis(record.scheduled_time).to_string(),
        );
        data.clear_dirty_flag();

        let name = format!("recover_{}_{}", record.instance_id, record.fire_instance_id);
        let mut trigger = Trigger::new(
            Key::new(name, RECOVERING_JOBS_GROUP),
            job_key.clone(),
            TriggerSchedule::Simple {
                repeat_interval_ms: 0,
                repeat_count: 0,
                times_triggered: 0,
            },
        )
        .with_start_time(record.scheduled_time)
        .with_priority(record.priority)
        .with_misfire_policy(MisfirePolicy::IgnoreMisfires)
        .with_data(data);
        // the one-shot keeps the missed instant as its fire time, so
        // recovered fires stay in their original chronological order; the
        // ignore-misfires policy stops the sweep from rescheduling it
        trigger.next_fire_time = Some(record.scheduled_time);
        trigger
    }

    // ------------------------------------------------------------------
    // Cluster coordination, driven by the cluster manager
    // ------------------------------------------------------------------

    /// Record this instance's heartbeat and report peers that have stopped
    /// checking in. Uses the database clock exclusively.
    #[instrument(skip(self))]
    pub async fn cluster_checkin(&self) -> Result<Vec<SchedulerStateRecord>, StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[STATE_ACCESS])
            .await?;
        let now = self.db_now(ltx.conn()).await?;

        let updated = sqlx::query(&self.q.update_scheduler_state)
            .bind(&self.cfg.sched_name)
            .bind(&self.cfg.instance_id)
            .bind(to_millis(now))
            .execute(&mut *ltx.conn())
            .await?
            .rows_affected();
        if updated == 0 {
            sqlx::query(&self.q.insert_scheduler_state)
                .bind(&self.cfg.sched_name)
                .bind(&self.cfg.instance_id)
                .bind(to_millis(now))
                .bind(self.cfg.cluster_checkin_interval_ms)
                .execute(&mut *ltx.conn())
                .await?;
        }

        let failed = self.find_failed_instances(ltx.conn(), now).await?;
        ltx.commit().await?;
        Ok(failed)
    }

    async fn find_failed_instances(
        &self,
        conn: &mut PgConnection,
        now: DateTime<Utc>,
    ) -> Result<Vec<SchedulerStateRecord>, StoreError> {
        let rows = sqlx::query(&self.q.select_scheduler_states)
            .bind(&self.cfg.sched_name)
            .fetch_all(&mut *conn)
            .await?;

        let mut failed = Vec::new();
        for row in rows {
            let record = SchedulerStateRecord {
                instance_id: row.try_get("instance_name")?,
                last_checkin: from_millis(row.try_get("last_checkin_time")?),
                checkin_interval_ms: row.try_get("checkin_interval")?,
            };
            if record.instance_id == self.cfg.instance_id {
                continue;
            }
            let interval = record
                .checkin_interval_ms
                .max(self.cfg.cluster_checkin_interval_ms);
            let deadline =
                record.last_checkin + Duration::milliseconds(interval * 2 + 500);
            if deadline < now {
                failed.push(record);
            }
        }
        Ok(failed)
    }

    /// Take over the in-flight fires of dead peers: release their claims,
    /// synthesize recovery triggers and drop their state rows.
    #[instrument(skip(self, failed), fields(failed = failed.len()))]
    pub async fn cluster_recover(
        &self,
        failed: &[SchedulerStateRecord],
    ) -> Result<(), StoreError> {
        if failed.is_empty() {
            return Ok(());
        }

        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS, STATE_ACCESS])
            .await?;

        for peer in failed {
            info!(instance = %peer.instance_id, "Recovering fired triggers of failed instance");
            let recovered = self
                .recover_fired_records(ltx.conn(), &peer.instance_id)
                .await?;
            sqlx::query(&self.q.delete_scheduler_state)
                .bind(&self.cfg.sched_name)
                .bind(&peer.instance_id)
                .execute(&mut *ltx.conn())
                .await?;
            metrics::counter!("scheduler_cluster_recoveries_total").increment(1);
            info!(
                instance = %peer.instance_id,
                recovered,
                "Failed instance recovered"
            );
        }

        ltx.commit().await?;
        self.signaler().signal_scheduling_change(None);
        Ok(())
    }
}

fn fired_record_from_row(row: &PgRow) -> Result<FiredTriggerRecord, StoreError> {
    let state_str: String = row.try_get("state")?;
    let job_name: Option<String> = row.try_get("job_name")?;
    let job_group: Option<String> = row.try_get("job_group")?;
    Ok(FiredTriggerRecord {
        fire_instance_id: row.try_get("entry_id")?,
        trigger_key: Key::new(
            row.try_get::<String, _>("trigger_name")?,
            row.try_get::<String, _>("trigger_group")?,
        ),
        job_key: match (job_name, job_group) {
            (Some(n), Some(g)) => Some(Key::new(n, g)),
            _ => None,
        },
        instance_id: row.try_get("instance_name")?,
        fired_time: from_millis(row.try_get("fired_time")?),
        scheduled_time: from_millis(row.try_get("sched_time")?),
        state: FiredState::parse(&state_str)
            .ok_or_else(|| StoreError::Fatal(format!("unknown fired state '{}'", state_str)))?,
        disallow_concurrent_execution: row.try_get("is_nonconcurrent")?,
        requests_recovery: row.try_get("requests_recovery")?,
        priority: row.try_get("priority")?,
    })
}

#[async_trait]
impl JobStore for ClusteredJobStore {
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> Result<(), StoreError> {
        *self.signaler.write().unwrap_or_else(|e| e.into_inner()) = signaler;

        // schema presence check; failure here is fatal, not retryable
        sqlx::query(&format!(
            "SELECT COUNT(*) FROM {}locks WHERE sched_name = $1",
            self.cfg.table_prefix
        ))
        .bind(&self.cfg.sched_name)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| StoreError::Fatal(format!("Schema check failed: {}", e)))?;

        if !self.cfg.is_clustered {
            self.recover_own_state().await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        if let Some(stop) = self
            .misfire_handler_stop
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = stop.send(true);
        }
        if self.cfg.is_clustered {
            let mut ltx = self
                .locks
                .begin_locked(self.pool.pool(), &[STATE_ACCESS])
                .await?;
            sqlx::query(&self.q.delete_scheduler_state)
                .bind(&self.cfg.sched_name)
                .bind(&self.cfg.instance_id)
                .execute(&mut *ltx.conn())
                .await?;
            ltx.commit().await?;
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job = %job.key))]
    async fn store_job(&self, job: JobDetail, replace: bool) -> Result<(), StoreError> {
        job.validate()?;
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;

        let exists = self.load_job(ltx.conn(), &job.key).await?.is_some();
        if exists && !replace {
            return Err(StoreError::AlreadyExists {
                kind: "Job",
                key: job.key.to_string(),
            });
        }

        let sql = if exists {
            &self.q.update_job
        } else {
            &self.q.insert_job
        };
        sqlx::query(sql)
            .bind(&self.cfg.sched_name)
            .bind(&job.key.name)
            .bind(&job.key.group)
            .bind(&job.description)
            .bind(&job.job_type)
            .bind(job.durable)
            .bind(job.disallow_concurrent_execution)
            .bind(job.persist_data_after_execution)
            .bind(job.requests_recovery)
            .bind(self.serialize_data(&job.data)?)
            .execute(&mut *ltx.conn())
            .await?;

        ltx.commit().await
    }

    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<(), StoreError> {
        let candidate = trigger.next_fire_time;
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;
        self.store_trigger_in_tx(ltx.conn(), trigger, replace, None)
            .await?;
        ltx.commit().await?;
        self.signaler().signal_scheduling_change(candidate);
        Ok(())
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;

        for tk in self.trigger_keys_for_job(ltx.conn(), key).await? {
            if let Some((trigger, _)) = self.load_trigger(ltx.conn(), &tk).await? {
                self.delete_trigger_rows(ltx.conn(), &tk, &trigger.schedule)
                    .await?;
            }
        }
        let removed = sqlx::query(&self.q.delete_job)
            .bind(&self.cfg.sched_name)
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut *ltx.conn())
            .await?
            .rows_affected()
            > 0;

        ltx.commit().await?;
        Ok(removed)
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;
        let removed = self.remove_trigger_in_tx(ltx.conn(), key, true).await?;
        ltx.commit().await?;
        Ok(removed)
    }

    async fn replace_trigger(
        &self,
        key: &TriggerKey,
        new_trigger: Trigger,
    ) -> Result<bool, StoreError> {
        let candidate = new_trigger.next_fire_time;
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;

        let Some((old, _)) = self.load_trigger(ltx.conn(), key).await? else {
            ltx.rollback().await?;
            return Ok(false);
        };
        if old.job_key != new_trigger.job_key {
            ltx.rollback().await?;
            return Err(ValidationError::InvalidFieldValue {
                field: "job_key".to_string(),
                reason: "replacement trigger must reference the same job".to_string(),
            }
            .into());
        }

        self.delete_trigger_rows(ltx.conn(), key, &old.schedule).await?;
        self.store_trigger_in_tx(ltx.conn(), new_trigger, false, None)
            .await?;
        ltx.commit().await?;
        self.signaler().signal_scheduling_change(candidate);
        Ok(true)
    }

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError> {
        let mut conn = self.pool.pool().acquire().await?;
        self.load_job(&mut conn, key).await
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        let mut conn = self.pool.pool().acquire().await?;
        Ok(self.load_trigger(&mut conn, key).await?.map(|(t, _)| t))
    }

    async fn check_job_exists(&self, key: &JobKey) -> Result<bool, StoreError> {
        Ok(self.retrieve_job(key).await?.is_some())
    }

    async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let mut conn = self.pool.pool().acquire().await?;
        Ok(self.trigger_state_of(&mut conn, key).await?.is_some())
    }

    async fn clear_all_scheduling_data(&self) -> Result<(), StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;
        for sql in &self.q.delete_all {
            sqlx::query(sql)
                .bind(&self.cfg.sched_name)
                .execute(&mut *ltx.conn())
                .await?;
        }
        ltx.commit().await
    }

    async fn get_job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>, StoreError> {
        let mut conn = self.pool.pool().acquire().await?;
        let mut keys = self
            .keys_from(&mut conn, &self.q.select_job_keys, "job_name", "job_group")
            .await?;
        keys.retain(|k| matcher.matches_key(k));
        keys.sort();
        Ok(keys)
    }

    async fn get_trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>, StoreError> {
        let mut conn = self.pool.pool().acquire().await?;
        let mut keys = self
            .keys_from(
                &mut conn,
                &self.q.select_trigger_keys,
                "trigger_name",
                "trigger_group",
            )
            .await?;
        keys.retain(|k| matcher.matches_key(k));
        keys.sort();
        Ok(keys)
    }

    async fn get_job_group_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(&self.q.select_job_groups)
            .bind(&self.cfg.sched_name)
            .fetch_all(self.pool.pool())
            .await?;
        let mut groups: Vec<String> = rows
            .iter()
            .map(|r| r.try_get("job_group"))
            .collect::<Result<_, _>>()?;
        groups.sort();
        Ok(groups)
    }

    async fn get_trigger_group_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(&self.q.select_trigger_groups)
            .bind(&self.cfg.sched_name)
            .fetch_all(self.pool.pool())
            .await?;
        let mut groups: Vec<String> = rows
            .iter()
            .map(|r| r.try_get("trigger_group"))
            .collect::<Result<_, _>>()?;
        groups.sort();
        Ok(groups)
    }

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, StoreError> {
        let mut conn = self.pool.pool().acquire().await?;
        let mut triggers = Vec::new();
        for tk in self.trigger_keys_for_job(&mut conn, key).await? {
            if let Some((t, _)) = self.load_trigger(&mut conn, &tk).await? {
                triggers.push(t);
            }
        }
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
        let bytes = serde_json::to_vec(&calendar)?;
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;

        let exists = self.load_calendar_in_tx(ltx.conn(), name).await?.is_some();
        if exists && !replace {
            return Err(StoreError::AlreadyExists {
                kind: "Calendar",
                key: name.to_string(),
            });
        }
        let sql = if exists {
            &self.q.update_calendar
        } else {
            &self.q.insert_calendar
        };
        sqlx::query(sql)
            .bind(&self.cfg.sched_name)
            .bind(name)
            .bind(&bytes)
            .execute(&mut *ltx.conn())
            .await?;

        if exists && update_triggers {
            let rows = sqlx::query(&self.q.select_trigger_keys_using_calendar)
                .bind(&self.cfg.sched_name)
                .bind(name)
                .fetch_all(&mut *ltx.conn())
                .await?;
            for row in rows {
                let key = Key::new(
                    row.try_get::<String, _>("trigger_name")?,
                    row.try_get::<String, _>("trigger_group")?,
                );
                if let Some((mut trigger, state)) = self.load_trigger(ltx.conn(), &key).await? {
                    trigger.compute_first_fire_time(Some(&calendar));
                    let new_state = if trigger.next_fire_time.is_none() {
                        TriggerState::Complete
                    } else {
                        state
                    };
                    self.update_trigger_row(ltx.conn(), &trigger, new_state).await?;
                }
            }
        }

        ltx.commit().await?;
        if update_triggers {
            self.signaler().signal_scheduling_change(None);
        }
        Ok(())
    }

    async fn remove_calendar(&self, name: &str) -> Result<bool, StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;
        let row = sqlx::query(&self.q.count_triggers_using_calendar)
            .bind(&self.cfg.sched_name)
            .bind(name)
            .fetch_one(&mut *ltx.conn())
            .await?;
        let referenced: i64 = row.try_get("cnt")?;
        if referenced > 0 {
            ltx.rollback().await?;
            return Err(StoreError::CalendarInUse(name.to_string()));
        }
        let removed = sqlx::query(&self.q.delete_calendar)
            .bind(&self.cfg.sched_name)
            .bind(name)
            .execute(&mut *ltx.conn())
            .await?
            .rows_affected()
            > 0;
        ltx.commit().await?;
        Ok(removed)
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<ExclusionCalendar>, StoreError> {
        let mut conn = self.pool.pool().acquire().await?;
        self.load_calendar_in_tx(&mut conn, name).await
    }

    async fn get_calendar_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(&self.q.select_calendar_names)
            .bind(&self.cfg.sched_name)
            .fetch_all(self.pool.pool())
            .await?;
        rows.iter()
            .map(|r| r.try_get("calendar_name").map_err(Into::into))
            .collect()
    }

    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<TriggerStateView, StoreError> {
        let mut conn = self.pool.pool().acquire().await?;
        Ok(self
            .trigger_state_of(&mut conn, key)
            .await?
            .map(TriggerStateView::from)
            .unwrap_or(TriggerStateView::None))
    }

    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;
        let paused = self.paused_groups_in_tx(ltx.conn()).await?;
        let target = if paused.contains(&key.group) {
            TriggerState::Paused
        } else {
            TriggerState::Waiting
        };
        self.set_trigger_state_from(ltx.conn(), key, target, &[TriggerState::Error])
            .await?;
        ltx.commit().await?;
        self.signaler().signal_scheduling_change(None);
        Ok(())
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;
        self.set_trigger_state_from(
            ltx.conn(),
            key,
            TriggerState::Paused,
            &[
                TriggerState::Waiting,
                TriggerState::Acquired,
                TriggerState::Error,
            ],
        )
        .await?;
        self.set_trigger_state_from(
            ltx.conn(),
            key,
            TriggerState::PausedBlocked,
            &[TriggerState::Blocked],
        )
        .await?;
        ltx.commit().await
    }

    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;

        let mut groups: Vec<String> = match matcher {
            GroupMatcher::Equals(group) => vec![group.clone()],
            _ => {
                let rows = sqlx::query(&self.q.select_trigger_groups)
                    .bind(&self.cfg.sched_name)
                    .fetch_all(&mut *ltx.conn())
                    .await?;
                rows.iter()
                    .filter_map(|r| r.try_get::<String, _>("trigger_group").ok())
                    .filter(|g| matcher.matches(g))
                    .collect()
            }
        };
        groups.sort();
        groups.dedup();

        for group in &groups {
            sqlx::query(&self.q.insert_paused_group)
                .bind(&self.cfg.sched_name)
                .bind(group)
                .execute(&mut *ltx.conn())
                .await?;
        }

        let keys = self
            .keys_from(
                ltx.conn(),
                &self.q.select_trigger_keys,
                "trigger_name",
                "trigger_group",
            )
            .await?;
        for key in keys.iter().filter(|k| groups.contains(&k.group)) {
            self.set_trigger_state_from(
                ltx.conn(),
                key,
                TriggerState::Paused,
                &[
                    TriggerState::Waiting,
                    TriggerState::Acquired,
                    TriggerState::Error,
                ],
            )
            .await?;
            self.set_trigger_state_from(
                ltx.conn(),
                key,
                TriggerState::PausedBlocked,
                &[TriggerState::Blocked],
            )
            .await?;
        }

        ltx.commit().await?;
        Ok(groups)
    }

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;
        let candidate = self.resume_trigger_in_tx(ltx.conn(), key).await?;
        ltx.commit().await?;
        self.signaler().signal_scheduling_change(candidate);
        Ok(())
    }

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;

        let paused = self.paused_groups_in_tx(ltx.conn()).await?;
        let all_keys = self
            .keys_from(
                ltx.conn(),
                &self.q.select_trigger_keys,
                "trigger_name",
                "trigger_group",
            )
            .await?;

        let mut groups: Vec<String> = paused
            .iter()
            .filter(|g| matcher.matches(g))
            .cloned()
            .collect();
        groups.extend(
            all_keys
                .iter()
                .map(|k| k.group.clone())
                .filter(|g| matcher.matches(g)),
        );
        groups.sort();
        groups.dedup();

        for group in &groups {
            sqlx::query(&self.q.delete_paused_group)
                .bind(&self.cfg.sched_name)
                .bind(group)
                .execute(&mut *ltx.conn())
                .await?;
        }
        for key in all_keys.iter().filter(|k| groups.contains(&k.group)) {
            self.resume_trigger_in_tx(ltx.conn(), key).await?;
        }

        ltx.commit().await?;
        self.signaler().signal_scheduling_change(None);
        Ok(groups)
    }

    async fn pause_job(&self, key: &JobKey) -> Result<(), StoreError> {
        for tk in self.get_triggers_for_job(key).await? {
            self.pause_trigger(&tk.key).await?;
        }
        Ok(())
    }

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut groups: Vec<String> = self
            .get_job_keys(matcher)
            .await?
            .iter()
            .map(|k| k.group.clone())
            .collect();
        if let GroupMatcher::Equals(group) = matcher {
            groups.push(group.clone());
        }
        groups.sort();
        groups.dedup();

        for job_key in self.get_job_keys(matcher).await? {
            self.pause_job(&job_key).await?;
        }
        Ok(groups)
    }

    async fn resume_job(&self, key: &JobKey) -> Result<(), StoreError> {
        for trigger in self.get_triggers_for_job(key).await? {
            self.resume_trigger(&trigger.key).await?;
        }
        Ok(())
    }

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>, StoreError> {
        let mut groups = Vec::new();
        for job_key in self.get_job_keys(matcher).await? {
            groups.push(job_key.group.clone());
            self.resume_job(&job_key).await?;
        }
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn pause_all(&self) -> Result<(), StoreError> {
        self.pause_triggers(&GroupMatcher::Any).await?;
        Ok(())
    }

    async fn resume_all(&self) -> Result<(), StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;
        sqlx::query(&self.q.delete_all_paused_groups)
            .bind(&self.cfg.sched_name)
            .execute(&mut *ltx.conn())
            .await?;
        let keys = self
            .keys_from(
                ltx.conn(),
                &self.q.select_trigger_keys,
                "trigger_name",
                "trigger_group",
            )
            .await?;
        for key in &keys {
            self.resume_trigger_in_tx(ltx.conn(), key).await?;
        }
        ltx.commit().await?;
        self.signaler().signal_scheduling_change(None);
        Ok(())
    }

    async fn get_paused_trigger_groups(&self) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.pool.pool().acquire().await?;
        self.paused_groups_in_tx(&mut conn).await
    }

    #[instrument(skip(self), fields(max_count))]
    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>, StoreError> {
        let locks: &[&str] = if self.cfg.acquire_triggers_within_lock {
            &[TRIGGER_ACCESS]
        } else {
            &[]
        };
        let mut ltx = self.locks.begin_locked(self.pool.pool(), locks).await?;

        let now = self.db_now(ltx.conn()).await?;
        let misfire_time = now - self.misfire_threshold();

        let rows = sqlx::query(&self.q.select_next_trigger_keys)
            .bind(&self.cfg.sched_name)
            .bind(to_millis(no_later_than + time_window))
            .bind(to_millis(misfire_time))
            .bind(max_count as i64)
            .fetch_all(&mut *ltx.conn())
            .await?;

        let mut acquired = Vec::new();
        let mut jobs_claimed: HashSet<JobKey> = HashSet::new();
        let mut batch_end: Option<DateTime<Utc>> = None;

        for row in rows {
            let key = Key::new(
                row.try_get::<String, _>("trigger_name")?,
                row.try_get::<String, _>("trigger_group")?,
            );
            let Some((mut trigger, _state)) = self.load_trigger(ltx.conn(), &key).await? else {
                continue;
            };
            let Some(next) = trigger.next_fire_time else {
                continue;
            };
            if let Some(end) = batch_end {
                if next > end {
                    break;
                }
            }

            let job = self.load_job(ltx.conn(), &trigger.job_key).await?;
            let disallow_concurrent = job
                .as_ref()
                .map(|j| j.disallow_concurrent_execution)
                .unwrap_or(false);
            let requests_recovery = job.as_ref().map(|j| j.requests_recovery).unwrap_or(false);
            if disallow_concurrent && jobs_claimed.contains(&trigger.job_key) {
                continue;
            }

            // the guarded transition is the race arbiter between peers
            let claimed = self
                .set_trigger_state_from(
                    ltx.conn(),
                    &key,
                    TriggerState::Acquired,
                    &[TriggerState::Waiting],
                )
                .await?;
            if claimed == 0 {
                debug!(trigger = %key, "Trigger claimed by a peer, skipping");
                continue;
            }

            if disallow_concurrent {
                jobs_claimed.insert(trigger.job_key.clone());
            }

            let fire_instance_id = Uuid::new_v4().to_string();
            trigger.fire_instance_id = Some(fire_instance_id.clone());
            sqlx::query(&self.q.insert_fired_trigger)
                .bind(&self.cfg.sched_name)
                .bind(&fire_instance_id)
                .bind(&key.name)
                .bind(&key.group)
                .bind(&self.cfg.instance_id)
                .bind(to_millis(now))
                .bind(to_millis(next))
                .bind(trigger.priority)
                .bind(FiredState::Acquired.as_str())
                .bind(&trigger.job_key.name)
                .bind(&trigger.job_key.group)
                .bind(disallow_concurrent)
                .bind(requests_recovery)
                .execute(&mut *ltx.conn())
                .await?;

            if batch_end.is_none() {
                batch_end = Some(next.max(now) + time_window);
            }
            acquired.push(trigger);
        }

        ltx.commit().await?;
        if !acquired.is_empty() {
            metrics::counter!("scheduler_triggers_acquired_total")
                .increment(acquired.len() as u64);
        }
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;
        self.set_trigger_state_from(
            ltx.conn(),
            &trigger.key,
            TriggerState::Waiting,
            &[TriggerState::Acquired],
        )
        .await?;
        if let Some(id) = &trigger.fire_instance_id {
            sqlx::query(&self.q.delete_fired_trigger)
                .bind(&self.cfg.sched_name)
                .bind(id)
                .execute(&mut *ltx.conn())
                .await?;
        }
        ltx.commit().await
    }

    #[instrument(skip(self, triggers), fields(batch = triggers.len()))]
    async fn triggers_fired(
        &self,
        triggers: &[Trigger],
    ) -> Result<Vec<TriggerFiredResult>, StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;
        let now = self.db_now(ltx.conn()).await?;
        let mut results = Vec::with_capacity(triggers.len());

        for trigger in triggers {
            let state = self.trigger_state_of(ltx.conn(), &trigger.key).await?;
            if state != Some(TriggerState::Acquired) {
                results.push(TriggerFiredResult { bundle: None });
                continue;
            }
            let Some((mut stored, _)) = self.load_trigger(ltx.conn(), &trigger.key).await? else {
                results.push(TriggerFiredResult { bundle: None });
                continue;
            };
            let Some(job) = self.load_job(ltx.conn(), &stored.job_key).await? else {
                results.push(TriggerFiredResult { bundle: None });
                continue;
            };
            let calendar = self.calendar_for_trigger(ltx.conn(), &stored).await?;
            if stored.calendar_name.is_some() && calendar.is_none() {
                results.push(TriggerFiredResult { bundle: None });
                continue;
            }

            if let Some(id) = &trigger.fire_instance_id {
                sqlx::query(&self.q.update_fired_trigger_executing)
                    .bind(&self.cfg.sched_name)
                    .bind(id)
                    .bind(to_millis(now))
                    .execute(&mut *ltx.conn())
                    .await?;
            }

            let prev_fire_time = stored.previous_fire_time;
            stored.fire_instance_id = trigger.fire_instance_id.clone();
            stored.triggered(calendar.as_ref());

            let mut job_now_blocked = false;
            let mut new_state = TriggerState::Waiting;
            if job.disallow_concurrent_execution {
                job_now_blocked = true;
                new_state = TriggerState::Blocked;
                self.set_trigger_states_for_job_from(
                    ltx.conn(),
                    &job.key,
                    TriggerState::Blocked,
                    &[TriggerState::Waiting, TriggerState::Acquired],
                )
                .await?;
                self.set_trigger_states_for_job_from(
                    ltx.conn(),
                    &job.key,
                    TriggerState::PausedBlocked,
                    &[TriggerState::Paused],
                )
                .await?;
            }
            if stored.next_fire_time.is_none() {
                new_state = TriggerState::Complete;
            }
            self.update_trigger_row(ltx.conn(), &stored, new_state).await?;

            let scheduled_fire_time = stored.previous_fire_time.unwrap_or(now);
            results.push(TriggerFiredResult {
                bundle: Some(TriggerFiredBundle {
                    next_fire_time: stored.next_fire_time,
                    job,
                    trigger: stored,
                    calendar,
                    job_is_recovering: trigger.key.group == RECOVERING_JOBS_GROUP,
                    job_now_blocked,
                    fire_time: now,
                    scheduled_fire_time,
                    prev_fire_time,
                }),
            });
        }

        ltx.commit().await?;
        metrics::counter!("scheduler_triggers_fired_total")
            .increment(results.iter().filter(|r| r.bundle.is_some()).count() as u64);
        Ok(results)
    }

    #[instrument(skip(self, trigger, job_detail), fields(trigger = %trigger.key))]
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job_detail: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StoreError> {
        let mut ltx = self
            .locks
            .begin_locked(self.pool.pool(), &[TRIGGER_ACCESS])
            .await?;

        if let Some(id) = &trigger.fire_instance_id {
            sqlx::query(&self.q.delete_fired_trigger)
                .bind(&self.cfg.sched_name)
                .bind(id)
                .execute(&mut *ltx.conn())
                .await?;
        }

        if job_detail.persist_data_after_execution {
            let mut data = job_detail.data.clone();
            data.clear_dirty_flag();
            sqlx::query(&self.q.update_job_data)
                .bind(&self.cfg.sched_name)
                .bind(&job_detail.key.name)
                .bind(&job_detail.key.group)
                .bind(self.serialize_data(&data)?)
                .execute(&mut *ltx.conn())
                .await?;
        }

        if job_detail.disallow_concurrent_execution {
            self.set_trigger_states_for_job_from(
                ltx.conn(),
                &job_detail.key,
                TriggerState::Waiting,
                &[TriggerState::Blocked],
            )
            .await?;
            self.set_trigger_states_for_job_from(
                ltx.conn(),
                &job_detail.key,
                TriggerState::Paused,
                &[TriggerState::PausedBlocked],
            )
            .await?;
        }

        match instruction {
            CompletedExecutionInstruction::DeleteTrigger => {
                let stored_next = self
                    .load_trigger(ltx.conn(), &trigger.key)
                    .await?
                    .and_then(|(t, _)| t.next_fire_time);
                // a misfire may have rescheduled the trigger while the job
                // ran; in that case the delete is obsolete
                if !(trigger.next_fire_time.is_none() && stored_next.is_some()) {
                    self.remove_trigger_in_tx(ltx.conn(), &trigger.key, true)
                        .await?;
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.set_trigger_state(ltx.conn(), &trigger.key, TriggerState::Complete)
                    .await?;
            }
            CompletedExecutionInstruction::SetTriggerError => {
                warn!(trigger = %trigger.key, "Trigger entering ERROR state");
                self.set_trigger_state(ltx.conn(), &trigger.key, TriggerState::Error)
                    .await?;
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                for tk in self.trigger_keys_for_job(ltx.conn(), &job_detail.key).await? {
                    self.set_trigger_state(ltx.conn(), &tk, TriggerState::Complete)
                        .await?;
                }
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                for tk in self.trigger_keys_for_job(ltx.conn(), &job_detail.key).await? {
                    self.set_trigger_state(ltx.conn(), &tk, TriggerState::Error)
                        .await?;
                }
            }
            CompletedExecutionInstruction::Noop
            | CompletedExecutionInstruction::ReExecuteJob => {}
        }

        ltx.commit().await?;
        self.signaler().signal_scheduling_change(None);
        Ok(())
    }

    fn is_clustered(&self) -> bool {
        self.cfg.is_clustered
    }
}

impl ClusteredJobStore {
    async fn resume_trigger_in_tx(
        &self,
        conn: &mut PgConnection,
        key: &TriggerKey,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let resumed = self
            .set_trigger_state_from(conn, key, TriggerState::Waiting, &[TriggerState::Paused])
            .await?;
        self.set_trigger_state_from(
            conn,
            key,
            TriggerState::Blocked,
            &[TriggerState::PausedBlocked],
        )
        .await?;
        if resumed == 0 {
            return Ok(None);
        }
        Ok(self
            .load_trigger(conn, key)
            .await?
            .and_then(|(t, _)| t.next_fire_time))
    }

    /// Start the background misfire sweep. Called once by the scheduler
    /// after `initialize`.
    pub fn start_misfire_handler(self: &Arc<Self>) {
        self.spawn_misfire_handler();
    }
}
