// Database-backed scenario tests for the clustered job store.
//
// All tests require a running PostgreSQL instance and are ignored by
// default. Run with:
//   DATABASE_URL=postgresql://... cargo test --test integration_tests -- --ignored --test-threads=1

use chrono::{Duration, Utc};
use common::calendar::ExclusionCalendar;
use common::cron::CronExpression;
use common::models::{
    CompletedExecutionInstruction, GroupMatcher, IntervalUnit, JobDataMap, JobDetail, Key,
    TimeOfDay, TriggerStateView, RECOVERING_JOBS_GROUP,
};
use common::schedule::{Trigger, TriggerSchedule, REPEAT_INDEFINITELY};
use common::store::{JobStore, NullSignaler, RECOVERY_ORIG_SCHEDULED_FIRE_TIME_MS};
use integration_tests::{connect, properties_mode_store, reset_schema, store_for_instance};
use std::collections::BTreeSet;
use std::sync::Arc;

fn due_simple_trigger(job: &str, name: &str) -> Trigger {
    Trigger::new(
        Key::of(name),
        Key::of(job),
        TriggerSchedule::Simple {
            repeat_interval_ms: 60_000,
            repeat_count: REPEAT_INDEFINITELY,
            times_triggered: 0,
        },
    )
    .with_start_time(Utc::now() - Duration::seconds(1))
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL instance
async fn test_job_data_round_trip_blob_mode() {
    let pool = connect().await;
    reset_schema(&pool).await;
    let store = store_for_instance(&pool, "node-1", 7_500);
    store.initialize(Arc::new(NullSignaler)).await.unwrap();

    let mut data = JobDataMap::new();
    data.put("a", "1");
    data.put("b", "2");
    data.put("count", 42);
    let job = JobDetail::new(Key::of("blob-job"), "noop")
        .durable(true)
        .with_data(data.clone());
    store.store_job(job, false).await.unwrap();

    let loaded = store
        .retrieve_job(&Key::of("blob-job"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data.get_string("a"), Some("1"));
    assert_eq!(loaded.data.get_string("b"), Some("2"));
    assert_eq!(loaded.data.get_i64("count"), Some(42));
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL instance
async fn test_job_data_round_trip_properties_mode() {
    let pool = connect().await;
    reset_schema(&pool).await;
    let store = properties_mode_store(&pool);
    store.initialize(Arc::new(NullSignaler)).await.unwrap();

    let data: JobDataMap = [("a", "1"), ("b", "2")].into_iter().collect();
    let job = JobDetail::new(Key::of("props-job"), "noop")
        .durable(true)
        .with_data(data);
    store.store_job(job, false).await.unwrap();

    let loaded = store
        .retrieve_job(&Key::of("props-job"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data.get_string("a"), Some("1"));
    assert_eq!(loaded.data.get_string("b"), Some("2"));

    // non-string values are rejected before any state change
    let mut bad = JobDataMap::new();
    bad.put("n", 7);
    let job = JobDetail::new(Key::of("bad-job"), "noop")
        .durable(true)
        .with_data(bad);
    assert!(store.store_job(job, false).await.is_err());
    assert!(!store.check_job_exists(&Key::of("bad-job")).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL instance
async fn test_trigger_round_trip_every_schedule_type() {
    let pool = connect().await;
    reset_schema(&pool).await;
    let store = store_for_instance(&pool, "node-1", 7_500);
    store.initialize(Arc::new(NullSignaler)).await.unwrap();

    store
        .store_job(JobDetail::new(Key::of("j"), "noop").durable(true), false)
        .await
        .unwrap();

    let start = Utc::now() + Duration::minutes(5);
    let schedules: Vec<(&str, TriggerSchedule)> = vec![
        (
            "simple",
            TriggerSchedule::Simple {
                repeat_interval_ms: 30_000,
                repeat_count: 11,
                times_triggered: 0,
            },
        ),
        (
            "cron",
            TriggerSchedule::Cron {
                expression: CronExpression::parse_in_zone(
                    "0 0 9 ? * MON-FRI",
                    chrono_tz::Europe::Vienna,
                )
                .unwrap(),
            },
        ),
        (
            "calendar-interval",
            TriggerSchedule::CalendarInterval {
                interval: 2,
                unit: IntervalUnit::Month,
                time_zone: chrono_tz::UTC,
                preserve_hour_across_dst: true,
                skip_day_if_hour_does_not_exist: false,
            },
        ),
        (
            "daily",
            TriggerSchedule::DailyTimeInterval {
                interval: 72,
                unit: IntervalUnit::Minute,
                days_of_week: [2u8, 3, 4, 5, 6].into_iter().collect::<BTreeSet<_>>(),
                start_time_of_day: TimeOfDay::new(8, 0, 0).unwrap(),
                end_time_of_day: TimeOfDay::new(17, 0, 0).unwrap(),
                repeat_count: REPEAT_INDEFINITELY,
                times_triggered: 0,
                time_zone: chrono_tz::UTC,
            },
        ),
    ];

    for (name, schedule) in schedules {
        let trigger = Trigger::new(Key::of(name), Key::of("j"), schedule)
            .with_start_time(start)
            .with_priority(7);
        store.store_trigger(trigger, false).await.unwrap();

        let loaded = store
            .retrieve_trigger(&Key::of(name))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.priority, 7);
        assert!(loaded.next_fire_time.is_some(), "{} lost its fire time", name);
        // the schedule advances identically before and after the round trip
        let probe = start + Duration::days(3);
        let original = Trigger::new(
            Key::of(name),
            Key::of("j"),
            loaded.schedule.clone(),
        )
        .with_start_time(start);
        assert_eq!(
            loaded.fire_time_after(probe, None),
            original.fire_time_after(probe, None),
            "{} diverged after round trip",
            name
        );
    }
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL instance
async fn test_pause_resume_group_against_database() {
    let pool = connect().await;
    reset_schema(&pool).await;
    let store = store_for_instance(&pool, "node-1", 7_500);
    store.initialize(Arc::new(NullSignaler)).await.unwrap();

    store
        .store_job(JobDetail::new(Key::of("j"), "noop").durable(true), false)
        .await
        .unwrap();
    let mut trigger = due_simple_trigger("j", "t1");
    trigger.key = Key::new("t1", "GroupA");
    store.store_trigger(trigger, false).await.unwrap();

    store
        .pause_triggers(&GroupMatcher::Equals("GroupA".to_string()))
        .await
        .unwrap();
    assert_eq!(
        store
            .get_trigger_state(&Key::new("t1", "GroupA"))
            .await
            .unwrap(),
        TriggerStateView::Paused
    );

    // sticky: a trigger stored into the paused group starts paused
    let mut late = due_simple_trigger("j", "t2");
    late.key = Key::new("t2", "GroupA");
    store.store_trigger(late, false).await.unwrap();
    assert_eq!(
        store
            .get_trigger_state(&Key::new("t2", "GroupA"))
            .await
            .unwrap(),
        TriggerStateView::Paused
    );

    store
        .resume_triggers(&GroupMatcher::Equals("GroupA".to_string()))
        .await
        .unwrap();
    for name in ["t1", "t2"] {
        assert_eq!(
            store
                .get_trigger_state(&Key::new(name, "GroupA"))
                .await
                .unwrap(),
            TriggerStateView::Normal
        );
    }
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL instance
async fn test_acquire_exclusivity_between_peers() {
    let pool = connect().await;
    reset_schema(&pool).await;
    let node1 = store_for_instance(&pool, "node-1", 7_500);
    let node2 = store_for_instance(&pool, "node-2", 7_500);
    node1.initialize(Arc::new(NullSignaler)).await.unwrap();
    node2.initialize(Arc::new(NullSignaler)).await.unwrap();

    node1
        .store_job(JobDetail::new(Key::of("j"), "noop").durable(true), false)
        .await
        .unwrap();
    node1
        .store_trigger(due_simple_trigger("j", "contested"), false)
        .await
        .unwrap();

    let deadline = Utc::now() + Duration::seconds(30);
    let (a, b) = tokio::join!(
        node1.acquire_next_triggers(deadline, 1, Duration::zero()),
        node2.acquire_next_triggers(deadline, 1, Duration::zero()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // exactly one peer obtains the trigger; the other skips it silently
    assert_eq!(a.len() + b.len(), 1);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL instance
async fn test_failover_recovers_in_flight_fire() {
    let pool = connect().await;
    reset_schema(&pool).await;
    // short checkin interval so the failover deadline passes quickly
    let dying = store_for_instance(&pool, "dying-node", 200);
    let survivor = store_for_instance(&pool, "survivor-node", 200);
    dying.initialize(Arc::new(NullSignaler)).await.unwrap();
    survivor.initialize(Arc::new(NullSignaler)).await.unwrap();

    dying
        .store_job(
            JobDetail::new(Key::of("critical"), "noop")
                .durable(true)
                .requests_recovery(true),
            false,
        )
        .await
        .unwrap();
    dying
        .store_trigger(due_simple_trigger("critical", "t"), false)
        .await
        .unwrap();

    // the dying node claims and fires, then crashes before completing
    dying.cluster_checkin().await.unwrap();
    let acquired = dying
        .acquire_next_triggers(Utc::now() + Duration::seconds(30), 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    let scheduled_time = acquired[0].next_fire_time.unwrap();
    let fired = dying.triggers_fired(&acquired).await.unwrap();
    assert!(fired[0].bundle.is_some());
    drop(dying); // no completion, no further checkins

    // past the failover deadline the survivor detects and recovers
    tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
    let failed = survivor.cluster_checkin().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].instance_id, "dying-node");
    survivor.cluster_recover(&failed).await.unwrap();

    // a one-shot recovery trigger now exists, carrying the original
    // scheduled instant
    let recovery_keys = survivor
        .get_trigger_keys(&GroupMatcher::Equals(RECOVERING_JOBS_GROUP.to_string()))
        .await
        .unwrap();
    assert_eq!(recovery_keys.len(), 1);
    let recovery = survivor
        .retrieve_trigger(&recovery_keys[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovery.job_key, Key::of("critical"));
    // the one-shot is scheduled at the missed instant itself, keeping
    // recovered fires in their original chronological order
    assert_eq!(recovery.next_fire_time, Some(scheduled_time));
    assert_eq!(
        recovery
            .data
            .get_string(RECOVERY_ORIG_SCHEDULED_FIRE_TIME_MS)
            .and_then(|s| s.parse::<i64>().ok()),
        Some(scheduled_time.timestamp_millis())
    );

    // and it fires exactly once
    let acquired = survivor
        .acquire_next_triggers(Utc::now() + Duration::seconds(30), 10, Duration::zero())
        .await
        .unwrap();
    let recovered: Vec<_> = acquired
        .iter()
        .filter(|t| t.key.group == RECOVERING_JOBS_GROUP)
        .collect();
    assert_eq!(recovered.len(), 1);
    let fired = survivor.triggers_fired(&acquired).await.unwrap();
    let bundle = fired
        .iter()
        .filter_map(|r| r.bundle.as_ref())
        .find(|b| b.trigger.key.group == RECOVERING_JOBS_GROUP)
        .expect("recovery bundle");
    assert!(bundle.job_is_recovering);
    assert!(bundle.next_fire_time.is_none());

    survivor
        .triggered_job_complete(
            &bundle.trigger,
            &bundle.job,
            CompletedExecutionInstruction::DeleteTrigger,
        )
        .await
        .unwrap();
    assert!(!survivor
        .check_trigger_exists(&bundle.trigger.key)
        .await
        .unwrap());
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL instance
async fn test_calendar_excludes_fire_times_in_store() {
    let pool = connect().await;
    reset_schema(&pool).await;
    let store = store_for_instance(&pool, "node-1", 7_500);
    store.initialize(Arc::new(NullSignaler)).await.unwrap();

    store
        .store_calendar(
            "weekends",
            ExclusionCalendar::weekend(chrono_tz::UTC),
            false,
            false,
        )
        .await
        .unwrap();
    store
        .store_job(JobDetail::new(Key::of("j"), "noop").durable(true), false)
        .await
        .unwrap();

    let trigger = Trigger::new(
        Key::of("weekday-noon"),
        Key::of("j"),
        TriggerSchedule::Cron {
            expression: CronExpression::parse("0 0 12 * * ?").unwrap(),
        },
    )
    .with_calendar("weekends");
    store.store_trigger(trigger, false).await.unwrap();

    let loaded = store
        .retrieve_trigger(&Key::of("weekday-noon"))
        .await
        .unwrap()
        .unwrap();
    let calendar = store.retrieve_calendar("weekends").await.unwrap().unwrap();
    assert!(calendar.is_time_included(loaded.next_fire_time.unwrap()));

    // removal is refused while referenced
    assert!(store.remove_calendar("weekends").await.is_err());
}
