// Scenario tests for the job store contract, run against the in-memory
// store. The clustered store shares the contract; its database-backed
// scenarios live in the integration-tests crate.

use chrono::{Duration, Utc};
use common::models::{GroupMatcher, JobDetail, Key, TriggerStateView};
use common::schedule::{Trigger, TriggerSchedule, REPEAT_INDEFINITELY};
use common::store::memory::MemoryJobStore;
use common::store::JobStore;
use std::sync::Arc;

fn due_trigger(job: &str, name: &str, group: &str) -> Trigger {
    Trigger::new(
        Key::new(name, group),
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
async fn test_pause_resume_group_round_trip() {
    let store = MemoryJobStore::default();
    store
        .store_job(JobDetail::new(Key::of("j"), "noop").durable(true), false)
        .await
        .unwrap();
    store
        .store_trigger(due_trigger("j", "t", "GroupA"), false)
        .await
        .unwrap();

    store
        .pause_triggers(&GroupMatcher::Equals("GroupA".to_string()))
        .await
        .unwrap();
    assert_eq!(
        store
            .get_trigger_state(&Key::new("t", "GroupA"))
            .await
            .unwrap(),
        TriggerStateView::Paused
    );
    assert!(store
        .get_paused_trigger_groups()
        .await
        .unwrap()
        .contains("GroupA"));

    store
        .resume_triggers(&GroupMatcher::Equals("GroupA".to_string()))
        .await
        .unwrap();
    assert_eq!(
        store
            .get_trigger_state(&Key::new("t", "GroupA"))
            .await
            .unwrap(),
        TriggerStateView::Normal
    );
    assert!(store.get_paused_trigger_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_trigger_added_to_paused_group_starts_paused() {
    let store = MemoryJobStore::default();
    store
        .store_job(JobDetail::new(Key::of("j"), "noop").durable(true), false)
        .await
        .unwrap();

    // pausing an empty group is remembered
    store
        .pause_triggers(&GroupMatcher::Equals("GroupA".to_string()))
        .await
        .unwrap();
    store
        .store_trigger(due_trigger("j", "late-arrival", "GroupA"), false)
        .await
        .unwrap();

    assert_eq!(
        store
            .get_trigger_state(&Key::new("late-arrival", "GroupA"))
            .await
            .unwrap(),
        TriggerStateView::Paused
    );

    // and a paused trigger is never acquired
    let acquired = store
        .acquire_next_triggers(Utc::now() + Duration::seconds(30), 10, Duration::zero())
        .await
        .unwrap();
    assert!(acquired.is_empty());
}

#[tokio::test]
async fn test_durable_job_lifecycle() {
    let store = MemoryJobStore::default();

    // a non-durable job cannot exist without triggers beyond removal
    store
        .store_job(JobDetail::new(Key::of("transient"), "noop"), false)
        .await
        .unwrap();
    store
        .store_trigger(due_trigger("transient", "t1", "DEFAULT"), false)
        .await
        .unwrap();
    store.remove_trigger(&Key::of("t1")).await.unwrap();
    assert!(!store.check_job_exists(&Key::of("transient")).await.unwrap());

    // a durable job survives without triggers
    store
        .store_job(
            JobDetail::new(Key::of("durable"), "noop").durable(true),
            false,
        )
        .await
        .unwrap();
    store
        .store_trigger(due_trigger("durable", "t2", "DEFAULT"), false)
        .await
        .unwrap();
    store.remove_trigger(&Key::of("t2")).await.unwrap();
    assert!(store.check_job_exists(&Key::of("durable")).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_acquirers_claim_disjoint_triggers() {
    let store = Arc::new(MemoryJobStore::default());
    store
        .store_job(JobDetail::new(Key::of("j"), "noop").durable(true), false)
        .await
        .unwrap();
    store
        .store_trigger(due_trigger("j", "only", "DEFAULT"), false)
        .await
        .unwrap();

    // two acquirers race for a single due trigger
    let a = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .acquire_next_triggers(Utc::now() + Duration::seconds(30), 1, Duration::zero())
                .await
                .unwrap()
        })
    };
    let b = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .acquire_next_triggers(Utc::now() + Duration::seconds(30), 1, Duration::zero())
                .await
                .unwrap()
        })
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    // exactly one claim succeeds; the loser sees nothing to take
    assert_eq!(a.len() + b.len(), 1);
}

#[tokio::test]
async fn test_unscheduling_releases_nothing_extra() {
    let store = MemoryJobStore::default();
    store
        .store_job(JobDetail::new(Key::of("j"), "noop").durable(true), false)
        .await
        .unwrap();
    store
        .store_trigger(due_trigger("j", "a", "DEFAULT"), false)
        .await
        .unwrap();
    store
        .store_trigger(due_trigger("j", "b", "DEFAULT"), false)
        .await
        .unwrap();

    assert!(store.remove_trigger(&Key::of("a")).await.unwrap());
    assert!(store.check_trigger_exists(&Key::of("b")).await.unwrap());
    assert_eq!(
        store
            .get_triggers_for_job(&Key::of("j"))
            .await
            .unwrap()
            .len(),
        1
    );
}
