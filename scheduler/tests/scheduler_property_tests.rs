// Property-based tests for the acquire pipeline's ordering and
// exclusivity guarantees

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::models::{JobDetail, Key};
use common::schedule::{Trigger, TriggerSchedule};
use common::store::memory::MemoryJobStore;
use common::store::JobStore;
use proptest::prelude::*;

fn instant(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// For any set of one-shot triggers, acquisition returns them ordered by
/// (next_fire_time asc, priority desc, key asc) with no duplicates.
#[test]
fn property_acquire_ordering() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    proptest!(|(
        specs in prop::collection::vec(
            (0i64..60, 1i32..10, "[a-f]{4}"),
            1..12
        )
    )| {
        runtime.block_on(async {
            let store = MemoryJobStore::default();
            let base = instant(2_000_000_000);
            store
                .store_job(JobDetail::new(Key::of("j"), "noop").durable(true), false)
                .await
                .unwrap();

            let mut stored = 0usize;
            for (i, (offset, priority, name)) in specs.iter().enumerate() {
                let trigger = Trigger::new(
                    Key::of(format!("{}-{}", name, i)),
                    Key::of("j"),
                    TriggerSchedule::Simple {
                        repeat_interval_ms: 0,
                        repeat_count: 0,
                        times_triggered: 0,
                    },
                )
                .with_start_time(base + Duration::seconds(*offset))
                .with_priority(*priority);
                store.store_trigger(trigger, false).await.unwrap();
                stored += 1;
            }

            let acquired = store
                .acquire_next_triggers(
                    base + Duration::seconds(120),
                    stored,
                    Duration::seconds(120),
                )
                .await
                .unwrap();

            prop_assert_eq!(acquired.len(), stored);

            // ordering: fire time asc, then priority desc, then key asc
            for pair in acquired.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                let (ta, tb) = (a.next_fire_time.unwrap(), b.next_fire_time.unwrap());
                prop_assert!(ta <= tb);
                if ta == tb {
                    prop_assert!(a.priority >= b.priority);
                    if a.priority == b.priority {
                        prop_assert!(a.key < b.key);
                    }
                }
            }

            // no duplicates
            let mut keys: Vec<_> = acquired.iter().map(|t| t.key.clone()).collect();
            keys.sort();
            keys.dedup();
            prop_assert_eq!(keys.len(), acquired.len());
            Ok(())
        })?;
    });
}

/// Repeated acquisition never hands the same one-shot fire out twice.
#[test]
fn property_acquire_is_exclusive_across_rounds() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    proptest!(|(count in 1usize..10, rounds in 2usize..5)| {
        runtime.block_on(async {
            let store = MemoryJobStore::default();
            let base = instant(2_000_000_000);
            store
                .store_job(JobDetail::new(Key::of("j"), "noop").durable(true), false)
                .await
                .unwrap();
            for i in 0..count {
                store
                    .store_trigger(
                        Trigger::new(
                            Key::of(format!("t{}", i)),
                            Key::of("j"),
                            TriggerSchedule::Simple {
                                repeat_interval_ms: 0,
                                repeat_count: 0,
                                times_triggered: 0,
                            },
                        )
                        .with_start_time(base),
                        false,
                    )
                    .await
                    .unwrap();
            }

            let mut total = 0usize;
            for _ in 0..rounds {
                let acquired = store
                    .acquire_next_triggers(base + Duration::seconds(60), count, Duration::zero())
                    .await
                    .unwrap();
                total += acquired.len();
            }
            // every trigger is claimed exactly once across all rounds
            prop_assert_eq!(total, count);
            Ok(())
        })?;
    });
}
