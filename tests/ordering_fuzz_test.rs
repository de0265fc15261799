//! Randomized ordering tests for the statement queue.
//!
//! Each round queues a random batch of statements, some scripted to fail,
//! then resumes after every failure with a random reset choice. The executed
//! SQL must match a simple model of the queue, and no two statements may
//! ever execute at the same time.

use anysql::db::memory::ScriptedCapability;
use anysql::db::{ConnectionState, Driver};
use anysql::error::DbError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

const ROUNDS: usize = 25;

struct Planned {
    sql: String,
    fails: bool,
}

fn plan(rng: &mut StdRng) -> Vec<Vec<Planned>> {
    (0..ROUNDS)
        .map(|round| {
            let len = rng.gen_range(1..=8);
            (0..len)
                .map(|i| Planned {
                    sql: format!("STMT {round}-{i}"),
                    fails: rng.gen_bool(0.2),
                })
                .collect()
        })
        .collect()
}

async fn run_seed(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let rounds = plan(&mut rng);

    let mut cap = ScriptedCapability::new();
    if rng.gen_bool(0.5) {
        cap = cap.with_connect_delay(Duration::from_millis(rng.gen_range(1..5)));
    }
    for planned in rounds.iter().flatten().filter(|p| p.fails) {
        cap = cap.with_error(
            planned.sql.clone(),
            DbError::database(format!("{} failed", planned.sql), None, "none"),
        );
    }

    let conn = Driver::new("scripted", Arc::new(cap.clone())).connect("memory://");
    let mut expected = Vec::new();

    for batch in &rounds {
        let cursors: Vec<_> = batch
            .iter()
            .map(|p| conn.exec(p.sql.clone()).unwrap())
            .collect();
        if rng.gen_bool(0.3) {
            tokio::task::yield_now().await;
        }

        let mut discarding = false;
        for (planned, cursor) in batch.iter().zip(&cursors) {
            let result = cursor.then().unwrap().await;
            if discarding {
                assert!(
                    matches!(result, Err(DbError::Discarded)),
                    "seed {seed}: {} should be discarded, got {result:?}",
                    planned.sql
                );
                continue;
            }

            expected.push(planned.sql.clone());
            if planned.fails {
                let err = result.unwrap_err();
                assert!(matches!(err, DbError::Statement { .. }), "seed {seed}: {err:?}");
                assert_eq!(conn.state(), ConnectionState::Paused, "seed {seed}");

                let reset = rng.gen_bool(0.5);
                conn.resume(reset).unwrap();
                discarding = reset;
            } else {
                assert!(result.is_ok(), "seed {seed}: {} failed: {result:?}", planned.sql);
            }
        }
    }

    assert_eq!(cap.executed_sql(), expected, "seed {seed}");
    assert_eq!(cap.max_in_flight(), 1, "seed {seed}");
    assert_eq!(conn.state(), ConnectionState::Ready, "seed {seed}");
    assert_eq!(conn.queued(), 0);
    conn.release();
}

#[tokio::test]
async fn test_random_batches_keep_submission_order() {
    for seed in 0..20 {
        run_seed(seed).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_batches_on_multi_thread_runtime() {
    for seed in 100..110 {
        run_seed(seed).await;
    }
}
