//! Property tests for the invariants enumerated in §8: attempts
//! monotonicity across rejection sequences, and the worker's
//! generation counter strictly increasing across every `SetTaskSpec`
//! call.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use leasequeue::record::{apply_reject, ErrorDetails};
use leasequeue::spec::TaskSpec;
use leasequeue::store::memory::InMemoryStore;
use leasequeue::store::TransactionOutcome;
use leasequeue::worker::{ProcessingFn, TaskHandle, Worker};

proptest! {
    /// §8 invariant 6: applying a sequence of rejections against the
    /// same `previous_state` strictly increases `_error_details.attempts`
    /// by exactly one each time, regardless of the retries budget or the
    /// rejection message content.
    #[test]
    fn attempts_monotonically_increase_within_same_previous_state(
        rejections in 1usize..20,
        retries in 0u32..50,
        messages in prop::collection::vec("[a-zA-Z0-9 ]{0,30}", 1..20),
    ) {
        let mut current = json!({"_state": "in_progress", "_owner": "p:0"});
        let mut expected_attempts = 0u64;
        for i in 0..rejections {
            let message = messages[i % messages.len()].clone();
            let outcome = apply_reject(
                &current,
                "in_progress",
                Some("start"),
                "error",
                retries,
                "p:0",
                &message.into(),
            );
            let next = match outcome {
                TransactionOutcome::Write(next) => next,
                other => {
                    prop_assert!(false, "expected a write, got {:?}", other);
                    return Ok(());
                }
            };
            expected_attempts += 1;
            let details: ErrorDetails = serde_json::from_value(next["_error_details"].clone()).unwrap();
            prop_assert_eq!(details.attempts, Some(expected_attempts));

            // Simulate the task being re-claimed for another attempt:
            // `_owner` and `_state` return to in-progress, but
            // `_error_details` survives (the claim transform never
            // touches it), matching what the worker actually does.
            let mut reclaimed = next.as_object().unwrap().clone();
            reclaimed.insert("_state".to_string(), json!("in_progress"));
            reclaimed.insert("_owner".to_string(), json!("p:0"));
            current = serde_json::Value::Object(reclaimed);
        }
    }

    /// Changing `previous_state` resets the counter to 1 on the very
    /// next rejection, regardless of how high it had climbed before.
    #[test]
    fn attempts_reset_when_previous_state_changes(prior_attempts in 1u64..1000) {
        let prior = json!({
            "_state": "in_progress",
            "_owner": "p:0",
            "_error_details": {"previous_state": "some_other_state", "attempts": prior_attempts},
        });
        let outcome = apply_reject(&prior, "in_progress", Some("start"), "error", 5, "p:0", &"boom".into());
        let next = match outcome {
            TransactionOutcome::Write(next) => next,
            other => {
                prop_assert!(false, "expected a write, got {:?}", other);
                return Ok(());
            }
        };
        prop_assert_eq!(next["_error_details"]["attempts"], json!(1));
    }

    /// §4.1: any spec whose `startState` collides with `inProgressState`,
    /// or whose `finishedState` collides with either, is rejected
    /// regardless of the other fields' values.
    #[test]
    fn spec_validation_rejects_state_collisions(
        shared in "[a-z]{1,10}",
        other in "[a-z]{1,10}",
    ) {
        prop_assume!(shared != other);
        let start_collision = TaskSpec::new(Some(shared.clone()), shared.clone(), None, None, None, None);
        prop_assert!(start_collision.is_err());

        let finished_collision_with_in_progress =
            TaskSpec::new(Some(other.clone()), shared.clone(), Some(shared.clone()), None, None, None);
        prop_assert!(finished_collision_with_in_progress.is_err());

        let finished_collision_with_start =
            TaskSpec::new(Some(shared.clone()), other.clone(), Some(shared.clone()), None, None, None);
        prop_assert!(finished_collision_with_start.is_err());
    }
}

/// §8 invariant 4: `SetTaskSpec` always strictly increments `taskNumber`,
/// across any number of calls, valid or invalid.
#[tokio::test]
async fn set_task_spec_strictly_increments_generation() {
    let store = Arc::new(InMemoryStore::new());
    let processing_fn: ProcessingFn<_> = Arc::new(|_data, _handle: TaskHandle<_>| Box::pin(async move {}));
    let worker = Worker::new(store, "tasks", "p", true, false, processing_fn).unwrap();

    let mut last = worker.task_number();
    for i in 0..10 {
        let spec = if i % 3 == 0 {
            None
        } else {
            Some(TaskSpec::new(None, format!("state-{i}"), None, None, None, None).unwrap())
        };
        worker.set_task_spec(spec).await.unwrap();
        let next = worker.task_number();
        assert!(next > last, "task_number must strictly increase: {last} -> {next}");
        last = next;
    }

    worker.shutdown().await;
}

/// §4.3 idempotence: concurrent and repeated `Shutdown()` calls all
/// observe the same completion with no further side effects.
#[tokio::test]
async fn shutdown_is_idempotent_and_concurrent_callers_agree() {
    let store = Arc::new(InMemoryStore::new());
    let processing_fn: ProcessingFn<_> = Arc::new(|_data, handle: TaskHandle<_>| {
        Box::pin(async move {
            let _ = handle.resolve(None).await;
        })
    });
    let worker = Arc::new(Worker::new(store, "tasks", "p", true, false, processing_fn).unwrap());
    let spec = TaskSpec::new(None, "in_progress".into(), None, None, None, None).unwrap();
    worker.set_task_spec(Some(spec)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let worker = worker.clone();
        handles.push(tokio::spawn(async move {
            worker.shutdown().await;
        }));
    }
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("shutdown should complete promptly")
            .unwrap();
    }

    // A further call after completion must also resolve immediately.
    tokio::time::timeout(Duration::from_secs(1), worker.shutdown())
        .await
        .expect("repeated shutdown after completion should resolve immediately");
}
