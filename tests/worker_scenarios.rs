//! End-to-end scenario tests driving a real [`Worker`] against the
//! bundled [`InMemoryStore`], covering the six concrete scenarios and
//! the stated invariants.
//!
//! Each test waits on a channel the processing function signals through
//! rather than sleeping blindly wherever the assertion depends on a
//! specific callback having run; short `sleep`s are used only where the
//! scenario genuinely depends on wall-clock passage (timeout
//! reclamation).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use leasequeue::spec::TaskSpec;
use leasequeue::store::memory::InMemoryStore;
use leasequeue::worker::{ProcessingFn, TaskHandle, Worker};

async fn wait_until<F: Fn() -> bool>(predicate: F, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn happy_path_resolve_with_finished_state() {
    let store = Arc::new(InMemoryStore::new());
    store.seed("tasks/a", json!({"foo": "bar"}));

    let processing_fn: ProcessingFn<_> = Arc::new(|_data, handle: TaskHandle<_>| {
        Box::pin(async move {
            let _ = handle.resolve(Some(json!({"baz": "qux"}))).await;
        })
    });

    let worker = Worker::new(store.clone(), "tasks", "p", true, false, processing_fn).unwrap();
    let spec = TaskSpec::new(None, "in_progress".into(), Some("finished".into()), None, None, None).unwrap();
    worker.set_task_spec(Some(spec)).await.unwrap();

    wait_until(|| store.peek("tasks/a").map(|v| v["_state"] == "finished").unwrap_or(false), Duration::from_secs(1)).await;

    let record = store.peek("tasks/a").unwrap();
    assert_eq!(record["_state"], "finished");
    assert_eq!(record["_progress"], 100);
    assert_eq!(record["baz"], "qux");
    assert!(record.get("_owner").is_none());
    assert!(record.get("_error_details").is_none());
    assert!(record["_state_changed"].is_i64());

    worker.shutdown().await;
}

#[tokio::test]
async fn single_worker_drains_multiple_queued_tasks() {
    let store = Arc::new(InMemoryStore::new());
    store.seed("tasks/a", json!({"foo": "bar"}));
    store.seed("tasks/b", json!({"foo": "baz"}));

    let processing_fn: ProcessingFn<_> = Arc::new(|_data, handle: TaskHandle<_>| {
        Box::pin(async move {
            let _ = handle.resolve(None).await;
        })
    });

    let worker = Worker::new(store.clone(), "tasks", "p", true, false, processing_fn).unwrap();
    let spec = TaskSpec::new(None, "in_progress".into(), None, None, None, None).unwrap();
    worker.set_task_spec(Some(spec)).await.unwrap();

    // One worker must eventually drain both tasks: the try-to-process
    // protocol re-reads a fresh one-child page after each release rather
    // than re-driving only the key that triggered the claim it just
    // finished, so the second task is not left stranded at start state.
    wait_until(
        || store.peek("tasks/a").is_none() && store.peek("tasks/b").is_none(),
        Duration::from_secs(1),
    )
    .await;

    worker.shutdown().await;
}

#[tokio::test]
async fn resolve_with_no_finished_state_deletes_the_record() {
    let store = Arc::new(InMemoryStore::new());
    store.seed("tasks/a", json!({"foo": "bar"}));

    let processing_fn: ProcessingFn<_> = Arc::new(|_data, handle: TaskHandle<_>| {
        Box::pin(async move {
            let _ = handle.resolve(None).await;
        })
    });

    let worker = Worker::new(store.clone(), "tasks", "p", true, false, processing_fn).unwrap();
    let spec = TaskSpec::new(None, "in_progress".into(), None, None, None, None).unwrap();
    worker.set_task_spec(Some(spec)).await.unwrap();

    wait_until(|| store.peek("tasks/a").is_none(), Duration::from_secs(1)).await;

    worker.shutdown().await;
}

#[tokio::test]
async fn retry_then_error_tracks_attempts_and_escalates() {
    let store = Arc::new(InMemoryStore::new());
    store.seed("tasks/a", json!({}));

    let attempt = Arc::new(AtomicUsize::new(0));
    let attempt_for_fn = attempt.clone();
    let processing_fn: ProcessingFn<_> = Arc::new(move |_data, handle: TaskHandle<_>| {
        let attempt = attempt_for_fn.clone();
        Box::pin(async move {
            attempt.fetch_add(1, Ordering::SeqCst);
            let _ = handle.reject("boom").await;
        })
    });

    let worker = Worker::new(store.clone(), "tasks", "p", true, false, processing_fn).unwrap();
    let spec = TaskSpec::new(None, "in_progress".into(), None, None, None, Some(1)).unwrap();
    worker.set_task_spec(Some(spec)).await.unwrap();

    wait_until(|| attempt.load(Ordering::SeqCst) >= 1, Duration::from_secs(1)).await;
    wait_until(
        || store.peek("tasks/a").map(|v| v["_error_details"]["attempts"] == 1).unwrap_or(false),
        Duration::from_secs(1),
    )
    .await;
    let first = store.peek("tasks/a").unwrap();
    assert!(first["_state"].is_null());
    assert_eq!(first["_error_details"]["attempts"], 1);

    wait_until(|| attempt.load(Ordering::SeqCst) >= 2, Duration::from_secs(1)).await;
    wait_until(
        || store.peek("tasks/a").map(|v| v["_state"] == "error").unwrap_or(false),
        Duration::from_secs(1),
    )
    .await;
    let second = store.peek("tasks/a").unwrap();
    assert_eq!(second["_state"], "error");
    assert_eq!(second["_error_details"]["attempts"], 2);
    assert_eq!(second["_error_details"]["error"], "boom");
    assert_eq!(second["_error_details"]["previous_state"], "in_progress");

    worker.shutdown().await;
}

#[tokio::test]
async fn expired_lease_is_reclaimed_by_timeout() {
    let store = Arc::new(InMemoryStore::new());
    let now = chrono::Utc::now().timestamp_millis();
    store.seed(
        "tasks/a",
        json!({
            "_state": "in_progress",
            "_state_changed": now - 5,
            "_owner": "worker-A:0",
        }),
    );

    // A task returned to its start state is immediately eligible for
    // (re-)claim, including by this same worker, so the assertion looks
    // for evidence the reset transaction ran rather than for a
    // necessarily-still-unclaimed record: `_state_changed` must have
    // moved off the stale timestamp, and the previous owner's identity
    // must no longer be present in `_owner` (absent, or replaced by a
    // fresh claim with a different generation).
    let processing_fn: ProcessingFn<_> = Arc::new(|_data, _handle: TaskHandle<_>| Box::pin(async move {}));
    let worker = Worker::new(store.clone(), "tasks", "p", true, false, processing_fn).unwrap();
    let spec = TaskSpec::new(None, "in_progress".into(), None, None, Some(10), None).unwrap();
    worker.set_task_spec(Some(spec)).await.unwrap();

    wait_until(
        || {
            store
                .peek("tasks/a")
                .map(|v| v["_state_changed"].as_i64() != Some(now - 5))
                .unwrap_or(false)
        },
        Duration::from_secs(1),
    )
    .await;

    let record = store.peek("tasks/a").unwrap();
    assert_ne!(record["_owner"].as_str(), Some("worker-A:0"));
    assert!(record.get("_error_details").is_none());

    worker.shutdown().await;
}

#[tokio::test]
async fn malformed_task_is_rewritten_into_error_state() {
    let store = Arc::new(InMemoryStore::new());
    store.seed("tasks/a", json!("invalid"));

    let processing_fn: ProcessingFn<_> = Arc::new(|_data, handle: TaskHandle<_>| {
        Box::pin(async move {
            let _ = handle.resolve(None).await;
        })
    });
    let worker = Worker::new(store.clone(), "tasks", "p", true, false, processing_fn).unwrap();
    let spec = TaskSpec::new(None, "in_progress".into(), None, None, None, None).unwrap();
    worker.set_task_spec(Some(spec)).await.unwrap();

    wait_until(
        || store.peek("tasks/a").map(|v| v["_state"] == "error").unwrap_or(false),
        Duration::from_secs(1),
    )
    .await;

    let record = store.peek("tasks/a").unwrap();
    assert_eq!(record["_state"], "error");
    assert_eq!(record["_error_details"]["error"], "Task was malformed");
    assert_eq!(record["_error_details"]["original_task"], "invalid");

    worker.shutdown().await;
}

#[tokio::test]
async fn stolen_ownership_short_circuits_resolve() {
    let store = Arc::new(InMemoryStore::new());
    store.seed("tasks/a", json!({"foo": "bar"}));

    let (claimed_tx, mut claimed_rx) = mpsc::channel::<TaskHandle<leasequeue::store::memory::MemoryStoreError>>(1);
    let claimed_tx = Arc::new(Mutex::new(Some(claimed_tx)));
    let processing_fn: ProcessingFn<_> = Arc::new(move |_data, handle: TaskHandle<_>| {
        let claimed_tx = claimed_tx.clone();
        Box::pin(async move {
            if let Some(tx) = claimed_tx.lock().await.take() {
                let _ = tx.send(handle.clone()).await;
            }
            // Hold the claim open until the test drives ownership theft
            // and exercises resolve() against the stale handle.
            tokio::time::sleep(Duration::from_millis(200)).await;
        })
    });

    let worker = Worker::new(store.clone(), "tasks", "worker-A", true, false, processing_fn).unwrap();
    let spec = TaskSpec::new(None, "in_progress".into(), Some("finished".into()), None, None, None).unwrap();
    worker.set_task_spec(Some(spec)).await.unwrap();

    let handle = claimed_rx.recv().await.expect("task claimed");
    let claimed_record = store.peek("tasks/a").unwrap();
    assert_eq!(claimed_record["_state"], "in_progress");

    // External party steals ownership by clearing `_owner` directly.
    let mut stolen = claimed_record.as_object().unwrap().clone();
    stolen.remove("_owner");
    store.seed("tasks/a", serde_json::Value::Object(stolen));

    wait_until(
        || store.peek("tasks/a").map(|v| v.get("_owner").is_none()).unwrap_or(false),
        Duration::from_secs(1),
    )
    .await;
    // Give the owner watcher a moment to observe the change and clear
    // the worker's current-task reference.
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.resolve(Some(json!({"late": true}))).await.unwrap();

    // The stale resolve must not have mutated the record any further.
    let after = store.peek("tasks/a").unwrap();
    assert!(after.get("late").is_none());
    assert_eq!(after["_state"], "in_progress");

    worker.shutdown().await;
}
