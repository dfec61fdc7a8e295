//! An in-process [`StoreAdapter`] backed by [`DashMap`] and
//! [`tokio::sync::broadcast`], grounded in the concurrent-map pattern of
//! `InMemoryBackend` and the forwarder/event-bus pattern used for
//! cross-subsystem pub/sub elsewhere in the corpus.
//!
//! This is a first-class, tested implementation of the adapter contract
//! (§4.2), not a stub: the crate's own tests run against it, and callers
//! without a real tree-store binding can use it directly. A production
//! deployment would supply its own [`StoreAdapter`] against an actual
//! realtime database; this one never leaves the process.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use super::{
    ChildEvent, ChildEventKind, ChildFilter, ChildSubscription, StoreAdapter, TransactionFn,
    TransactionOutcome, TransactionResult, ValueEvent, ValueSubscription,
};

const EVENT_BUFFER: usize = 1024;

/// This backend never fails a transaction or a read on its own (it has
/// no I/O to fail). The error type exists so the trait's `Result` plumbing
/// and the worker's retry-on-[`StoreAdapter::Error`] path are exercised
/// the same way a real backend would exercise them.
#[derive(Debug, thiserror::Error)]
pub enum MemoryStoreError {
    /// Placeholder so tests can construct a failing adapter by injection.
    #[error("in-memory store: {0}")]
    Injected(String),
}

/// A raw mutation as it actually happened, carrying both sides of the
/// change. Subscribers determine their own `Added`/`Changed`/`Removed`
/// classification from `old_value`/`new_value` against their own filter
/// (real filtered-query semantics: a child that starts matching a filter
/// it previously didn't is `Added` to that view even though the record
/// already existed, and a child that stops matching is `Removed` from
/// that view even though the record survives). A single global kind
/// decided once, independent of each listener's filter, cannot express
/// this (see `subscribe_children`'s forwarder).
#[derive(Debug, Clone)]
struct RawEvent {
    parent: String,
    key: String,
    old_value: Option<Value>,
    new_value: Option<Value>,
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// Reserved field names that may appear as the trailing segment of a
/// [`StoreAdapter::subscribe_value`] path, e.g. the worker's owner
/// watcher subscribing to `<task>/_owner` (§4.6). Any other path is
/// taken to name a record directly (e.g. a spec path), since this
/// backend has no general notion of path depth: record keys themselves
/// may contain `/`-separated segments (`QueueRefs::from_root` nests
/// `tasks`/`specs` under a caller-chosen root).
const NESTED_FIELD_NAMES: &[&str] = &[
    crate::constants::FIELD_STATE,
    crate::constants::FIELD_STATE_CHANGED,
    crate::constants::FIELD_OWNER,
    crate::constants::FIELD_PROGRESS,
    crate::constants::FIELD_ERROR_DETAILS,
];

/// Split a path into the record it denotes (the unit this store
/// actually keeps in `data`) and, if the trailing segment names a
/// reserved field, the single-element field path addressing a value
/// nested inside that record, e.g. `tasks/abc/_owner` splits into
/// (`tasks/abc`, [`_owner`]). Supports [`StoreAdapter::subscribe_value`]
/// watching a single reserved field the way a real tree store would,
/// without this backend needing to store individual fields as separate
/// entries.
fn record_path_and_field(path: &str) -> (String, Vec<String>) {
    match path.rsplit_once('/') {
        Some((record_path, field)) if NESTED_FIELD_NAMES.contains(&field) => {
            (record_path.to_string(), vec![field.to_string()])
        }
        _ => (path.to_string(), Vec::new()),
    }
}

fn navigate<'a>(value: &'a Value, field_path: &[String]) -> Option<&'a Value> {
    let mut current = value;
    for segment in field_path {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn matches_filter(value: &Value, filter: &ChildFilter) -> bool {
    let field_value = value.as_object().and_then(|m| m.get(&filter.field));
    let actual = field_value.and_then(|v| if v.is_null() { None } else { v.as_str() });
    match (&filter.equals, actual) {
        (None, None) => true,
        (Some(expected), Some(actual)) => expected == actual,
        _ => false,
    }
}

fn resolve_timestamps(value: &mut Value, now_millis: i64) {
    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                if super::is_server_timestamp_sentinel(v) {
                    *v = Value::from(now_millis);
                } else {
                    resolve_timestamps(v, now_millis);
                }
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                resolve_timestamps(v, now_millis);
            }
        }
        _ => {}
    }
}

/// In-process tree store: `DashMap<full path, value>` plus a broadcast
/// bus of raw mutations that per-subscription forwarder tasks filter.
pub struct InMemoryStore {
    data: DashMap<String, Value>,
    raw_bus: broadcast::Sender<RawEvent>,
    child_subs: DashMap<u64, JoinHandle<()>>,
    value_subs: DashMap<u64, JoinHandle<()>>,
    next_id: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        let (raw_bus, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            data: DashMap::new(),
            raw_bus,
            child_subs: DashMap::new(),
            value_subs: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Directly seed a value at `path`, bypassing the transaction
    /// protocol. Intended for test setup (pushing pre-shaped tasks).
    pub fn seed(&self, path: &str, value: Value) {
        let (parent, key) = split_path(path);
        let old_value = self.data.insert(path.to_string(), value.clone());
        let _ = self.raw_bus.send(RawEvent {
            parent: parent.to_string(),
            key: key.to_string(),
            old_value,
            new_value: Some(value),
        });
    }

    /// Current value at `path`, bypassing subscriptions. Intended for
    /// test assertions.
    pub fn peek(&self, path: &str) -> Option<Value> {
        self.data.get(path).map(|r| r.value().clone())
    }

    fn next_subscription_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl StoreAdapter for InMemoryStore {
    type Error = MemoryStoreError;

    async fn transaction(
        &self,
        path: &str,
        update: TransactionFn,
    ) -> Result<TransactionResult, Self::Error> {
        // DashMap::entry() locks the owning shard for as long as `entry`
        // is held, so the read `update` sees and the write it produces
        // are atomic with respect to every other transaction and to
        // `seed`/`read` on the same path, so no separate CAS retry loop
        // is needed here, unlike a real networked store (§4.2's "store
        // retries on contention" is this lock, held instead of retried).
        let (parent, key) = split_path(path);
        let entry = self.data.entry(path.to_string());
        let current = match &entry {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(_) => None,
        };
        match update(current.clone()) {
            TransactionOutcome::Abort => Ok(TransactionResult::Aborted),
            TransactionOutcome::Delete => match entry {
                Entry::Occupied(occupied) => {
                    let prev = occupied.get().clone();
                    occupied.remove();
                    let _ = self.raw_bus.send(RawEvent {
                        parent: parent.to_string(),
                        key: key.to_string(),
                        old_value: Some(prev),
                        new_value: None,
                    });
                    Ok(TransactionResult::Deleted)
                }
                Entry::Vacant(_) => Ok(TransactionResult::Aborted),
            },
            TransactionOutcome::Write(mut new_value) => {
                let now_millis = chrono::Utc::now().timestamp_millis();
                resolve_timestamps(&mut new_value, now_millis);
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(new_value.clone());
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(new_value.clone());
                    }
                }
                let _ = self.raw_bus.send(RawEvent {
                    parent: parent.to_string(),
                    key: key.to_string(),
                    old_value: current,
                    new_value: Some(new_value.clone()),
                });
                Ok(TransactionResult::Committed(new_value))
            }
        }
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, Self::Error> {
        Ok(self.data.get(path).map(|r| r.value().clone()))
    }

    async fn read_first_child(
        &self,
        parent: &str,
        filter: ChildFilter,
    ) -> Result<Option<(String, Value)>, Self::Error> {
        let prefix = format!("{parent}/");
        let found = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .filter(|entry| matches_filter(entry.value(), &filter))
            .map(|entry| (entry.key()[prefix.len()..].to_string(), entry.value().clone()))
            .next();
        Ok(found)
    }

    async fn subscribe_children(
        &self,
        parent: &str,
        filter: ChildFilter,
    ) -> Result<ChildSubscription, Self::Error> {
        let id = self.next_subscription_id();
        let (tx, rx) = broadcast::channel(EVENT_BUFFER);

        let prefix = format!("{parent}/");
        let mut backlog: Vec<(String, Value)> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .filter(|entry| matches_filter(entry.value(), &filter))
            .map(|entry| (entry.key()[prefix.len()..].to_string(), entry.value().clone()))
            .collect();
        if let Some(limit) = filter.limit {
            backlog.truncate(limit);
        }
        for (key, value) in backlog {
            let _ = tx.send(ChildEvent {
                kind: ChildEventKind::Added,
                key,
                value,
            });
        }

        let mut raw_rx = self.raw_bus.subscribe();
        let parent_owned = parent.to_string();
        let forward_tx = tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match raw_rx.recv().await {
                    Ok(event) if event.parent == parent_owned => {
                        let old_matches = event
                            .old_value
                            .as_ref()
                            .map(|v| matches_filter(v, &filter))
                            .unwrap_or(false);
                        let new_matches = event
                            .new_value
                            .as_ref()
                            .map(|v| matches_filter(v, &filter))
                            .unwrap_or(false);
                        // A real filtered-query listener only sees a
                        // child at all once it matches: entering the
                        // filter is always `Added` to this view, even if
                        // the underlying record already existed, and
                        // leaving it (including outright deletion) is
                        // always `Removed`.
                        let child_event = match (old_matches, new_matches) {
                            (false, true) => Some(ChildEvent {
                                kind: ChildEventKind::Added,
                                key: event.key,
                                value: event.new_value.expect("new_matches implies Some"),
                            }),
                            (true, true) => Some(ChildEvent {
                                kind: ChildEventKind::Changed,
                                key: event.key,
                                value: event.new_value.expect("new_matches implies Some"),
                            }),
                            (true, false) => Some(ChildEvent {
                                kind: ChildEventKind::Removed,
                                key: event.key,
                                value: event.old_value.expect("old_matches implies Some"),
                            }),
                            (false, false) => None,
                        };
                        if let Some(child_event) = child_event {
                            if forward_tx.send(child_event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "child subscription lagged, dropped events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.child_subs.insert(id, handle);
        Ok(ChildSubscription { id, receiver: rx })
    }

    async fn subscribe_value(&self, path: &str) -> Result<ValueSubscription, Self::Error> {
        let id = self.next_subscription_id();
        let (tx, rx) = broadcast::channel(EVENT_BUFFER);

        let (record_path, field_path) = record_path_and_field(path);
        let current = self
            .data
            .get(&record_path)
            .and_then(|r| navigate(r.value(), &field_path).cloned());
        let _ = tx.send(ValueEvent { value: current });

        let mut raw_rx = self.raw_bus.subscribe();
        let (parent, key) = split_path(&record_path);
        let parent = parent.to_string();
        let key = key.to_string();
        let forward_tx = tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match raw_rx.recv().await {
                    Ok(event) if event.parent == parent && event.key == key => {
                        let value = event
                            .new_value
                            .as_ref()
                            .and_then(|v| navigate(v, &field_path).cloned());
                        if forward_tx.send(ValueEvent { value }).is_err() {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "value subscription lagged, dropped events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.value_subs.insert(id, handle);
        Ok(ValueSubscription { id, receiver: rx })
    }

    async fn unsubscribe_children(&self, subscription_id: u64) {
        if let Some((_, handle)) = self.child_subs.remove(&subscription_id) {
            handle.abort();
        }
    }

    async fn unsubscribe_value(&self, subscription_id: u64) {
        if let Some((_, handle)) = self.value_subs.remove(&subscription_id) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn boxed(f: impl Fn(Option<Value>) -> TransactionOutcome + Send + Sync + 'static) -> TransactionFn {
        Box::new(f)
    }

    #[tokio::test]
    async fn transaction_writes_and_resolves_timestamp_sentinel() {
        let store = InMemoryStore::new();
        let result = store
            .transaction(
                "tasks/a",
                boxed(|_current| {
                    TransactionOutcome::Write(json!({
                        "_state": "in_progress",
                        "_state_changed": super::super::server_timestamp_sentinel(),
                    }))
                }),
            )
            .await
            .unwrap();
        match result {
            TransactionResult::Committed(v) => {
                assert_eq!(v["_state"], "in_progress");
                assert!(v["_state_changed"].is_i64());
            }
            _ => panic!("expected commit"),
        }
    }

    #[tokio::test]
    async fn transaction_delete_removes_record() {
        let store = InMemoryStore::new();
        store.seed("tasks/a", json!({"foo": "bar"}));
        let result = store
            .transaction("tasks/a", boxed(|_current| TransactionOutcome::Delete))
            .await
            .unwrap();
        assert_eq!(result, TransactionResult::Deleted);
        assert!(store.peek("tasks/a").is_none());
    }

    #[tokio::test]
    async fn transaction_abort_leaves_value_untouched() {
        let store = InMemoryStore::new();
        store.seed("tasks/a", json!({"foo": "bar"}));
        let result = store
            .transaction("tasks/a", boxed(|_current| TransactionOutcome::Abort))
            .await
            .unwrap();
        assert_eq!(result, TransactionResult::Aborted);
        assert_eq!(store.peek("tasks/a"), Some(json!({"foo": "bar"})));
    }

    #[tokio::test]
    async fn subscribe_children_replays_backlog_then_live_events() {
        let store = InMemoryStore::new();
        store.seed("tasks/a", json!({"_state": "start"}));
        let mut sub = store
            .subscribe_children("tasks", ChildFilter::equals("_state", Some("start".into())))
            .await
            .unwrap();

        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first.kind, ChildEventKind::Added);
        assert_eq!(first.key, "a");

        store.seed("tasks/b", json!({"_state": "start"}));
        let second = sub.receiver.recv().await.unwrap();
        assert_eq!(second.key, "b");

        store.unsubscribe_children(sub.id).await;
    }

    #[tokio::test]
    async fn subscribe_value_replays_current_value_immediately() {
        let store = InMemoryStore::new();
        store.seed("specs/default", json!({"in_progress_state": "working"}));
        let mut sub = store.subscribe_value("specs/default").await.unwrap();
        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first.value, Some(json!({"in_progress_state": "working"})));
        store.unsubscribe_value(sub.id).await;
    }

    #[tokio::test]
    async fn unsubscribed_children_stop_receiving_events() {
        let store = InMemoryStore::new();
        let sub = store
            .subscribe_children("tasks", ChildFilter::equals("_state", Some("start".into())))
            .await
            .unwrap();
        let id = sub.id;
        store.unsubscribe_children(sub.id).await;
        assert!(!store.child_subs.contains_key(&id));
    }
}
