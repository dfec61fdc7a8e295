//! Store Adapter: the uniform interface to a hierarchical, transactional,
//! listener-oriented tree store (§4.2).
//!
//! [`StoreAdapter`] is the seam between the domain state machine in
//! [`crate::worker`] and whatever remote store actually holds the tree:
//! a real "realtime database" binding, or (for this crate's own tests,
//! and as a usable default) the bundled [`memory::InMemoryStore`]. The
//! worker never touches a backend directly; it only ever calls through
//! this trait, and treats every [`StoreAdapter::Error`] as transient,
//! retrying per [`crate::constants::MAX_TRANSACTION_ATTEMPTS`].

pub mod memory;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;

/// What a transaction's update function decided to do with the current
/// value it was handed (§4.2).
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    /// Leave the value unchanged.
    Abort,
    /// Remove the record entirely.
    Delete,
    /// Replace the record with this value.
    Write(Value),
}

/// What actually happened when a transaction was run against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionResult {
    /// The update function returned [`TransactionOutcome::Abort`], or the
    /// value no longer matched by the time the write was attempted.
    Aborted,
    /// The record was deleted.
    Deleted,
    /// The record was written; this is the value that committed.
    Committed(Value),
}

/// A reserved JSON shape a [`StoreAdapter`] implementation replaces with
/// its own wall-clock time at commit, used for `_state_changed`.
pub fn server_timestamp_sentinel() -> Value {
    serde_json::json!({ "__leasequeue_server_timestamp__": true })
}

/// True if `value` is the marker produced by [`server_timestamp_sentinel`].
pub fn is_server_timestamp_sentinel(value: &Value) -> bool {
    value
        .get("__leasequeue_server_timestamp__")
        .and_then(Value::as_bool)
        == Some(true)
}

/// The update function passed to [`StoreAdapter::transaction`]. Boxed
/// because it must cross an `async fn` boundary and may be invoked more
/// than once if the backend retries on contention internally.
pub type TransactionFn = Box<dyn Fn(Option<Value>) -> TransactionOutcome + Send + Sync>;

/// A boxed future, used where `async_trait` object-safety requires one
/// (subscription forwarding helpers outside the trait itself).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which kind of child mutation a [`ChildEvent`] reports, mirroring the
/// three events the worker subscribes to in §4.2/§4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    /// A new child started matching the filter (includes backlogged items).
    Added,
    /// A previously-matching child changed while still matching.
    Changed,
    /// A previously-matching child was deleted, or stopped matching.
    Removed,
}

/// One event from a filtered child-query subscription.
#[derive(Debug, Clone)]
pub struct ChildEvent {
    /// Which kind of mutation this is.
    pub kind: ChildEventKind,
    /// The child's key relative to the subscribed parent.
    pub key: String,
    /// The child's value (for `Removed`, its last known value).
    pub value: Value,
}

/// `(orderByChild=field, equalTo=equals[, limitToFirst=limit])` (§4.2).
#[derive(Debug, Clone)]
pub struct ChildFilter {
    /// The field to filter on, e.g. `_state`.
    pub field: String,
    /// The required value of `field`; `None` matches an absent/`null` field.
    pub equals: Option<String>,
    /// If set, only this many backlogged matches are replayed at subscribe time.
    pub limit: Option<usize>,
}

impl ChildFilter {
    /// Build a filter matching `field == equals`.
    pub fn equals(field: impl Into<String>, equals: Option<String>) -> Self {
        Self {
            field: field.into(),
            equals,
            limit: None,
        }
    }

    /// Cap the number of backlogged matches replayed at subscribe time.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A single `value` event: the current value at a path, or `None` if absent.
#[derive(Debug, Clone)]
pub struct ValueEvent {
    /// The value observed, or `None` if the path is empty.
    pub value: Option<Value>,
}

/// A live child-query subscription. Drop or pass to
/// [`StoreAdapter::unsubscribe_children`] to stop receiving events and
/// free the backend's resources.
pub struct ChildSubscription {
    /// Opaque identifier the owning adapter uses to tear this down.
    pub id: u64,
    /// Receiver side of the event stream.
    pub receiver: tokio::sync::broadcast::Receiver<ChildEvent>,
}

/// A live `value` subscription on a single path.
pub struct ValueSubscription {
    /// Opaque identifier the owning adapter uses to tear this down.
    pub id: u64,
    /// Receiver side of the event stream.
    pub receiver: tokio::sync::broadcast::Receiver<ValueEvent>,
}

/// The operations a worker consumes from the tree store (§4.2).
///
/// Event delivery is single-threaded per subscriber and ordered
/// per-path, but concurrent with transactions: implementations must
/// never assume a subscriber's cached state reflects what a concurrent
/// transaction will observe.
#[async_trait]
pub trait StoreAdapter: Send + Sync + 'static {
    /// The backend-specific failure type, treated as transient by the worker.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run `update` against the current value at `path`, retrying
    /// internally on contention (the store's own job, distinct from the
    /// worker's bounded retry of the whole operation on [`Self::Error`]).
    async fn transaction(
        &self,
        path: &str,
        update: TransactionFn,
    ) -> Result<TransactionResult, Self::Error>;

    /// One-shot read of the value at `path`.
    async fn read(&self, path: &str) -> Result<Option<Value>, Self::Error>;

    /// One-shot read of the first child of `parent` matching `filter`
    /// (§4.4 step 3's "read a one-child page from the filtered view").
    /// Unlike [`Self::subscribe_children`] this does not install a
    /// listener; it is the query the claim protocol re-runs every time
    /// it wants to find a new candidate, independent of any specific
    /// event that may have prompted the attempt.
    async fn read_first_child(
        &self,
        parent: &str,
        filter: ChildFilter,
    ) -> Result<Option<(String, Value)>, Self::Error>;

    /// Subscribe to `childAdded`/`childChanged`/`childRemoved` on a
    /// filtered view of `parent`'s children. Backlogged matches are
    /// replayed as `Added` events before the call returns.
    async fn subscribe_children(
        &self,
        parent: &str,
        filter: ChildFilter,
    ) -> Result<ChildSubscription, Self::Error>;

    /// Subscribe to `value` events on `path`. The current value is
    /// replayed immediately before the call returns.
    async fn subscribe_value(&self, path: &str) -> Result<ValueSubscription, Self::Error>;

    /// Release a child-query subscription and any backend resources it
    /// holds, identified by [`ChildSubscription::id`].
    async fn unsubscribe_children(&self, subscription_id: u64);

    /// Release a value subscription and any backend resources it holds,
    /// identified by [`ValueSubscription::id`].
    async fn unsubscribe_value(&self, subscription_id: u64);
}
