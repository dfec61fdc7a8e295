//! A fault-tolerant, multi-worker job queue layered on top of a
//! hierarchical, transactional, listener-oriented remote tree store (a
//! "realtime database" with per-path compare-and-set transactions and
//! child-change event subscriptions).
//!
//! Producers push task records into a tree location; one or more
//! [`Worker`]s (typically supervised by a [`Queue`]) atomically claim,
//! process, and complete them, with time-based reclamation of tasks
//! whose lease expires before the processing function finishes.
//!
//! # Module organization
//!
//! - [`store`], the [`StoreAdapter`] trait that abstracts the tree
//!   store, plus [`store::memory::InMemoryStore`], a first-class
//!   reference implementation the crate's own tests run against.
//! - [`record`], the task record's reserved-field conventions and the
//!   pure state transforms (claim, resolve, reject, reset) a worker
//!   applies inside each transaction.
//! - [`spec`], [`TaskSpec`], the validated per-worker state-machine
//!   configuration.
//! - [`worker`], [`Worker`], the claim/process/resolve/reject/timeout
//!   state machine; the bulk of the crate.
//! - [`queue`], [`Queue`], the supervisor that builds a worker pool and
//!   optionally keeps it synchronized with a live task spec.
//! - [`error`], [`QueueError`] and friends.
//! - [`constants`], reserved field names and tunables.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use leasequeue::queue::{Queue, QueueOptions, QueueRefs};
//! use leasequeue::store::memory::InMemoryStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//! let processing_fn = Arc::new(|data, handle: leasequeue::worker::TaskHandle<_>| {
//!     Box::pin(async move {
//!         tracing::info!(?data, "processing task");
//!         let _ = handle.resolve(Some(serde_json::json!({"ok": true}))).await;
//!     }) as leasequeue::store::BoxFuture<'static, ()>
//! });
//!
//! let queue = Queue::new(
//!     store,
//!     QueueRefs::from_root("myapp"),
//!     QueueOptions::default(),
//!     processing_fn,
//! )
//! .await?;
//!
//! // ... run for a while ...
//! queue.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod error;
pub mod queue;
pub mod record;
pub mod spec;
pub mod store;
pub mod worker;

pub use error::QueueError;
pub use queue::{Queue, QueueOptions, QueueRefs};
pub use spec::{TaskSpec, TaskSpecBuilder};
pub use store::StoreAdapter;
pub use worker::{ProcessingFn, TaskHandle, Worker};
