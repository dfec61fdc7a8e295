//! Queue: the supervisor that owns a pool of workers (§2, §4.8).
//!
//! A [`Queue`] is deliberately thin: it builds `num_workers` [`Worker`]s
//! bound to a shared tasks path and processing function, and, if
//! constructed with a `spec_id`, subscribes to the corresponding specs
//! path and re-programs every worker whenever that spec changes. All the
//! interesting state-machine behavior lives in [`crate::worker`]; this
//! module only ever calls through the public `Worker` API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::QueueError;
use crate::spec::TaskSpec;
use crate::store::StoreAdapter;
use crate::worker::{ProcessingFn, Worker};

/// `{spec_id, num_workers, sanitize, suppress_stack}` (§4.8, §10.3).
///
/// Defaults: no `spec_id` (the queue runs the built-in default spec),
/// one worker, `sanitize = true`, `suppress_stack = false`.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// If set, the queue subscribes to `specs/<spec_id>` and reprograms
    /// every worker on change instead of using the built-in default spec.
    pub spec_id: Option<String>,
    /// Number of workers to construct; must be at least 1.
    pub num_workers: usize,
    /// Strip reserved fields from data handed to the processing function.
    pub sanitize: bool,
    /// Omit captured stack/backtrace text from rejection records.
    pub suppress_stack: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            spec_id: None,
            num_workers: 1,
            sanitize: true,
            suppress_stack: false,
        }
    }
}

impl QueueOptions {
    /// Validate field values (§4.8: "non-positive integer `numWorkers`,
    /// non-string `specId`, non-boolean `sanitize`/`suppressStack`" all
    /// reject at construction time; the Rust type system already rules
    /// out the non-string/non-boolean cases, so only `num_workers` needs
    /// a runtime check here).
    fn validate<E: std::error::Error + Send + Sync + 'static>(&self) -> Result<(), QueueError<E>> {
        if self.num_workers == 0 {
            return Err(QueueError::InvalidArgs(
                "num_workers must be a positive integer".to_string(),
            ));
        }
        if let Some(spec_id) = &self.spec_id {
            if spec_id.is_empty() {
                return Err(QueueError::InvalidArgs(
                    "spec_id must be a non-empty string".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Build a [`TaskSpec`] from a specs-path snapshot's children (§4.8):
/// `{start_state, in_progress_state, finished_state, error_state,
/// timeout, retries}`. Returns `Ok(None)` for an absent/null snapshot
/// (the worker is left idle per §4.1's "invalid/absent" case), and
/// `Err` only when the snapshot names an `in_progress_state` but it
/// fails §4.1 validation.
fn spec_from_snapshot<E: std::error::Error + Send + Sync + 'static>(
    snapshot: Option<&Value>,
) -> Result<Option<TaskSpec>, QueueError<E>> {
    let Some(obj) = snapshot.and_then(Value::as_object) else {
        return Ok(None);
    };
    let string_field = |name: &str| obj.get(name).and_then(Value::as_str).map(str::to_string);
    let in_progress_state = match string_field("in_progress_state") {
        Some(s) => s,
        None => return Ok(None),
    };
    let timeout = obj.get("timeout").and_then(Value::as_u64);
    let retries = obj
        .get("retries")
        .and_then(Value::as_u64)
        .map(|n| n as u32);
    let spec = TaskSpec::new(
        string_field("start_state"),
        in_progress_state,
        string_field("finished_state"),
        string_field("error_state"),
        timeout,
        retries,
    )?;
    Ok(Some(spec))
}

/// Where tasks and specs live in the tree store; mirrors §6's schema.
/// Constructed either from a single tasks path (siblings `tasks`/`specs`
/// are derived per §4.8) or supplied explicitly.
#[derive(Debug, Clone)]
pub struct QueueRefs {
    /// Path to the tasks tree, e.g. `"myapp/tasks"`.
    pub tasks_path: String,
    /// Path to the specs tree, e.g. `"myapp/specs"`.
    pub specs_path: String,
}

impl QueueRefs {
    /// Derive `{tasks_path, specs_path}` as sibling locations under a
    /// single root reference (§4.8).
    pub fn from_root(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            tasks_path: format!("{root}/tasks"),
            specs_path: format!("{root}/specs"),
        }
    }

    /// Supply both paths explicitly (the `{tasksRef, specsRef}` object
    /// form of the constructor).
    pub fn explicit(tasks_path: impl Into<String>, specs_path: impl Into<String>) -> Self {
        Self {
            tasks_path: tasks_path.into(),
            specs_path: specs_path.into(),
        }
    }
}

struct QueueInner<S: StoreAdapter> {
    store: Arc<S>,
    refs: QueueRefs,
    options: QueueOptions,
    processing_fn: ProcessingFn<S::Error>,
    workers: Mutex<Vec<Arc<Worker<S>>>>,
    next_index: AtomicUsize,
    spec_watch: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The supervisor described in §2 and §4.8: constructs a pool of
/// workers against a shared tasks path, optionally keeping them all in
/// sync with a live spec, and exposes pool-wide shutdown and resizing.
pub struct Queue<S: StoreAdapter> {
    inner: Arc<QueueInner<S>>,
}

impl<S: StoreAdapter> Queue<S> {
    /// Construct a queue and its initial worker pool (§4.8).
    ///
    /// When `options.spec_id` is `None`, every worker is immediately
    /// programmed with [`TaskSpec::default_spec`]. When it is `Some`,
    /// this subscribes `value` events on `<specs_path>/<spec_id>` and
    /// reprograms every worker (current and future) each time that spec
    /// changes; the subscription's first replayed event establishes the
    /// pool's initial spec.
    pub async fn new(
        store: Arc<S>,
        refs: QueueRefs,
        options: QueueOptions,
        processing_fn: ProcessingFn<S::Error>,
    ) -> Result<Self, QueueError<S::Error>> {
        options.validate::<S::Error>()?;

        let inner = Arc::new(QueueInner {
            store,
            refs,
            options,
            processing_fn,
            workers: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(0),
            spec_watch: Mutex::new(None),
        });

        for _ in 0..inner.options.num_workers {
            Self::construct_worker(&inner)?;
        }

        match &inner.options.spec_id {
            None => {
                let default = TaskSpec::default_spec();
                for worker in inner.workers.lock().iter() {
                    worker.set_task_spec(Some(default.clone())).await?;
                }
            }
            Some(spec_id) => {
                Self::start_spec_watch(&inner, spec_id.clone()).await?;
            }
        }

        Ok(Self { inner })
    }

    fn process_id_prefix(options: &QueueOptions, index: usize) -> String {
        match &options.spec_id {
            Some(spec_id) => format!("{spec_id}:{index}"),
            None => index.to_string(),
        }
    }

    fn construct_worker(inner: &Arc<QueueInner<S>>) -> Result<(), QueueError<S::Error>> {
        let index = inner.next_index.fetch_add(1, Ordering::SeqCst);
        let process_id = Self::process_id_prefix(&inner.options, index);
        let worker = Worker::new(
            inner.store.clone(),
            inner.refs.tasks_path.clone(),
            process_id,
            inner.options.sanitize,
            inner.options.suppress_stack,
            inner.processing_fn.clone(),
        )?;
        inner.workers.lock().push(Arc::new(worker));
        Ok(())
    }

    #[instrument(skip(inner))]
    async fn start_spec_watch(
        inner: &Arc<QueueInner<S>>,
        spec_id: String,
    ) -> Result<(), QueueError<S::Error>> {
        let path = format!("{}/{spec_id}", inner.refs.specs_path);
        let mut sub = inner
            .store
            .subscribe_value(&path)
            .await
            .map_err(QueueError::Store)?;

        // Apply the replayed current value synchronously so `new()`
        // only returns once the pool's initial spec is programmed
        // (mirrors "Marks initialized = true after first event").
        if let Ok(event) = sub.receiver.try_recv() {
            Self::apply_spec_event(inner, event.value.as_ref()).await?;
        }

        let inner_for_task = inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match sub.receiver.recv().await {
                    Ok(event) => {
                        if let Err(error) =
                            Self::apply_spec_event(&inner_for_task, event.value.as_ref()).await
                        {
                            warn!(%error, "failed to apply spec update to worker pool");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "spec listener lagged, dropped events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *inner.spec_watch.lock() = Some(handle);
        Ok(())
    }

    async fn apply_spec_event(
        inner: &Arc<QueueInner<S>>,
        snapshot: Option<&Value>,
    ) -> Result<(), QueueError<S::Error>> {
        let spec = spec_from_snapshot::<S::Error>(snapshot)?;
        debug!(valid = spec.is_some(), "applying spec update to worker pool");
        let workers: Vec<Arc<Worker<S>>> = inner.workers.lock().clone();
        for worker in workers {
            worker.set_task_spec(spec.clone()).await?;
        }
        Ok(())
    }

    /// Add one more worker to the pool (§4.8, `AddWorker`), indexed
    /// after every worker constructed so far. If this queue watches a
    /// live spec, the new worker joins idle and receives the next spec
    /// update like any other; if it uses the default spec, the new
    /// worker is programmed immediately so it starts claiming work
    /// right away.
    pub async fn add_worker(&self) -> Result<(), QueueError<S::Error>> {
        Self::construct_worker(&self.inner)?;
        if self.inner.options.spec_id.is_none() {
            let worker = self.inner.workers.lock().last().cloned();
            if let Some(worker) = worker {
                worker.set_task_spec(Some(TaskSpec::default_spec())).await?;
            }
        }
        Ok(())
    }

    /// Remove and shut down the last worker in the pool (§4.8,
    /// `ShutdownWorker`). Returns `true` if a worker was removed, `false`
    /// if the pool was already empty.
    pub async fn shutdown_worker(&self) -> bool {
        let worker = self.inner.workers.lock().pop();
        match worker {
            Some(worker) => {
                worker.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Current number of workers in the pool (§4.8, `getWorkerCount`).
    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Unsubscribe the spec listener (if any), then shut down every
    /// worker concurrently, resolving once all have finished their
    /// current task (if any) and torn down their listeners (§4.8).
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.spec_watch.lock().take() {
            handle.abort();
        }
        let workers: Vec<Arc<Worker<S>>> = self.inner.workers.lock().clone();
        let futures = workers.iter().map(|worker| worker.shutdown());
        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn noop_processing_fn<S: StoreAdapter>() -> ProcessingFn<S::Error> {
        Arc::new(move |_data, handle| {
            Box::pin(async move {
                let _ = handle.resolve(None).await;
            })
        })
    }

    #[tokio::test]
    async fn default_spec_queue_claims_and_resolves_tasks() {
        let store = Arc::new(InMemoryStore::new());
        store.seed("root/tasks/a", json!({"foo": "bar"}));

        let queue = Queue::new(
            store.clone(),
            QueueRefs::from_root("root"),
            QueueOptions::default(),
            noop_processing_fn::<InMemoryStore>(),
        )
        .await
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(store.peek("root/tasks/a").is_none());

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn add_and_shutdown_worker_changes_count() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Queue::new(
            store,
            QueueRefs::from_root("root"),
            QueueOptions {
                num_workers: 2,
                ..QueueOptions::default()
            },
            noop_processing_fn::<InMemoryStore>(),
        )
        .await
        .unwrap();

        assert_eq!(queue.worker_count(), 2);
        queue.add_worker().await.unwrap();
        assert_eq!(queue.worker_count(), 3);
        assert!(queue.shutdown_worker().await);
        assert_eq!(queue.worker_count(), 2);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_zero_workers() {
        let store = Arc::new(InMemoryStore::new());
        let result = Queue::new(
            store,
            QueueRefs::from_root("root"),
            QueueOptions {
                num_workers: 0,
                ..QueueOptions::default()
            },
            noop_processing_fn::<InMemoryStore>(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn spec_id_queue_reprograms_workers_on_spec_change() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(
            "root/specs/mySpec",
            json!({"in_progress_state": "working", "finished_state": "done"}),
        );
        store.seed("root/tasks/a", json!({"foo": "bar"}));

        let resolved = Arc::new(StdAtomicUsize::new(0));
        let resolved_for_fn = resolved.clone();
        let processing_fn: ProcessingFn<_> = Arc::new(move |_data, handle| {
            let resolved = resolved_for_fn.clone();
            Box::pin(async move {
                resolved.fetch_add(1, Ordering::SeqCst);
                let _ = handle.resolve(None).await;
            })
        });

        let queue = Queue::new(
            store.clone(),
            QueueRefs::from_root("root"),
            QueueOptions {
                spec_id: Some("mySpec".to_string()),
                ..QueueOptions::default()
            },
            processing_fn,
        )
        .await
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(resolved.load(Ordering::SeqCst), 1);

        queue.shutdown().await;
    }
}
