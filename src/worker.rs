//! Worker: the per-task state machine (§2, §4.3-§4.7).
//!
//! A [`Worker`] is a thin handle around a detached actor task that owns
//! every piece of mutable state the state machine needs: the current
//! spec, the claimed task (if any), its listener subscriptions, and its
//! expiry-timer bookkeeping. Commands (claim events, spec reloads,
//! resolve/reject/progress calls, shutdown) all funnel through a single
//! `mpsc` channel into that actor, so the state machine never needs a
//! lock: only the actor ever touches `busy`, `current_task`,
//! `expiry_timers`, or `owners` (§5 "Workers do not share mutable
//! state").
//!
//! The user's processing function runs on its own spawned task, talking
//! back to the actor exclusively through a [`TaskHandle`] (the "detached
//! via asynchronous scheduling" requirement of §4.4: nothing the
//! processing function does can reenter the actor mid-transaction).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::constants::{FIELD_OWNER, FIELD_STATE, FIELD_STATE_CHANGED, MAX_TRANSACTION_ATTEMPTS};
use crate::error::{QueueError, RejectionMessage};
use crate::record::{self, ClaimOutcome};
use crate::spec::TaskSpec;
use crate::store::{
    ChildEvent, ChildEventKind, ChildFilter, ChildSubscription, StoreAdapter, TransactionFn,
    TransactionOutcome, TransactionResult, ValueSubscription,
};

/// A user-supplied processing function: given the sanitized task data and
/// a [`TaskHandle`] bound to this claim's generation, returns a future
/// that resolves once the function has called exactly one of
/// [`TaskHandle::resolve`]/[`TaskHandle::reject`] (possibly after several
/// [`TaskHandle::progress`] calls). The crate never inspects the
/// function's return value; all effects are communicated back to the
/// worker through the handle (§4.4, §6 "Processing function signature").
pub type ProcessingFn<E> =
    Arc<dyn Fn(Value, TaskHandle<E>) -> crate::store::BoxFuture<'static, ()> + Send + Sync>;

fn boxed_txn(f: impl Fn(Option<Value>) -> TransactionOutcome + Send + Sync + 'static) -> TransactionFn {
    Box::new(f)
}

/// Runs `make_fn` against `store.transaction(path, ..)` up to
/// [`MAX_TRANSACTION_ATTEMPTS`] times, treating every backend error as
/// transient (§4.2, §7). Exhaustion surfaces as
/// [`QueueError::StoreExhausted`], matching the source's literal
/// "errored too many times, no longer retrying".
async fn retry_transaction<S: StoreAdapter>(
    store: &S,
    path: &str,
    make_fn: impl Fn() -> TransactionFn,
) -> Result<TransactionResult, QueueError<S::Error>> {
    for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
        match store.transaction(path, make_fn()).await {
            Ok(result) => return Ok(result),
            Err(error) => {
                warn!(path, attempt, %error, "transaction attempt failed, retrying");
            }
        }
    }
    Err(QueueError::StoreExhausted)
}

/// A single attempt at `store.transaction`, with no retry: used only by
/// [`TaskHandle::progress`], which the source explicitly exempts from
/// the retry policy (§4.5).
async fn transact_once<S: StoreAdapter>(
    store: &S,
    path: &str,
    update: TransactionFn,
) -> Result<TransactionResult, QueueError<S::Error>> {
    store.transaction(path, update).await.map_err(QueueError::Store)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "processing function panicked".to_string()
    }
}

fn capture_backtrace(suppress: bool) -> Option<String> {
    if suppress {
        return None;
    }
    let backtrace = std::backtrace::Backtrace::capture();
    match backtrace.status() {
        std::backtrace::BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

/// The three capabilities a processing function is handed for one claim
/// (§4.4, §9): progress reporting, resolution, and rejection, all gated
/// on the generation (`taskNumber`) the claim was made under. Calling
/// any of them after the worker has moved on (ownership stolen, spec
/// reloaded, shutdown) is safe and short-circuits per §4.5/§9.
pub struct TaskHandle<E: std::error::Error + Send + Sync + 'static> {
    cmd_tx: mpsc::UnboundedSender<Command<E>>,
    task_number: u64,
    suppress_stack: bool,
}

impl<E: std::error::Error + Send + Sync + 'static> Clone for TaskHandle<E> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            task_number: self.task_number,
            suppress_stack: self.suppress_stack,
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Debug for TaskHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_number", &self.task_number)
            .finish_non_exhaustive()
    }
}

impl<E: std::error::Error + Send + Sync + 'static> TaskHandle<E> {
    /// Report advisory progress in `[0, 100]` (§4.5, `Progress`). Rejects
    /// immediately (without talking to the store) if `p` is not a finite
    /// number in range, or if this handle's generation is stale. A
    /// single store attempt is made; transient failures are not retried.
    pub async fn progress(&self, p: f64) -> Result<(), QueueError<E>> {
        if !p.is_finite() || !(0.0..=100.0).contains(&p) {
            return Err(QueueError::InvalidArgs(
                "progress must be a finite number in [0, 100]".to_string(),
            ));
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Progress {
                task_number: self.task_number,
                value: p,
                ack: ack_tx,
            })
            .is_err()
        {
            return Ok(());
        }
        ack_rx.await.unwrap_or(Ok(()))
    }

    /// Complete the task (§4.5, `Resolve`). `new_data` becomes the
    /// record's surviving user fields; `_new_state` inside it (if
    /// present) overrides the configured `finishedState` per §9's
    /// open-question resolution. Calling this with a stale generation,
    /// or after ownership was already released, resolves immediately
    /// and still triggers another claim attempt (§4.5, §9).
    pub async fn resolve(&self, new_data: Option<Value>) -> Result<(), QueueError<E>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Resolve {
                task_number: self.task_number,
                data: new_data,
                ack: ack_tx,
            })
            .is_err()
        {
            return Ok(());
        }
        ack_rx.await.unwrap_or(Ok(()))
    }

    /// Fail the task (§4.5, `Reject`). `error` is stringified via
    /// [`std::fmt::Display`]; unless the worker was built with
    /// `suppress_stack = true`, a captured backtrace is attached as
    /// `error_stack`. Attempts are tracked across retries of the same
    /// in-progress state; once they reach the spec's `retries` budget
    /// the task moves to `errorState` instead of back to `startState`.
    pub async fn reject(&self, error: impl fmt::Display) -> Result<(), QueueError<E>> {
        let message = RejectionMessage {
            message: error.to_string(),
            stack: capture_backtrace(self.suppress_stack),
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Reject {
                task_number: self.task_number,
                message,
                ack: ack_tx,
            })
            .is_err()
        {
            return Ok(());
        }
        ack_rx.await.unwrap_or(Ok(()))
    }
}

type AckSender<E> = oneshot::Sender<Result<(), QueueError<E>>>;

enum Command<E: std::error::Error + Send + Sync + 'static> {
    SetSpec {
        spec: Option<TaskSpec>,
        ack: oneshot::Sender<()>,
    },
    Shutdown,
    NewTaskEvent(ChildEvent),
    TimeoutEvent(ChildEvent),
    OwnerInvalidated { task_number: u64 },
    ExpireTimer { key: String },
    Progress { task_number: u64, value: f64, ack: AckSender<E> },
    Resolve { task_number: u64, data: Option<Value>, ack: AckSender<E> },
    Reject { task_number: u64, message: RejectionMessage, ack: AckSender<E> },
}

/// Bookkeeping for the task currently claimed by this worker, if any.
struct CurrentTask {
    key: String,
    task_number: u64,
    owner_watch: JoinHandle<()>,
}

/// Shared idempotent completion signal for [`Worker::shutdown`]: many
/// callers may await it concurrently, and it is safe to check after
/// completion has already happened (§4.3 "idempotent: repeated calls
/// return the same future").
#[derive(Default)]
struct ShutdownState {
    done: std::sync::atomic::AtomicBool,
    notify: Notify,
}

impl ShutdownState {
    async fn wait(&self) {
        loop {
            if self.done.load(Ordering::Acquire) {
                return;
            }
            let notified = self.notify.notified();
            if self.done.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    fn complete(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// The worker state machine's actor: owns every listener, timer, and
/// piece of per-claim state. Reachable only through the [`Command`]
/// channel driven by [`Worker`].
struct WorkerActor<S: StoreAdapter> {
    store: Arc<S>,
    tasks_path: String,
    process_id: String,
    sanitize: bool,
    suppress_stack: bool,
    processing_fn: ProcessingFn<S::Error>,

    cmd_tx: mpsc::UnboundedSender<Command<S::Error>>,
    cmd_rx: mpsc::UnboundedReceiver<Command<S::Error>>,

    spec: Option<TaskSpec>,
    task_number: u64,
    task_number_shared: Arc<AtomicU64>,
    busy: bool,
    shutdown_requested: bool,
    stopped: bool,

    current_task: Option<CurrentTask>,
    new_task_sub: Option<(ChildSubscription, JoinHandle<()>)>,
    timeout_sub: Option<(ChildSubscription, JoinHandle<()>)>,
    expiry_timers: HashMap<String, JoinHandle<()>>,
    owners: HashMap<String, Option<String>>,

    shutdown_state: Arc<ShutdownState>,
}

impl<S: StoreAdapter> WorkerActor<S> {
    fn identity(&self, task_number: u64) -> String {
        format!("{}:{task_number}", self.process_id)
    }

    fn task_path(&self, key: &str) -> String {
        format!("{}/{key}", self.tasks_path)
    }

    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            self.handle(cmd).await;
            if self.stopped {
                break;
            }
        }
        if !self.stopped {
            self.teardown().await;
            self.shutdown_state.complete();
        }
    }

    async fn handle(&mut self, cmd: Command<S::Error>) {
        match cmd {
            Command::SetSpec { spec, ack } => {
                self.handle_set_spec(spec).await;
                let _ = ack.send(());
            }
            Command::Shutdown => {
                self.shutdown_requested = true;
                if !self.busy {
                    self.teardown().await;
                    self.shutdown_state.complete();
                    self.stopped = true;
                }
            }
            Command::NewTaskEvent(event) => {
                // Only the event's kind matters here: it is a wake-up
                // signal that a candidate may now be claimable, not a
                // claim on that specific key (§4.4 step 3 re-reads a
                // fresh one-child page regardless of what triggered it).
                if event.kind == ChildEventKind::Added {
                    self.try_to_process().await;
                }
            }
            Command::TimeoutEvent(event) => self.handle_timeout_event(event),
            Command::OwnerInvalidated { task_number } => {
                self.handle_owner_invalidated(task_number).await
            }
            Command::ExpireTimer { key } => self.handle_expire_timer(key).await,
            Command::Progress { task_number, value, ack } => {
                let _ = ack.send(self.handle_progress(task_number, value).await);
            }
            Command::Resolve { task_number, data, ack } => {
                let result = self.handle_resolve(task_number, data).await;
                let _ = ack.send(result);
            }
            Command::Reject { task_number, message, ack } => {
                let result = self.handle_reject(task_number, message).await;
                let _ = ack.send(result);
            }
        }
    }

    #[instrument(skip(self), fields(process_id = %self.process_id))]
    async fn handle_set_spec(&mut self, spec: Option<TaskSpec>) {
        debug!("reprogramming worker spec");

        if let Some((sub, forwarder)) = self.new_task_sub.take() {
            forwarder.abort();
            self.store.unsubscribe_children(sub.id).await;
        }
        if let Some((sub, forwarder)) = self.timeout_sub.take() {
            forwarder.abort();
            self.store.unsubscribe_children(sub.id).await;
        }
        for (_, timer) in self.expiry_timers.drain() {
            timer.abort();
        }
        self.owners.clear();

        self.task_number += 1;
        self.task_number_shared.store(self.task_number, Ordering::Release);

        if let Some(current) = self.current_task.take() {
            current.owner_watch.abort();
            self.reset_task(&current.key).await;
            self.busy = false;
        }

        self.spec = spec;

        let Some(spec) = self.spec.clone() else {
            return;
        };

        match self
            .store
            .subscribe_children(
                &self.tasks_path,
                ChildFilter::equals(FIELD_STATE, spec.start_state().map(str::to_string)).limit(1),
            )
            .await
        {
            Ok(sub) => {
                let forwarder = spawn_child_forwarder(sub.receiver.resubscribe(), self.cmd_tx.clone(), false);
                self.new_task_sub = Some((sub, forwarder));
            }
            Err(error) => warn!(%error, "failed to subscribe to new-task listener"),
        }

        if spec.timeout_ms().is_some() {
            match self
                .store
                .subscribe_children(
                    &self.tasks_path,
                    ChildFilter::equals(FIELD_STATE, Some(spec.in_progress_state().to_string())),
                )
                .await
            {
                Ok(sub) => {
                    let forwarder = spawn_child_forwarder(sub.receiver.resubscribe(), self.cmd_tx.clone(), true);
                    self.timeout_sub = Some((sub, forwarder));
                }
                Err(error) => warn!(%error, "failed to subscribe to timeout listener"),
            }
        }
    }

    /// Try-to-process (§4.4 step 3): read a one-child page from the
    /// filtered view to locate a candidate and run the claim transaction
    /// on it. Called on every triggering event (a new-task `Added`, or a
    /// release after resolve/reject/shutdown-check), never on the
    /// triggering event's own key, since that key may already be stale
    /// or may not even be the first match the filtered view would
    /// return. Loops past a candidate whose transaction rewrote it as
    /// malformed, since that leaves it no longer eligible and a worker
    /// that is not busy should keep going rather than wait for another
    /// event that may never come (the backlog of `Added` events for
    /// already-queued tasks is only replayed once, at subscribe time).
    #[instrument(skip(self), fields(process_id = %self.process_id, task_number = self.task_number))]
    async fn try_to_process(&mut self) {
        loop {
            if self.busy {
                return;
            }
            if self.shutdown_requested {
                self.teardown().await;
                self.shutdown_state.complete();
                self.stopped = true;
                return;
            }
            let Some(spec) = self.spec.clone() else {
                return;
            };

            let start_state = spec.start_state().map(str::to_string);
            let filter = ChildFilter::equals(FIELD_STATE, start_state.clone()).limit(1);
            let candidate = match self.store.read_first_child(&self.tasks_path, filter).await {
                Ok(candidate) => candidate,
                Err(error) => {
                    warn!(%error, "failed to read a candidate task");
                    return;
                }
            };
            let Some((key, _)) = candidate else {
                return;
            };

            let in_progress_state = spec.in_progress_state().to_string();
            let error_state = spec.error_state().to_string();
            let candidate_task_number = self.task_number + 1;
            let identity = self.identity(candidate_task_number);

            let path = self.task_path(&key);
            let identity_for_txn = identity.clone();
            let result = retry_transaction(self.store.as_ref(), &path, move || {
                let start_state = start_state.clone();
                let in_progress_state = in_progress_state.clone();
                let error_state = error_state.clone();
                let identity = identity_for_txn.clone();
                boxed_txn(move |current| match current {
                    None => TransactionOutcome::Abort,
                    Some(current) => {
                        match record::apply_claim(
                            &current,
                            start_state.as_deref(),
                            &in_progress_state,
                            &error_state,
                        ) {
                            ClaimOutcome::Absent | ClaimOutcome::NoLongerEligible => {
                                TransactionOutcome::Abort
                            }
                            ClaimOutcome::Malformed(record) => TransactionOutcome::Write(record),
                            ClaimOutcome::Claimed(record) => {
                                TransactionOutcome::Write(record::stamp_owner(record, &identity))
                            }
                        }
                    }
                })
            })
            .await;

            let committed = match result {
                Ok(TransactionResult::Committed(value)) => value,
                Ok(TransactionResult::Aborted | TransactionResult::Deleted) => return,
                Err(error) => {
                    warn!(%error, key, "claim transaction exhausted retries");
                    return;
                }
            };

            if record::state_of(&committed) != Some(spec.in_progress_state()) {
                // The malformed-task branch committed, so this key is no
                // longer eligible. Go around again for the next candidate.
                debug!(key, "rewrote malformed task into error state");
                continue;
            }

            let claimed = committed;

            self.task_number = candidate_task_number;
            self.task_number_shared.store(self.task_number, Ordering::Release);
            self.busy = true;

            let owner_sub = match self.store.subscribe_value(&format!("{path}/{FIELD_OWNER}")).await {
                Ok(sub) => sub,
                Err(error) => {
                    warn!(%error, key, "failed to subscribe to owner watcher");
                    ValueSubscription { id: 0, receiver: tokio::sync::broadcast::channel(1).1 }
                }
            };
            let owner_watch =
                spawn_owner_watch(owner_sub, identity.clone(), candidate_task_number, self.cmd_tx.clone());

            self.current_task = Some(CurrentTask {
                key: key.clone(),
                task_number: candidate_task_number,
                owner_watch,
            });

            let input = record::prepare_for_processing(&claimed, self.sanitize, &key);
            let handle = TaskHandle {
                cmd_tx: self.cmd_tx.clone(),
                task_number: candidate_task_number,
                suppress_stack: self.suppress_stack,
            };
            let processing_fn = self.processing_fn.clone();
            tokio::spawn(async move {
                let handle_for_panic = handle.clone();
                let outcome = std::panic::AssertUnwindSafe((processing_fn)(input, handle))
                    .catch_unwind()
                    .await;
                if let Err(panic) = outcome {
                    let _ = handle_for_panic.reject(panic_message(&panic)).await;
                }
            });
            return;
        }
    }

    fn handle_timeout_event(&mut self, event: ChildEvent) {
        let Some(spec) = self.spec.clone() else { return };
        let Some(timeout_ms) = spec.timeout_ms() else { return };
        match event.kind {
            ChildEventKind::Removed => {
                self.owners.remove(&event.key);
                if let Some(timer) = self.expiry_timers.remove(&event.key) {
                    timer.abort();
                }
            }
            ChildEventKind::Added => {
                let owner = record::owner_of(&event.value).map(str::to_string);
                self.owners.insert(event.key.clone(), owner);
                self.schedule_expiry(event.key, &event.value, timeout_ms);
            }
            ChildEventKind::Changed => {
                let owner = record::owner_of(&event.value).map(str::to_string);
                if self.owners.get(&event.key).cloned().flatten() != owner {
                    self.owners.insert(event.key.clone(), owner);
                    self.schedule_expiry(event.key, &event.value, timeout_ms);
                }
            }
        }
    }

    fn schedule_expiry(&mut self, key: String, snapshot: &Value, timeout_ms: u64) {
        if let Some(prior) = self.expiry_timers.remove(&key) {
            prior.abort();
        }
        let changed_at = snapshot
            .as_object()
            .and_then(|m| m.get(FIELD_STATE_CHANGED))
            .and_then(Value::as_i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let now = chrono::Utc::now().timestamp_millis();
        let deadline = changed_at + timeout_ms as i64;
        let delay_ms = (deadline - now).max(0) as u64;

        let cmd_tx = self.cmd_tx.clone();
        let key_for_timer = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = cmd_tx.send(Command::ExpireTimer { key: key_for_timer });
        });
        self.expiry_timers.insert(key, handle);
    }

    async fn handle_expire_timer(&mut self, key: String) {
        self.expiry_timers.remove(&key);
        self.reset_task(&key).await;
    }

    async fn reset_task(&self, key: &str) {
        let Some(spec) = self.spec.clone() else { return };
        let path = self.task_path(key);
        let in_progress_state = spec.in_progress_state().to_string();
        let start_state = spec.start_state().map(str::to_string);
        let result = retry_transaction(self.store.as_ref(), &path, move || {
            let in_progress_state = in_progress_state.clone();
            let start_state = start_state.clone();
            boxed_txn(move |current| match current {
                None => TransactionOutcome::Abort,
                Some(current) => record::apply_reset(&current, &in_progress_state, start_state.as_deref()),
            })
        })
        .await;
        if let Err(error) = result {
            warn!(%error, key, "reset transaction exhausted retries");
        }
    }

    async fn handle_owner_invalidated(&mut self, task_number: u64) {
        let released = match &self.current_task {
            Some(current) if current.task_number == task_number => true,
            _ => false,
        };
        if !released {
            return;
        }
        debug!(task_number, "ownership stolen mid-flight, releasing current task");
        self.current_task = None;
        self.busy = false;
        if self.shutdown_requested {
            self.teardown().await;
            self.shutdown_state.complete();
            self.stopped = true;
        }
    }

    async fn handle_progress(&mut self, task_number: u64, value: f64) -> Result<(), QueueError<S::Error>> {
        let Some(current) = &self.current_task else {
            return Err(QueueError::InvalidArgs(
                "progress call targets a stale or already-released task".to_string(),
            ));
        };
        if current.task_number != task_number {
            return Err(QueueError::InvalidArgs(
                "progress call targets a stale or already-released task".to_string(),
            ));
        }
        let Some(spec) = self.spec.clone() else {
            return Err(QueueError::InvalidArgs("worker has no active spec".to_string()));
        };
        let path = self.task_path(&current.key);
        let in_progress_state = spec.in_progress_state().to_string();
        let identity = self.identity(task_number);
        let update = boxed_txn(move |current| match current {
            None => TransactionOutcome::Abort,
            Some(current) => record::apply_progress(&current, &in_progress_state, &identity, value),
        });
        transact_once(self.store.as_ref(), &path, update).await?;
        Ok(())
    }

    async fn handle_resolve(&mut self, task_number: u64, data: Option<Value>) -> Result<(), QueueError<S::Error>> {
        let stale = match &self.current_task {
            Some(current) => current.task_number != task_number,
            None => true,
        };
        if stale {
            self.try_to_process_after_release().await;
            return Ok(());
        }
        let current = self.current_task.take().expect("checked above");
        current.owner_watch.abort();
        let Some(spec) = self.spec.clone() else {
            self.busy = false;
            self.try_to_process_after_release().await;
            return Ok(());
        };
        let path = self.task_path(&current.key);
        let in_progress_state = spec.in_progress_state().to_string();
        let finished_state = spec.finished_state().map(str::to_string);
        let identity = self.identity(task_number);
        let result = retry_transaction(self.store.as_ref(), &path, move || {
            let in_progress_state = in_progress_state.clone();
            let finished_state = finished_state.clone();
            let identity = identity.clone();
            let data = data.clone();
            boxed_txn(move |current| match current {
                None => TransactionOutcome::Abort,
                Some(current) => record::apply_resolve(
                    &current,
                    &in_progress_state,
                    finished_state.as_deref(),
                    &identity,
                    data.clone(),
                ),
            })
        })
        .await;
        self.busy = false;
        let outcome = result.map(|_| ());
        self.try_to_process_after_release().await;
        outcome
    }

    async fn handle_reject(
        &mut self,
        task_number: u64,
        message: RejectionMessage,
    ) -> Result<(), QueueError<S::Error>> {
        let stale = match &self.current_task {
            Some(current) => current.task_number != task_number,
            None => true,
        };
        if stale {
            self.try_to_process_after_release().await;
            return Ok(());
        }
        let current = self.current_task.take().expect("checked above");
        current.owner_watch.abort();
        let Some(spec) = self.spec.clone() else {
            self.busy = false;
            self.try_to_process_after_release().await;
            return Ok(());
        };
        let path = self.task_path(&current.key);
        let in_progress_state = spec.in_progress_state().to_string();
        let start_state = spec.start_state().map(str::to_string);
        let error_state = spec.error_state().to_string();
        let retries = spec.retries();
        let identity = self.identity(task_number);
        let result = retry_transaction(self.store.as_ref(), &path, move || {
            let in_progress_state = in_progress_state.clone();
            let start_state = start_state.clone();
            let error_state = error_state.clone();
            let identity = identity.clone();
            let message = message.clone();
            boxed_txn(move |current| match current {
                None => TransactionOutcome::Abort,
                Some(current) => record::apply_reject(
                    &current,
                    &in_progress_state,
                    start_state.as_deref(),
                    &error_state,
                    retries,
                    &identity,
                    &message,
                ),
            })
        })
        .await;
        self.busy = false;
        let outcome = result.map(|_| ());
        self.try_to_process_after_release().await;
        outcome
    }

    /// After a resolve/reject clears `busy` (or a stale callback finds
    /// nothing to release), either resume shutdown (if one was requested
    /// while we were processing) or make another claim attempt (§4.4,
    /// §4.5, §9). A stale resolve/reject has no task of its own to
    /// re-drive, but still triggers a fresh claim attempt: §9 calls for a
    /// stale resolve to resolve immediately and nudge try-to-process.
    async fn try_to_process_after_release(&mut self) {
        if self.shutdown_requested {
            self.teardown().await;
            self.shutdown_state.complete();
            self.stopped = true;
            return;
        }
        self.try_to_process().await;
    }

    async fn teardown(&mut self) {
        if let Some((sub, forwarder)) = self.new_task_sub.take() {
            forwarder.abort();
            self.store.unsubscribe_children(sub.id).await;
        }
        if let Some((sub, forwarder)) = self.timeout_sub.take() {
            forwarder.abort();
            self.store.unsubscribe_children(sub.id).await;
        }
        for (_, timer) in self.expiry_timers.drain() {
            timer.abort();
        }
        if let Some(current) = self.current_task.take() {
            current.owner_watch.abort();
        }
    }
}

fn spawn_child_forwarder<E: std::error::Error + Send + Sync + 'static>(
    mut receiver: tokio::sync::broadcast::Receiver<ChildEvent>,
    cmd_tx: mpsc::UnboundedSender<Command<E>>,
    is_timeout_listener: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let cmd = if is_timeout_listener {
                        Command::TimeoutEvent(event)
                    } else {
                        Command::NewTaskEvent(event)
                    };
                    if cmd_tx.send(cmd).is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "worker listener lagged, dropped events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_owner_watch<E: std::error::Error + Send + Sync + 'static>(
    mut sub: ValueSubscription,
    expected_owner: String,
    task_number: u64,
    cmd_tx: mpsc::UnboundedSender<Command<E>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match sub.receiver.recv().await {
                Ok(event) => {
                    let observed = event.value.as_ref().and_then(Value::as_str);
                    if observed != Some(expected_owner.as_str()) {
                        let _ = cmd_tx.send(Command::OwnerInvalidated { task_number });
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "owner watcher lagged, dropped events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// A handle to one worker state machine (§2, §4.3). Cheap to hold: the
/// real state lives in the detached actor task; this struct is just the
/// command channel, the shared generation counter, and the shutdown
/// signal.
pub struct Worker<S: StoreAdapter> {
    cmd_tx: mpsc::UnboundedSender<Command<S::Error>>,
    process_id: String,
    task_number: Arc<AtomicU64>,
    shutdown_state: Arc<ShutdownState>,
}

impl<S: StoreAdapter> fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("process_id", &self.process_id)
            .field("task_number", &self.task_number.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<S: StoreAdapter> Worker<S> {
    /// Construct a worker bound to `tasks_path`, idle until
    /// [`Worker::set_task_spec`] is called. `process_id` is the caller's
    /// identity prefix (e.g. `<specId>:<index>` per §4.8); a random UUID
    /// is appended internally to form the full identity stamped into
    /// `_owner` (§3 "Worker Identity"). Every argument is required;
    /// an empty `process_id` or `tasks_path` is a configuration error
    /// (§4.3).
    pub fn new(
        store: Arc<S>,
        tasks_path: impl Into<String>,
        process_id: impl Into<String>,
        sanitize: bool,
        suppress_stack: bool,
        processing_fn: ProcessingFn<S::Error>,
    ) -> Result<Self, QueueError<S::Error>> {
        let tasks_path = tasks_path.into();
        let process_id_prefix = process_id.into();
        if tasks_path.is_empty() {
            return Err(QueueError::InvalidArgs("tasks_path must not be empty".to_string()));
        }
        if process_id_prefix.is_empty() {
            return Err(QueueError::InvalidArgs("process_id must not be empty".to_string()));
        }
        let process_id = format!("{process_id_prefix}:{}", Uuid::new_v4());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task_number = Arc::new(AtomicU64::new(0));
        let shutdown_state = Arc::new(ShutdownState::default());

        let actor = WorkerActor {
            store,
            tasks_path,
            process_id: process_id.clone(),
            sanitize,
            suppress_stack,
            processing_fn,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            spec: None,
            task_number: 0,
            task_number_shared: task_number.clone(),
            busy: false,
            shutdown_requested: false,
            stopped: false,
            current_task: None,
            new_task_sub: None,
            timeout_sub: None,
            expiry_timers: HashMap::new(),
            owners: HashMap::new(),
            shutdown_state: shutdown_state.clone(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            cmd_tx,
            process_id,
            task_number,
            shutdown_state,
        })
    }

    /// Reprogram this worker with a new (or absent) spec (§4.3,
    /// `SetTaskSpec`). Always strictly increments the worker's
    /// generation counter (§8 invariant 4), cancels and rebuilds every
    /// listener, and resets whatever task was in flight.
    pub async fn set_task_spec(&self, spec: Option<TaskSpec>) -> Result<(), QueueError<S::Error>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::SetSpec { spec, ack: ack_tx }).is_err() {
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }

    /// Request shutdown and wait for it to complete (§4.3). Safe and
    /// idempotent to call more than once, including concurrently: every
    /// caller observes the same completion.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        self.shutdown_state.wait().await;
    }

    /// This worker's full identity prefix (`<caller-prefix>:<uuid>`),
    /// before the per-claim `:<taskNumber>` suffix is appended for
    /// `_owner` (§3).
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// The worker's current generation counter, for introspection and
    /// tests (§8 invariant 4).
    pub fn task_number(&self) -> u64 {
        self.task_number.load(Ordering::Acquire)
    }
}
