//! Reserved field names and tunables shared across the crate.

/// Maximum number of times a transaction is retried against the store
/// before the operation it backs gives up.
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 10;

/// State name a [`crate::queue::Queue`] programs its workers with when
/// constructed without a `specId`.
pub const DEFAULT_IN_PROGRESS_STATE: &str = "in_progress";

/// Lease duration (ms) used by the default spec.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// State a worker falls back to for malformed tasks and unrecoverable
/// retries when the spec does not set `errorState`.
pub const DEFAULT_ERROR_STATE: &str = "error";

/// Reserved task record field: current lifecycle state.
pub const FIELD_STATE: &str = "_state";
/// Reserved task record field: server timestamp of the last transition.
pub const FIELD_STATE_CHANGED: &str = "_state_changed";
/// Reserved task record field: `<processId>:<taskNumber>` of the current lease holder.
pub const FIELD_OWNER: &str = "_owner";
/// Reserved task record field: advisory progress, 0..=100.
pub const FIELD_PROGRESS: &str = "_progress";
/// Reserved task record field: `{previous_state, error, error_stack, attempts, original_task}`.
pub const FIELD_ERROR_DETAILS: &str = "_error_details";
/// Reserved task record field: injected key, only present when `sanitize == false`.
pub const FIELD_ID: &str = "_id";
/// Reserved task record field: caller-supplied override of the post-resolve state.
pub const FIELD_NEW_STATE: &str = "_new_state";
