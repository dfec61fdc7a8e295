//! Error types for queue, worker and store-adapter operations.

use std::fmt;

/// Errors surfaced by the queue, worker, and spec-validation layers.
///
/// Store adapter implementations report their own failures through
/// [`QueueError::Store`], which wraps the adapter's associated error
/// type without interpreting it (the generic worker code treats store
/// failures as opaque and transient), retrying per
/// [`crate::constants::MAX_TRANSACTION_ATTEMPTS`] before surfacing
/// [`QueueError::StoreExhausted`].
#[derive(Debug, thiserror::Error)]
pub enum QueueError<E: std::error::Error + Send + Sync + 'static> {
    /// A [`crate::spec::TaskSpec`] failed validation (§4.1).
    #[error("invalid task spec: {0}")]
    InvalidSpec(#[from] SpecValidationError),

    /// Constructor arguments for a [`crate::worker::Worker`] or
    /// [`crate::queue::Queue`] were invalid.
    #[error("invalid constructor arguments: {0}")]
    InvalidArgs(String),

    /// A transaction was retried `MAX_TRANSACTION_ATTEMPTS` times without
    /// committing; the operation it backed has given up.
    #[error("errored too many times, no longer retrying")]
    StoreExhausted,

    /// Shutdown has been requested; new claims are refused while other
    /// in-flight operations are allowed to finish.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// The store adapter reported a backend-specific failure.
    #[error(transparent)]
    Store(#[from] E),
}

/// Why a [`crate::spec::TaskSpec`] was rejected, per §4.1.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecValidationError {
    /// `inProgressState` was absent or the empty string.
    #[error("inProgressState must be a non-empty string")]
    EmptyInProgressState,
    /// `startState` equalled `inProgressState`.
    #[error("startState must differ from inProgressState")]
    StartEqualsInProgress,
    /// `finishedState` coincided with `startState` or `inProgressState`.
    #[error("finishedState must differ from startState and inProgressState")]
    FinishedStateCollision,
    /// `errorState` equalled `inProgressState`.
    #[error("errorState must differ from inProgressState")]
    ErrorEqualsInProgress,
    /// `timeout` was present but not a positive integer.
    #[error("timeout must be a positive integer number of milliseconds")]
    NonPositiveTimeout,
    /// A state name field was present but the empty string.
    #[error("state names must be non-empty strings")]
    EmptyStateName,
}

/// Stringified form of whatever the processing function rejected with,
/// captured alongside an optional stack trace (§4.5, `Reject`).
#[derive(Debug, Clone)]
pub struct RejectionMessage {
    /// The human-readable message.
    pub message: String,
    /// Captured stack/backtrace text, present unless `suppress_stack` was set.
    pub stack: Option<String>,
}

impl fmt::Display for RejectionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<&str> for RejectionMessage {
    fn from(value: &str) -> Self {
        Self {
            message: value.to_string(),
            stack: None,
        }
    }
}

impl From<String> for RejectionMessage {
    fn from(message: String) -> Self {
        Self {
            message,
            stack: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct FakeStoreError;

    #[test]
    fn spec_validation_errors_display() {
        assert_eq!(
            SpecValidationError::EmptyInProgressState.to_string(),
            "inProgressState must be a non-empty string"
        );
    }

    #[test]
    fn store_exhausted_display() {
        let err: QueueError<FakeStoreError> = QueueError::StoreExhausted;
        assert_eq!(err.to_string(), "errored too many times, no longer retrying");
    }

    #[test]
    fn store_error_wraps_transparently() {
        let err: QueueError<FakeStoreError> = QueueError::Store(FakeStoreError);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn rejection_message_from_str() {
        let msg: RejectionMessage = "boom".into();
        assert_eq!(msg.message, "boom");
        assert!(msg.stack.is_none());
    }
}
