//! Task Spec: validated per-worker state-machine configuration (§3, §4.1).

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_IN_PROGRESS_STATE, DEFAULT_TIMEOUT_MS};
use crate::error::SpecValidationError;

/// `{ startState?, inProgressState, finishedState?, errorState?, timeout?, retries? }`.
///
/// Constructed via [`TaskSpec::new`] or [`TaskSpecBuilder`], both of
/// which validate eagerly per §4.1 and never hand back a spec a worker
/// could not safely run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskSpec {
    start_state: Option<String>,
    in_progress_state: String,
    finished_state: Option<String>,
    error_state: Option<String>,
    timeout: Option<u64>,
    retries: Option<u32>,
}

impl TaskSpec {
    /// Validate and construct a spec. Mirrors the rules in §4.1 exactly.
    pub fn new(
        start_state: Option<String>,
        in_progress_state: String,
        finished_state: Option<String>,
        error_state: Option<String>,
        timeout: Option<u64>,
        retries: Option<u32>,
    ) -> Result<Self, SpecValidationError> {
        if in_progress_state.is_empty() {
            return Err(SpecValidationError::EmptyInProgressState);
        }
        for name in [&start_state, &finished_state, &error_state] {
            if let Some(s) = name {
                if s.is_empty() {
                    return Err(SpecValidationError::EmptyStateName);
                }
            }
        }
        if let Some(start) = &start_state {
            if start == &in_progress_state {
                return Err(SpecValidationError::StartEqualsInProgress);
            }
        }
        if let Some(finished) = &finished_state {
            if finished == &in_progress_state || Some(finished) == start_state.as_ref() {
                return Err(SpecValidationError::FinishedStateCollision);
            }
        }
        if let Some(error) = &error_state {
            if error == &in_progress_state {
                return Err(SpecValidationError::ErrorEqualsInProgress);
            }
        }
        if let Some(timeout) = timeout {
            if timeout == 0 {
                return Err(SpecValidationError::NonPositiveTimeout);
            }
        }
        Ok(Self {
            start_state,
            in_progress_state,
            finished_state,
            error_state,
            timeout,
            retries,
        })
    }

    /// The default spec a [`crate::queue::Queue`] programs its workers
    /// with when constructed without a `specId` (§4.8): `inProgressState
    /// = "in_progress"`, `timeout = 300000`, everything else unset.
    pub fn default_spec() -> Self {
        Self {
            start_state: None,
            in_progress_state: DEFAULT_IN_PROGRESS_STATE.to_string(),
            finished_state: None,
            error_state: None,
            timeout: Some(DEFAULT_TIMEOUT_MS),
            retries: None,
        }
    }

    /// `startState`; a task whose `_state` is absent or `null` matches this.
    pub fn start_state(&self) -> Option<&str> {
        self.start_state.as_deref()
    }

    /// `inProgressState`, always present.
    pub fn in_progress_state(&self) -> &str {
        &self.in_progress_state
    }

    /// `finishedState`; `None` means "delete the record on resolve".
    pub fn finished_state(&self) -> Option<&str> {
        self.finished_state.as_deref()
    }

    /// `errorState`, defaulting to `"error"` per §4.3/§6 when unset.
    pub fn error_state(&self) -> &str {
        self.error_state
            .as_deref()
            .unwrap_or(crate::constants::DEFAULT_ERROR_STATE)
    }

    /// Lease duration in milliseconds, if this spec reclaims stalled tasks.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout
    }

    /// Maximum retry count before a rejected task moves to `errorState`.
    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(0)
    }
}

/// Builder mirroring the teacher's documented-default configuration
/// structs (`StoreConfig`-style): construct incrementally, validate on
/// [`TaskSpecBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct TaskSpecBuilder {
    start_state: Option<String>,
    in_progress_state: Option<String>,
    finished_state: Option<String>,
    error_state: Option<String>,
    timeout: Option<u64>,
    retries: Option<u32>,
}

impl TaskSpecBuilder {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `startState`.
    pub fn start_state(mut self, state: impl Into<String>) -> Self {
        self.start_state = Some(state.into());
        self
    }

    /// Set the required `inProgressState`.
    pub fn in_progress_state(mut self, state: impl Into<String>) -> Self {
        self.in_progress_state = Some(state.into());
        self
    }

    /// Set `finishedState`.
    pub fn finished_state(mut self, state: impl Into<String>) -> Self {
        self.finished_state = Some(state.into());
        self
    }

    /// Set `errorState`.
    pub fn error_state(mut self, state: impl Into<String>) -> Self {
        self.error_state = Some(state.into());
        self
    }

    /// Set the lease timeout in milliseconds.
    pub fn timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry budget.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Validate and produce a [`TaskSpec`].
    pub fn build(self) -> Result<TaskSpec, SpecValidationError> {
        let in_progress_state = self
            .in_progress_state
            .unwrap_or_default();
        TaskSpec::new(
            self.start_state,
            in_progress_state,
            self.finished_state,
            self.error_state,
            self.timeout,
            self.retries,
        )
    }
}
