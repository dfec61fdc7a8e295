//! Task Record: reserved-field conventions and the pure state transforms
//! a worker applies inside each transaction (§3, §4.4, §4.5).
//!
//! These functions are deliberately pure: given a snapshot and the
//! caller's intent they compute the next value (or an abort/delete), but
//! never talk to the store themselves. [`crate::worker::Worker`] is the
//! only caller, and it is responsible for feeding the result into a
//! retried [`crate::store::StoreAdapter::transaction`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{
    FIELD_ERROR_DETAILS, FIELD_ID, FIELD_NEW_STATE, FIELD_OWNER, FIELD_PROGRESS, FIELD_STATE,
    FIELD_STATE_CHANGED,
};
use crate::error::RejectionMessage;
use crate::store::{server_timestamp_sentinel, TransactionOutcome};

/// `_error_details`: `{previous_state?, error?, error_stack?, attempts?, original_task?}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_task: Option<Value>,
}

const RESERVED_FIELDS: &[&str] = &[
    FIELD_STATE,
    FIELD_STATE_CHANGED,
    FIELD_OWNER,
    FIELD_PROGRESS,
    FIELD_ERROR_DETAILS,
    FIELD_NEW_STATE,
    FIELD_ID,
];

/// `_state`, treating a present-but-null field the same as an absent one.
pub fn state_of(value: &Value) -> Option<&str> {
    value
        .as_object()
        .and_then(|m| m.get(FIELD_STATE))
        .and_then(Value::as_str)
}

/// `_owner`.
pub fn owner_of(value: &Value) -> Option<&str> {
    value
        .as_object()
        .and_then(|m| m.get(FIELD_OWNER))
        .and_then(Value::as_str)
}

/// `_error_details`, deserialized, ignoring a missing or `null` field.
pub fn error_details_of(value: &Value) -> Option<ErrorDetails> {
    let raw = value.as_object()?.get(FIELD_ERROR_DETAILS)?;
    if raw.is_null() {
        return None;
    }
    serde_json::from_value(raw.clone()).ok()
}

/// `_state == inProgressState ∧ _owner == identity`, the guard every
/// resolve/reject/progress transaction checks before committing (§3 Invariants).
pub fn is_owned_in_progress(value: &Value, in_progress_state: &str, identity: &str) -> bool {
    state_of(value) == Some(in_progress_state) && owner_of(value) == Some(identity)
}

/// Strip reserved fields (`sanitize=true`) or inject `_id` (`sanitize=false`)
/// before handing a task to the user's processing function (§4.4 step 4).
pub fn prepare_for_processing(value: &Value, sanitize: bool, id: &str) -> Value {
    let mut obj = value.as_object().cloned().unwrap_or_default();
    if sanitize {
        for field in RESERVED_FIELDS {
            obj.remove(*field);
        }
    } else {
        obj.insert(FIELD_ID.to_string(), Value::String(id.to_string()));
    }
    Value::Object(obj)
}

/// Outcome of attempting to claim a candidate task (§4.4 step 3).
pub enum ClaimOutcome {
    /// The candidate was absent by the time the transaction ran.
    Absent,
    /// The candidate no longer matched `startState`; leave it untouched.
    NoLongerEligible,
    /// The candidate was not a mapping; replaced with an error record.
    Malformed(Value),
    /// The candidate matched and was claimed; this is its new value.
    Claimed(Value),
}

/// Apply the claim transaction body (§4.4 step 3) to a snapshot.
pub fn apply_claim(
    current: &Value,
    start_state: Option<&str>,
    in_progress_state: &str,
    error_state: &str,
) -> ClaimOutcome {
    if current.is_null() {
        return ClaimOutcome::Absent;
    }
    let Some(obj) = current.as_object() else {
        return ClaimOutcome::Malformed(build_malformed_error_record(current.clone(), error_state));
    };
    let state = obj.get(FIELD_STATE).and_then(|v| {
        if v.is_null() {
            None
        } else {
            v.as_str()
        }
    });
    let eligible = match (state, start_state) {
        (None, None) => true,
        (Some(actual), Some(expected)) => actual == expected,
        _ => false,
    };
    if !eligible {
        return ClaimOutcome::NoLongerEligible;
    }
    let mut claimed = obj.clone();
    claimed.insert(
        FIELD_STATE.to_string(),
        Value::String(in_progress_state.to_string()),
    );
    claimed.insert(FIELD_STATE_CHANGED.to_string(), server_timestamp_sentinel());
    claimed.insert(FIELD_PROGRESS.to_string(), Value::from(0));
    ClaimOutcome::Claimed(Value::Object(claimed))
}

/// Stamp `_owner` onto an already-claimed candidate. Split out from
/// [`apply_claim`] because the owner identity (`processId:taskNumber`) is
/// only known to the worker, not to this pure-data module.
pub fn stamp_owner(mut claimed: Value, identity: &str) -> Value {
    if let Some(obj) = claimed.as_object_mut() {
        obj.insert(FIELD_OWNER.to_string(), Value::String(identity.to_string()));
    }
    claimed
}

/// Build the replacement record for a malformed (non-mapping) task (§4.4 step 3).
pub fn build_malformed_error_record(original: Value, error_state: &str) -> Value {
    let mut error_details = Map::new();
    error_details.insert(
        "error".to_string(),
        Value::String("Task was malformed".to_string()),
    );
    error_details.insert("original_task".to_string(), original);

    let mut record = Map::new();
    record.insert(FIELD_STATE.to_string(), Value::String(error_state.to_string()));
    record.insert(FIELD_STATE_CHANGED.to_string(), server_timestamp_sentinel());
    record.insert(FIELD_ERROR_DETAILS.to_string(), Value::Object(error_details));
    Value::Object(record)
}

/// Apply the progress transaction body (§4.5, `Progress`).
pub fn apply_progress(
    current: &Value,
    in_progress_state: &str,
    identity: &str,
    progress: f64,
) -> TransactionOutcome {
    if !is_owned_in_progress(current, in_progress_state, identity) {
        return TransactionOutcome::Abort;
    }
    let mut obj = current.as_object().cloned().unwrap_or_default();
    obj.insert(FIELD_PROGRESS.to_string(), serde_json::json!(progress));
    TransactionOutcome::Write(Value::Object(obj))
}

/// Apply the resolve transaction body (§4.5, `Resolve`).
///
/// `new_data` is the caller-supplied output, with `_new_state` pulled out
/// of it (if present) as the override described in §4.5 and §9's
/// open-question resolution: a literal `false` takes precedence over an
/// absent `finishedState`.
pub fn apply_resolve(
    current: &Value,
    in_progress_state: &str,
    finished_state: Option<&str>,
    identity: &str,
    new_data: Option<Value>,
) -> TransactionOutcome {
    if current.is_null() {
        return TransactionOutcome::Abort;
    }
    if !is_owned_in_progress(current, in_progress_state, identity) {
        return TransactionOutcome::Abort;
    }
    let mut output = match new_data {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let new_state_field = output.remove(FIELD_NEW_STATE);
    let delete = match &new_state_field {
        Some(Value::Bool(false)) => true,
        Some(Value::String(_)) => false,
        _ => finished_state.is_none(),
    };
    if delete {
        return TransactionOutcome::Delete;
    }
    let next_state = match new_state_field {
        Some(Value::String(s)) => s,
        _ => finished_state.expect("non-delete branch implies finishedState is set").to_string(),
    };
    output.insert(FIELD_STATE.to_string(), Value::String(next_state));
    output.insert(FIELD_STATE_CHANGED.to_string(), server_timestamp_sentinel());
    output.insert(FIELD_PROGRESS.to_string(), Value::from(100));
    TransactionOutcome::Write(Value::Object(output))
}

/// Apply the reject transaction body (§4.5, `Reject`).
///
/// `start_state: None` (no configured start state) resets `_state` to
/// `null` rather than removing the field, matching the claim guard's
/// treatment of absent and `null` `_state` as equivalent.
pub fn apply_reject(
    current: &Value,
    in_progress_state: &str,
    start_state: Option<&str>,
    error_state: &str,
    retries: u32,
    identity: &str,
    message: &RejectionMessage,
) -> TransactionOutcome {
    if !is_owned_in_progress(current, in_progress_state, identity) {
        return TransactionOutcome::Abort;
    }
    let mut obj = current.as_object().cloned().unwrap_or_default();

    let prior_attempts = error_details_of(current)
        .filter(|details| details.previous_state.as_deref() == Some(in_progress_state))
        .and_then(|details| details.attempts)
        .unwrap_or(0);

    let exhausted = prior_attempts >= u64::from(retries);
    if exhausted {
        obj.insert(FIELD_STATE.to_string(), Value::String(error_state.to_string()));
    } else {
        match start_state {
            Some(start) => {
                obj.insert(FIELD_STATE.to_string(), Value::String(start.to_string()));
            }
            None => {
                obj.insert(FIELD_STATE.to_string(), Value::Null);
            }
        }
    }

    let details = ErrorDetails {
        previous_state: Some(in_progress_state.to_string()),
        error: Some(message.message.clone()),
        error_stack: message.stack.clone(),
        attempts: Some(prior_attempts + 1),
        original_task: None,
    };
    obj.insert(
        FIELD_ERROR_DETAILS.to_string(),
        serde_json::to_value(&details).expect("ErrorDetails always serializes"),
    );
    obj.insert(FIELD_STATE_CHANGED.to_string(), server_timestamp_sentinel());
    obj.remove(FIELD_OWNER);
    // _progress is intentionally left untouched: tests require it survive onto error records.
    TransactionOutcome::Write(Value::Object(obj))
}

/// Apply the reset transaction body (§4.5, `Reset`): return an in-progress
/// task to `startState`, clearing ownership, progress, and error details.
pub fn apply_reset(current: &Value, in_progress_state: &str, start_state: Option<&str>) -> TransactionOutcome {
    if state_of(current) != Some(in_progress_state) {
        return TransactionOutcome::Abort;
    }
    let mut obj = current.as_object().cloned().unwrap_or_default();
    match start_state {
        Some(start) => {
            obj.insert(FIELD_STATE.to_string(), Value::String(start.to_string()));
        }
        None => {
            obj.remove(FIELD_STATE);
        }
    }
    obj.remove(FIELD_OWNER);
    obj.remove(FIELD_PROGRESS);
    obj.remove(FIELD_ERROR_DETAILS);
    obj.insert(FIELD_STATE_CHANGED.to_string(), server_timestamp_sentinel());
    TransactionOutcome::Write(Value::Object(obj))
}
