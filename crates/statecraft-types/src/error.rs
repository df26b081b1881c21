//! The protocol error record and reserved error names.
//!
//! Errors in the States Language are strings, not types: a state that fails
//! carries an error *name* plus an optional human-readable cause. Names
//! beginning with `States.` are reserved for the engine; any other string is
//! a user-defined error name emitted by a task executor.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Reserved error names
// ---------------------------------------------------------------------------

/// Wildcard matcher in `Retry`/`Catch` lists. Never surfaced as an error.
pub const ERROR_ALL: &str = "States.ALL";

/// A task or machine exceeded its `TimeoutSeconds`.
pub const ERROR_TIMEOUT: &str = "States.Timeout";

/// A task executor failed without a structured error record.
pub const ERROR_TASK_FAILED: &str = "States.TaskFailed";

/// A task executor was denied access to its resource.
pub const ERROR_PERMISSIONS: &str = "States.Permissions";

/// A `ResultPath` could not be applied to the raw input.
pub const ERROR_RESULT_PATH_MATCH_FAILURE: &str = "States.ResultPathMatchFailure";

/// An `InputPath`/`OutputPath`/`Parameters` reference failed to resolve.
pub const ERROR_PARAMETER_PATH_FAILURE: &str = "States.ParameterPathFailure";

/// A Parallel branch failed after exhausting its own retries and catchers.
pub const ERROR_BRANCH_FAILED: &str = "States.BranchFailed";

/// A Choice state matched no rule and has no `Default`.
pub const ERROR_NO_CHOICE_MATCHED: &str = "States.NoChoiceMatched";

/// An intrinsic function call was malformed or failed to evaluate.
pub const ERROR_INTRINSIC_FAILURE: &str = "States.IntrinsicFailure";

/// Engine-issued when an execution or branch is cancelled mid-flight.
pub const ERROR_CANCELLED: &str = "States.Cancelled";

/// Engine-issued when the interpreter itself cannot proceed (max-steps
/// safeguard tripped, internal invariant broken, malformed wait clock).
pub const ERROR_RUNTIME: &str = "States.Runtime";

// ---------------------------------------------------------------------------
// ErrorRecord
// ---------------------------------------------------------------------------

/// A runtime error: a States-protocol error name plus an optional cause.
///
/// Serializes as `{"Error": ..., "Cause": ...}`, which is exactly the
/// payload a catcher injects into the document via its `ResultPath`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "PascalCase")]
#[error("{error}{}", .cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
pub struct ErrorRecord {
    /// The error name (reserved `States.*` or user-defined).
    pub error: String,
    /// Optional human-readable description of what went wrong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorRecord {
    /// Create an error record with a name and a cause.
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: Some(cause.into()),
        }
    }

    /// Create an error record with a name only.
    pub fn named(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: None,
        }
    }

    pub fn timeout() -> Self {
        Self::named(ERROR_TIMEOUT)
    }

    pub fn cancelled() -> Self {
        Self::named(ERROR_CANCELLED)
    }

    pub fn task_failed(cause: impl Into<String>) -> Self {
        Self::new(ERROR_TASK_FAILED, cause)
    }

    pub fn parameter_path(cause: impl Into<String>) -> Self {
        Self::new(ERROR_PARAMETER_PATH_FAILURE, cause)
    }

    pub fn result_path(cause: impl Into<String>) -> Self {
        Self::new(ERROR_RESULT_PATH_MATCH_FAILURE, cause)
    }

    pub fn intrinsic(cause: impl Into<String>) -> Self {
        Self::new(ERROR_INTRINSIC_FAILURE, cause)
    }

    pub fn no_choice_matched() -> Self {
        Self::named(ERROR_NO_CHOICE_MATCHED)
    }

    pub fn branch_failed(cause: impl Into<String>) -> Self {
        Self::new(ERROR_BRANCH_FAILED, cause)
    }

    pub fn runtime(cause: impl Into<String>) -> Self {
        Self::new(ERROR_RUNTIME, cause)
    }

    /// The `{"Error", "Cause"}` payload a catcher injects into the document.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
