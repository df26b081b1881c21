//! Execution tracking types: status and the per-state history record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Overall status of a machine execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    /// Whether the execution has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Succeeded | ExecutionStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// HistoryEntry
// ---------------------------------------------------------------------------

/// Audit record for a single completed state transition.
///
/// History is append-only and ordered by `exited_at`; sub-execution history
/// (Parallel branches) is not merged into the parent's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Name of the state that ran.
    pub state_name: String,
    /// When the dispatcher entered the state.
    pub entered_at: DateTime<Utc>,
    /// When the state yielded its transition.
    pub exited_at: DateTime<Utc>,
    /// Snapshot of the working document after the state's output filters.
    pub output: Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
