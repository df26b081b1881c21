//! Machine definition types: the canonical IR for a parsed Amazon States
//! Language tree.
//!
//! Field names follow the exact case-sensitive ASL spelling (`StartAt`,
//! `InputPath`, `ErrorEquals`, ...) so definitions round-trip byte-for-byte
//! through serde. The engine consumes definitions as an already-parsed
//! `serde_json::Value`; loaders for serialized formats live outside this
//! workspace.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// A filter path that distinguishes an explicit `null` from an absent field.
///
/// `InputPath: null` replaces the input with `{}` while omitting the field
/// selects the whole document, so plain `Option` (which folds JSON `null`
/// into "absent") cannot represent the grammar. Outer `None` = field absent,
/// `Some(None)` = explicit `null`, `Some(Some(path))` = a reference path.
pub type PathField = Option<Option<String>>;

/// Deserialize helper capturing a present field even when its value is a
/// literal `null`.
fn present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ---------------------------------------------------------------------------
// Machine definition
// ---------------------------------------------------------------------------

/// A complete machine definition: a named-state tree with a designated
/// start state. Also the shape of each Parallel branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Name of the state the execution enters first.
    pub start_at: String,
    /// Whole-machine timeout; exceeding it fails the execution with
    /// `States.Timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// The named states.
    pub states: HashMap<String, StateDefinition>,
}

// ---------------------------------------------------------------------------
// State definition (closed sum over the seven kinds)
// ---------------------------------------------------------------------------

/// A single state, tagged by its ASL `Type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum StateDefinition {
    Pass(PassState),
    Task(TaskState),
    Choice(ChoiceState),
    Wait(WaitState),
    Parallel(ParallelState),
    Succeed(SucceedState),
    Fail(FailState),
}

impl StateDefinition {
    /// The ASL `Type` tag, for logging and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StateDefinition::Pass(_) => "Pass",
            StateDefinition::Task(_) => "Task",
            StateDefinition::Choice(_) => "Choice",
            StateDefinition::Wait(_) => "Wait",
            StateDefinition::Parallel(_) => "Parallel",
            StateDefinition::Succeed(_) => "Succeed",
            StateDefinition::Fail(_) => "Fail",
        }
    }

    /// The `Next` target, if this state declares one.
    pub fn next(&self) -> Option<&str> {
        match self {
            StateDefinition::Pass(s) => s.next.as_deref(),
            StateDefinition::Task(s) => s.next.as_deref(),
            StateDefinition::Wait(s) => s.next.as_deref(),
            StateDefinition::Parallel(s) => s.next.as_deref(),
            StateDefinition::Choice(_)
            | StateDefinition::Succeed(_)
            | StateDefinition::Fail(_) => None,
        }
    }

    /// Whether this state declares `End: true`.
    pub fn is_end(&self) -> bool {
        match self {
            StateDefinition::Pass(s) => s.end,
            StateDefinition::Task(s) => s.end,
            StateDefinition::Wait(s) => s.end,
            StateDefinition::Parallel(s) => s.end,
            StateDefinition::Choice(_)
            | StateDefinition::Succeed(_)
            | StateDefinition::Fail(_) => false,
        }
    }

    /// Whether the state ends the execution (Succeed, Fail, or `End: true`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StateDefinition::Succeed(_) | StateDefinition::Fail(_)
        ) || self.is_end()
    }

    /// The state's `Catch` list, for states that support one.
    pub fn catchers(&self) -> &[Catcher] {
        match self {
            StateDefinition::Task(s) => &s.catch,
            StateDefinition::Parallel(s) => &s.catch,
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Per-kind attribute records
// ---------------------------------------------------------------------------

/// Pass: forwards its (optionally templated) input, or a literal `Result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PassState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub input_path: PathField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Literal raw result; when present it replaces the effective input.
    /// `Result: null` is a valid literal and is kept distinct from absent.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result_path: PathField,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub output_path: PathField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Task: invokes the context's task executor against an opaque resource URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Opaque resource URI handed to the task executor uninterpreted.
    pub resource: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub input_path: PathField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result_path: PathField,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub output_path: PathField,
    /// Per-invocation timeout; elapsing raises `States.Timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Accepted and round-tripped; heartbeat enforcement is a host concern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Choice: routes on the first matching rule, or `Default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub input_path: PathField,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub output_path: PathField,
    pub choices: Vec<ChoiceRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Wait: sleeps until its single clock source elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub input_path: PathField,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub output_path: PathField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_path: Option<String>,
    /// ISO-8601 timestamp; already-past timestamps wait zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Parallel: runs each branch concurrently on a copy of the effective input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParallelState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub input_path: PathField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result_path: PathField,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub output_path: PathField,
    /// Each branch is a full sub-machine (`StartAt` + `States`).
    pub branches: Vec<MachineDefinition>,
    /// Upper bound on concurrently running branches; defaults to the branch
    /// count. Zero is rejected at validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

/// Succeed: terminal; ends the execution with status `succeeded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SucceedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub input_path: PathField,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub output_path: PathField,
}

/// Fail: terminal; ends the execution with status `failed` and an error
/// record built from `Error`/`Cause`. No filters apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

// ---------------------------------------------------------------------------
// Retry / Catch
// ---------------------------------------------------------------------------

/// An entry in a state's `Retry` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Retrier {
    /// Error names this retrier matches; `States.ALL` is the wildcard.
    pub error_equals: Vec<String>,
    /// Base delay before the first retry (default 1).
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Number of retries; the work step runs at most `1 + MaxAttempts`
    /// times (default 3). Counted per retrier, not per state invocation.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Multiplier applied per retry: the kth retry sleeps
    /// `IntervalSeconds * BackoffRate^(k-1)` (default 2.0).
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
}

fn default_interval_seconds() -> u64 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_rate() -> f64 {
    2.0
}

/// An entry in a state's `Catch` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Catcher {
    /// Error names this catcher matches; `States.ALL` is the wildcard.
    pub error_equals: Vec<String>,
    /// State to transition to with the error payload injected.
    pub next: String,
    /// Where in the raw input to inject `{"Error", "Cause"}` (default `$`).
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result_path: PathField,
}

// ---------------------------------------------------------------------------
// Choice rules
// ---------------------------------------------------------------------------

/// A single choice rule: either a comparator applied to `Variable`, or a
/// boolean combinator (`And` / `Or` / `Not`) over nested rules.
///
/// Comparator keys (`StringEquals`, `NumericGreaterThanPath`, `IsPresent`,
/// ...) are captured verbatim in `comparison` and interpreted by the
/// engine's choice evaluator; only top-level rules carry `Next`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<ChoiceRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<ChoiceRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<ChoiceRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// The comparator key/operand pair, e.g. `"NumericGreaterThan": 5`.
    #[serde(flatten)]
    pub comparison: BTreeMap<String, Value>,
}

impl ChoiceRule {
    /// Whether this rule is a boolean combinator rather than a comparator.
    pub fn is_combinator(&self) -> bool {
        self.and.is_some() || self.or.is_some() || self.not.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
