//! The task execution boundary and the shared execution context.
//!
//! The engine never interprets a Task state's `Resource` URI; it hands the
//! effective input to the caller-supplied [`TaskExecutor`] and converts
//! whatever comes back into the protocol's error records.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;
use thiserror::Error;

use statecraft_types::error::ErrorRecord;

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// Failure raised by a task executor.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// A structured `{Error, Cause}` record, carried through verbatim.
    #[error("{error}")]
    Structured {
        error: String,
        cause: Option<String>,
    },

    /// A plain failure message; surfaces as `States.TaskFailed` with the
    /// message as cause.
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Structured error with a name and a cause.
    pub fn structured(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Structured {
            error: error.into(),
            cause: Some(cause.into()),
        }
    }

    /// Structured error with a name only.
    pub fn named(error: impl Into<String>) -> Self {
        Self::Structured {
            error: error.into(),
            cause: None,
        }
    }

    /// Unstructured failure message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<TaskError> for ErrorRecord {
    fn from(error: TaskError) -> Self {
        match error {
            TaskError::Structured { error, cause } => ErrorRecord { error, cause },
            TaskError::Failed(message) => ErrorRecord::task_failed(message),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

/// The callable behind every Task state.
///
/// Object-safe with a boxed future so implementations can be shared as
/// `Arc<dyn TaskExecutor>` across an execution and its Parallel branches.
pub trait TaskExecutor: Send + Sync {
    /// Run `resource` with the effective input and optional credentials.
    fn execute(
        &self,
        resource: &str,
        input: Value,
        credentials: Option<&Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + '_>>;
}

/// Adapter turning a plain synchronous closure into a [`TaskExecutor`].
pub struct FnTaskExecutor<F>(F);

impl<F> FnTaskExecutor<F>
where
    F: Fn(&str, Value, Option<&Value>) -> Result<Value, TaskError> + Send + Sync,
{
    pub fn new(function: F) -> Self {
        Self(function)
    }
}

impl<F> TaskExecutor for FnTaskExecutor<F>
where
    F: Fn(&str, Value, Option<&Value>) -> Result<Value, TaskError> + Send + Sync,
{
    fn execute(
        &self,
        resource: &str,
        input: Value,
        credentials: Option<&Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + '_>> {
        let result = (self.0)(resource, input, credentials);
        Box::pin(async move { result })
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Shape of a Parallel state's raw result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelOutputMode {
    /// An ordered array positionally aligned with the branch list.
    #[default]
    Array,
    /// Legacy shape: branch outputs deep-merged into a single object.
    DeepMerge,
}

/// Immutable context shared read-only by an execution and all of its
/// Parallel branch sub-executions.
pub struct ExecutionContext {
    pub(crate) task_executor: Arc<dyn TaskExecutor>,
    pub(crate) credentials: Option<Value>,
    pub(crate) max_steps: Option<u32>,
    pub(crate) parallel_output: ParallelOutputMode,
    rng: Mutex<StdRng>,
}

impl ExecutionContext {
    pub fn new(task_executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            task_executor,
            credentials: None,
            max_steps: None,
            parallel_output: ParallelOutputMode::default(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Credentials handed verbatim to the task executor.
    pub fn with_credentials(mut self, credentials: Value) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Bound on transitions per execution, as an infinite-loop safeguard.
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Select the Parallel raw-result shape.
    pub fn with_parallel_output(mut self, mode: ParallelOutputMode) -> Self {
        self.parallel_output = mode;
        self
    }

    /// Seed the context RNG for deterministic `States.UUID` /
    /// `States.MathRandom` output in tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Lock the context RNG. Never held across an await point.
    pub(crate) fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
