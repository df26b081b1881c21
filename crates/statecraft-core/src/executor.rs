//! The execution record and transition loop.
//!
//! An [`Execution`] drives a JSON document through the machine's states one
//! transition at a time: look up the current state, apply the I/O filter
//! pipeline around its work step, replace the working document, append a
//! history entry, and route to the next state or terminate. Retry/catch
//! dispatch for Task and Parallel lives here as free functions over the
//! variant's attributes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use statecraft_types::error::{ERROR_CANCELLED, ErrorRecord};
use statecraft_types::execution::{ExecutionStatus, HistoryEntry};
use statecraft_types::machine::{
    Catcher, ChoiceState, ParallelState, PassState, PathField, Retrier, StateDefinition,
    SucceedState, TaskState, WaitState,
};

use crate::choice;
use crate::definition::Machine;
use crate::parallel;
use crate::path::ReferencePath;
use crate::pipeline;
use crate::retry;
use crate::task::ExecutionContext;

impl Machine {
    /// Begin an execution of this machine.
    pub fn start_execution(
        self: Arc<Self>,
        input: Value,
        name: impl Into<String>,
        context: Arc<ExecutionContext>,
    ) -> Execution {
        Execution::new(self, input, name, context)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// A single run of a machine over one input document.
pub struct Execution {
    machine: Arc<Machine>,
    context: Arc<ExecutionContext>,
    name: String,
    status: ExecutionStatus,
    current_state: Option<String>,
    input: Value,
    output: Value,
    error: Option<ErrorRecord>,
    history: Vec<HistoryEntry>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    steps_taken: u32,
    cancellation: CancellationToken,
}

impl Execution {
    /// Create an execution positioned at the machine's `StartAt`.
    pub fn new(
        machine: Arc<Machine>,
        input: Value,
        name: impl Into<String>,
        context: Arc<ExecutionContext>,
    ) -> Self {
        Self::with_cancellation(machine, input, name, context, CancellationToken::new())
    }

    pub(crate) fn with_cancellation(
        machine: Arc<Machine>,
        input: Value,
        name: impl Into<String>,
        context: Arc<ExecutionContext>,
        cancellation: CancellationToken,
    ) -> Self {
        let name = name.into();
        let start_at = machine.definition().start_at.clone();
        tracing::info!(execution = %name, start_at = %start_at, "starting execution");
        Self {
            machine,
            context,
            name,
            status: ExecutionStatus::Running,
            current_state: Some(start_at),
            output: input.clone(),
            input,
            error: None,
            history: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            steps_taken: 0,
            cancellation,
        }
    }

    // -- Inspection ---------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Name of the state the execution is positioned at; `None` once
    /// terminal.
    pub fn current_state(&self) -> Option<&str> {
        self.current_state.as_deref()
    }

    /// The original input document.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// The current working document (the final output once terminal).
    pub fn output(&self) -> &Value {
        &self.output
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        self.error.as_ref()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Wall-clock time spent so far (or total, once terminal).
    pub fn execution_time(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }

    /// Token that cancels this execution and any running branches. Clone it
    /// before `run_all` to cancel from another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    // -- Driving ------------------------------------------------------------

    /// Perform one transition. No-op when the execution is terminal.
    pub async fn step(&mut self) -> ExecutionStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        if self.cancellation.is_cancelled() {
            self.finish_failed(ErrorRecord::cancelled());
            return self.status;
        }
        if let Some(max_steps) = self.context.max_steps {
            if self.steps_taken >= max_steps {
                self.finish_failed(ErrorRecord::runtime(format!(
                    "exceeded the configured maximum of {max_steps} steps"
                )));
                return self.status;
            }
        }

        let Some(state_name) = self.current_state.clone() else {
            self.finish_failed(ErrorRecord::runtime("running execution has no current state"));
            return self.status;
        };
        let Some(state) = self.machine.state(&state_name).cloned() else {
            self.finish_failed(ErrorRecord::runtime(format!(
                "current state '{state_name}' is not defined"
            )));
            return self.status;
        };

        let entered_at = Utc::now();
        tracing::info!(
            execution = %self.name,
            state = %state_name,
            kind = state.kind(),
            "entering state"
        );
        let outcome = run_state(
            &state_name,
            &state,
            &self.output,
            &self.context,
            &self.cancellation,
        )
        .await;
        self.steps_taken += 1;

        match outcome {
            Ok(Transition::Next { next, output }) => {
                tracing::info!(
                    execution = %self.name,
                    state = %state_name,
                    next = %next,
                    "state completed"
                );
                self.record_history(&state_name, entered_at, output.clone());
                self.output = output;
                self.current_state = Some(next);
            }
            Ok(Transition::Complete { output }) => {
                self.record_history(&state_name, entered_at, output.clone());
                self.output = output;
                self.finish_succeeded();
            }
            Ok(Transition::Failed { error }) => {
                let snapshot = self.output.clone();
                self.record_history(&state_name, entered_at, snapshot);
                self.finish_failed(error);
            }
            Err(error) => self.finish_failed(error),
        }
        self.status
    }

    /// Repeat [`step`](Self::step) until terminal, bounded by the machine's
    /// `TimeoutSeconds` when one is declared.
    pub async fn run_all(&mut self) -> ExecutionStatus {
        let machine_timeout = self.machine.definition().timeout_seconds;
        match machine_timeout {
            Some(seconds) => {
                if timeout(Duration::from_secs(seconds), self.drive())
                    .await
                    .is_err()
                {
                    self.cancellation.cancel();
                    self.finish_failed(ErrorRecord::timeout());
                }
            }
            None => self.drive().await,
        }
        self.status
    }

    async fn drive(&mut self) {
        while !self.status.is_terminal() {
            self.step().await;
        }
    }

    // -- Bookkeeping --------------------------------------------------------

    fn record_history(&mut self, state_name: &str, entered_at: DateTime<Utc>, output: Value) {
        self.history.push(HistoryEntry {
            state_name: state_name.to_string(),
            entered_at,
            exited_at: Utc::now(),
            output,
        });
    }

    fn finish_succeeded(&mut self) {
        self.status = ExecutionStatus::Succeeded;
        self.current_state = None;
        self.finished_at = Some(Utc::now());
        tracing::info!(execution = %self.name, "execution succeeded");
    }

    fn finish_failed(&mut self, error: ErrorRecord) {
        tracing::error!(execution = %self.name, error = %error, "execution failed");
        self.status = ExecutionStatus::Failed;
        self.current_state = None;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }
}

// ---------------------------------------------------------------------------
// State dispatch
// ---------------------------------------------------------------------------

/// What a state's work step resolved to.
enum Transition {
    /// Route to another state with a new working document.
    Next { next: String, output: Value },
    /// Terminate the execution successfully (Succeed or `End: true`).
    Complete { output: Value },
    /// Terminate the execution as failed (a Fail state).
    Failed { error: ErrorRecord },
}

fn transition(next: Option<&String>, output: Value) -> Result<Transition, ErrorRecord> {
    match next {
        Some(next) => Ok(Transition::Next {
            next: next.clone(),
            output,
        }),
        None => Ok(Transition::Complete { output }),
    }
}

async fn run_state(
    state_name: &str,
    state: &StateDefinition,
    input: &Value,
    context: &Arc<ExecutionContext>,
    cancellation: &CancellationToken,
) -> Result<Transition, ErrorRecord> {
    match state {
        StateDefinition::Pass(s) => run_pass(s, input, context),
        StateDefinition::Choice(s) => run_choice(s, input),
        StateDefinition::Succeed(s) => run_succeed(s, input),
        StateDefinition::Fail(s) => Ok(Transition::Failed {
            error: ErrorRecord {
                error: s.error.clone().unwrap_or_default(),
                cause: s.cause.clone(),
            },
        }),
        StateDefinition::Wait(s) => run_wait(s, input, cancellation).await,
        StateDefinition::Task(s) => {
            run_retryable(state_name, RetryableState::Task(s), input, context, cancellation)
                .await
        }
        StateDefinition::Parallel(s) => {
            run_retryable(
                state_name,
                RetryableState::Parallel(s),
                input,
                context,
                cancellation,
            )
            .await
        }
    }
}

fn run_pass(
    state: &PassState,
    input: &Value,
    context: &ExecutionContext,
) -> Result<Transition, ErrorRecord> {
    let selected = pipeline::select_input(input, &state.input_path)?;
    let effective = {
        let mut rng = context.rng();
        pipeline::apply_parameters(selected, state.parameters.as_ref(), &mut *rng)?
    };
    let raw_result = match &state.result {
        Some(result) => result.clone(),
        None => effective,
    };
    let combined = pipeline::insert_result(input, raw_result, &state.result_path)?;
    let output = pipeline::select_output(combined, &state.output_path)?;
    transition(state.next.as_ref(), output)
}

fn run_choice(state: &ChoiceState, input: &Value) -> Result<Transition, ErrorRecord> {
    let selected = pipeline::select_input(input, &state.input_path)?;
    let next = choice::evaluate(state, &selected)?;
    let output = pipeline::select_output(selected, &state.output_path)?;
    Ok(Transition::Next { next, output })
}

fn run_succeed(state: &SucceedState, input: &Value) -> Result<Transition, ErrorRecord> {
    let selected = pipeline::select_input(input, &state.input_path)?;
    let output = pipeline::select_output(selected, &state.output_path)?;
    Ok(Transition::Complete { output })
}

// ---------------------------------------------------------------------------
// Wait
// ---------------------------------------------------------------------------

async fn run_wait(
    state: &WaitState,
    input: &Value,
    cancellation: &CancellationToken,
) -> Result<Transition, ErrorRecord> {
    let selected = pipeline::select_input(input, &state.input_path)?;
    let delay = wait_delay(state, &selected)?;
    if !delay.is_zero() {
        tracing::debug!(delay_ms = delay.as_millis() as u64, "waiting");
        tokio::select! {
            _ = cancellation.cancelled() => return Err(ErrorRecord::cancelled()),
            _ = sleep(delay) => {}
        }
    }
    let output = pipeline::select_output(selected, &state.output_path)?;
    transition(state.next.as_ref(), output)
}

fn wait_delay(state: &WaitState, document: &Value) -> Result<Duration, ErrorRecord> {
    if let Some(seconds) = state.seconds {
        return Ok(Duration::from_secs(seconds));
    }
    if let Some(path) = &state.seconds_path {
        let value = resolve_required(path, document)?;
        let seconds = value.as_u64().ok_or_else(|| {
            ErrorRecord::runtime(format!(
                "SecondsPath '{path}' must resolve to a non-negative integer, got {value}"
            ))
        })?;
        return Ok(Duration::from_secs(seconds));
    }

    let timestamp = if let Some(timestamp) = &state.timestamp {
        timestamp.clone()
    } else if let Some(path) = &state.timestamp_path {
        let value = resolve_required(path, document)?;
        value
            .as_str()
            .ok_or_else(|| {
                ErrorRecord::runtime(format!(
                    "TimestampPath '{path}' must resolve to a string, got {value}"
                ))
            })?
            .to_string()
    } else {
        return Err(ErrorRecord::runtime("wait state has no clock source"));
    };

    let target = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| ErrorRecord::runtime(format!("invalid timestamp '{timestamp}': {e}")))?;
    // Already-past timestamps wait zero.
    Ok(target
        .signed_duration_since(Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO))
}

fn resolve_required(path: &str, document: &Value) -> Result<Value, ErrorRecord> {
    let parsed =
        ReferencePath::parse(path).map_err(|e| ErrorRecord::parameter_path(e.to_string()))?;
    parsed
        .resolve(document)
        .cloned()
        .map_err(|e| ErrorRecord::parameter_path(e.to_string()))
}

// ---------------------------------------------------------------------------
// Task / Parallel with retry and catch
// ---------------------------------------------------------------------------

/// The two state kinds that share the full pipeline plus `Retry`/`Catch`.
enum RetryableState<'a> {
    Task(&'a TaskState),
    Parallel(&'a ParallelState),
}

impl<'a> RetryableState<'a> {
    fn retriers(&self) -> &'a [Retrier] {
        match self {
            RetryableState::Task(s) => &s.retry,
            RetryableState::Parallel(s) => &s.retry,
        }
    }

    fn catchers(&self) -> &'a [Catcher] {
        match self {
            RetryableState::Task(s) => &s.catch,
            RetryableState::Parallel(s) => &s.catch,
        }
    }

    fn next(&self) -> Option<&'a String> {
        match self {
            RetryableState::Task(s) => s.next.as_ref(),
            RetryableState::Parallel(s) => s.next.as_ref(),
        }
    }

    fn input_path(&self) -> &'a PathField {
        match self {
            RetryableState::Task(s) => &s.input_path,
            RetryableState::Parallel(s) => &s.input_path,
        }
    }

    fn parameters(&self) -> Option<&'a Value> {
        match self {
            RetryableState::Task(s) => s.parameters.as_ref(),
            RetryableState::Parallel(s) => s.parameters.as_ref(),
        }
    }

    fn result_selector(&self) -> Option<&'a Value> {
        match self {
            RetryableState::Task(s) => s.result_selector.as_ref(),
            RetryableState::Parallel(s) => s.result_selector.as_ref(),
        }
    }

    fn result_path(&self) -> &'a PathField {
        match self {
            RetryableState::Task(s) => &s.result_path,
            RetryableState::Parallel(s) => &s.result_path,
        }
    }

    fn output_path(&self) -> &'a PathField {
        match self {
            RetryableState::Task(s) => &s.output_path,
            RetryableState::Parallel(s) => &s.output_path,
        }
    }
}

/// Drive one Task/Parallel state through its retry and catch protocol.
///
/// Attempt budgets are tracked per retrier; exhausting a retrier falls
/// through to the catchers, and an unmatched error surfaces to fail the
/// execution. Cancellation bypasses both.
async fn run_retryable(
    state_name: &str,
    state: RetryableState<'_>,
    input: &Value,
    context: &Arc<ExecutionContext>,
    cancellation: &CancellationToken,
) -> Result<Transition, ErrorRecord> {
    let retriers = state.retriers();
    let mut attempts = vec![0u32; retriers.len()];

    loop {
        let error = match attempt(&state, input, context, cancellation).await {
            Ok(output) => return transition(state.next(), output),
            Err(error) => error,
        };
        if error.error == ERROR_CANCELLED {
            return Err(error);
        }

        if let Some((index, retrier)) = retry::find_retrier(retriers, &error.error) {
            if attempts[index] < retrier.max_attempts {
                attempts[index] += 1;
                let delay = retry::backoff_delay(retrier, attempts[index]);
                tracing::warn!(
                    state = %state_name,
                    error = %error.error,
                    retry_attempt = attempts[index],
                    retry_in_ms = delay.as_millis() as u64,
                    "retrying state after error"
                );
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancellation.cancelled() => return Err(ErrorRecord::cancelled()),
                        _ = sleep(delay) => {}
                    }
                }
                continue;
            }
        }

        if let Some(catcher) = retry::find_catcher(state.catchers(), &error.error) {
            tracing::info!(
                state = %state_name,
                error = %error.error,
                next = %catcher.next,
                "catcher handling error"
            );
            let combined =
                pipeline::insert_result(input, error.to_payload(), &catcher.result_path)?;
            return Ok(Transition::Next {
                next: catcher.next.clone(),
                output: combined,
            });
        }

        return Err(error);
    }
}

/// One full attempt: pipeline stages 1-2, the work step, stages 4-6.
async fn attempt(
    state: &RetryableState<'_>,
    input: &Value,
    context: &Arc<ExecutionContext>,
    cancellation: &CancellationToken,
) -> Result<Value, ErrorRecord> {
    let selected = pipeline::select_input(input, state.input_path())?;
    let effective = {
        let mut rng = context.rng();
        pipeline::apply_parameters(selected, state.parameters(), &mut *rng)?
    };

    let raw_result = match state {
        RetryableState::Task(task) => {
            invoke_task(task, effective, context, cancellation).await?
        }
        RetryableState::Parallel(parallel_state) => {
            parallel::run_branches(parallel_state, effective, context, cancellation).await?
        }
    };

    let selected_result = {
        let mut rng = context.rng();
        pipeline::apply_result_selector(raw_result, state.result_selector(), &mut *rng)?
    };
    let combined = pipeline::insert_result(input, selected_result, state.result_path())?;
    pipeline::select_output(combined, state.output_path())
}

async fn invoke_task(
    task: &TaskState,
    effective_input: Value,
    context: &Arc<ExecutionContext>,
    cancellation: &CancellationToken,
) -> Result<Value, ErrorRecord> {
    tracing::debug!(resource = %task.resource, "invoking task executor");
    let invocation = context.task_executor.execute(
        &task.resource,
        effective_input,
        context.credentials.as_ref(),
    );

    let result = match task.timeout_seconds {
        Some(seconds) => {
            tokio::select! {
                _ = cancellation.cancelled() => return Err(ErrorRecord::cancelled()),
                outcome = timeout(Duration::from_secs(seconds), invocation) => match outcome {
                    Ok(result) => result,
                    Err(_) => return Err(ErrorRecord::timeout()),
                },
            }
        }
        None => {
            tokio::select! {
                _ = cancellation.cancelled() => return Err(ErrorRecord::cancelled()),
                result = invocation => result,
            }
        }
    };
    result.map_err(ErrorRecord::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use statecraft_types::error::{
        ERROR_NO_CHOICE_MATCHED, ERROR_RUNTIME, ERROR_TIMEOUT,
    };

    use crate::task::{FnTaskExecutor, TaskError, TaskExecutor};

    fn machine(value: Value) -> Arc<Machine> {
        Arc::new(Machine::from_value(value).expect("definition should validate"))
    }

    /// Context whose executor echoes the effective input back.
    fn echo_context() -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(Arc::new(FnTaskExecutor::new(
            |_, input, _| Ok(input),
        ))))
    }

    fn context_with(
        executor: impl TaskExecutor + 'static,
    ) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(Arc::new(executor)))
    }

    /// Fails with error name `E` a fixed number of times, then succeeds.
    struct FlakyExecutor {
        failures_left: AtomicUsize,
        calls: Arc<AtomicUsize>,
    }

    impl FlakyExecutor {
        fn new(failures: usize, calls: Arc<AtomicUsize>) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                calls,
            }
        }
    }

    impl TaskExecutor for FlakyExecutor {
        fn execute(
            &self,
            _resource: &str,
            _input: Value,
            _credentials: Option<&Value>,
        ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + '_>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                Err(TaskError::named("E"))
            } else {
                Ok(json!({ "ok": true }))
            };
            Box::pin(async move { result })
        }
    }

    /// Sleeps before answering, for timeout and cancellation tests.
    struct SleepyExecutor {
        delay: Duration,
    }

    impl TaskExecutor for SleepyExecutor {
        fn execute(
            &self,
            _resource: &str,
            _input: Value,
            _credentials: Option<&Value>,
        ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + '_>> {
            let delay = self.delay;
            Box::pin(async move {
                sleep(delay).await;
                Ok(json!({ "slept": true }))
            })
        }
    }

    // -----------------------------------------------------------------------
    // Pass
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_pass_identity() {
        let machine = machine(json!({
            "StartAt": "A",
            "States": { "A": { "Type": "Pass", "End": true } }
        }));
        let mut execution =
            machine.start_execution(json!({ "x": 1 }), "pass-identity", echo_context());
        let status = execution.run_all().await;

        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(execution.output(), &json!({ "x": 1 }));
        assert_eq!(execution.history().len(), 1);
        assert_eq!(execution.history()[0].state_name, "A");
        assert!(execution.current_state().is_none());
    }

    #[tokio::test]
    async fn test_pass_literal_result_and_result_path() {
        let machine = machine(json!({
            "StartAt": "A",
            "States": {
                "A": {
                    "Type": "Pass",
                    "Result": { "fixed": true },
                    "ResultPath": "$.r",
                    "End": true
                }
            }
        }));
        let mut execution = machine.start_execution(json!({ "x": 1 }), "pass", echo_context());
        execution.run_all().await;
        assert_eq!(execution.output(), &json!({ "x": 1, "r": { "fixed": true } }));
    }

    #[tokio::test]
    async fn test_pass_chain_feeds_output_forward() {
        let machine = machine(json!({
            "StartAt": "First",
            "States": {
                "First": { "Type": "Pass", "Result": { "step": 1 }, "Next": "Second" },
                "Second": { "Type": "Pass", "ResultPath": "$.second", "End": true }
            }
        }));
        let mut execution = machine.start_execution(json!({}), "chain", echo_context());
        execution.run_all().await;
        // Second receives {"step":1} and inserts its own (identical) result.
        assert_eq!(
            execution.output(),
            &json!({ "step": 1, "second": { "step": 1 } })
        );
        assert_eq!(execution.history().len(), 2);
    }

    // -----------------------------------------------------------------------
    // Choice
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_choice_routes_and_preserves_document() {
        let machine = machine(json!({
            "StartAt": "Route",
            "States": {
                "Route": {
                    "Type": "Choice",
                    "Choices": [
                        { "Variable": "$.n", "NumericGreaterThan": 5, "Next": "Big" }
                    ],
                    "Default": "Small"
                },
                "Big": { "Type": "Pass", "Result": "big", "ResultPath": "$.route", "End": true },
                "Small": { "Type": "Pass", "Result": "small", "ResultPath": "$.route", "End": true }
            }
        }));
        let mut execution = machine.start_execution(json!({ "n": 7 }), "route", echo_context());
        execution.run_all().await;
        assert_eq!(execution.output(), &json!({ "n": 7, "route": "big" }));
        assert_eq!(execution.history()[0].output, json!({ "n": 7 }));
    }

    #[tokio::test]
    async fn test_choice_without_match_fails_execution() {
        let machine = machine(json!({
            "StartAt": "Route",
            "States": {
                "Route": {
                    "Type": "Choice",
                    "Choices": [
                        { "Variable": "$.n", "NumericGreaterThan": 5, "Next": "Done" }
                    ]
                },
                "Done": { "Type": "Succeed" }
            }
        }));
        let mut execution = machine.start_execution(json!({ "n": 1 }), "route", echo_context());
        let status = execution.run_all().await;
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(execution.error().unwrap().error, ERROR_NO_CHOICE_MATCHED);
    }

    // -----------------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_task_result_path_insertion() {
        let machine = machine(json!({
            "StartAt": "Work",
            "States": {
                "Work": {
                    "Type": "Task",
                    "Resource": "method:ok",
                    "ResultPath": "$.r",
                    "End": true
                }
            }
        }));
        let context = context_with(FnTaskExecutor::new(|_, _, _| Ok(json!({ "ok": true }))));
        let mut execution = machine.start_execution(json!({ "x": 1 }), "task", context);
        execution.run_all().await;
        assert_eq!(execution.output(), &json!({ "x": 1, "r": { "ok": true } }));
    }

    #[tokio::test]
    async fn test_task_parameters_shape_effective_input() {
        let machine = machine(json!({
            "StartAt": "Work",
            "States": {
                "Work": {
                    "Type": "Task",
                    "Resource": "method:echo",
                    "Parameters": { "wrapped.$": "$.x", "constant": 9 },
                    "End": true
                }
            }
        }));
        let mut execution =
            machine.start_execution(json!({ "x": "value" }), "params", echo_context());
        execution.run_all().await;
        assert_eq!(execution.output(), &json!({ "wrapped": "value", "constant": 9 }));
    }

    #[tokio::test]
    async fn test_task_result_selector_reshapes_result() {
        let machine = machine(json!({
            "StartAt": "Work",
            "States": {
                "Work": {
                    "Type": "Task",
                    "Resource": "method:fetch",
                    "ResultSelector": { "id.$": "$.body.id" },
                    "ResultPath": "$.out",
                    "End": true
                }
            }
        }));
        let context = context_with(FnTaskExecutor::new(|_, _, _| {
            Ok(json!({ "body": { "id": 42 }, "status": 200 }))
        }));
        let mut execution = machine.start_execution(json!({}), "selector", context);
        execution.run_all().await;
        assert_eq!(execution.output(), &json!({ "out": { "id": 42 } }));
    }

    #[tokio::test]
    async fn test_task_receives_credentials() {
        let machine = machine(json!({
            "StartAt": "Work",
            "States": {
                "Work": { "Type": "Task", "Resource": "method:auth", "End": true }
            }
        }));
        let context = Arc::new(
            ExecutionContext::new(Arc::new(FnTaskExecutor::new(|_, _, credentials| {
                Ok(json!({ "creds": credentials.cloned() }))
            })))
            .with_credentials(json!({ "token": "t0" })),
        );
        let mut execution = machine.start_execution(json!({}), "creds", context);
        execution.run_all().await;
        assert_eq!(execution.output(), &json!({ "creds": { "token": "t0" } }));
    }

    // -----------------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_retry_until_success_counts_invocations() {
        let machine = machine(json!({
            "StartAt": "Flaky",
            "States": {
                "Flaky": {
                    "Type": "Task",
                    "Resource": "method:flaky",
                    "Retry": [
                        { "ErrorEquals": ["E"], "MaxAttempts": 3, "IntervalSeconds": 0 }
                    ],
                    "End": true
                }
            }
        }));
        let calls = Arc::new(AtomicUsize::new(0));
        let context = context_with(FlakyExecutor::new(2, calls.clone()));
        let mut execution = machine.start_execution(json!({}), "retry", context);
        let status = execution.run_all().await;

        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(execution.history().len(), 1, "one entry for the state");
        assert_eq!(execution.output(), &json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_with_original_error() {
        let machine = machine(json!({
            "StartAt": "Flaky",
            "States": {
                "Flaky": {
                    "Type": "Task",
                    "Resource": "method:flaky",
                    "Retry": [
                        { "ErrorEquals": ["E"], "MaxAttempts": 2, "IntervalSeconds": 0 }
                    ],
                    "End": true
                }
            }
        }));
        let calls = Arc::new(AtomicUsize::new(0));
        let context = context_with(FlakyExecutor::new(10, calls.clone()));
        let mut execution = machine.start_execution(json!({}), "retry", context);
        let status = execution.run_all().await;

        assert_eq!(status, ExecutionStatus::Failed);
        // Initial attempt + MaxAttempts retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(execution.error().unwrap().error, "E");
    }

    #[tokio::test]
    async fn test_unmatched_error_is_not_retried() {
        let machine = machine(json!({
            "StartAt": "Flaky",
            "States": {
                "Flaky": {
                    "Type": "Task",
                    "Resource": "method:flaky",
                    "Retry": [
                        { "ErrorEquals": ["SomethingElse"], "MaxAttempts": 5, "IntervalSeconds": 0 }
                    ],
                    "End": true
                }
            }
        }));
        let calls = Arc::new(AtomicUsize::new(0));
        let context = context_with(FlakyExecutor::new(10, calls.clone()));
        let mut execution = machine.start_execution(json!({}), "retry", context);
        execution.run_all().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // Catch
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_catch_injects_error_payload_and_transitions() {
        let machine = machine(json!({
            "StartAt": "Boom",
            "States": {
                "Boom": {
                    "Type": "Task",
                    "Resource": "method:boom",
                    "Catch": [
                        { "ErrorEquals": ["States.ALL"], "Next": "Handler", "ResultPath": "$.err" }
                    ],
                    "End": true
                },
                "Handler": { "Type": "Pass", "End": true }
            }
        }));
        let context = context_with(FnTaskExecutor::new(|_, _, _| {
            Err(TaskError::structured("E", "it broke"))
        }));
        let mut execution = machine.start_execution(json!({ "x": 1 }), "catch", context);
        let status = execution.run_all().await;

        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(
            execution.output(),
            &json!({ "x": 1, "err": { "Error": "E", "Cause": "it broke" } })
        );
    }

    #[tokio::test]
    async fn test_unstructured_failure_surfaces_as_task_failed() {
        let machine = machine(json!({
            "StartAt": "Boom",
            "States": {
                "Boom": {
                    "Type": "Task",
                    "Resource": "method:boom",
                    "Catch": [
                        { "ErrorEquals": ["States.TaskFailed"], "Next": "Handler", "ResultPath": "$.err" }
                    ],
                    "End": true
                },
                "Handler": { "Type": "Pass", "End": true }
            }
        }));
        let context =
            context_with(FnTaskExecutor::new(|_, _, _| Err(TaskError::failed("oops"))));
        let mut execution = machine.start_execution(json!({}), "catch", context);
        execution.run_all().await;
        assert_eq!(
            execution.output()["err"],
            json!({ "Error": "States.TaskFailed", "Cause": "oops" })
        );
    }

    #[tokio::test]
    async fn test_uncaught_error_fails_execution_and_run_all_is_noop_after() {
        let machine = machine(json!({
            "StartAt": "Boom",
            "States": {
                "Boom": { "Type": "Task", "Resource": "method:boom", "End": true }
            }
        }));
        let context =
            context_with(FnTaskExecutor::new(|_, _, _| Err(TaskError::named("E"))));
        let mut execution = machine.start_execution(json!({}), "fail", context);
        let status = execution.run_all().await;
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(execution.error().unwrap().error, "E");

        // Terminal executions do not move again.
        let again = execution.run_all().await;
        assert_eq!(again, ExecutionStatus::Failed);
        assert!(execution.history().is_empty());
    }

    // -----------------------------------------------------------------------
    // Timeout
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_task_timeout_raises_states_timeout() {
        let machine = machine(json!({
            "StartAt": "Slow",
            "States": {
                "Slow": {
                    "Type": "Task",
                    "Resource": "method:slow",
                    "TimeoutSeconds": 1,
                    "End": true
                }
            }
        }));
        let context = context_with(SleepyExecutor {
            delay: Duration::from_secs(30),
        });
        let mut execution = machine.start_execution(json!({}), "timeout", context);
        let started = std::time::Instant::now();
        let status = execution.run_all().await;

        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(execution.error().unwrap().error, ERROR_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_machine_timeout_fails_run_all() {
        let machine = machine(json!({
            "StartAt": "Slow",
            "TimeoutSeconds": 1,
            "States": {
                "Slow": { "Type": "Task", "Resource": "method:slow", "End": true }
            }
        }));
        let context = context_with(SleepyExecutor {
            delay: Duration::from_secs(30),
        });
        let mut execution = machine.start_execution(json!({}), "machine-timeout", context);
        let status = execution.run_all().await;
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(execution.error().unwrap().error, ERROR_TIMEOUT);
    }

    // -----------------------------------------------------------------------
    // Wait
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_wait_seconds_then_transition() {
        let machine = machine(json!({
            "StartAt": "Hold",
            "States": {
                "Hold": { "Type": "Wait", "Seconds": 0, "Next": "Done" },
                "Done": { "Type": "Succeed" }
            }
        }));
        let mut execution = machine.start_execution(json!({ "x": 1 }), "wait", echo_context());
        let status = execution.run_all().await;
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(execution.output(), &json!({ "x": 1 }));
        assert_eq!(execution.history().len(), 2);
    }

    #[tokio::test]
    async fn test_wait_seconds_path() {
        let machine = machine(json!({
            "StartAt": "Hold",
            "States": {
                "Hold": { "Type": "Wait", "SecondsPath": "$.delay", "End": true }
            }
        }));
        let mut execution =
            machine.start_execution(json!({ "delay": 0 }), "wait-path", echo_context());
        assert_eq!(execution.run_all().await, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_wait_past_timestamp_is_immediate() {
        let machine = machine(json!({
            "StartAt": "Hold",
            "States": {
                "Hold": {
                    "Type": "Wait",
                    "Timestamp": "2001-01-01T00:00:00Z",
                    "End": true
                }
            }
        }));
        let mut execution = machine.start_execution(json!({}), "wait-past", echo_context());
        let started = std::time::Instant::now();
        assert_eq!(execution.run_all().await, ExecutionStatus::Succeeded);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_honours_cancellation() {
        let machine = machine(json!({
            "StartAt": "Hold",
            "States": {
                "Hold": { "Type": "Wait", "Seconds": 3600, "End": true }
            }
        }));
        let mut execution = machine.start_execution(json!({}), "wait-cancel", echo_context());
        let token = execution.cancellation_token();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let started = std::time::Instant::now();
        let status = execution.run_all().await;
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(execution.error().unwrap().error, ERROR_CANCELLED);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    // -----------------------------------------------------------------------
    // Parallel (end to end; branch mechanics are covered in `parallel`)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_parallel_result_is_an_ordered_array() {
        let machine = machine(json!({
            "StartAt": "Fan",
            "States": {
                "Fan": {
                    "Type": "Parallel",
                    "Branches": [
                        {
                            "StartAt": "A",
                            "States": { "A": { "Type": "Pass", "Result": { "a": 1 }, "End": true } }
                        },
                        {
                            "StartAt": "B",
                            "States": { "B": { "Type": "Pass", "Result": { "b": 2 }, "End": true } }
                        }
                    ],
                    "ResultPath": "$.forks",
                    "End": true
                }
            }
        }));
        let mut execution = machine.start_execution(json!({ "x": 0 }), "fan", echo_context());
        let status = execution.run_all().await;
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(
            execution.output(),
            &json!({ "x": 0, "forks": [{ "a": 1 }, { "b": 2 }] })
        );
    }

    #[tokio::test]
    async fn test_parallel_branch_failure_is_catchable() {
        let machine = machine(json!({
            "StartAt": "Fan",
            "States": {
                "Fan": {
                    "Type": "Parallel",
                    "Branches": [
                        {
                            "StartAt": "Boom",
                            "States": { "Boom": { "Type": "Fail", "Error": "E", "Cause": "branch gave up" } }
                        }
                    ],
                    "Catch": [
                        { "ErrorEquals": ["States.BranchFailed"], "Next": "Handler", "ResultPath": "$.err" }
                    ],
                    "End": true
                },
                "Handler": { "Type": "Pass", "End": true }
            }
        }));
        let mut execution = machine.start_execution(json!({ "x": 1 }), "fan", echo_context());
        let status = execution.run_all().await;
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(execution.output()["x"], json!(1));
        assert_eq!(
            execution.output()["err"]["Error"],
            json!("States.BranchFailed")
        );
    }

    // -----------------------------------------------------------------------
    // Succeed / Fail
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_succeed_applies_paths() {
        let machine = machine(json!({
            "StartAt": "Done",
            "States": {
                "Done": { "Type": "Succeed", "InputPath": "$.keep" }
            }
        }));
        let mut execution = machine.start_execution(
            json!({ "keep": { "v": 1 }, "drop": true }),
            "succeed",
            echo_context(),
        );
        execution.run_all().await;
        assert_eq!(execution.output(), &json!({ "v": 1 }));
    }

    #[tokio::test]
    async fn test_fail_state_records_error() {
        let machine = machine(json!({
            "StartAt": "Nope",
            "States": {
                "Nope": { "Type": "Fail", "Error": "Custom.Bad", "Cause": "input rejected" }
            }
        }));
        let mut execution = machine.start_execution(json!({ "x": 1 }), "fail", echo_context());
        let status = execution.run_all().await;
        assert_eq!(status, ExecutionStatus::Failed);
        let error = execution.error().unwrap();
        assert_eq!(error.error, "Custom.Bad");
        assert_eq!(error.cause.as_deref(), Some("input rejected"));
        // The Fail transition is recorded in history.
        assert_eq!(execution.history().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Safeguards
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_max_steps_bounds_infinite_loops() {
        // The terminal is reachable through a choice rule that never fires,
        // so the A/B cycle would otherwise spin forever.
        let machine = machine(json!({
            "StartAt": "A",
            "States": {
                "A": {
                    "Type": "Choice",
                    "Choices": [ { "Variable": "$.never", "IsPresent": true, "Next": "Exit" } ],
                    "Default": "B"
                },
                "B": { "Type": "Pass", "Next": "A" },
                "Exit": { "Type": "Succeed" }
            }
        }));
        let context = Arc::new(
            ExecutionContext::new(Arc::new(FnTaskExecutor::new(|_, input, _| Ok(input))))
                .with_max_steps(10),
        );
        let mut execution = machine.start_execution(json!({}), "looping", context);
        let status = execution.run_all().await;
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(execution.error().unwrap().error, ERROR_RUNTIME);
        assert_eq!(execution.history().len(), 10);
    }

    #[tokio::test]
    async fn test_step_is_noop_once_terminal() {
        let machine = machine(json!({
            "StartAt": "A",
            "States": { "A": { "Type": "Pass", "End": true } }
        }));
        let mut execution = machine.start_execution(json!(1), "steps", echo_context());
        assert_eq!(execution.step().await, ExecutionStatus::Succeeded);
        assert_eq!(execution.step().await, ExecutionStatus::Succeeded);
        assert_eq!(execution.history().len(), 1);
    }

    // -----------------------------------------------------------------------
    // History invariants
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_history_is_ordered_and_names_known_states() {
        let machine = machine(json!({
            "StartAt": "A",
            "States": {
                "A": { "Type": "Pass", "Next": "B" },
                "B": { "Type": "Wait", "Seconds": 0, "Next": "C" },
                "C": { "Type": "Succeed" }
            }
        }));
        let mut execution =
            Arc::clone(&machine).start_execution(json!({}), "history", echo_context());
        execution.run_all().await;

        let history = execution.history();
        assert_eq!(history.len(), 3);
        for pair in history.windows(2) {
            assert!(pair[0].exited_at <= pair[1].exited_at);
        }
        for entry in history {
            assert!(machine.state(&entry.state_name).is_some());
        }
    }

    #[tokio::test]
    async fn test_execution_time_is_reported() {
        let machine = machine(json!({
            "StartAt": "A",
            "States": { "A": { "Type": "Pass", "End": true } }
        }));
        let mut execution = machine.start_execution(json!({}), "timing", echo_context());
        execution.run_all().await;
        assert!(execution.execution_time() >= chrono::Duration::zero());
    }
}
