//! Concurrent branch execution for Parallel states.
//!
//! Every branch is a full sub-machine interpreted by a recursive
//! [`Execution`] sharing the parent's context. Branches run on spawned
//! tasks bounded by a semaphore of `MaxConcurrency` permits; outputs are
//! collected positionally in branch-declaration order regardless of
//! completion order. The first branch failure cancels the still-running
//! siblings and fails the state with `States.BranchFailed`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use statecraft_types::error::ErrorRecord;
use statecraft_types::execution::ExecutionStatus;
use statecraft_types::machine::{MachineDefinition, ParallelState};

use crate::definition::Machine;
use crate::executor::Execution;
use crate::task::{ExecutionContext, ParallelOutputMode};

/// Run every branch of a Parallel state against a copy of the effective
/// input and merge the outputs.
pub async fn run_branches(
    state: &ParallelState,
    effective_input: Value,
    context: &Arc<ExecutionContext>,
    cancellation: &CancellationToken,
) -> Result<Value, ErrorRecord> {
    let branch_count = state.branches.len();
    let max_concurrency = state.max_concurrency.unwrap_or(branch_count);
    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let branch_token = cancellation.child_token();

    let mut join_set = JoinSet::new();
    for (index, branch) in state.branches.iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let token = branch_token.clone();
        let context = Arc::clone(context);
        let branch = branch.clone();
        let input = effective_input.clone();
        join_set.spawn(async move {
            let _permit = tokio::select! {
                _ = token.cancelled() => return (index, Err(ErrorRecord::cancelled())),
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return (index, Err(ErrorRecord::cancelled())),
                },
            };
            if token.is_cancelled() {
                return (index, Err(ErrorRecord::cancelled()));
            }
            (index, run_branch(index, branch, input, context, token).await)
        });
    }

    let mut outputs: Vec<Option<Value>> = vec![None; branch_count];
    let mut first_failure: Option<(usize, ErrorRecord)> = None;
    while let Some(joined) = join_set.join_next().await {
        let (index, result) = match joined {
            Ok(pair) => pair,
            Err(join_error) => {
                branch_token.cancel();
                return Err(ErrorRecord::runtime(format!(
                    "branch task failed to join: {join_error}"
                )));
            }
        };
        match result {
            Ok(output) => outputs[index] = Some(output),
            Err(error) => {
                if first_failure.is_none() {
                    tracing::warn!(
                        branch = index,
                        error = %error.error,
                        "branch failed, cancelling siblings"
                    );
                    branch_token.cancel();
                    first_failure = Some((index, error));
                }
            }
        }
    }

    if cancellation.is_cancelled() {
        return Err(ErrorRecord::cancelled());
    }
    if let Some((index, error)) = first_failure {
        return Err(ErrorRecord::branch_failed(format!(
            "branch {index} failed: {error}"
        )));
    }

    let outputs: Vec<Value> = outputs
        .into_iter()
        .map(|output| output.unwrap_or(Value::Null))
        .collect();
    match context.parallel_output {
        ParallelOutputMode::Array => Ok(Value::Array(outputs)),
        ParallelOutputMode::DeepMerge => Ok(deep_merge(outputs)),
    }
}

/// Boxed so the branch recursion (`Execution::run_all` -> Parallel ->
/// `run_branch` -> ...) has a finite future type.
fn run_branch(
    index: usize,
    definition: MachineDefinition,
    input: Value,
    context: Arc<ExecutionContext>,
    cancellation: CancellationToken,
) -> Pin<Box<dyn Future<Output = Result<Value, ErrorRecord>> + Send>> {
    Box::pin(async move {
        let machine = Machine::new(definition).map_err(|e| {
            ErrorRecord::runtime(format!("branch {index} definition rejected: {e}"))
        })?;
        let mut execution = Execution::with_cancellation(
            Arc::new(machine),
            input,
            format!("branch-{index}"),
            context,
            cancellation,
        );
        execution.run_all().await;
        match execution.status() {
            ExecutionStatus::Succeeded => Ok(execution.output().clone()),
            _ => Err(execution.error().cloned().unwrap_or_else(|| {
                ErrorRecord::runtime(format!("branch {index} ended without an error record"))
            })),
        }
    })
}

/// Legacy result shape: fold branch outputs into one object, merging nested
/// objects key-by-key; later branches win scalar conflicts.
fn deep_merge(outputs: Vec<Value>) -> Value {
    let mut merged = Value::Object(Map::new());
    for output in outputs {
        merge_into(&mut merged, output);
    }
    merged
}

fn merge_into(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(target), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match target.get_mut(&key) {
                    Some(slot) if slot.is_object() && value.is_object() => {
                        merge_into(slot, value);
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, incoming) => *target = incoming,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
