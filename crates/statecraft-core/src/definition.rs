//! Machine construction and structural validation.
//!
//! `Machine::new` runs every check a definition must pass before execution;
//! definition errors never appear at run time. Parallel branches are
//! validated recursively with the same rules.

use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;

use statecraft_types::machine::{MachineDefinition, StateDefinition};

use crate::choice;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building a [`Machine`].
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The definition value does not deserialize into the IR.
    #[error("parse error: {0}")]
    Parse(String),

    /// A structural constraint is violated.
    #[error("validation error: {0}")]
    Validation(String),

    /// A transition names a state that does not exist.
    #[error("'{referrer}' references unknown state '{target}'")]
    UnknownTarget { referrer: String, target: String },
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// A validated, immutable machine definition ready to execute.
#[derive(Debug, Clone)]
pub struct Machine {
    definition: MachineDefinition,
}

impl Machine {
    /// Validate a definition and wrap it for execution.
    pub fn new(definition: MachineDefinition) -> Result<Self, DefinitionError> {
        validate_definition(&definition)?;
        Ok(Self { definition })
    }

    /// Build a machine from an already-parsed generic JSON value.
    pub fn from_value(value: Value) -> Result<Self, DefinitionError> {
        let definition: MachineDefinition =
            serde_json::from_value(value).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        Self::new(definition)
    }

    pub fn definition(&self) -> &MachineDefinition {
        &self.definition
    }

    pub fn state(&self, name: &str) -> Option<&StateDefinition> {
        self.definition.states.get(name)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a definition (also applied to every
/// Parallel branch).
///
/// Checks:
/// - at least one state; `StartAt` names an existing state
/// - every `Next`, `Catch[].Next`, choice `Next`/`Default` target exists
/// - every non-terminal state has exactly one of `Next` / `End: true`
///   (Choice is exempt)
/// - Wait states declare exactly one clock source
/// - Parallel states have at least one branch, `MaxConcurrency >= 1`, and
///   structurally valid branches
/// - choice rules are well-formed (comparator shape, nested `Next` rules)
/// - a terminal state is reachable from `StartAt`
pub fn validate_definition(def: &MachineDefinition) -> Result<(), DefinitionError> {
    if def.states.is_empty() {
        return Err(DefinitionError::Validation(
            "machine must declare at least one state".to_string(),
        ));
    }
    if !def.states.contains_key(&def.start_at) {
        return Err(DefinitionError::UnknownTarget {
            referrer: "StartAt".to_string(),
            target: def.start_at.clone(),
        });
    }
    if def.timeout_seconds == Some(0) {
        return Err(DefinitionError::Validation(
            "TimeoutSeconds must be > 0".to_string(),
        ));
    }

    for (name, state) in &def.states {
        validate_state(def, name, state)?;
    }

    if !terminal_reachable(def) {
        return Err(DefinitionError::Validation(
            "no terminal state is reachable from StartAt".to_string(),
        ));
    }

    Ok(())
}

fn validate_state(
    def: &MachineDefinition,
    name: &str,
    state: &StateDefinition,
) -> Result<(), DefinitionError> {
    let require_target = |target: &str| -> Result<(), DefinitionError> {
        if def.states.contains_key(target) {
            Ok(())
        } else {
            Err(DefinitionError::UnknownTarget {
                referrer: name.to_string(),
                target: target.to_string(),
            })
        }
    };

    // Exactly one of Next / End for the routing kinds.
    match state {
        StateDefinition::Pass(_)
        | StateDefinition::Task(_)
        | StateDefinition::Wait(_)
        | StateDefinition::Parallel(_) => {
            if state.next().is_some() == state.is_end() {
                return Err(DefinitionError::Validation(format!(
                    "state '{name}' must declare exactly one of Next or End"
                )));
            }
        }
        StateDefinition::Choice(_) | StateDefinition::Succeed(_) | StateDefinition::Fail(_) => {}
    }

    if let Some(next) = state.next() {
        require_target(next)?;
    }
    for catcher in state.catchers() {
        require_target(&catcher.next)?;
        if catcher.error_equals.is_empty() {
            return Err(DefinitionError::Validation(format!(
                "state '{name}' has a catcher with an empty ErrorEquals"
            )));
        }
    }

    match state {
        StateDefinition::Task(task) => {
            if task.timeout_seconds == Some(0) {
                return Err(DefinitionError::Validation(format!(
                    "state '{name}': TimeoutSeconds must be > 0"
                )));
            }
            for retrier in &task.retry {
                if retrier.error_equals.is_empty() {
                    return Err(DefinitionError::Validation(format!(
                        "state '{name}' has a retrier with an empty ErrorEquals"
                    )));
                }
            }
        }
        StateDefinition::Choice(choice_state) => {
            if choice_state.choices.is_empty() {
                return Err(DefinitionError::Validation(format!(
                    "choice state '{name}' must declare at least one rule"
                )));
            }
            for rule in &choice_state.choices {
                choice::validate_rule(rule, true).map_err(|reason| {
                    DefinitionError::Validation(format!("choice state '{name}': {reason}"))
                })?;
                if let Some(next) = &rule.next {
                    require_target(next)?;
                }
            }
            if let Some(default) = &choice_state.default {
                require_target(default)?;
            }
        }
        StateDefinition::Wait(wait) => {
            let clocks = [
                wait.seconds.is_some(),
                wait.seconds_path.is_some(),
                wait.timestamp.is_some(),
                wait.timestamp_path.is_some(),
            ]
            .into_iter()
            .filter(|set| *set)
            .count();
            if clocks != 1 {
                return Err(DefinitionError::Validation(format!(
                    "wait state '{name}' must declare exactly one of \
                     Seconds, SecondsPath, Timestamp, TimestampPath"
                )));
            }
        }
        StateDefinition::Parallel(parallel) => {
            if parallel.branches.is_empty() {
                return Err(DefinitionError::Validation(format!(
                    "parallel state '{name}' must declare at least one branch"
                )));
            }
            if parallel.max_concurrency == Some(0) {
                return Err(DefinitionError::Validation(format!(
                    "parallel state '{name}': MaxConcurrency must be >= 1"
                )));
            }
            for retrier in &parallel.retry {
                if retrier.error_equals.is_empty() {
                    return Err(DefinitionError::Validation(format!(
                        "state '{name}' has a retrier with an empty ErrorEquals"
                    )));
                }
            }
            for (index, branch) in parallel.branches.iter().enumerate() {
                validate_definition(branch).map_err(|e| {
                    DefinitionError::Validation(format!(
                        "parallel state '{name}' branch {index}: {e}"
                    ))
                })?;
            }
        }
        StateDefinition::Pass(_) | StateDefinition::Succeed(_) | StateDefinition::Fail(_) => {}
    }

    Ok(())
}

/// Breadth-first walk over `Next`/`Catch`/choice edges from `StartAt`.
fn terminal_reachable(def: &MachineDefinition) -> bool {
    let mut queue = vec![def.start_at.as_str()];
    let mut seen = HashSet::new();

    while let Some(name) = queue.pop() {
        if !seen.insert(name) {
            continue;
        }
        let Some(state) = def.states.get(name) else {
            continue;
        };
        if state.is_terminal() {
            return true;
        }
        if let Some(next) = state.next() {
            queue.push(next);
        }
        for catcher in state.catchers() {
            queue.push(&catcher.next);
        }
        if let StateDefinition::Choice(choice_state) = state {
            for rule in &choice_state.choices {
                if let Some(next) = &rule.next {
                    queue.push(next);
                }
            }
            if let Some(default) = &choice_state.default {
                queue.push(default);
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
