//! The six-stage I/O filter pipeline applied around every state's work step:
//! `InputPath` -> `Parameters` -> work -> `ResultSelector` -> `ResultPath`
//! -> `OutputPath`.
//!
//! Every stage is a pure function over `serde_json::Value`; no stage mutates
//! its input. Explicit `null` values carry the protocol's special meanings:
//! `InputPath: null` selects `{}`, `ResultPath: null` discards the result,
//! `OutputPath: null` yields `{}`.

use rand::Rng;
use serde_json::{Map, Value};
use statecraft_types::error::ErrorRecord;
use statecraft_types::machine::PathField;

use crate::path::ReferencePath;
use crate::template;

/// Stage 1: select the sub-document `InputPath` addresses (default `$`).
pub fn select_input(raw_input: &Value, input_path: &PathField) -> Result<Value, ErrorRecord> {
    select(raw_input, input_path)
}

/// Stage 2: evaluate `Parameters` against the selected input to produce the
/// effective input handed to the work step.
pub fn apply_parameters<R: Rng>(
    selected: Value,
    parameters: Option<&Value>,
    rng: &mut R,
) -> Result<Value, ErrorRecord> {
    match parameters {
        Some(parameters) => template::apply(parameters, &selected, rng),
        None => Ok(selected),
    }
}

/// Stage 4: evaluate `ResultSelector` against the raw result.
pub fn apply_result_selector<R: Rng>(
    raw_result: Value,
    result_selector: Option<&Value>,
    rng: &mut R,
) -> Result<Value, ErrorRecord> {
    match result_selector {
        Some(selector) => template::apply(selector, &raw_result, rng),
        None => Ok(raw_result),
    }
}

/// Stage 5: place the result into the raw input at `ResultPath`.
///
/// The default `$` replaces the whole document; explicit `null` discards
/// the result, leaving the raw input as the combined document.
pub fn insert_result(
    raw_input: &Value,
    result: Value,
    result_path: &PathField,
) -> Result<Value, ErrorRecord> {
    match result_path {
        None => Ok(result),
        Some(None) => Ok(raw_input.clone()),
        Some(Some(path)) => {
            let path = ReferencePath::parse(path)
                .map_err(|e| ErrorRecord::result_path(e.to_string()))?;
            path.insert(raw_input, result)
                .map_err(|e| ErrorRecord::result_path(e.to_string()))
        }
    }
}

/// Stage 6: select the state's final output from the combined document.
pub fn select_output(combined: Value, output_path: &PathField) -> Result<Value, ErrorRecord> {
    select(&combined, output_path)
}

fn select(document: &Value, path: &PathField) -> Result<Value, ErrorRecord> {
    match path {
        None => Ok(document.clone()),
        Some(None) => Ok(Value::Object(Map::new())),
        Some(Some(path)) => {
            let path = ReferencePath::parse(path)
                .map_err(|e| ErrorRecord::parameter_path(e.to_string()))?;
            path.resolve(document)
                .cloned()
                .map_err(|e| ErrorRecord::parameter_path(e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
