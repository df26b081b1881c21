//! Payload template evaluation for `Parameters` and `ResultSelector`.
//!
//! A template is walked recursively. Object keys ending in `.$` are
//! placeholder fields: the key loses its suffix and the value -- a reference
//! path or an intrinsic call -- is evaluated against the current scope.
//! Every other leaf is copied literally.

use rand::Rng;
use serde_json::{Map, Value};
use statecraft_types::error::ErrorRecord;

use crate::intrinsics;
use crate::path::ReferencePath;

/// Evaluate a payload template against `scope`.
pub fn apply<R: Rng>(
    template: &Value,
    scope: &Value,
    rng: &mut R,
) -> Result<Value, ErrorRecord> {
    match template {
        Value::Object(map) => {
            let mut output = Map::with_capacity(map.len());
            for (key, value) in map {
                if let Some(target_key) = key.strip_suffix(".$") {
                    let resolved = resolve_placeholder(key, value, scope, rng)?;
                    output.insert(target_key.to_string(), resolved);
                } else {
                    output.insert(key.clone(), apply(value, scope, rng)?);
                }
            }
            Ok(Value::Object(output))
        }
        Value::Array(items) => {
            let mut output = Vec::with_capacity(items.len());
            for item in items {
                output.push(apply(item, scope, rng)?);
            }
            Ok(Value::Array(output))
        }
        leaf => Ok(leaf.clone()),
    }
}

fn resolve_placeholder<R: Rng>(
    key: &str,
    value: &Value,
    scope: &Value,
    rng: &mut R,
) -> Result<Value, ErrorRecord> {
    let Value::String(expression) = value else {
        return Err(ErrorRecord::parameter_path(format!(
            "placeholder field '{key}' must hold a string, not {value}"
        )));
    };

    if intrinsics::is_intrinsic_call(expression) {
        return intrinsics::evaluate(expression, scope, rng)
            .map_err(|e| ErrorRecord::intrinsic(e.to_string()));
    }

    let path = ReferencePath::parse(expression)
        .map_err(|e| ErrorRecord::parameter_path(e.to_string()))?;
    path.resolve(scope)
        .cloned()
        .map_err(|e| ErrorRecord::parameter_path(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
