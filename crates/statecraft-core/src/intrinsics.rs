//! The `States.*` intrinsic function library.
//!
//! Intrinsic calls appear inside placeholder fields of `Parameters` /
//! `ResultSelector` templates, e.g. `States.Format('...', $.a)`. Arguments
//! are evaluated left to right: `$`-prefixed arguments resolve as reference
//! paths against the current scope, everything else is a JSON literal.

use rand::Rng;
use serde_json::Value;
use thiserror::Error;

use crate::path::ReferencePath;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from parsing or evaluating an intrinsic call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntrinsicError {
    #[error("malformed intrinsic call '{0}'")]
    Malformed(String),

    #[error("unknown intrinsic function '{0}'")]
    Unknown(String),

    #[error("{function}: {reason}")]
    Invalid { function: String, reason: String },
}

impl IntrinsicError {
    fn invalid(function: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            function: function.to_string(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Whether a placeholder string value is an intrinsic call rather than a
/// bare reference path.
pub fn is_intrinsic_call(expression: &str) -> bool {
    expression.starts_with("States.") && expression.ends_with(')')
}

/// Evaluate a full intrinsic call expression against `scope`.
pub fn evaluate<R: Rng>(
    expression: &str,
    scope: &Value,
    rng: &mut R,
) -> Result<Value, IntrinsicError> {
    let (name, argument_sources) = parse_call(expression)?;
    let mut arguments = Vec::with_capacity(argument_sources.len());
    for source in &argument_sources {
        arguments.push(evaluate_argument(name, source, scope)?);
    }

    match name {
        "States.Format" => format_string(&arguments),
        "States.StringToJson" => string_to_json(&arguments),
        "States.JsonToString" => json_to_string(&arguments),
        "States.Array" => Ok(Value::Array(arguments)),
        "States.UUID" => {
            if !arguments.is_empty() {
                return Err(IntrinsicError::invalid(name, "takes no arguments"));
            }
            let mut bytes = [0u8; 16];
            rng.fill(&mut bytes[..]);
            let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
            Ok(Value::String(id.to_string()))
        }
        "States.MathRandom" => math_random(&arguments, rng),
        "States.MathAdd" => math_add(&arguments),
        other => Err(IntrinsicError::Unknown(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Call parsing
// ---------------------------------------------------------------------------

fn parse_call(expression: &str) -> Result<(&str, Vec<String>), IntrinsicError> {
    let malformed = || IntrinsicError::Malformed(expression.to_string());
    let open = expression.find('(').ok_or_else(malformed)?;
    if !expression.ends_with(')') {
        return Err(malformed());
    }
    let name = &expression[..open];
    if !name.starts_with("States.") || name.len() == "States.".len() {
        return Err(malformed());
    }
    let inner = &expression[open + 1..expression.len() - 1];
    Ok((name, split_arguments(inner, expression)?))
}

/// Split an argument list on top-level commas, respecting string literals
/// and bracket nesting.
fn split_arguments(inner: &str, expression: &str) -> Result<Vec<String>, IntrinsicError> {
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for ch in inner.chars() {
        if in_string {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                current.push(ch);
            }
            '[' | '{' | '(' => {
                depth += 1;
                current.push(ch);
            }
            ']' | '}' | ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| IntrinsicError::Malformed(expression.to_string()))?;
                current.push(ch);
            }
            ',' if depth == 0 => {
                arguments.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if in_string || depth != 0 {
        return Err(IntrinsicError::Malformed(expression.to_string()));
    }
    arguments.push(current.trim().to_string());

    if arguments.iter().any(String::is_empty) {
        return Err(IntrinsicError::Malformed(expression.to_string()));
    }
    Ok(arguments)
}

fn evaluate_argument(
    function: &str,
    source: &str,
    scope: &Value,
) -> Result<Value, IntrinsicError> {
    if source.starts_with('$') {
        let path = ReferencePath::parse(source)
            .map_err(|e| IntrinsicError::invalid(function, e.to_string()))?;
        return path
            .resolve(scope)
            .cloned()
            .map_err(|e| IntrinsicError::invalid(function, e.to_string()));
    }
    serde_json::from_str(source)
        .map_err(|_| IntrinsicError::invalid(function, format!("invalid literal '{source}'")))
}

// ---------------------------------------------------------------------------
// Function implementations
// ---------------------------------------------------------------------------

fn format_string(arguments: &[Value]) -> Result<Value, IntrinsicError> {
    const NAME: &str = "States.Format";
    let Some((template, rest)) = arguments.split_first() else {
        return Err(IntrinsicError::invalid(NAME, "missing format string"));
    };
    let Value::String(template) = template else {
        return Err(IntrinsicError::invalid(NAME, "format string must be a string"));
    };

    let pieces: Vec<&str> = template.split("{}").collect();
    if pieces.len() - 1 != rest.len() {
        return Err(IntrinsicError::invalid(
            NAME,
            format!(
                "format string has {} placeholder(s) but {} argument(s) were given",
                pieces.len() - 1,
                rest.len()
            ),
        ));
    }

    let mut output = String::new();
    for (i, piece) in pieces.iter().enumerate() {
        output.push_str(piece);
        if i < rest.len() {
            output.push_str(&render(&rest[i]));
        }
    }
    Ok(Value::String(output))
}

/// String arguments splice in without surrounding quotes; everything else
/// renders as compact JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn string_to_json(arguments: &[Value]) -> Result<Value, IntrinsicError> {
    const NAME: &str = "States.StringToJson";
    let [Value::String(text)] = arguments else {
        return Err(IntrinsicError::invalid(NAME, "expects a single string"));
    };
    serde_json::from_str(text)
        .map_err(|e| IntrinsicError::invalid(NAME, format!("not valid JSON: {e}")))
}

fn json_to_string(arguments: &[Value]) -> Result<Value, IntrinsicError> {
    const NAME: &str = "States.JsonToString";
    let [value] = arguments else {
        return Err(IntrinsicError::invalid(NAME, "expects a single argument"));
    };
    Ok(Value::String(value.to_string()))
}

fn math_random<R: Rng>(arguments: &[Value], rng: &mut R) -> Result<Value, IntrinsicError> {
    const NAME: &str = "States.MathRandom";
    let [low, high] = arguments else {
        return Err(IntrinsicError::invalid(NAME, "expects (low, high)"));
    };
    let (Some(low), Some(high)) = (low.as_i64(), high.as_i64()) else {
        return Err(IntrinsicError::invalid(NAME, "bounds must be integers"));
    };
    if low > high {
        return Err(IntrinsicError::invalid(NAME, "low bound exceeds high bound"));
    }
    Ok(Value::from(rng.gen_range(low..=high)))
}

fn math_add(arguments: &[Value]) -> Result<Value, IntrinsicError> {
    const NAME: &str = "States.MathAdd";
    let [left, right] = arguments else {
        return Err(IntrinsicError::invalid(NAME, "expects (a, b)"));
    };
    let (Some(left), Some(right)) = (left.as_i64(), right.as_i64()) else {
        return Err(IntrinsicError::invalid(NAME, "operands must be integers"));
    };
    left.checked_add(right)
        .map(Value::from)
        .ok_or_else(|| IntrinsicError::invalid(NAME, "integer overflow"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
