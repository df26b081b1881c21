//! Choice rule evaluation: typed comparators, boolean combinators, and the
//! anchored glob used by `StringMatches`.
//!
//! Comparator keys arrive verbatim from the definition (`ChoiceRule`
//! captures them as key/operand pairs); this module interprets them into a
//! closed [`Comparison`] type. A missing left-hand reference makes the rule
//! false rather than an error, except for `IsPresent` which tests exactly
//! that.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use statecraft_types::error::ErrorRecord;
use statecraft_types::machine::{ChoiceRule, ChoiceState};

use crate::path::ReferencePath;

// ---------------------------------------------------------------------------
// Evaluation entry points
// ---------------------------------------------------------------------------

/// Evaluate a Choice state's rules in order against `document` and return
/// the name of the state to transition to.
pub fn evaluate(state: &ChoiceState, document: &Value) -> Result<String, ErrorRecord> {
    for rule in &state.choices {
        if rule_matches(rule, document)? {
            return rule
                .next
                .clone()
                .ok_or_else(|| ErrorRecord::runtime("top-level choice rule is missing Next"));
        }
    }
    state
        .default
        .clone()
        .ok_or_else(ErrorRecord::no_choice_matched)
}

/// Whether a single rule (comparator or combinator) matches `document`.
pub fn rule_matches(rule: &ChoiceRule, document: &Value) -> Result<bool, ErrorRecord> {
    if let Some(rules) = &rule.and {
        for nested in rules {
            if !rule_matches(nested, document)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    if let Some(rules) = &rule.or {
        for nested in rules {
            if rule_matches(nested, document)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(nested) = &rule.not {
        return Ok(!rule_matches(nested, document)?);
    }

    let comparison = Comparison::from_rule(rule).map_err(ErrorRecord::runtime)?;
    let variable = rule
        .variable
        .as_deref()
        .ok_or_else(|| ErrorRecord::runtime("choice rule is missing Variable"))?;
    let resolved = ReferencePath::parse(variable)
        .ok()
        .and_then(|path| path.resolve(document).ok().cloned());
    Ok(comparison.test(resolved.as_ref(), document))
}

/// Validate a rule's shape; used by machine validation at build time.
pub(crate) fn validate_rule(rule: &ChoiceRule, top_level: bool) -> Result<(), String> {
    if top_level && rule.next.is_none() {
        return Err("top-level choice rule must declare Next".to_string());
    }
    if !top_level && rule.next.is_some() {
        return Err("nested choice rules must not declare Next".to_string());
    }

    let combinators = [rule.and.is_some(), rule.or.is_some(), rule.not.is_some()]
        .into_iter()
        .filter(|set| *set)
        .count();
    if combinators > 1 {
        return Err("a choice rule may use only one of And/Or/Not".to_string());
    }

    if combinators == 1 {
        if rule.variable.is_some() || !rule.comparison.is_empty() {
            return Err(
                "a combinator rule cannot also carry Variable or a comparator".to_string(),
            );
        }
        for nested in rule.and.iter().flatten().chain(rule.or.iter().flatten()) {
            validate_rule(nested, false)?;
        }
        if let Some(nested) = &rule.not {
            validate_rule(nested, false)?;
        }
        return Ok(());
    }

    let variable = rule
        .variable
        .as_deref()
        .ok_or_else(|| "choice rule is missing Variable".to_string())?;
    ReferencePath::parse(variable).map_err(|e| e.to_string())?;
    Comparison::from_rule(rule).map(|_| ())
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Equals,
    LessThan,
    GreaterThan,
    LessThanEquals,
    GreaterThanEquals,
}

impl CompareOp {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "Equals" => Some(Self::Equals),
            "LessThan" => Some(Self::LessThan),
            "GreaterThan" => Some(Self::GreaterThan),
            "LessThanEquals" => Some(Self::LessThanEquals),
            "GreaterThanEquals" => Some(Self::GreaterThanEquals),
            _ => None,
        }
    }

    fn check<T: PartialOrd + ?Sized>(self, left: &T, right: &T) -> bool {
        match self {
            Self::Equals => left == right,
            Self::LessThan => left < right,
            Self::GreaterThan => left > right,
            Self::LessThanEquals => left <= right,
            Self::GreaterThanEquals => left >= right,
        }
    }
}

/// The right-hand side of a typed comparator: a literal, or a `*Path`
/// reference resolved against the current document.
#[derive(Debug, Clone)]
enum Operand {
    Literal(Value),
    Path(String),
}

impl Operand {
    fn resolve(&self, document: &Value) -> Option<Value> {
        match self {
            Operand::Literal(value) => Some(value.clone()),
            Operand::Path(path) => ReferencePath::parse(path)
                .ok()?
                .resolve(document)
                .ok()
                .cloned(),
        }
    }
}

/// A parsed comparator.
#[derive(Debug, Clone)]
enum Comparison {
    String { op: CompareOp, operand: Operand },
    Numeric { op: CompareOp, operand: Operand },
    Boolean { op: CompareOp, operand: Operand },
    Timestamp { op: CompareOp, operand: Operand },
    StringMatches(String),
    IsNull(bool),
    IsPresent(bool),
    IsNumeric(bool),
    IsString(bool),
    IsBoolean(bool),
    IsTimestamp(bool),
}

impl Comparison {
    fn from_rule(rule: &ChoiceRule) -> Result<Self, String> {
        let mut entries = rule.comparison.iter();
        let (Some((key, operand)), None) = (entries.next(), entries.next()) else {
            return Err("choice rule must carry exactly one comparator".to_string());
        };
        Self::parse(key, operand)
    }

    fn parse(key: &str, operand: &Value) -> Result<Self, String> {
        let expect_bool = || {
            operand
                .as_bool()
                .ok_or_else(|| format!("'{key}' expects a boolean operand"))
        };
        match key {
            "IsNull" => return Ok(Self::IsNull(expect_bool()?)),
            "IsPresent" => return Ok(Self::IsPresent(expect_bool()?)),
            "IsNumeric" => return Ok(Self::IsNumeric(expect_bool()?)),
            "IsString" => return Ok(Self::IsString(expect_bool()?)),
            "IsBoolean" => return Ok(Self::IsBoolean(expect_bool()?)),
            "IsTimestamp" => return Ok(Self::IsTimestamp(expect_bool()?)),
            "StringMatches" => {
                return operand
                    .as_str()
                    .map(|pattern| Self::StringMatches(pattern.to_string()))
                    .ok_or_else(|| format!("'{key}' expects a string operand"));
            }
            _ => {}
        }

        for family in ["String", "Numeric", "Boolean", "Timestamp"] {
            let Some(rest) = key.strip_prefix(family) else {
                continue;
            };
            let (op_name, is_path) = match rest.strip_suffix("Path") {
                Some(stripped) => (stripped, true),
                None => (rest, false),
            };
            let Some(op) = CompareOp::parse(op_name) else {
                break;
            };
            let operand = if is_path {
                Operand::Path(
                    operand
                        .as_str()
                        .ok_or_else(|| format!("'{key}' expects a path string operand"))?
                        .to_string(),
                )
            } else {
                let type_ok = match family {
                    "String" | "Timestamp" => operand.is_string(),
                    "Numeric" => operand.is_number(),
                    "Boolean" => operand.is_boolean(),
                    _ => false,
                };
                if !type_ok {
                    return Err(format!("'{key}' operand has the wrong type"));
                }
                Operand::Literal(operand.clone())
            };
            return Ok(match family {
                "String" => Self::String { op, operand },
                "Numeric" => Self::Numeric { op, operand },
                "Boolean" => Self::Boolean { op, operand },
                _ => Self::Timestamp { op, operand },
            });
        }

        Err(format!("unknown comparator '{key}'"))
    }

    fn test(&self, value: Option<&Value>, document: &Value) -> bool {
        if let Self::IsPresent(expected) = self {
            return value.is_some() == *expected;
        }
        let Some(value) = value else {
            return false;
        };

        match self {
            Self::IsPresent(_) => unreachable!("handled above"),
            Self::IsNull(expected) => value.is_null() == *expected,
            Self::IsNumeric(expected) => value.is_number() == *expected,
            Self::IsString(expected) => value.is_string() == *expected,
            Self::IsBoolean(expected) => value.is_boolean() == *expected,
            Self::IsTimestamp(expected) => {
                let is_timestamp = value
                    .as_str()
                    .is_some_and(|text| parse_timestamp(text).is_some());
                is_timestamp == *expected
            }
            Self::StringMatches(pattern) => value
                .as_str()
                .is_some_and(|text| glob_match(pattern, text)),
            Self::String { op, operand } => {
                let Some(left) = value.as_str() else {
                    return false;
                };
                let Some(right) = operand.resolve(document) else {
                    return false;
                };
                let Some(right) = right.as_str() else {
                    return false;
                };
                op.check(left, right)
            }
            Self::Numeric { op, operand } => {
                let Some(right) = operand.resolve(document) else {
                    return false;
                };
                compare_numbers(*op, value, &right)
            }
            Self::Boolean { op, operand } => {
                let Some(left) = value.as_bool() else {
                    return false;
                };
                let Some(right) = operand.resolve(document).and_then(|v| v.as_bool()) else {
                    return false;
                };
                op.check(&left, &right)
            }
            Self::Timestamp { op, operand } => {
                let Some(left) = value.as_str().and_then(parse_timestamp) else {
                    return false;
                };
                let Some(right) = operand
                    .resolve(document)
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .and_then(parse_timestamp)
                else {
                    return false;
                };
                op.check(&left, &right)
            }
        }
    }
}

/// Integer pairs compare exactly; any float operand falls back to f64.
fn compare_numbers(op: CompareOp, left: &Value, right: &Value) -> bool {
    if let (Some(left), Some(right)) = (left.as_i64(), right.as_i64()) {
        return op.check(&left, &right);
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(left), Some(right)) => op.check(&left, &right),
        _ => false,
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text).ok()
}

// ---------------------------------------------------------------------------
// Glob matching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobToken {
    Literal(char),
    Star,
}

fn parse_glob(pattern: &str) -> Vec<GlobToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => tokens.push(GlobToken::Literal(chars.next().unwrap_or('\\'))),
            '*' => tokens.push(GlobToken::Star),
            other => tokens.push(GlobToken::Literal(other)),
        }
    }
    tokens
}

/// Anchored match where `*` greedily matches any run of characters.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = parse_glob(pattern);
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                GlobToken::Star => {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                GlobToken::Literal(ch) if ch == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                GlobToken::Literal(_) => {}
            }
        }
        match backtrack {
            Some((star_p, star_t)) => {
                backtrack = Some((star_p, star_t + 1));
                p = star_p + 1;
                t = star_t + 1;
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|token| *token == GlobToken::Star)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
