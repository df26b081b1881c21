//! Reference-path parsing and document addressing.
//!
//! The engine's path dialect is a restricted JSONPath: the literal `$`
//! (whole document) followed by `.field` and `[index]` segments. No
//! wildcards, filters, or recursive descent. Lookup through a missing field
//! or out-of-range index is a resolution failure; insertion creates missing
//! intermediate objects but refuses to descend through non-objects.

use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from parsing or applying a reference path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The text is not a valid reference path.
    #[error("invalid reference path '{0}'")]
    Malformed(String),

    /// The path does not address a value in the document.
    #[error("path '{path}' does not resolve: {reason}")]
    Unresolved { path: String, reason: String },

    /// The path cannot receive a value (insertion only).
    #[error("cannot place result at '{path}': {reason}")]
    Unplaceable { path: String, reason: String },
}

// ---------------------------------------------------------------------------
// ReferencePath
// ---------------------------------------------------------------------------

/// One step of a reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// `.field` -- an object member.
    Field(String),
    /// `[n]` -- an array element.
    Index(usize),
}

/// A parsed reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePath {
    text: String,
    segments: Vec<Segment>,
}

impl ReferencePath {
    /// Parse `$`, `$.a.b`, `$.items[0].id`, ...
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let malformed = || PathError::Malformed(text.to_string());
        let bytes = text.as_bytes();
        if bytes.first() != Some(&b'$') {
            return Err(malformed());
        }

        let mut segments = Vec::new();
        let mut i = 1;
        while i < bytes.len() {
            match bytes[i] {
                b'.' => {
                    i += 1;
                    let start = i;
                    while i < bytes.len() && bytes[i] != b'.' && bytes[i] != b'[' {
                        i += 1;
                    }
                    if start == i {
                        return Err(malformed());
                    }
                    segments.push(Segment::Field(text[start..i].to_string()));
                }
                b'[' => {
                    i += 1;
                    let start = i;
                    while i < bytes.len() && bytes[i] != b']' {
                        i += 1;
                    }
                    if i == bytes.len() {
                        return Err(malformed());
                    }
                    let index: usize = text[start..i].parse().map_err(|_| malformed())?;
                    segments.push(Segment::Index(index));
                    i += 1;
                }
                _ => return Err(malformed()),
            }
        }

        Ok(Self {
            text: text.to_string(),
            segments,
        })
    }

    /// The original path text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether this path is the bare `$` (whole document).
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Look up the value this path addresses.
    pub fn resolve<'a>(&self, document: &'a Value) -> Result<&'a Value, PathError> {
        let mut current = document;
        for segment in &self.segments {
            current = match segment {
                Segment::Field(name) => match current {
                    Value::Object(map) => map.get(name).ok_or_else(|| PathError::Unresolved {
                        path: self.text.clone(),
                        reason: format!("field '{name}' not found"),
                    })?,
                    other => {
                        return Err(PathError::Unresolved {
                            path: self.text.clone(),
                            reason: format!("cannot read field '{name}' of {}", kind_of(other)),
                        });
                    }
                },
                Segment::Index(index) => match current {
                    Value::Array(items) => {
                        items.get(*index).ok_or_else(|| PathError::Unresolved {
                            path: self.text.clone(),
                            reason: format!("index {index} out of range (len {})", items.len()),
                        })?
                    }
                    other => {
                        return Err(PathError::Unresolved {
                            path: self.text.clone(),
                            reason: format!("cannot index {} with [{index}]", kind_of(other)),
                        });
                    }
                },
            };
        }
        Ok(current)
    }

    /// Produce a copy of `document` with `value` placed at this path.
    ///
    /// Missing intermediate object fields are created; descending through an
    /// existing non-object (or a missing array slot) is an error. The root
    /// path replaces the whole document.
    pub fn insert(&self, document: &Value, value: Value) -> Result<Value, PathError> {
        self.place(document, &self.segments, value)
    }

    fn place(
        &self,
        current: &Value,
        segments: &[Segment],
        value: Value,
    ) -> Result<Value, PathError> {
        let Some((segment, rest)) = segments.split_first() else {
            return Ok(value);
        };

        match segment {
            Segment::Field(name) => {
                let mut map = match current {
                    Value::Object(map) => map.clone(),
                    other => {
                        return Err(PathError::Unplaceable {
                            path: self.text.clone(),
                            reason: format!(
                                "cannot set field '{name}' on {}",
                                kind_of(other)
                            ),
                        });
                    }
                };
                let child = map
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                let placed = self.place(&child, rest, value)?;
                map.insert(name.clone(), placed);
                Ok(Value::Object(map))
            }
            Segment::Index(index) => {
                let mut items = match current {
                    Value::Array(items) => items.clone(),
                    other => {
                        return Err(PathError::Unplaceable {
                            path: self.text.clone(),
                            reason: format!("cannot index {} with [{index}]", kind_of(other)),
                        });
                    }
                };
                if *index < items.len() {
                    items[*index] = self.place(&items[*index], rest, value)?;
                } else if *index == items.len() && rest.is_empty() {
                    items.push(value);
                } else {
                    return Err(PathError::Unplaceable {
                        path: self.text.clone(),
                        reason: format!("index {index} out of range (len {})", items.len()),
                    });
                }
                Ok(Value::Array(items))
            }
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
