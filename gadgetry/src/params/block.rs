//! Argument-block body decoder.
//!
//! Bodies in block format are a sequence of header lines
//! `<arg_prefix><path>` each followed by a raw value running until the next
//! header line (or end of body) with exactly one trailing newline stripped.
//! Paths are slash-separated; a segment matching `[0-9]+` addresses an array
//! index, anything else (including negative numbers) an object key.

use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::schema::{ExpectedKind, SchemaIntrospector};

/// Errors raised while decoding an argument-block body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BlockParamsError {
    /// The same pointer was assigned twice.
    #[error("duplicate pointer '{path}'")]
    DuplicatePointer {
        /// The offending path.
        path: String,
    },

    /// An array index skipped over unassigned slots.
    #[error("array index gap at '{path}': got index {index}, expected {expected}")]
    ArrayGap {
        /// The offending path.
        path: String,
        /// The index that was assigned.
        index: usize,
        /// The next dense index.
        expected: usize,
    },

    /// A segment addressed an existing container of the other shape.
    #[error("path conflict at '{path}': value already has a different shape")]
    PathConflict {
        /// The path up to and including the conflicting segment.
        path: String,
    },

    /// A header line carried no path.
    #[error("empty argument path")]
    EmptyPath,

    /// Non-blank content appeared before the first header line.
    #[error("unexpected content before first argument header")]
    UnexpectedContent,
}

/// Parses a block-format body into a nested value tree.
///
/// When `schema` is given, leaf literals are coerced according to the
/// expected kind at their path; otherwise auto-coercion applies (numeric
/// literals to numbers, exact `true`/`false` to booleans).
///
/// # Errors
///
/// See [`BlockParamsError`].
pub fn parse_block_params(
    body: &str,
    arg_prefix: &str,
    schema: Option<&SchemaIntrospector>,
) -> Result<Value, BlockParamsError> {
    let mut root = Value::Object(Map::new());

    for (path, raw_value) in split_args(body, arg_prefix)? {
        let value = coerce(path, raw_value, schema);
        insert(&mut root, path, value)?;
    }

    Ok(root)
}

/// Splits the body into `(path, raw value)` pairs.
fn split_args<'a>(
    body: &'a str,
    arg_prefix: &str,
) -> Result<Vec<(&'a str, &'a str)>, BlockParamsError> {
    // Byte offsets of every header line start, in order.
    let mut headers: Vec<usize> = Vec::new();
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if line.starts_with(arg_prefix) {
            headers.push(offset);
        } else if headers.is_empty() && !line.trim().is_empty() {
            return Err(BlockParamsError::UnexpectedContent);
        }
        offset += line.len();
    }

    let mut args = Vec::with_capacity(headers.len());
    for (i, &start) in headers.iter().enumerate() {
        let region_end = headers.get(i + 1).copied().unwrap_or(body.len());
        let region = &body[start..region_end];

        let header_end = region.find('\n').unwrap_or(region.len());
        let path = region[arg_prefix.len()..header_end].trim_end_matches('\r');
        if path.is_empty() {
            return Err(BlockParamsError::EmptyPath);
        }

        let mut value = if header_end < region.len() {
            &region[header_end + 1..]
        } else {
            ""
        };
        // Exactly one trailing newline belongs to the block framing.
        value = value
            .strip_suffix('\n')
            .map_or(value, |v| v.strip_suffix('\r').unwrap_or(v));

        args.push((path, value));
    }
    Ok(args)
}

fn coerce(path: &str, raw: &str, schema: Option<&SchemaIntrospector>) -> Value {
    let kind = schema.map_or(ExpectedKind::Unknown, |s| s.kind_at_path(path));
    match kind {
        ExpectedKind::String => Value::String(raw.to_string()),
        ExpectedKind::Number => parse_number(raw).unwrap_or_else(|| Value::String(raw.to_string())),
        ExpectedKind::Boolean => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            other => Value::String(other.to_string()),
        },
        ExpectedKind::Unknown => auto_coerce(raw),
    }
}

fn auto_coerce(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if is_numeric_literal(raw)
        && let Some(number) = parse_number(raw)
    {
        return number;
    }
    Value::String(raw.to_string())
}

/// The numeric literal shape that auto-coerces: `-?[0-9]+(\.[0-9]+)?`.
fn is_numeric_literal(raw: &str) -> bool {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() {
        return false;
    }
    match digits.split_once('.') {
        None => digits.bytes().all(|b| b.is_ascii_digit()),
        Some((int, frac)) => {
            !int.is_empty()
                && !frac.is_empty()
                && int.bytes().all(|b| b.is_ascii_digit())
                && frac.bytes().all(|b| b.is_ascii_digit())
        }
    }
}

fn parse_number(raw: &str) -> Option<Value> {
    if !is_numeric_literal(raw) {
        return None;
    }
    if raw.contains('.') {
        Number::from_f64(raw.parse::<f64>().ok()?).map(Value::Number)
    } else {
        raw.parse::<i64>().ok().map(|n| Value::Number(n.into()))
    }
}

fn is_index_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Inserts `value` at `path`, creating intermediate objects/arrays.
fn insert(root: &mut Value, path: &str, value: Value) -> Result<(), BlockParamsError> {
    let normalized = path.strip_prefix('/').unwrap_or(path);
    let segments: Vec<&str> = normalized.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(BlockParamsError::EmptyPath);
    }

    let mut current = root;
    for (depth, segment) in segments.iter().enumerate() {
        let is_leaf = depth + 1 == segments.len();
        let here = || segments[..=depth].join("/");

        if is_index_segment(segment) {
            let Value::Array(arr) = current else {
                return Err(BlockParamsError::PathConflict { path: here() });
            };
            // `is_index_segment` guarantees the parse succeeds.
            let index: usize = segment
                .parse()
                .map_err(|_| BlockParamsError::PathConflict { path: here() })?;
            if index > arr.len() {
                return Err(BlockParamsError::ArrayGap {
                    path: here(),
                    index,
                    expected: arr.len(),
                });
            }
            if is_leaf {
                if index < arr.len() {
                    return Err(BlockParamsError::DuplicatePointer {
                        path: normalized.to_string(),
                    });
                }
                arr.push(value);
                return Ok(());
            }
            if index == arr.len() {
                arr.push(container_for(segments[depth + 1]));
            }
            current = &mut arr[index];
        } else {
            let Value::Object(map) = current else {
                return Err(BlockParamsError::PathConflict { path: here() });
            };
            if is_leaf {
                if map.contains_key(*segment) {
                    return Err(BlockParamsError::DuplicatePointer {
                        path: normalized.to_string(),
                    });
                }
                map.insert((*segment).to_string(), value);
                return Ok(());
            }
            let entry = map
                .entry((*segment).to_string())
                .or_insert_with(|| container_for(segments[depth + 1]));
            match entry {
                Value::Object(_) | Value::Array(_) => {}
                _ => {
                    return Err(BlockParamsError::DuplicatePointer {
                        path: here(),
                    });
                }
            }
            current = entry;
        }
    }
    Ok(())
}

fn container_for(next_segment: &str) -> Value {
    if is_index_segment(next_segment) {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    }
}
