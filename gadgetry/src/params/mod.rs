//! Gadget parameter bodies.
//!
//! A gadget body between the start and end markers is one of three formats
//! (the agent declares the expected one in its system prompt, the parser
//! accepts all three):
//!
//! - a JSON object literal,
//! - a YAML document,
//! - a sequence of `<arg_prefix><path>` header lines with raw values
//!   (handled by [`block`]).

pub mod block;

use std::sync::Arc;

use serde_json::Value;

use crate::schema::SchemaIntrospector;

pub use block::{BlockParamsError, parse_block_params};

/// Parses a raw params body, auto-detecting the format.
///
/// The schema, when supplied, drives coercion of block-format values; JSON
/// and YAML bodies carry native types and are taken as-is.
///
/// # Errors
///
/// Returns a rendered parse error when the body matches none of the formats
/// or the matched format is malformed.
pub fn parse_params(
    raw: &str,
    arg_prefix: &str,
    schema: Option<&Arc<SchemaIntrospector>>,
) -> Result<Value, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    // Block bodies keep their trailing-newline semantics: only leading
    // whitespace is dropped before handing off.
    if trimmed.starts_with(arg_prefix) {
        return parse_block_params(raw.trim_start(), arg_prefix, schema.map(Arc::as_ref))
            .map_err(|err| err.to_string());
    }

    // Only object literals count as the JSON format; anything else (arrays
    // included) is a malformed body.
    if trimmed.starts_with('{') {
        return match serde_json::from_str(trimmed) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(_) => Err("parameter body is neither JSON object, YAML mapping, nor argument blocks".into()),
            Err(err) => Err(format!("invalid JSON body: {err}")),
        };
    }

    match serde_yaml::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("parameter body is neither JSON object, YAML mapping, nor argument blocks".into()),
        Err(err) => Err(format!("invalid YAML body: {err}")),
    }
}
