//! Incremental recovery of gadget invocations from the model's text stream.
//!
//! The model interleaves free text with marker-framed blocks; the
//! [`StreamParser`] splits an arbitrarily chunked character stream into
//! [`ParserEvent`]s while preserving the free text verbatim. Feeding the
//! stream one byte at a time produces exactly the same events as feeding it
//! whole.

pub mod deps;
mod stream;

pub use stream::StreamParser;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::schema::SchemaIntrospector;

/// The marker literals that frame gadget invocations in the text stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerConfig {
    /// Opens an invocation; followed by `Name` or `Name:id`, then a newline.
    pub start_prefix: String,
    /// Closes an invocation; optionally followed by `:id`.
    pub end_prefix: String,
    /// Introduces one argument inside a block-format body.
    pub arg_prefix: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            start_prefix: "!!!GADGET_START:".to_string(),
            end_prefix: "!!!GADGET_END".to_string(),
            arg_prefix: "!!!ARG:".to_string(),
        }
    }
}

/// Source of parameter-schema introspectors, keyed by gadget name. The
/// registry implements this so the parser can coerce block-format literals
/// schema-aware at parse time.
pub trait SchemaSource: Send + Sync {
    /// The introspector for a gadget's parameter schema, if the gadget is
    /// known.
    fn introspector_for(&self, name: &str) -> Option<Arc<SchemaIntrospector>>;
}

/// One parsed gadget invocation, immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedGadgetCall {
    /// The gadget name from the start marker header.
    pub name: String,
    /// The invocation id: supplied in the header, or minted process-wide.
    pub invocation_id: String,
    /// The raw body text between the header newline and the end marker.
    pub params_raw: String,
    /// The parsed parameter tree; `None` when parsing failed.
    pub params: Option<Value>,
    /// The parse failure, carried so the loop can surface it to the model.
    pub parse_error: Option<String>,
    /// Invocation ids this call references in its parameter values.
    pub dependencies: BTreeSet<String>,
}

impl ParsedGadgetCall {
    /// Serializes the call back to its wire form with the given markers.
    #[must_use]
    pub fn render(&self, markers: &MarkerConfig) -> String {
        let mut out = String::with_capacity(
            markers.start_prefix.len() + markers.end_prefix.len() + self.params_raw.len() + 64,
        );
        out.push_str(&markers.start_prefix);
        out.push_str(&self.name);
        out.push(':');
        out.push_str(&self.invocation_id);
        out.push('\n');
        out.push_str(&self.params_raw);
        if !self.params_raw.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&markers.end_prefix);
        out.push(':');
        out.push_str(&self.invocation_id);
        out
    }
}

/// An event recovered from the stream, in input order.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// A run of free text. Never empty.
    Text(String),
    /// A complete gadget invocation.
    GadgetCall(ParsedGadgetCall),
}

impl ParserEvent {
    /// The text content, if this is a text event.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::GadgetCall(_) => None,
        }
    }

    /// The call, if this is a gadget-call event.
    #[must_use]
    pub fn as_call(&self) -> Option<&ParsedGadgetCall> {
        match self {
            Self::Text(_) => None,
            Self::GadgetCall(call) => Some(call),
        }
    }
}
