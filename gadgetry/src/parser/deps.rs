//! Dependency-reference harvesting.
//!
//! A parameter value that is exactly `@<id>` references another invocation's
//! whole output; `$<id>.<path>` references a dotted path into that output
//! parsed as JSON. Dependencies are harvested at parse time so the dispatcher
//! can order and gate execution before anything runs.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static OUTPUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@([A-Za-z0-9_-]+)$").expect("valid reference pattern"));

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$([A-Za-z0-9_-]+)\.([A-Za-z0-9_.\[\]-]+)$").expect("valid reference pattern")
});

/// A reference found inside a parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `@id`: the whole output text of the referenced invocation.
    Output {
        /// The referenced invocation id.
        id: String,
    },
    /// `$id.path`: a dotted-path lookup into the referenced output.
    Path {
        /// The referenced invocation id.
        id: String,
        /// The dotted path into the output, e.g. `items.0.name`.
        path: String,
    },
}

impl Reference {
    /// The referenced invocation id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Output { id } | Self::Path { id, .. } => id,
        }
    }
}

/// Parses a parameter value as a reference, if its whole text matches one of
/// the reference shapes.
#[must_use]
pub fn parse_reference(value: &str) -> Option<Reference> {
    if let Some(captures) = OUTPUT_RE.captures(value) {
        return Some(Reference::Output {
            id: captures[1].to_string(),
        });
    }
    if let Some(captures) = PATH_RE.captures(value) {
        return Some(Reference::Path {
            id: captures[1].to_string(),
            path: captures[2].to_string(),
        });
    }
    None
}

/// Collects the invocation ids referenced anywhere in a parameter tree.
#[must_use]
pub fn harvest(params: &Value) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    collect(params, &mut ids);
    ids
}

fn collect(value: &Value, ids: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => {
            if let Some(reference) = parse_reference(text) {
                ids.insert(reference.id().to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, ids);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, ids);
            }
        }
        _ => {}
    }
}
