//! Path-wise kind lookup over a JSON-Schema value.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

/// The primitive kind a schema expects at some path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedKind {
    /// A string; literals at this path are never coerced.
    String,
    /// A number (JSON-Schema `number` or `integer`).
    Number,
    /// A boolean.
    Boolean,
    /// Anything else: unions, transforms, free-form values. Auto-coercion
    /// applies.
    Unknown,
}

/// Walks a JSON-Schema value to report the expected kind at a slash-separated
/// path, caching results per path.
///
/// Wrapper layers (nullable unions, `default`, annotations) are unwrapped;
/// objects, arrays, tuples and records are descended into. Unions of more
/// than one non-null branch report [`ExpectedKind::Unknown`]; `enum` reports
/// [`ExpectedKind::String`]; `const` reports the kind of its value.
#[derive(Debug)]
pub struct SchemaIntrospector {
    root: Value,
    cache: Mutex<HashMap<String, ExpectedKind>>,
}

impl SchemaIntrospector {
    /// Create an introspector over a schema value.
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self {
            root,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The expected kind at `path` (`"a/b/0/c"` form; a path without `/`
    /// names a top-level field; an empty path names the root).
    #[must_use]
    pub fn kind_at_path(&self, path: &str) -> ExpectedKind {
        let normalized = path.strip_prefix('/').unwrap_or(path);
        if let Ok(cache) = self.cache.lock()
            && let Some(kind) = cache.get(normalized)
        {
            return *kind;
        }

        let segments: Vec<&str> = if normalized.is_empty() {
            Vec::new()
        } else {
            normalized.split('/').collect()
        };
        let kind = walk(&self.root, &segments);

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(normalized.to_string(), kind);
        }
        kind
    }
}

fn walk(schema: &Value, segments: &[&str]) -> ExpectedKind {
    let schema = unwrap_schema(schema);
    let Some(first) = segments.first() else {
        return kind_of(schema);
    };
    let rest = &segments[1..];

    let Some(obj) = schema.as_object() else {
        return ExpectedKind::Unknown;
    };

    if let Some(props) = obj.get("properties").and_then(Value::as_object)
        && let Some(sub) = props.get(*first)
    {
        return walk(sub, rest);
    }

    if let Ok(index) = first.parse::<usize>() {
        // Tuples first (draft 2020-12 prefixItems, draft 7 items-as-array),
        // then uniform arrays.
        if let Some(prefix) = obj.get("prefixItems").and_then(Value::as_array)
            && let Some(sub) = prefix.get(index)
        {
            return walk(sub, rest);
        }
        match obj.get("items") {
            Some(Value::Array(tuple)) => {
                if let Some(sub) = tuple.get(index) {
                    return walk(sub, rest);
                }
            }
            Some(items) if items.is_object() => return walk(items, rest),
            _ => {}
        }
    } else if let Some(additional) = obj.get("additionalProperties")
        && additional.is_object()
    {
        // Record/map schemas.
        return walk(additional, rest);
    }

    ExpectedKind::Unknown
}

/// Strips wrapper layers: a union whose only non-null branch is a single
/// schema collapses to that branch (optional/nullable wrappers).
fn unwrap_schema(schema: &Value) -> &Value {
    let mut current = schema;
    loop {
        let Some(obj) = current.as_object() else {
            return current;
        };
        let branches = obj
            .get("anyOf")
            .or_else(|| obj.get("oneOf"))
            .and_then(Value::as_array);
        let Some(branches) = branches else {
            return current;
        };
        let non_null: Vec<&Value> = branches.iter().filter(|b| !is_null_schema(b)).collect();
        if non_null.len() == 1 {
            current = non_null[0];
        } else {
            return current;
        }
    }
}

fn is_null_schema(schema: &Value) -> bool {
    schema
        .as_object()
        .and_then(|o| o.get("type"))
        .and_then(Value::as_str)
        == Some("null")
}

fn kind_of(schema: &Value) -> ExpectedKind {
    let Some(obj) = schema.as_object() else {
        return ExpectedKind::Unknown;
    };

    // Enums always carry string literals in marker bodies.
    if obj.contains_key("enum") {
        return ExpectedKind::String;
    }
    if let Some(constant) = obj.get("const") {
        return kind_of_value(constant);
    }

    // Unions that survived unwrapping are genuinely ambiguous.
    if obj.contains_key("anyOf") || obj.contains_key("oneOf") {
        return ExpectedKind::Unknown;
    }

    match obj.get("type") {
        Some(Value::String(ty)) => kind_of_type_name(ty),
        Some(Value::Array(types)) => {
            let non_null: Vec<&str> = types
                .iter()
                .filter_map(Value::as_str)
                .filter(|t| *t != "null")
                .collect();
            match non_null.as_slice() {
                [single] => kind_of_type_name(single),
                _ => ExpectedKind::Unknown,
            }
        }
        _ => ExpectedKind::Unknown,
    }
}

fn kind_of_type_name(name: &str) -> ExpectedKind {
    match name {
        "string" => ExpectedKind::String,
        "number" | "integer" => ExpectedKind::Number,
        "boolean" => ExpectedKind::Boolean,
        _ => ExpectedKind::Unknown,
    }
}

fn kind_of_value(value: &Value) -> ExpectedKind {
    match value {
        Value::String(_) => ExpectedKind::String,
        Value::Number(_) => ExpectedKind::Number,
        Value::Bool(_) => ExpectedKind::Boolean,
        _ => ExpectedKind::Unknown,
    }
}
