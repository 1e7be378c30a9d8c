//! Loop-owned stores for gadget outputs and media.
//!
//! Both stores belong to one agent loop: created with it, cleared when the
//! run ends, never shared across loops. The output store backs reference
//! substitution (`@id`, `$id.path`) at dispatch time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::parser::deps::{Reference, parse_reference};

/// Invocation id → result text, for reference substitution.
#[derive(Debug, Clone, Default)]
pub struct GadgetOutputStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl GadgetOutputStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an invocation's output text.
    pub fn record(&self, invocation_id: impl Into<String>, output: impl Into<String>) {
        self.lock().insert(invocation_id.into(), output.into());
    }

    /// The recorded output for an invocation.
    #[must_use]
    pub fn get(&self, invocation_id: &str) -> Option<String> {
        self.lock().get(invocation_id).cloned()
    }

    /// Drop all recorded outputs.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One media item produced by a gadget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    /// Store-assigned id.
    pub id: String,
    /// MIME type as reported by the producer.
    pub mime: String,
    /// Raw bytes.
    pub data: Vec<u8>,
}

/// Media id → item, owned by one loop.
#[derive(Debug, Clone, Default)]
pub struct MediaStore {
    inner: Arc<Mutex<HashMap<String, MediaItem>>>,
    next: Arc<AtomicU64>,
}

impl MediaStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an item, returning its assigned id (`media_<N>`).
    pub fn store(&self, mime: impl Into<String>, data: Vec<u8>) -> String {
        let id = format!("media_{}", self.next.fetch_add(1, Ordering::SeqCst) + 1);
        let item = MediaItem {
            id: id.clone(),
            mime: mime.into(),
            data,
        };
        self.lock().insert(id.clone(), item);
        id
    }

    /// Fetch an item by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<MediaItem> {
        self.lock().get(id).cloned()
    }

    /// Drop all items.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MediaItem>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replaces whole-value references in a parameter tree with the referenced
/// outputs. Unresolvable references are left untouched; the gadget's own
/// execution surfaces the problem.
#[must_use]
pub fn resolve_references(params: &Value, outputs: &GadgetOutputStore) -> Value {
    match params {
        Value::String(text) => match parse_reference(text) {
            Some(Reference::Output { id }) => outputs
                .get(&id)
                .map_or_else(|| params.clone(), Value::String),
            Some(Reference::Path { id, path }) => outputs
                .get(&id)
                .and_then(|output| lookup_path(&output, &path))
                .unwrap_or_else(|| params.clone()),
            None => params.clone(),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_references(item, outputs))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), resolve_references(value, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Dotted-path lookup into an output parsed as JSON. Numeric segments index
/// arrays. String results unwrap to plain strings.
fn lookup_path(output: &str, path: &str) -> Option<Value> {
    let parsed: Value = serde_json::from_str(output).ok()?;
    let mut current = &parsed;
    for segment in path.split('.') {
        current = match (current, segment.parse::<usize>()) {
            (Value::Array(items), Ok(index)) => items.get(index)?,
            (Value::Object(map), _) => map.get(segment)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_output_substitution() {
        let outputs = GadgetOutputStore::new();
        outputs.record("gadget_1", "forty-two");
        let params = json!({ "value": "@gadget_1", "other": "@missing" });
        let resolved = resolve_references(&params, &outputs);
        assert_eq!(resolved, json!({ "value": "forty-two", "other": "@missing" }));
    }

    #[test]
    fn path_substitution_into_json_output() {
        let outputs = GadgetOutputStore::new();
        outputs.record("g", r#"{"items":[{"name":"first"},{"name":"second"}],"n":7}"#);
        let params = json!({
            "a": "$g.items.1.name",
            "b": "$g.n",
            "c": "$g.items.9.name"
        });
        let resolved = resolve_references(&params, &outputs);
        assert_eq!(resolved["a"], "second");
        assert_eq!(resolved["b"], 7);
        assert_eq!(resolved["c"], "$g.items.9.name");
    }

    #[test]
    fn clear_empties_the_store() {
        let outputs = GadgetOutputStore::new();
        outputs.record("x", "y");
        outputs.clear();
        assert!(outputs.get("x").is_none());
    }

    #[test]
    fn media_ids_are_sequential_per_store() {
        let media = MediaStore::new();
        let a = media.store("image/png", vec![1, 2, 3]);
        let b = media.store("text/plain", vec![4]);
        assert_ne!(a, b);
        assert_eq!(media.get(&a).unwrap().mime, "image/png");
        media.clear();
        assert!(media.get(&a).is_none());
    }
}
