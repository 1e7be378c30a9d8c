//! Name → gadget definition mapping.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::Value;

use super::traits::{Gadget, GadgetDyn};
use crate::parser::SchemaSource;
use crate::schema::{SchemaIntrospector, validate};

struct Registered {
    gadget: Arc<dyn GadgetDyn>,
    schema: Arc<Value>,
    introspector: Arc<SchemaIntrospector>,
    compiled: Option<JSONSchema>,
}

/// Read-mostly registry of gadget definitions.
///
/// Registration replaces any prior definition under the same name. The
/// registry owns its definitions for its lifetime and is shared behind an
/// `Arc` once the loop starts.
#[derive(Default)]
pub struct GadgetRegistry {
    entries: HashMap<String, Registered>,
}

impl fmt::Debug for GadgetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GadgetRegistry")
            .field("gadgets", &self.list_names())
            .finish()
    }
}

impl GadgetRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed gadget.
    pub fn register(&mut self, gadget: impl Gadget) {
        self.register_dyn(Arc::new(gadget));
    }

    /// Register a dynamically dispatched gadget, replacing any prior
    /// definition with the same name.
    pub fn register_dyn(&mut self, gadget: Arc<dyn GadgetDyn>) {
        let name = gadget.name();
        let mut schema = gadget.parameters_schema();
        // Validate with the compiler's default dialect; schemars stamps a
        // meta-schema the validator may not have enabled.
        if let Some(object) = schema.as_object_mut() {
            object.remove("$schema");
        }
        let compiled = validate::compile(&name, &schema);
        let entry = Registered {
            gadget,
            introspector: Arc::new(SchemaIntrospector::new(schema.clone())),
            schema: Arc::new(schema),
            compiled,
        };
        self.entries.insert(name, entry);
    }

    /// The gadget registered under a name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn GadgetDyn>> {
        self.entries.get(name).map(|entry| Arc::clone(&entry.gadget))
    }

    /// Whether a gadget is registered under a name.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// The parameter schema for a gadget.
    #[must_use]
    pub fn schema(&self, name: &str) -> Option<Arc<Value>> {
        self.entries.get(name).map(|entry| Arc::clone(&entry.schema))
    }

    /// Validates a parsed parameter tree against a gadget's schema,
    /// returning the normalized params.
    ///
    /// # Errors
    ///
    /// A rendered validation message when the gadget is unknown or the
    /// params do not conform.
    pub fn validate_params(&self, name: &str, params: &Value) -> Result<Value, String> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| format!("unknown gadget '{name}'"))?;
        if let Some(compiled) = &entry.compiled {
            validate::validate(compiled, params)?;
        }
        Ok(params.clone())
    }
}

impl SchemaSource for GadgetRegistry {
    fn introspector_for(&self, name: &str) -> Option<Arc<SchemaIntrospector>> {
        self.entries
            .get(name)
            .map(|entry| Arc::clone(&entry.introspector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::{GadgetContext, GadgetError, GadgetOutput};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct CounterArgs {
        amount: i64,
    }

    struct Counter;

    impl Gadget for Counter {
        const NAME: &'static str = "Counter";
        type Args = CounterArgs;
        type Error = GadgetError;

        async fn invoke(
            &self,
            args: CounterArgs,
            _ctx: &GadgetContext,
        ) -> Result<GadgetOutput, GadgetError> {
            Ok(GadgetOutput::text(args.amount.to_string()))
        }
    }

    struct Counter2;

    impl Gadget for Counter2 {
        const NAME: &'static str = "Counter";
        type Args = CounterArgs;
        type Error = GadgetError;

        fn description(&self) -> String {
            "replacement".into()
        }

        async fn invoke(
            &self,
            args: CounterArgs,
            _ctx: &GadgetContext,
        ) -> Result<GadgetOutput, GadgetError> {
            Ok(GadgetOutput::text(args.amount.to_string()))
        }
    }

    #[test]
    fn lookup_and_listing() {
        let mut registry = GadgetRegistry::new();
        registry.register(Counter);
        assert!(registry.has("Counter"));
        assert!(!registry.has("Other"));
        assert_eq!(registry.list_names(), vec!["Counter".to_string()]);
        assert!(registry.get("Counter").is_some());
    }

    #[test]
    fn reregistering_replaces_the_definition() {
        let mut registry = GadgetRegistry::new();
        registry.register(Counter);
        registry.register(Counter2);
        assert_eq!(registry.get("Counter").unwrap().description(), "replacement");
        assert_eq!(registry.list_names().len(), 1);
    }

    #[test]
    fn validate_params_accepts_and_rejects() {
        let mut registry = GadgetRegistry::new();
        registry.register(Counter);

        let ok = registry.validate_params("Counter", &json!({ "amount": 3 }));
        assert_eq!(ok.unwrap(), json!({ "amount": 3 }));

        let err = registry
            .validate_params("Counter", &json!({ "amount": "three" }))
            .unwrap_err();
        assert!(err.contains("amount"), "unexpected message: {err}");

        let err = registry.validate_params("Missing", &json!({})).unwrap_err();
        assert!(err.contains("unknown gadget"));
    }

    #[test]
    fn schema_source_exposes_introspectors() {
        let mut registry = GadgetRegistry::new();
        registry.register(Counter);
        assert!(registry.introspector_for("Counter").is_some());
        assert!(registry.introspector_for("Missing").is_none());
    }
}
