//! JSON-Schema validation of parsed gadget parameters.

use jsonschema::JSONSchema;
use serde_json::Value;
use tracing::warn;

/// Compiles a schema, returning `None` (with a warning) when the schema
/// itself is malformed. Gadgets with uncompilable schemas skip validation
/// rather than becoming uncallable.
#[must_use]
pub fn compile(name: &str, schema: &Value) -> Option<JSONSchema> {
    match JSONSchema::compile(schema) {
        Ok(compiled) => Some(compiled),
        Err(err) => {
            warn!(gadget = %name, error = %err, "parameter schema failed to compile; validation disabled");
            None
        }
    }
}

/// Validates an instance, rendering all violations into one message.
///
/// # Errors
///
/// Returns the joined violation messages when the instance does not conform.
pub fn validate(compiled: &JSONSchema, instance: &Value) -> Result<(), String> {
    if let Err(errors) = compiled.validate(instance) {
        let rendered: Vec<String> = errors
            .map(|err| {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    err.to_string()
                } else {
                    format!("{path}: {err}")
                }
            })
            .collect();
        return Err(rendered.join("; "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_instance_passes() {
        let schema = json!({
            "type": "object",
            "properties": { "x": { "type": "integer" } },
            "required": ["x"]
        });
        let compiled = compile("t", &schema).unwrap();
        assert!(validate(&compiled, &json!({ "x": 3 })).is_ok());
    }

    #[test]
    fn violations_are_rendered_with_paths() {
        let schema = json!({
            "type": "object",
            "properties": { "x": { "type": "integer" } },
            "required": ["x"]
        });
        let compiled = compile("t", &schema).unwrap();
        let err = validate(&compiled, &json!({ "x": "nope" })).unwrap_err();
        assert!(err.contains("/x"), "path missing from: {err}");
    }

    #[test]
    fn malformed_schema_compiles_to_none() {
        let schema = json!({ "type": 12 });
        assert!(compile("t", &schema).is_none());
    }
}
