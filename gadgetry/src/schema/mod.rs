//! Schema introspection and parameter validation.
//!
//! Gadget parameter schemas are plain JSON-Schema values (produced by
//! `schemars` derives or written by hand). [`SchemaIntrospector`] answers
//! "what primitive kind lives at this path?" for the block-params coercion
//! layer; [`validate`] runs full validation for the registry.

mod introspect;
pub mod validate;

pub use introspect::{ExpectedKind, SchemaIntrospector};
