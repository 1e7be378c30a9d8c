//! Gadgetry is a runtime for LLM-driven agents whose tool calls ("gadgets")
//! are framed as marker blocks embedded in the model's text stream.
//!
//! The model emits free text interleaved with blocks of the form
//!
//! ```text
//! !!!GADGET_START:Name:id
//! <params>
//! !!!GADGET_END:id
//! ```
//!
//! The runtime recovers those blocks incrementally from the token stream
//! ([`parser::StreamParser`]), validates the parameters against the gadget's
//! schema ([`gadget::GadgetRegistry`]), executes the invocations under
//! dependency ordering, timeouts and cooperative cancellation
//! ([`gadget::GadgetExecutor`]), records everything in a hierarchical
//! execution tree ([`tree::ExecutionTree`]) and feeds results back into the
//! next model turn ([`agent::Agent`]).

// Core plumbing
pub mod abort;
pub mod error;
pub mod id;
pub mod message;
pub mod usage;

// Parsing
pub mod params;
pub mod parser;
pub mod schema;

// Gadgets and execution
pub mod gadget;
pub mod store;
pub mod tree;

// The loop and its collaborators
pub mod agent;
pub mod llm;

// Built-in gadgets and their support code
pub mod matcher;
pub mod tools;

pub mod prelude;

pub use error::{AgentError, Result};
pub use message::{Message, Role};
pub use usage::Usage;
