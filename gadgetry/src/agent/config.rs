//! Agent loop configuration.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::parser::MarkerConfig;

/// Action resolved for an iteration that produced text but no gadget calls.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TextOnlyAction {
    /// End the run with the text as the final answer.
    Terminate,
    /// Append a synthetic "continue" user message and re-enter.
    Acknowledge,
    /// Ask the user for input and continue with their answer.
    WaitForInput,
    /// Dispatch a synthetic gadget invocation this iteration.
    TriggerGadget {
        /// Gadget name.
        name: String,
        /// Parameters for the synthetic invocation.
        params: Value,
    },
}

/// Policy for text-only iterations.
#[derive(Clone, Default)]
#[non_exhaustive]
pub enum TextOnlyHandler {
    /// End the run (default).
    #[default]
    Terminate,
    /// Append a synthetic "continue" user message and re-enter.
    Acknowledge,
    /// Ask the configured human-input provider.
    WaitForInput,
    /// Decide per response.
    Custom(Arc<dyn Fn(&str) -> TextOnlyAction + Send + Sync>),
}

impl fmt::Debug for TextOnlyHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate => write!(f, "Terminate"),
            Self::Acknowledge => write!(f, "Acknowledge"),
            Self::WaitForInput => write!(f, "WaitForInput"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Configuration for an agent loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model identifier, possibly provider-prefixed.
    pub model: String,
    /// Iteration cap (default 15).
    pub max_iterations: usize,
    /// Default per-gadget timeout; gadgets may override.
    pub default_gadget_timeout_ms: Option<u64>,
    /// Whether a gadget error ends the run (default true).
    pub stop_on_gadget_error: bool,
    /// Policy for iterations without gadget calls.
    pub text_only_handler: TextOnlyHandler,
    /// Marker literals framing gadget invocations.
    pub markers: MarkerConfig,
    /// Sampling temperature passed to the adapter.
    pub temperature: Option<f64>,
    /// Nucleus sampling parameter passed to the adapter.
    pub top_p: Option<f64>,
    /// Stop sequences passed to the adapter.
    pub stop_sequences: Vec<String>,
}

impl AgentConfig {
    /// Default iteration cap.
    pub const DEFAULT_MAX_ITERATIONS: usize = 15;

    /// Create a config for a model with defaults everywhere else.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            default_gadget_timeout_ms: None,
            stop_on_gadget_error: true,
            text_only_handler: TextOnlyHandler::default(),
            markers: MarkerConfig::default(),
            temperature: None,
            top_p: None,
            stop_sequences: Vec::new(),
        }
    }
}
