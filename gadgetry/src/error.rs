//! Error types for the gadgetry runtime.
//!
//! Parse and validation failures inside a single invocation are *data*, not
//! control flow: they travel on [`crate::parser::ParsedGadgetCall`] and
//! [`crate::gadget::GadgetExecutionResult`] so the model can see them. The
//! kinds below are the ones that escape an invocation and reach the loop.

use thiserror::Error;

use crate::gadget::GadgetError;

/// A type alias for `Result<T, AgentError>`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// The error type for agent loop operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// Transport or provider failure surfaced by the LLM adapter.
    #[error("provider error: {message}")]
    Provider {
        /// The underlying error message.
        message: String,
        /// Whether the adapter considers the failure retryable.
        retryable: bool,
    },

    /// The run was cancelled through the abort signal.
    #[error("run aborted: {reason}")]
    Aborted {
        /// The abort reason, as given to [`crate::abort::AbortSignal::abort`].
        reason: String,
    },

    /// A hook returned an action with a malformed payload.
    ///
    /// This is a programming error in the embedding application and is
    /// rethrown rather than recovered.
    #[error("hook returned a malformed action: {message}")]
    HookValidation {
        /// What was wrong with the action.
        message: String,
    },

    /// Invalid loop configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },

    /// A gadget failure that the loop's error policy decided is fatal.
    #[error("gadget '{name}' failed: {source}")]
    Gadget {
        /// Name of the gadget that failed.
        name: String,
        /// The underlying gadget error.
        source: GadgetError,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Create a new provider error.
    #[must_use]
    pub fn provider(message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            message: message.into(),
            retryable,
        }
    }

    /// Create a new aborted error.
    #[must_use]
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Create a new hook validation error.
    #[must_use]
    pub fn hook_validation(message: impl Into<String>) -> Self {
        Self::HookValidation {
            message: message.into(),
        }
    }

    /// Create a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
