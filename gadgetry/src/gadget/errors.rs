//! Gadget-level errors.

use thiserror::Error;

/// Errors raised by gadget resolution, validation and execution.
///
/// `HumanInputRequired` and `TaskComplete` are signalling variants: gadgets
/// raise them to ask the loop for user input or to terminate the run, and
/// the loop intercepts them rather than treating them as failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum GadgetError {
    /// No gadget registered under the invoked name.
    #[error("unknown gadget '{0}'")]
    UnknownGadget(String),

    /// Parsed params failed schema validation (or deserialization).
    #[error("invalid parameters: {0}")]
    Validation(String),

    /// Execution exceeded its deadline. The linked abort signal was tripped
    /// with a timeout reason before this was raised.
    #[error("timed out after {timeout_ms} ms")]
    Timeout {
        /// The deadline that was exceeded.
        timeout_ms: u64,
    },

    /// Cooperative cancellation observed.
    #[error("aborted: {reason}")]
    Aborted {
        /// The propagated abort reason.
        reason: String,
    },

    /// The gadget needs an answer from the user before it can proceed.
    #[error("human input required: {question}")]
    HumanInputRequired {
        /// The question to put to the user.
        question: String,
    },

    /// The gadget declares the whole task finished.
    #[error("task complete: {message}")]
    TaskComplete {
        /// Final message for the run result.
        message: String,
    },

    /// Ordinary execution failure.
    #[error("{0}")]
    Execution(String),
}

impl GadgetError {
    /// Converts an arbitrary gadget error type, preserving `GadgetError`
    /// kinds when the gadget already uses them.
    #[must_use]
    pub fn from_gadget<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(error);
        match boxed.downcast::<Self>() {
            Ok(gadget_error) => *gadget_error,
            Err(other) => Self::Execution(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_gadget_preserves_signalling_kinds() {
        let original = GadgetError::TaskComplete {
            message: "done".into(),
        };
        let converted = GadgetError::from_gadget(original);
        assert!(matches!(converted, GadgetError::TaskComplete { .. }));
    }

    #[test]
    fn from_gadget_wraps_foreign_errors() {
        #[derive(Debug, Error)]
        #[error("boom")]
        struct Custom;

        let converted = GadgetError::from_gadget(Custom);
        assert!(matches!(converted, GadgetError::Execution(message) if message == "boom"));
    }
}
