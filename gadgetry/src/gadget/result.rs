//! The outcome record of one gadget invocation.

use serde::Serialize;
use serde_json::Value;

/// What one invocation produced, as appended to history and surfaced
/// through loop events.
#[derive(Debug, Clone, Serialize)]
pub struct GadgetExecutionResult {
    /// Gadget name.
    pub name: String,
    /// Invocation id.
    pub invocation_id: String,
    /// The validated params the gadget ran with (`None` when it never ran).
    pub params: Option<Value>,
    /// Result text on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error text on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time in milliseconds.
    pub execution_ms: u64,
    /// The gadget asked the loop to terminate.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub breaks_loop: bool,
    /// Cost in USD (context-reported plus direct).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Set when the invocation was skipped because this dependency failed
    /// or was itself skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_due_to_failed_dependency: Option<String>,
}

impl GadgetExecutionResult {
    /// Whether the invocation failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the invocation was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.skipped_due_to_failed_dependency.is_some()
    }
}
