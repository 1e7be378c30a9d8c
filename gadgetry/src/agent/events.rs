//! Loop events and run results.

use crate::error::AgentError;
use crate::gadget::GadgetExecutionResult;
use crate::parser::ParsedGadgetCall;
use crate::usage::TokenTotals;

/// Events emitted while the loop streams.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum LoopEvent {
    /// Free text from the model, in stream order.
    Text(String),
    /// A gadget invocation was parsed out of the stream.
    GadgetCall(ParsedGadgetCall),
    /// A gadget invocation finished (completed, failed or skipped).
    GadgetResult(GadgetExecutionResult),
    /// The loop (or a gadget) is asking the user a question.
    HumanInputPrompt {
        /// The invocation that asked, when a gadget did.
        invocation_id: Option<String>,
        /// The question.
        question: String,
    },
    /// The conversation history was compacted.
    Compaction {
        /// Message count before compaction.
        before: usize,
        /// Message count after compaction.
        after: usize,
    },
}

/// Item type of the loop's event stream.
pub type LoopItem = Result<LoopEvent, AgentError>;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RunState {
    /// A gadget broke the loop or the model finished with plain text.
    Completed,
    /// The iteration cap was hit without completion.
    MaxIterationsReached,
    /// The abort signal ended the run.
    Aborted,
    /// A fatal error ended the run.
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::MaxIterationsReached => write!(f, "max_iterations_reached"),
            Self::Aborted => write!(f, "aborted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The aggregate result of one run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// How the run ended.
    pub state: RunState,
    /// The final text: a breaking gadget's message, or the last assistant
    /// response.
    pub final_text: String,
    /// Iterations executed.
    pub iterations: usize,
    /// Token totals across the run's LLM calls.
    pub tokens: TokenTotals,
    /// Cost in USD across LLM calls and gadgets.
    pub cost: f64,
    /// The fatal error, when the run failed.
    pub error: Option<String>,
}

/// Loop-internal outcome captured when the run ends.
#[derive(Debug, Clone)]
pub(crate) struct RunOutcome {
    pub state: RunState,
    pub final_text: String,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn completed(final_text: impl Into<String>) -> Self {
        Self {
            state: RunState::Completed,
            final_text: final_text.into(),
            error: None,
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            state: RunState::Aborted,
            final_text: String::new(),
            error: Some(reason),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: RunState::Failed,
            final_text: String::new(),
            error: Some(error.into()),
        }
    }
}
