//! Loop hooks.
//!
//! Hooks observe and steer loop decisions by returning closed action
//! variants. Every action is validated before it is applied: an action with
//! a degenerate payload (empty synthetic text, empty message list) is a
//! programming error in the embedding application and fails the run.

use async_trait::async_trait;

use crate::error::AgentError;
use crate::gadget::GadgetExecutionResult;
use crate::message::Message;
use crate::parser::ParsedGadgetCall;
use crate::usage::Usage;

/// Context for [`AgentHooks::before_llm_call`].
#[derive(Debug)]
pub struct LlmRequestContext<'a> {
    /// 1-based iteration number.
    pub iteration: usize,
    /// Model identifier.
    pub model: &'a str,
    /// The conversation about to be sent.
    pub messages: &'a [Message],
}

/// Context for [`AgentHooks::after_llm_call`].
#[derive(Debug)]
pub struct LlmResponseContext<'a> {
    /// 1-based iteration number.
    pub iteration: usize,
    /// Model identifier.
    pub model: &'a str,
    /// The full response text (markers included).
    pub response_text: &'a str,
    /// Usage, when the adapter reported it.
    pub usage: Option<&'a Usage>,
    /// Finish reason, when the adapter reported it.
    pub finish_reason: Option<&'a str>,
}

/// Context for [`AgentHooks::after_llm_error`].
#[derive(Debug)]
pub struct LlmErrorContext<'a> {
    /// 1-based iteration number.
    pub iteration: usize,
    /// The provider error.
    pub error: &'a AgentError,
}

/// Action for [`AgentHooks::before_llm_call`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum BeforeLlmAction {
    /// Make the call.
    Continue,
    /// Skip the call and treat the synthetic text as this iteration's
    /// response.
    Skip {
        /// The synthetic model response.
        synthetic_response: String,
    },
}

impl BeforeLlmAction {
    pub(crate) fn validate(&self) -> Result<(), AgentError> {
        match self {
            Self::Continue => Ok(()),
            Self::Skip { synthetic_response } if synthetic_response.is_empty() => Err(
                AgentError::hook_validation("before_llm_call skip with empty synthetic_response"),
            ),
            Self::Skip { .. } => Ok(()),
        }
    }
}

/// Action for [`AgentHooks::after_llm_call`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AfterLlmAction {
    /// Proceed to gadget dispatch.
    Continue,
    /// Append messages and re-enter the iteration; no gadget dispatch this
    /// pass.
    AppendMessages {
        /// Messages to append.
        messages: Vec<Message>,
    },
    /// Replace the assistant response text and proceed.
    ModifyAndContinue {
        /// The replacement text.
        response_text: String,
    },
    /// Both: append messages and replace the response, then re-enter.
    AppendAndModify {
        /// Messages to append.
        messages: Vec<Message>,
        /// The replacement text.
        response_text: String,
    },
}

impl AfterLlmAction {
    pub(crate) fn validate(&self) -> Result<(), AgentError> {
        match self {
            Self::Continue => Ok(()),
            Self::AppendMessages { messages } if messages.is_empty() => Err(
                AgentError::hook_validation("after_llm_call append with empty messages"),
            ),
            Self::ModifyAndContinue { response_text } if response_text.is_empty() => Err(
                AgentError::hook_validation("after_llm_call modify with empty response_text"),
            ),
            Self::AppendAndModify {
                messages,
                response_text,
            } if messages.is_empty() || response_text.is_empty() => Err(
                AgentError::hook_validation("after_llm_call append_and_modify with empty payload"),
            ),
            _ => Ok(()),
        }
    }
}

/// Action for [`AgentHooks::after_llm_error`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AfterLlmErrorAction {
    /// Propagate the provider error and end the run (default).
    Rethrow,
    /// Treat the fallback text as this iteration's response.
    Recover {
        /// The fallback response.
        fallback_response: String,
    },
}

impl AfterLlmErrorAction {
    pub(crate) fn validate(&self) -> Result<(), AgentError> {
        match self {
            Self::Rethrow => Ok(()),
            Self::Recover { fallback_response } if fallback_response.is_empty() => Err(
                AgentError::hook_validation("after_llm_error recover with empty fallback_response"),
            ),
            Self::Recover { .. } => Ok(()),
        }
    }
}

/// Action for [`AgentHooks::before_gadget_execution`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum BeforeGadgetAction {
    /// Execute the gadget.
    Proceed,
    /// Do not execute; record the synthetic text as the gadget's result.
    Skip {
        /// The synthetic result.
        synthetic_result: String,
    },
}

impl BeforeGadgetAction {
    pub(crate) fn validate(&self) -> Result<(), AgentError> {
        match self {
            Self::Proceed => Ok(()),
            Self::Skip { synthetic_result } if synthetic_result.is_empty() => Err(
                AgentError::hook_validation(
                    "before_gadget_execution skip with empty synthetic_result",
                ),
            ),
            Self::Skip { .. } => Ok(()),
        }
    }
}

/// Action for [`AgentHooks::after_gadget_execution`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AfterGadgetAction {
    /// Keep the result as-is.
    Continue,
    /// Replace a failed result with recovered text; the model sees a
    /// success. The tree keeps the raw failure record.
    Recover {
        /// The recovered result text.
        result: String,
    },
}

impl AfterGadgetAction {
    pub(crate) fn validate(&self) -> Result<(), AgentError> {
        match self {
            Self::Continue => Ok(()),
            Self::Recover { result } if result.is_empty() => Err(AgentError::hook_validation(
                "after_gadget_execution recover with empty result",
            )),
            Self::Recover { .. } => Ok(()),
        }
    }
}

/// Observer and controller callbacks for the loop. All methods default to
/// the pass-through action.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    /// Runs before each LLM call.
    async fn before_llm_call(&self, _ctx: &LlmRequestContext<'_>) -> BeforeLlmAction {
        BeforeLlmAction::Continue
    }

    /// Runs after each LLM response finalizes.
    async fn after_llm_call(&self, _ctx: &LlmResponseContext<'_>) -> AfterLlmAction {
        AfterLlmAction::Continue
    }

    /// Runs when the provider fails.
    async fn after_llm_error(&self, _ctx: &LlmErrorContext<'_>) -> AfterLlmErrorAction {
        AfterLlmErrorAction::Rethrow
    }

    /// Runs before each gadget executes.
    async fn before_gadget_execution(&self, _call: &ParsedGadgetCall) -> BeforeGadgetAction {
        BeforeGadgetAction::Proceed
    }

    /// Runs after each gadget finishes.
    async fn after_gadget_execution(&self, _result: &GadgetExecutionResult) -> AfterGadgetAction {
        AfterGadgetAction::Continue
    }
}

/// The do-nothing hook set.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

#[async_trait]
impl AgentHooks for NoHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_payloads_fail_validation() {
        assert!(
            BeforeLlmAction::Skip {
                synthetic_response: String::new()
            }
            .validate()
            .is_err()
        );
        assert!(
            AfterLlmAction::AppendMessages { messages: vec![] }
                .validate()
                .is_err()
        );
        assert!(
            AfterLlmErrorAction::Recover {
                fallback_response: String::new()
            }
            .validate()
            .is_err()
        );
        assert!(
            AfterGadgetAction::Recover {
                result: String::new()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn well_formed_actions_pass() {
        assert!(BeforeLlmAction::Continue.validate().is_ok());
        assert!(
            AfterLlmAction::AppendMessages {
                messages: vec![Message::user("go on")]
            }
            .validate()
            .is_ok()
        );
        assert!(
            BeforeGadgetAction::Skip {
                synthetic_result: "cached".into()
            }
            .validate()
            .is_ok()
        );
    }
}
