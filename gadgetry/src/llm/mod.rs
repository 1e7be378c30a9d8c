//! The LLM adapter boundary.
//!
//! Provider wire protocols live outside the core: an adapter is an opaque
//! supplier of `(text chunk, optional usage, optional finish reason)` deltas.
//! The core never inspects `raw`.

pub mod mock;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::abort::AbortSignal;
use crate::error::AgentError;
use crate::message::Message;
use crate::usage::Usage;

/// Options for one streamed completion.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Model identifier, possibly provider-prefixed (`provider:model`).
    pub model: String,
    /// The conversation to send.
    pub messages: Vec<Message>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Nucleus sampling parameter.
    pub top_p: Option<f64>,
    /// Output token cap, usually resolved from [`ModelLimits`].
    pub max_tokens: Option<u64>,
    /// Stop sequences.
    pub stop_sequences: Vec<String>,
    /// Cancellation signal; adapters should end the stream promptly when it
    /// fires.
    pub signal: Option<AbortSignal>,
}

/// One streamed delta from the adapter.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    /// Text fragment, if any.
    pub text: Option<String>,
    /// Usage totals, typically on the final delta.
    pub usage: Option<Usage>,
    /// Finish reason, on the final delta.
    pub finish_reason: Option<String>,
    /// Provider-specific payload, opaque to the core.
    pub raw: Option<Value>,
}

impl StreamDelta {
    /// A plain text delta.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: Some(content.into()),
            ..Self::default()
        }
    }
}

/// Static limits for a model.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelLimits {
    /// Context window size in tokens.
    pub context_window: Option<u64>,
    /// Maximum output tokens per call.
    pub max_output_tokens: Option<u64>,
}

/// Boxed delta stream returned by [`LlmAdapter::stream`].
pub type DeltaStream = BoxStream<'static, Result<StreamDelta, AgentError>>;

/// A provider adapter. Implementations shape provider payloads; the core
/// consumes only the delta stream.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Open a streamed completion.
    async fn stream(&self, request: StreamRequest) -> Result<DeltaStream, AgentError>;

    /// Token count estimate for a conversation. The default is the
    /// character-count fallback `ceil(total_chars / 4)`.
    fn count_tokens(&self, messages: &[Message], _model: &str) -> u64 {
        let chars: usize = messages.iter().map(Message::char_count).sum();
        (chars as u64).div_ceil(4)
    }

    /// Static limits for a model id, if known. Callers apply the
    /// provider-prefix fallback through [`resolve_model_limits`].
    fn get_model_limits(&self, _model: &str) -> Option<ModelLimits> {
        None
    }
}

/// Model-limit lookup with provider-prefix fallback: try the exact id, then
/// the id with its `provider:` prefix stripped. `None` means unlimited.
#[must_use]
pub fn resolve_model_limits(adapter: &dyn LlmAdapter, model: &str) -> Option<ModelLimits> {
    adapter.get_model_limits(model).or_else(|| {
        model
            .split_once(':')
            .and_then(|(_, bare)| adapter.get_model_limits(bare))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct LimitsOnly(HashMap<String, ModelLimits>);

    #[async_trait]
    impl LlmAdapter for LimitsOnly {
        async fn stream(&self, _request: StreamRequest) -> Result<DeltaStream, AgentError> {
            Err(AgentError::provider("not implemented", false))
        }

        fn get_model_limits(&self, model: &str) -> Option<ModelLimits> {
            self.0.get(model).copied()
        }
    }

    #[test]
    fn provider_prefix_fallback() {
        let mut limits = HashMap::new();
        limits.insert(
            "sonnet".to_string(),
            ModelLimits {
                context_window: Some(200_000),
                max_output_tokens: Some(8192),
            },
        );
        let adapter = LimitsOnly(limits);

        let resolved = resolve_model_limits(&adapter, "anthropic:sonnet").unwrap();
        assert_eq!(resolved.max_output_tokens, Some(8192));
        assert!(resolve_model_limits(&adapter, "anthropic:unknown").is_none());
    }

    #[test]
    fn default_token_estimate_is_char_quarter() {
        let adapter = LimitsOnly(HashMap::new());
        let messages = vec![Message::user("abcdefgh")]; // 8 chars
        assert_eq!(adapter.count_tokens(&messages, "m"), 2);
        let messages = vec![Message::user("abcdefghi")]; // 9 chars
        assert_eq!(adapter.count_tokens(&messages, "m"), 3);
    }
}
