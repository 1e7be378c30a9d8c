//! Mock adapter for testing.
//!
//! Returns scripted turns in sequence and records every request, so tests
//! can drive the loop without a provider. Chunk size is configurable to
//! exercise chunk-boundary behavior downstream.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;

use super::{DeltaStream, LlmAdapter, ModelLimits, StreamDelta, StreamRequest};
use crate::error::AgentError;
use crate::message::Message;
use crate::usage::Usage;

/// One scripted model turn.
#[derive(Debug, Clone)]
pub struct MockTurn {
    /// Text chunks to stream, in order.
    pub chunks: Vec<String>,
    /// Usage reported on the final delta.
    pub usage: Option<Usage>,
    /// Finish reason reported on the final delta.
    pub finish_reason: Option<String>,
    /// When set, the stream yields this provider error instead of text.
    pub error: Option<String>,
}

impl MockTurn {
    /// A turn streaming the given text in one chunk, with token usage and a
    /// `stop` finish reason.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            chunks: vec![content.into()],
            usage: Some(Usage::new(10, 5)),
            finish_reason: Some("stop".to_string()),
            error: None,
        }
    }

    /// A turn that fails with a provider error.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            chunks: Vec::new(),
            usage: None,
            finish_reason: None,
            error: Some(message.into()),
        }
    }

    /// Re-split the turn's text into chunks of at most `size` bytes
    /// (respecting char boundaries).
    #[must_use]
    pub fn chunked(mut self, size: usize) -> Self {
        let text: String = self.chunks.concat();
        let mut chunks = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            current.push(ch);
            if current.len() >= size {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        self.chunks = chunks;
        self
    }

    /// Override the reported usage.
    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// A scripted mock adapter.
#[derive(Debug, Default)]
pub struct MockAdapter {
    turns: Mutex<Vec<MockTurn>>,
    requests: Mutex<Vec<StreamRequest>>,
    limits: HashMap<String, ModelLimits>,
}

impl MockAdapter {
    /// Create an adapter with scripted turns, served in order.
    #[must_use]
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns),
            requests: Mutex::new(Vec::new()),
            limits: HashMap::new(),
        }
    }

    /// Register static limits for a model id.
    #[must_use]
    pub fn with_limits(mut self, model: impl Into<String>, limits: ModelLimits) -> Self {
        self.limits.insert(model.into(), limits);
        self
    }

    /// Every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Number of requests received so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmAdapter for MockAdapter {
    async fn stream(&self, request: StreamRequest) -> Result<DeltaStream, AgentError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let turn = self
            .turns
            .lock()
            .ok()
            .and_then(|mut turns| (!turns.is_empty()).then(|| turns.remove(0)));
        let Some(turn) = turn else {
            return Err(AgentError::provider("mock adapter: no scripted turns left", false));
        };

        if let Some(message) = turn.error {
            let deltas = vec![Err(AgentError::provider(message, true))];
            return Ok(futures::stream::iter(deltas).boxed());
        }

        let mut deltas: Vec<Result<StreamDelta, AgentError>> =
            turn.chunks.into_iter().map(|c| Ok(StreamDelta::text(c))).collect();
        deltas.push(Ok(StreamDelta {
            usage: turn.usage,
            finish_reason: turn.finish_reason,
            ..StreamDelta::default()
        }));
        Ok(futures::stream::iter(deltas).boxed())
    }

    fn get_model_limits(&self, model: &str) -> Option<ModelLimits> {
        self.limits.get(model).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn turns_are_served_in_order_then_exhausted() {
        let adapter = MockAdapter::new(vec![MockTurn::text("first"), MockTurn::text("second")]);
        let request = StreamRequest {
            model: "mock".into(),
            messages: vec![Message::user("hi")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop_sequences: Vec::new(),
            signal: None,
        };

        for expected in ["first", "second"] {
            let mut stream = adapter.stream(request.clone()).await.unwrap();
            let mut text = String::new();
            while let Some(delta) = stream.next().await {
                if let Some(chunk) = delta.unwrap().text {
                    text.push_str(&chunk);
                }
            }
            assert_eq!(text, expected);
        }

        assert!(adapter.stream(request).await.is_err());
        assert_eq!(adapter.request_count(), 3);
    }

    #[tokio::test]
    async fn chunked_splits_preserve_content() {
        let turn = MockTurn::text("hello world").chunked(3);
        assert!(turn.chunks.len() > 1);
        assert_eq!(turn.chunks.concat(), "hello world");
    }
}
