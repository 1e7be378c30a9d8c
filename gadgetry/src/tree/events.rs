//! Tree event bus.
//!
//! Observers subscribe with callbacks ([`crate::tree::ExecutionTree::on`] /
//! [`crate::tree::ExecutionTree::on_all`]) or consume an async stream
//! ([`crate::tree::ExecutionTree::events`]). Events are emitted in the order
//! of the state transitions that produced them.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::ExecutionTree;
use super::node::{NodeId, SkipReason};
use crate::usage::Usage;

/// Event kinds, matching the tree's state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An LLM call node was created.
    LlmCallStart,
    /// Response text was appended to an LLM call.
    LlmCallText,
    /// An LLM call finalized (normally or interrupted).
    LlmCallComplete,
    /// An LLM call failed.
    LlmCallError,
    /// A gadget invocation was recorded.
    GadgetCall,
    /// A gadget started executing.
    GadgetStart,
    /// A gadget completed successfully.
    GadgetComplete,
    /// A gadget failed.
    GadgetError,
    /// A gadget was skipped.
    GadgetSkipped,
}

/// Kind-specific event payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventPayload {
    /// See [`EventKind::LlmCallStart`].
    LlmCallStart {
        /// Loop iteration.
        iteration: usize,
        /// Model identifier.
        model: String,
    },
    /// See [`EventKind::LlmCallText`].
    LlmCallText {
        /// The appended text chunk.
        text: String,
    },
    /// See [`EventKind::LlmCallComplete`].
    LlmCallComplete {
        /// Finish reason, `"interrupted"` for torn-down calls.
        finish_reason: Option<String>,
        /// Usage, when reported.
        usage: Option<Usage>,
        /// Cost, when a cost model is configured.
        cost: Option<f64>,
    },
    /// See [`EventKind::LlmCallError`].
    LlmCallError {
        /// The error message.
        error: String,
        /// Whether the adapter considers it retryable.
        retryable: bool,
    },
    /// See [`EventKind::GadgetCall`].
    GadgetCall {
        /// Invocation id.
        invocation_id: String,
        /// Gadget name.
        name: String,
        /// Parsed params, when parsing succeeded.
        params: Option<Value>,
        /// Harvested dependencies.
        dependencies: BTreeSet<String>,
    },
    /// See [`EventKind::GadgetStart`].
    GadgetStart {
        /// Invocation id.
        invocation_id: String,
        /// Gadget name.
        name: String,
    },
    /// See [`EventKind::GadgetComplete`].
    GadgetComplete {
        /// Invocation id.
        invocation_id: String,
        /// Gadget name.
        name: String,
        /// Result text.
        result: Option<String>,
        /// Execution time in milliseconds.
        execution_ms: u64,
        /// Cost, when reported.
        cost: Option<f64>,
    },
    /// See [`EventKind::GadgetError`].
    GadgetError {
        /// Invocation id.
        invocation_id: String,
        /// Gadget name.
        name: String,
        /// The error message.
        error: String,
        /// Execution time in milliseconds.
        execution_ms: u64,
    },
    /// See [`EventKind::GadgetSkipped`].
    GadgetSkipped {
        /// Invocation id.
        invocation_id: String,
        /// Gadget name.
        name: String,
        /// The first failed/skipped dependency, when applicable.
        failed_dependency: Option<String>,
        /// Human-readable skip notice.
        message: String,
        /// Why the gadget was skipped.
        reason: SkipReason,
    },
}

impl EventPayload {
    /// The event kind this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::LlmCallStart { .. } => EventKind::LlmCallStart,
            Self::LlmCallText { .. } => EventKind::LlmCallText,
            Self::LlmCallComplete { .. } => EventKind::LlmCallComplete,
            Self::LlmCallError { .. } => EventKind::LlmCallError,
            Self::GadgetCall { .. } => EventKind::GadgetCall,
            Self::GadgetStart { .. } => EventKind::GadgetStart,
            Self::GadgetComplete { .. } => EventKind::GadgetComplete,
            Self::GadgetError { .. } => EventKind::GadgetError,
            Self::GadgetSkipped { .. } => EventKind::GadgetSkipped,
        }
    }
}

/// One tree event.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEvent {
    /// The node the event concerns.
    pub node_id: NodeId,
    /// Its parent, if any.
    pub parent_id: Option<NodeId>,
    /// Its depth.
    pub depth: usize,
    /// Its root-to-self path.
    pub path: Vec<NodeId>,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload.
    pub payload: EventPayload,
}

impl ExecutionEvent {
    /// The event kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Handle returned by subscriptions; pass to
/// [`crate::tree::ExecutionTree::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(pub(crate) u64);

/// Async stream of tree events.
///
/// Dropping the stream unsubscribes it. If the stream is dropped while an
/// LLM call is still in flight, the tree finalizes that call as interrupted
/// and synthesizes its completion event, so no consumer ever observes a
/// permanently open call.
pub struct EventStream {
    pub(crate) receiver: mpsc::UnboundedReceiver<ExecutionEvent>,
    pub(crate) tree: ExecutionTree,
    pub(crate) subscription: SubscriptionId,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl Stream for EventStream {
    type Item = ExecutionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.tree.off(self.subscription);
        self.tree.finish_in_flight_interrupted();
    }
}
