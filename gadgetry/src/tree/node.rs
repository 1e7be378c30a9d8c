//! Execution tree node types.
//!
//! Nodes are owned exclusively by the tree; everything else refers to them
//! by [`NodeId`]. A node transitions through its states exactly once and is
//! frozen afterwards.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::usage::Usage;

/// Opaque node identifier, allocated by the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub(crate) u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// Node kind discriminator, used by filtered queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// An LLM call node.
    LlmCall,
    /// A gadget invocation node.
    Gadget,
}

/// Lifecycle state of a gadget node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GadgetState {
    /// Parsed but not yet dispatched.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Never ran: a dependency failed, or a hook or cancellation skipped it.
    Skipped,
}

impl GadgetState {
    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Why a gadget was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency ended in failed or skipped state.
    FailedDependency,
    /// A `before_gadget_execution` hook skipped it.
    Hook,
    /// The run was cancelled before the gadget started.
    Cancelled,
}

/// One LLM call.
#[derive(Debug, Clone, Serialize)]
pub struct LlmCallNode {
    /// Node id.
    pub id: NodeId,
    /// 1-based loop iteration that made the call.
    pub iteration: usize,
    /// Model identifier.
    pub model: String,
    /// Parent node, when nested under a subagent gadget.
    pub parent_id: Option<NodeId>,
    /// Distance from the root (roots have depth 0).
    pub depth: usize,
    /// Root-to-self id chain, ending with this node's id.
    pub path: Vec<NodeId>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// When the response finalized (or was interrupted). Set exactly when
    /// the node becomes terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Accumulated response text.
    pub response_text: String,
    /// Token usage, when the adapter reported it.
    pub usage: Option<Usage>,
    /// Provider finish reason (`"interrupted"` when a consumer tore the
    /// stream down mid-call).
    pub finish_reason: Option<String>,
    /// Cost in USD, when a cost model is configured.
    pub cost: Option<f64>,
    /// Child node ids, in insertion order.
    pub children: Vec<NodeId>,
}

/// One gadget invocation.
#[derive(Debug, Clone, Serialize)]
pub struct GadgetNode {
    /// Node id.
    pub id: NodeId,
    /// The invocation id from the parsed call.
    pub invocation_id: String,
    /// Gadget name.
    pub name: String,
    /// Parsed parameters (`None` when parsing failed).
    pub params: Option<Value>,
    /// Invocation ids this gadget depends on.
    pub dependencies: BTreeSet<String>,
    /// Parent node id.
    pub parent_id: Option<NodeId>,
    /// Distance from the root.
    pub depth: usize,
    /// Root-to-self id chain.
    pub path: Vec<NodeId>,
    /// Lifecycle state.
    pub state: GadgetState,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the node became terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result text on success (or skip notice).
    pub result: Option<String>,
    /// Error text on failure.
    pub error: Option<String>,
    /// Ids of media items produced by the gadget.
    pub media: Vec<String>,
    /// Wall-clock execution time in milliseconds.
    pub execution_ms: Option<u64>,
    /// Cost in USD reported by the gadget.
    pub cost: Option<f64>,
    /// The first failed/skipped dependency, when skipped for that reason.
    pub failed_dependency: Option<String>,
    /// Child node ids, in insertion order.
    pub children: Vec<NodeId>,
}

/// A node in the execution tree.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    /// An LLM call.
    LlmCall(LlmCallNode),
    /// A gadget invocation.
    Gadget(GadgetNode),
}

impl TreeNode {
    /// Node id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        match self {
            Self::LlmCall(node) => node.id,
            Self::Gadget(node) => node.id,
        }
    }

    /// Node kind.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::LlmCall(_) => NodeKind::LlmCall,
            Self::Gadget(_) => NodeKind::Gadget,
        }
    }

    /// Parent node id.
    #[must_use]
    pub fn parent_id(&self) -> Option<NodeId> {
        match self {
            Self::LlmCall(node) => node.parent_id,
            Self::Gadget(node) => node.parent_id,
        }
    }

    /// Distance from the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            Self::LlmCall(node) => node.depth,
            Self::Gadget(node) => node.depth,
        }
    }

    /// Root-to-self id chain.
    #[must_use]
    pub fn path(&self) -> &[NodeId] {
        match self {
            Self::LlmCall(node) => &node.path,
            Self::Gadget(node) => &node.path,
        }
    }

    /// Child ids in insertion order.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        match self {
            Self::LlmCall(node) => &node.children,
            Self::Gadget(node) => &node.children,
        }
    }

    /// Node cost in USD, if recorded.
    #[must_use]
    pub fn cost(&self) -> Option<f64> {
        match self {
            Self::LlmCall(node) => node.cost,
            Self::Gadget(node) => node.cost,
        }
    }

    /// Whether the node has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::LlmCall(node) => node.completed_at.is_some(),
            Self::Gadget(node) => node.state.is_terminal(),
        }
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<NodeId> {
        match self {
            Self::LlmCall(node) => &mut node.children,
            Self::Gadget(node) => &mut node.children,
        }
    }

    /// The LLM call node, if this is one.
    #[must_use]
    pub fn as_llm_call(&self) -> Option<&LlmCallNode> {
        match self {
            Self::LlmCall(node) => Some(node),
            Self::Gadget(_) => None,
        }
    }

    /// The gadget node, if this is one.
    #[must_use]
    pub fn as_gadget(&self) -> Option<&GadgetNode> {
        match self {
            Self::LlmCall(_) => None,
            Self::Gadget(node) => Some(node),
        }
    }
}

/// Per-kind node counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCount {
    /// Number of LLM call nodes.
    pub llm_calls: usize,
    /// Number of gadget nodes.
    pub gadgets: usize,
}
