//! Hierarchical record of LLM calls and gadget invocations.
//!
//! The tree exclusively owns its nodes; every other component holds plain
//! [`NodeId`]s. Mutations happen on the loop's task; observers read through
//! queries or subscribe to the event bus. Subtree aggregates are computed
//! from descendants on demand and never stored denormalized.

mod events;
mod node;

pub use events::{EventKind, EventPayload, EventStream, ExecutionEvent, SubscriptionId};
pub use node::{
    GadgetNode, GadgetState, LlmCallNode, NodeCount, NodeId, NodeKind, SkipReason, TreeNode,
};

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::parser::ParsedGadgetCall;
use crate::usage::{TokenTotals, Usage};

/// Finish reason recorded when an event-stream consumer tears down while a
/// call is still streaming.
pub const FINISH_INTERRUPTED: &str = "interrupted";

/// Outcome data for finalizing an LLM call.
#[derive(Debug, Clone, Default)]
pub struct LlmCompletion {
    /// Replacement response text (e.g. after a hook modified it). When
    /// `None` the accumulated text stands.
    pub response: Option<String>,
    /// Token usage.
    pub usage: Option<Usage>,
    /// Provider finish reason.
    pub finish_reason: Option<String>,
    /// Cost in USD.
    pub cost: Option<f64>,
}

/// Outcome data for finalizing a gadget.
#[derive(Debug, Clone, Default)]
pub struct GadgetCompletion {
    /// Result text on success.
    pub result: Option<String>,
    /// Error text on failure. `Some` makes the node fail.
    pub error: Option<String>,
    /// Wall-clock execution milliseconds.
    pub execution_ms: u64,
    /// Media item ids produced by the gadget.
    pub media: Vec<String>,
    /// Cost in USD.
    pub cost: Option<f64>,
}

type Handler = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Handler {
        kind: Option<EventKind>,
        handler: Handler,
    },
    Channel(mpsc::UnboundedSender<ExecutionEvent>),
}

struct Subscriber {
    id: u64,
    sink: Sink,
}

#[derive(Default)]
struct TreeInner {
    nodes: HashMap<NodeId, TreeNode>,
    roots: Vec<NodeId>,
    by_invocation: HashMap<String, NodeId>,
    next_node: u64,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    in_flight: BTreeSet<NodeId>,
}

impl TreeInner {
    fn event(&self, id: NodeId, payload: EventPayload) -> Option<ExecutionEvent> {
        let node = self.nodes.get(&id)?;
        Some(ExecutionEvent {
            node_id: id,
            parent_id: node.parent_id(),
            depth: node.depth(),
            path: node.path().to_vec(),
            timestamp: Utc::now(),
            payload,
        })
    }

    fn attach(&mut self, node: TreeNode) -> NodeId {
        let id = node.id();
        match node.parent_id() {
            Some(parent) => {
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.children_mut().push(id);
                } else {
                    warn!(node = %id, parent = %parent, "parent node missing; attaching as root");
                    self.roots.push(id);
                }
            }
            None => self.roots.push(id),
        }
        self.nodes.insert(id, node);
        id
    }

    fn coordinates(&self, parent_id: Option<NodeId>) -> (usize, Vec<NodeId>) {
        parent_id
            .and_then(|pid| self.nodes.get(&pid))
            .map_or((0, Vec::new()), |parent| {
                (parent.depth() + 1, parent.path().to_vec())
            })
    }
}

/// The execution tree. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ExecutionTree {
    inner: Arc<Mutex<TreeInner>>,
}

impl std::fmt::Debug for ExecutionTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ExecutionTree")
            .field("nodes", &inner.nodes.len())
            .field("roots", &inner.roots.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TreeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, event: Option<ExecutionEvent>) {
        let Some(event) = event else { return };
        let sinks: Vec<(u64, Sink)> = {
            let inner = self.lock();
            inner
                .subscribers
                .iter()
                .map(|s| (s.id, s.sink.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, sink) in sinks {
            match sink {
                Sink::Handler { kind, handler } => {
                    if kind.is_none_or(|k| k == event.kind()) {
                        handler(&event);
                    }
                }
                Sink::Channel(sender) => {
                    if sender.send(event.clone()).is_err() {
                        dead.push(id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut inner = self.lock();
            inner.subscribers.retain(|s| !dead.contains(&s.id));
        }
    }

    // -- operations: LLM calls ------------------------------------------------

    /// Record a new LLM call, returning its node id.
    pub fn add_llm_call(
        &self,
        iteration: usize,
        model: impl Into<String>,
        parent_id: Option<NodeId>,
    ) -> NodeId {
        let model = model.into();
        let (id, event) = {
            let mut inner = self.lock();
            let id = NodeId(inner.next_node);
            inner.next_node += 1;
            let (depth, mut path) = inner.coordinates(parent_id);
            path.push(id);
            inner.attach(TreeNode::LlmCall(LlmCallNode {
                id,
                iteration,
                model: model.clone(),
                parent_id,
                depth,
                path,
                started_at: Utc::now(),
                completed_at: None,
                response_text: String::new(),
                usage: None,
                finish_reason: None,
                cost: None,
                children: Vec::new(),
            }));
            inner.in_flight.insert(id);
            let event = inner.event(id, EventPayload::LlmCallStart { iteration, model });
            (id, event)
        };
        self.dispatch(event);
        id
    }

    /// Append streamed response text to an LLM call.
    pub fn append_llm_response(&self, id: NodeId, text: &str) {
        let event = {
            let mut inner = self.lock();
            let payload = match inner.nodes.get_mut(&id) {
                Some(TreeNode::LlmCall(node)) if node.completed_at.is_none() => {
                    node.response_text.push_str(text);
                    Some(EventPayload::LlmCallText {
                        text: text.to_string(),
                    })
                }
                _ => None,
            };
            payload.and_then(|payload| inner.event(id, payload))
        };
        self.dispatch(event);
    }

    /// Finalize an LLM call. A second finalization is a no-op.
    pub fn complete_llm_call(&self, id: NodeId, outcome: LlmCompletion) {
        let event = {
            let mut inner = self.lock();
            inner.in_flight.remove(&id);
            let payload = match inner.nodes.get_mut(&id) {
                Some(TreeNode::LlmCall(node)) if node.completed_at.is_none() => {
                    node.completed_at = Some(Utc::now());
                    if let Some(response) = outcome.response {
                        node.response_text = response;
                    }
                    node.usage = outcome.usage.or(node.usage);
                    node.finish_reason = outcome.finish_reason.clone();
                    node.cost = outcome.cost;
                    Some(EventPayload::LlmCallComplete {
                        finish_reason: outcome.finish_reason,
                        usage: outcome.usage,
                        cost: outcome.cost,
                    })
                }
                _ => None,
            };
            payload.and_then(|payload| inner.event(id, payload))
        };
        self.dispatch(event);
    }

    /// Record an LLM call failure. Partial usage observed before the error
    /// is still recorded.
    pub fn fail_llm_call(&self, id: NodeId, error: &str, retryable: bool, usage: Option<Usage>) {
        let event = {
            let mut inner = self.lock();
            inner.in_flight.remove(&id);
            let payload = match inner.nodes.get_mut(&id) {
                Some(TreeNode::LlmCall(node)) if node.completed_at.is_none() => {
                    node.completed_at = Some(Utc::now());
                    node.finish_reason = Some("error".to_string());
                    node.usage = usage.or(node.usage);
                    Some(EventPayload::LlmCallError {
                        error: error.to_string(),
                        retryable,
                    })
                }
                _ => None,
            };
            payload.and_then(|payload| inner.event(id, payload))
        };
        self.dispatch(event);
    }

    /// Finalize any in-flight LLM calls as interrupted, synthesizing their
    /// completion events. Invoked when an event-stream consumer drops early
    /// and at loop teardown.
    pub fn finish_in_flight_interrupted(&self) {
        let ids: Vec<NodeId> = {
            let inner = self.lock();
            inner.in_flight.iter().copied().collect()
        };
        for id in ids {
            self.complete_llm_call(
                id,
                LlmCompletion {
                    finish_reason: Some(FINISH_INTERRUPTED.to_string()),
                    ..LlmCompletion::default()
                },
            );
        }
    }

    // -- operations: gadgets --------------------------------------------------

    /// Record a parsed gadget invocation in pending state.
    pub fn add_gadget(&self, call: &ParsedGadgetCall, parent_id: Option<NodeId>) -> NodeId {
        let (id, event) = {
            let mut inner = self.lock();
            let id = NodeId(inner.next_node);
            inner.next_node += 1;
            let (depth, mut path) = inner.coordinates(parent_id);
            path.push(id);
            inner.attach(TreeNode::Gadget(GadgetNode {
                id,
                invocation_id: call.invocation_id.clone(),
                name: call.name.clone(),
                params: call.params.clone(),
                dependencies: call.dependencies.clone(),
                parent_id,
                depth,
                path,
                state: GadgetState::Pending,
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
                media: Vec::new(),
                execution_ms: None,
                cost: None,
                failed_dependency: None,
                children: Vec::new(),
            }));
            inner
                .by_invocation
                .insert(call.invocation_id.clone(), id);
            let event = inner.event(
                id,
                EventPayload::GadgetCall {
                    invocation_id: call.invocation_id.clone(),
                    name: call.name.clone(),
                    params: call.params.clone(),
                    dependencies: call.dependencies.clone(),
                },
            );
            (id, event)
        };
        self.dispatch(event);
        id
    }

    /// Transition a pending gadget to running.
    pub fn start_gadget(&self, id: NodeId) {
        let event = {
            let mut inner = self.lock();
            let payload = match inner.nodes.get_mut(&id) {
                Some(TreeNode::Gadget(node)) if node.state == GadgetState::Pending => {
                    node.state = GadgetState::Running;
                    node.started_at = Some(Utc::now());
                    Some(EventPayload::GadgetStart {
                        invocation_id: node.invocation_id.clone(),
                        name: node.name.clone(),
                    })
                }
                _ => None,
            };
            payload.and_then(|payload| inner.event(id, payload))
        };
        self.dispatch(event);
    }

    /// Finalize a gadget as completed (no `error`) or failed (`error` set).
    pub fn complete_gadget(&self, id: NodeId, outcome: GadgetCompletion) {
        let event = {
            let mut inner = self.lock();
            let payload = match inner.nodes.get_mut(&id) {
                Some(TreeNode::Gadget(node)) if !node.state.is_terminal() => {
                    node.completed_at = Some(Utc::now());
                    node.execution_ms = Some(outcome.execution_ms);
                    node.media = outcome.media;
                    node.cost = outcome.cost;
                    match outcome.error {
                        Some(error) => {
                            node.state = GadgetState::Failed;
                            node.error = Some(error.clone());
                            Some(EventPayload::GadgetError {
                                invocation_id: node.invocation_id.clone(),
                                name: node.name.clone(),
                                error,
                                execution_ms: outcome.execution_ms,
                            })
                        }
                        None => {
                            node.state = GadgetState::Completed;
                            node.result = outcome.result.clone();
                            Some(EventPayload::GadgetComplete {
                                invocation_id: node.invocation_id.clone(),
                                name: node.name.clone(),
                                result: outcome.result,
                                execution_ms: outcome.execution_ms,
                                cost: outcome.cost,
                            })
                        }
                    }
                }
                _ => None,
            };
            payload.and_then(|payload| inner.event(id, payload))
        };
        self.dispatch(event);
    }

    /// Transition a gadget directly to skipped.
    pub fn skip_gadget(
        &self,
        id: NodeId,
        failed_dependency: Option<&str>,
        message: impl Into<String>,
        reason: SkipReason,
    ) {
        let message = message.into();
        let event = {
            let mut inner = self.lock();
            let payload = match inner.nodes.get_mut(&id) {
                Some(TreeNode::Gadget(node)) if !node.state.is_terminal() => {
                    node.state = GadgetState::Skipped;
                    node.completed_at = Some(Utc::now());
                    node.result = Some(message.clone());
                    node.failed_dependency = failed_dependency.map(str::to_string);
                    Some(EventPayload::GadgetSkipped {
                        invocation_id: node.invocation_id.clone(),
                        name: node.name.clone(),
                        failed_dependency: failed_dependency.map(str::to_string),
                        message,
                        reason,
                    })
                }
                _ => None,
            };
            payload.and_then(|payload| inner.event(id, payload))
        };
        self.dispatch(event);
    }

    // -- queries --------------------------------------------------------------

    /// The node with the given id, cloned out of the arena.
    #[must_use]
    pub fn get_node(&self, id: NodeId) -> Option<TreeNode> {
        self.lock().nodes.get(&id).cloned()
    }

    /// Root node ids in insertion order.
    #[must_use]
    pub fn get_roots(&self) -> Vec<NodeId> {
        self.lock().roots.clone()
    }

    /// Child nodes in insertion order.
    #[must_use]
    pub fn get_children(&self, id: NodeId) -> Vec<TreeNode> {
        let inner = self.lock();
        inner
            .nodes
            .get(&id)
            .map(|node| {
                node.children()
                    .iter()
                    .filter_map(|child| inner.nodes.get(child).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ancestors of a node, root first, excluding the node itself.
    #[must_use]
    pub fn get_ancestors(&self, id: NodeId) -> Vec<TreeNode> {
        let inner = self.lock();
        let Some(node) = inner.nodes.get(&id) else {
            return Vec::new();
        };
        node.path()[..node.path().len().saturating_sub(1)]
            .iter()
            .filter_map(|ancestor| inner.nodes.get(ancestor).cloned())
            .collect()
    }

    /// All descendants of a node in depth-first insertion order, optionally
    /// filtered by kind.
    #[must_use]
    pub fn get_descendants(&self, id: NodeId, kind: Option<NodeKind>) -> Vec<TreeNode> {
        let inner = self.lock();
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = inner
            .nodes
            .get(&id)
            .map(|n| n.children().iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if let Some(node) = inner.nodes.get(&current) {
                stack.extend(node.children().iter().rev().copied());
                if kind.is_none_or(|k| k == node.kind()) {
                    out.push(node.clone());
                }
            }
        }
        out
    }

    /// The gadget node for an invocation id.
    #[must_use]
    pub fn get_node_by_invocation_id(&self, invocation_id: &str) -> Option<TreeNode> {
        let inner = self.lock();
        inner
            .by_invocation
            .get(invocation_id)
            .and_then(|id| inner.nodes.get(id).cloned())
    }

    /// Sum of node costs over a node and its descendants.
    #[must_use]
    pub fn subtree_cost(&self, id: NodeId) -> f64 {
        let mut total = 0.0;
        self.walk_subtree(id, |node| total += node.cost().unwrap_or(0.0));
        total
    }

    /// Token totals over a node and its descendants.
    #[must_use]
    pub fn subtree_tokens(&self, id: NodeId) -> TokenTotals {
        let mut totals = TokenTotals::default();
        self.walk_subtree(id, |node| {
            if let TreeNode::LlmCall(call) = node
                && let Some(usage) = &call.usage
            {
                totals.absorb(usage);
            }
        });
        totals
    }

    /// Media item ids over a node and its descendants, in tree order.
    #[must_use]
    pub fn subtree_media(&self, id: NodeId) -> Vec<String> {
        let mut media = Vec::new();
        self.walk_subtree(id, |node| {
            if let TreeNode::Gadget(gadget) = node {
                media.extend(gadget.media.iter().cloned());
            }
        });
        media
    }

    /// Whether every node in the subtree is terminal.
    #[must_use]
    pub fn is_subtree_complete(&self, id: NodeId) -> bool {
        let mut complete = true;
        self.walk_subtree(id, |node| complete &= node.is_terminal());
        complete
    }

    /// Total cost over all nodes.
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        let inner = self.lock();
        inner
            .nodes
            .values()
            .map(|node| node.cost().unwrap_or(0.0))
            .sum()
    }

    /// Token totals over all nodes.
    #[must_use]
    pub fn total_tokens(&self) -> TokenTotals {
        let inner = self.lock();
        let mut totals = TokenTotals::default();
        for node in inner.nodes.values() {
            if let TreeNode::LlmCall(call) = node
                && let Some(usage) = &call.usage
            {
                totals.absorb(usage);
            }
        }
        totals
    }

    /// Per-kind node counts.
    #[must_use]
    pub fn node_count(&self) -> NodeCount {
        let inner = self.lock();
        let mut count = NodeCount::default();
        for node in inner.nodes.values() {
            match node.kind() {
                NodeKind::LlmCall => count.llm_calls += 1,
                NodeKind::Gadget => count.gadgets += 1,
            }
        }
        count
    }

    fn walk_subtree(&self, id: NodeId, mut visit: impl FnMut(&TreeNode)) {
        let inner = self.lock();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = inner.nodes.get(&current) {
                stack.extend(node.children().iter().rev().copied());
                visit(node);
            }
        }
    }

    // -- event bus ------------------------------------------------------------

    /// Subscribe a handler to one event kind. Returns the id to pass to
    /// [`ExecutionTree::off`].
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&ExecutionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(Some(kind), Arc::new(handler))
    }

    /// Subscribe a handler to every event kind.
    pub fn on_all(
        &self,
        handler: impl Fn(&ExecutionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(None, Arc::new(handler))
    }

    fn subscribe(&self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let mut inner = self.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push(Subscriber {
            id,
            sink: Sink::Handler { kind, handler },
        });
        SubscriptionId(id)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn off(&self, subscription: SubscriptionId) {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| s.id != subscription.0);
    }

    /// An async stream of every future event. Dropping the stream
    /// unsubscribes and finalizes in-flight LLM calls as interrupted.
    #[must_use]
    pub fn events(&self) -> EventStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = {
            let mut inner = self.lock();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.push(Subscriber {
                id,
                sink: Sink::Channel(sender),
            });
            SubscriptionId(id)
        };
        EventStream {
            receiver,
            tree: self.clone(),
            subscription,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    fn call(invocation_id: &str, deps: &[&str]) -> ParsedGadgetCall {
        ParsedGadgetCall {
            name: "Tool".into(),
            invocation_id: invocation_id.into(),
            params_raw: String::new(),
            params: Some(serde_json::json!({})),
            parse_error: None,
            dependencies: deps.iter().map(|d| (*d).to_string()).collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn parent_child_invariants_hold() {
        let tree = ExecutionTree::new();
        let root = tree.add_llm_call(1, "m", None);
        let child = tree.add_gadget(&call("g1", &[]), Some(root));
        let grandchild = tree.add_llm_call(1, "m", Some(child));

        let node = tree.get_node(grandchild).unwrap();
        assert_eq!(node.depth(), 2);
        assert_eq!(node.path(), &[root, child, grandchild]);

        // Ancestors root-first, and path == ancestors ++ [self].
        let ancestors = tree.get_ancestors(grandchild);
        let mut ids: Vec<NodeId> = ancestors.iter().map(TreeNode::id).collect();
        ids.push(grandchild);
        assert_eq!(ids, node.path());

        let children = tree.get_children(root);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id(), child);
    }

    #[test]
    fn children_keep_insertion_order() {
        let tree = ExecutionTree::new();
        let root = tree.add_llm_call(1, "m", None);
        let a = tree.add_gadget(&call("a", &[]), Some(root));
        let b = tree.add_gadget(&call("b", &[]), Some(root));
        let c = tree.add_gadget(&call("c", &[]), Some(root));
        let ids: Vec<NodeId> = tree.get_children(root).iter().map(TreeNode::id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn subtree_aggregates_sum_descendants() {
        let tree = ExecutionTree::new();
        let root = tree.add_llm_call(1, "m", None);
        let g1 = tree.add_gadget(&call("g1", &[]), Some(root));
        let g2 = tree.add_gadget(&call("g2", &[]), Some(root));
        let nested = tree.add_llm_call(1, "m", Some(g1));

        tree.complete_llm_call(
            root,
            LlmCompletion {
                usage: Some(Usage::new(100, 50).with_cached(10)),
                cost: Some(0.5),
                ..LlmCompletion::default()
            },
        );
        tree.complete_llm_call(
            nested,
            LlmCompletion {
                usage: Some(Usage::new(10, 5)),
                cost: Some(0.1),
                ..LlmCompletion::default()
            },
        );
        tree.start_gadget(g1);
        tree.complete_gadget(
            g1,
            GadgetCompletion {
                result: Some("ok".into()),
                execution_ms: 3,
                cost: Some(0.25),
                media: vec!["media_1".into()],
                ..GadgetCompletion::default()
            },
        );
        tree.start_gadget(g2);
        tree.complete_gadget(
            g2,
            GadgetCompletion {
                result: Some("ok".into()),
                execution_ms: 2,
                ..GadgetCompletion::default()
            },
        );

        assert!((tree.subtree_cost(root) - 0.85).abs() < 1e-9);
        let tokens = tree.subtree_tokens(root);
        assert_eq!(tokens.input, 110);
        assert_eq!(tokens.output, 55);
        assert_eq!(tokens.cached, 10);
        assert_eq!(tree.subtree_media(root), vec!["media_1".to_string()]);
        assert!(tree.is_subtree_complete(root));
        assert!((tree.total_cost() - 0.85).abs() < 1e-9);
        assert_eq!(tree.node_count(), NodeCount { llm_calls: 2, gadgets: 2 });
    }

    #[test]
    fn incomplete_subtree_is_reported() {
        let tree = ExecutionTree::new();
        let root = tree.add_llm_call(1, "m", None);
        let gadget = tree.add_gadget(&call("g", &[]), Some(root));
        tree.complete_llm_call(root, LlmCompletion::default());
        assert!(!tree.is_subtree_complete(root));
        tree.skip_gadget(gadget, None, "skipped", SkipReason::Hook);
        assert!(tree.is_subtree_complete(root));
    }

    #[test]
    fn invocation_id_lookup() {
        let tree = ExecutionTree::new();
        let id = tree.add_gadget(&call("inv-7", &[]), None);
        let node = tree.get_node_by_invocation_id("inv-7").unwrap();
        assert_eq!(node.id(), id);
        assert!(tree.get_node_by_invocation_id("missing").is_none());
    }

    #[test]
    fn skip_records_failed_dependency() {
        let tree = ExecutionTree::new();
        let id = tree.add_gadget(&call("b", &["a"]), None);
        tree.skip_gadget(id, Some("a"), "dependency a failed", SkipReason::FailedDependency);
        let node = tree.get_node(id).unwrap();
        let gadget = node.as_gadget().unwrap();
        assert_eq!(gadget.state, GadgetState::Skipped);
        assert_eq!(gadget.failed_dependency.as_deref(), Some("a"));
        assert!(gadget.completed_at.is_some());
    }

    #[test]
    fn transitions_fire_exactly_once() {
        let tree = ExecutionTree::new();
        let completions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&completions);
        tree.on(EventKind::GadgetComplete, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let id = tree.add_gadget(&call("g", &[]), None);
        tree.start_gadget(id);
        tree.complete_gadget(id, GadgetCompletion { execution_ms: 1, ..GadgetCompletion::default() });
        tree.complete_gadget(id, GadgetCompletion { execution_ms: 9, ..GadgetCompletion::default() });

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        let node = tree.get_node(id).unwrap();
        assert_eq!(node.as_gadget().unwrap().execution_ms, Some(1));
    }

    #[test]
    fn kind_filtered_and_all_subscriptions() {
        let tree = ExecutionTree::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&starts);
        let sub = tree.on(EventKind::GadgetStart, move |event| {
            assert_eq!(event.kind(), EventKind::GadgetStart);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let seen_all = Arc::clone(&all);
        tree.on_all(move |_| {
            seen_all.fetch_add(1, Ordering::SeqCst);
        });

        let id = tree.add_gadget(&call("g", &[]), None);
        tree.start_gadget(id);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        tree.off(sub);
        let id2 = tree.add_gadget(&call("g2", &[]), None);
        tree.start_gadget(id2);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn event_stream_receives_in_transition_order() {
        let tree = ExecutionTree::new();
        let mut stream = tree.events();

        let id = tree.add_gadget(&call("g", &[]), None);
        tree.start_gadget(id);
        tree.complete_gadget(id, GadgetCompletion { execution_ms: 1, ..GadgetCompletion::default() });

        let kinds = [
            stream.next().await.unwrap().kind(),
            stream.next().await.unwrap().kind(),
            stream.next().await.unwrap().kind(),
        ];
        assert_eq!(
            kinds,
            [EventKind::GadgetCall, EventKind::GadgetStart, EventKind::GadgetComplete]
        );
    }

    #[tokio::test]
    async fn dropping_event_stream_interrupts_in_flight_calls() {
        let tree = ExecutionTree::new();
        let stream = tree.events();

        let id = tree.add_llm_call(1, "m", None);
        tree.append_llm_response(id, "partial");
        drop(stream);

        let node = tree.get_node(id).unwrap();
        let llm = node.as_llm_call().unwrap();
        assert!(llm.completed_at.is_some());
        assert_eq!(llm.finish_reason.as_deref(), Some(FINISH_INTERRUPTED));
        assert_eq!(llm.response_text, "partial");

        // A later normal completion must not overwrite the teardown record.
        tree.complete_llm_call(
            id,
            LlmCompletion { finish_reason: Some("stop".into()), ..LlmCompletion::default() },
        );
        let node = tree.get_node(id).unwrap();
        assert_eq!(node.as_llm_call().unwrap().finish_reason.as_deref(), Some(FINISH_INTERRUPTED));
    }
}
