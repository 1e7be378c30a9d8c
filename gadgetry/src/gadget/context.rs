//! Per-invocation execution context.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::errors::GadgetError;
use super::registry::GadgetRegistry;
use crate::abort::AbortSignal;
use crate::error::AgentError;
use crate::llm::LlmAdapter;
use crate::store::{GadgetOutputStore, MediaStore};
use crate::tree::{ExecutionTree, NodeId};

/// Interactive input provider, shared by the loop's text-only handler and
/// gadgets that ask questions mid-execution.
#[async_trait]
pub trait HumanInput: Send + Sync {
    /// Put a question to the user and return their answer.
    async fn ask(&self, question: &str) -> Result<String, AgentError>;
}

/// Additive cost accumulator. Cloneable handle; clones share the meter.
#[derive(Debug, Clone, Default)]
pub struct CostMeter {
    total: Arc<Mutex<f64>>,
}

impl CostMeter {
    /// Create a zeroed meter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an amount in USD.
    pub fn add(&self, usd: f64) {
        *self.total.lock().unwrap_or_else(PoisonError::into_inner) += usd;
    }

    /// The accumulated total.
    #[must_use]
    pub fn total(&self) -> f64 {
        *self.total.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Factory handles for gadgets that run nested subagents sharing the parent
/// run's execution tree.
#[derive(Clone)]
pub struct HostExports {
    /// The shared execution tree.
    pub tree: ExecutionTree,
    /// The gadget's own node; nested work attaches under it.
    pub parent_node: NodeId,
    /// The LLM adapter of the hosting loop.
    pub adapter: Arc<dyn LlmAdapter>,
    /// The gadget registry of the hosting loop.
    pub registry: Arc<GadgetRegistry>,
}

impl fmt::Debug for HostExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostExports")
            .field("parent_node", &self.parent_node)
            .finish_non_exhaustive()
    }
}

/// Capabilities handed to one gadget invocation.
#[derive(Clone)]
pub struct GadgetContext {
    /// This invocation's id.
    pub invocation_id: String,
    /// Linked abort signal: fires when the run is cancelled or this
    /// gadget's own deadline expires.
    pub abort: AbortSignal,
    /// Outputs of previously completed invocations in this loop.
    pub outputs: GadgetOutputStore,
    /// The loop's media store.
    pub media: MediaStore,
    /// Subagent factory handles, when the loop hosts nesting.
    pub host: Option<HostExports>,
    pub(crate) cost: CostMeter,
    pub(crate) human_input: Option<Arc<dyn HumanInput>>,
}

impl fmt::Debug for GadgetContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GadgetContext")
            .field("invocation_id", &self.invocation_id)
            .field("aborted", &self.abort.aborted())
            .finish_non_exhaustive()
    }
}

impl GadgetContext {
    pub(crate) fn new(
        invocation_id: impl Into<String>,
        abort: AbortSignal,
        outputs: GadgetOutputStore,
        media: MediaStore,
        human_input: Option<Arc<dyn HumanInput>>,
        host: Option<HostExports>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            abort,
            outputs,
            media,
            host,
            cost: CostMeter::new(),
            human_input,
        }
    }

    /// A bare context for unit tests.
    #[must_use]
    pub fn for_tests(invocation_id: impl Into<String>) -> Self {
        Self::new(
            invocation_id,
            AbortSignal::new(),
            GadgetOutputStore::new(),
            MediaStore::new(),
            None,
            None,
        )
    }

    /// Report additional cost in USD for this invocation.
    pub fn report_cost(&self, usd: f64) {
        self.cost.add(usd);
    }

    /// Total cost reported so far.
    #[must_use]
    pub fn reported_cost(&self) -> f64 {
        self.cost.total()
    }

    /// Ask the user a question.
    ///
    /// # Errors
    ///
    /// [`GadgetError::HumanInputRequired`] when no input provider is
    /// configured (the loop surfaces the question instead), or an execution
    /// error when the provider fails.
    pub async fn request_human_input(&self, question: &str) -> Result<String, GadgetError> {
        match &self.human_input {
            Some(provider) => provider
                .ask(question)
                .await
                .map_err(|err| GadgetError::Execution(err.to_string())),
            None => Err(GadgetError::HumanInputRequired {
                question: question.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_meter_accumulates_across_clones() {
        let meter = CostMeter::new();
        let clone = meter.clone();
        meter.add(0.25);
        clone.add(0.5);
        assert!((meter.total() - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn request_without_provider_raises_signalling_error() {
        let ctx = GadgetContext::for_tests("t");
        let err = ctx.request_human_input("proceed?").await.unwrap_err();
        assert!(matches!(err, GadgetError::HumanInputRequired { question } if question == "proceed?"));
    }
}
