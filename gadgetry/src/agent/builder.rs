//! Agent construction.

use std::sync::Arc;

use super::config::{AgentConfig, TextOnlyHandler};
use super::hooks::{AgentHooks, NoHooks};
use super::{AbortInfo, Agent, Compactor, CostModel, ErrorHandler, InputQueue, OnAbort};
use crate::abort::AbortSignal;
use crate::error::{AgentError, Result};
use crate::gadget::{Gadget, GadgetDyn, GadgetExecutionResult, GadgetRegistry, HumanInput};
use crate::llm::LlmAdapter;
use crate::message::Message;
use crate::parser::MarkerConfig;
use crate::store::{GadgetOutputStore, MediaStore};
use crate::tree::{ExecutionTree, NodeId};
use crate::usage::{TokenTotals, Usage};

/// Builder for [`Agent`].
pub struct AgentBuilder {
    adapter: Option<Arc<dyn LlmAdapter>>,
    registry: GadgetRegistry,
    model: Option<String>,
    system_prompt: Option<String>,
    max_iterations: usize,
    default_gadget_timeout_ms: Option<u64>,
    stop_on_gadget_error: bool,
    text_only_handler: TextOnlyHandler,
    markers: MarkerConfig,
    temperature: Option<f64>,
    top_p: Option<f64>,
    stop_sequences: Vec<String>,
    hooks: Arc<dyn AgentHooks>,
    human_input: Option<Arc<dyn HumanInput>>,
    compactor: Option<Arc<dyn Compactor>>,
    cost_model: Option<CostModel>,
    error_handler: Option<ErrorHandler>,
    on_abort: Option<OnAbort>,
    abort: Option<AbortSignal>,
    tree: Option<ExecutionTree>,
    parent_node: Option<NodeId>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("model", &self.model)
            .field("gadgets", &self.registry.list_names())
            .finish_non_exhaustive()
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    /// Create a builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapter: None,
            registry: GadgetRegistry::new(),
            model: None,
            system_prompt: None,
            max_iterations: AgentConfig::DEFAULT_MAX_ITERATIONS,
            default_gadget_timeout_ms: None,
            stop_on_gadget_error: true,
            text_only_handler: TextOnlyHandler::default(),
            markers: MarkerConfig::default(),
            temperature: None,
            top_p: None,
            stop_sequences: Vec::new(),
            hooks: Arc::new(NoHooks),
            human_input: None,
            compactor: None,
            cost_model: None,
            error_handler: None,
            on_abort: None,
            abort: None,
            tree: None,
            parent_node: None,
        }
    }

    /// The LLM adapter.
    #[must_use]
    pub fn adapter(mut self, adapter: impl LlmAdapter + 'static) -> Self {
        self.adapter = Some(Arc::new(adapter));
        self
    }

    /// The LLM adapter, already shared.
    #[must_use]
    pub fn adapter_arc(mut self, adapter: Arc<dyn LlmAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// The model identifier.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Seed the conversation with a system prompt.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Register a gadget.
    #[must_use]
    pub fn gadget(mut self, gadget: impl Gadget) -> Self {
        self.registry.register(gadget);
        self
    }

    /// Register a dynamically dispatched gadget.
    #[must_use]
    pub fn gadget_dyn(mut self, gadget: Arc<dyn GadgetDyn>) -> Self {
        self.registry.register_dyn(gadget);
        self
    }

    /// Replace the whole registry.
    #[must_use]
    pub fn registry(mut self, registry: GadgetRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Iteration cap (default 15).
    #[must_use]
    pub fn max_iterations(mut self, cap: usize) -> Self {
        self.max_iterations = cap;
        self
    }

    /// Default per-gadget timeout in milliseconds.
    #[must_use]
    pub fn default_gadget_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_gadget_timeout_ms = Some(timeout_ms);
        self
    }

    /// Whether a gadget error ends the run (default true).
    #[must_use]
    pub fn stop_on_gadget_error(mut self, stop: bool) -> Self {
        self.stop_on_gadget_error = stop;
        self
    }

    /// Policy for text-only iterations.
    #[must_use]
    pub fn text_only_handler(mut self, handler: TextOnlyHandler) -> Self {
        self.text_only_handler = handler;
        self
    }

    /// Marker literals.
    #[must_use]
    pub fn markers(mut self, markers: MarkerConfig) -> Self {
        self.markers = markers;
        self
    }

    /// Sampling temperature.
    #[must_use]
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Nucleus sampling parameter.
    #[must_use]
    pub fn top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Add a stop sequence.
    #[must_use]
    pub fn stop_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.stop_sequences.push(sequence.into());
        self
    }

    /// Loop hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: impl AgentHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Interactive input provider.
    #[must_use]
    pub fn human_input(mut self, provider: impl HumanInput + 'static) -> Self {
        self.human_input = Some(Arc::new(provider));
        self
    }

    /// History compaction collaborator.
    #[must_use]
    pub fn compactor(mut self, compactor: impl Compactor + 'static) -> Self {
        self.compactor = Some(Arc::new(compactor));
        self
    }

    /// Cost model for LLM calls.
    #[must_use]
    pub fn cost_model(mut self, model: impl Fn(&str, &Usage) -> f64 + Send + Sync + 'static) -> Self {
        self.cost_model = Some(Arc::new(model));
        self
    }

    /// Per-error override of `stop_on_gadget_error`.
    #[must_use]
    pub fn error_handler(
        mut self,
        handler: impl Fn(&GadgetExecutionResult) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Callback fired once when a run ends through the abort signal.
    #[must_use]
    pub fn on_abort(mut self, callback: impl Fn(&AbortInfo) + Send + Sync + 'static) -> Self {
        self.on_abort = Some(Arc::new(callback));
        self
    }

    /// Use an external abort signal as the loop root.
    #[must_use]
    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    /// Attach to an existing execution tree (subagent nesting).
    #[must_use]
    pub fn tree(mut self, tree: ExecutionTree) -> Self {
        self.tree = Some(tree);
        self
    }

    /// Parent node for this loop's nodes (subagent nesting).
    #[must_use]
    pub fn parent_node(mut self, node: NodeId) -> Self {
        self.parent_node = Some(node);
        self
    }

    /// Build the agent.
    ///
    /// # Errors
    ///
    /// [`AgentError::Configuration`] when the adapter or model is missing.
    pub fn build(self) -> Result<Agent> {
        let adapter = self
            .adapter
            .ok_or_else(|| AgentError::configuration("an LLM adapter is required"))?;
        let model = self
            .model
            .filter(|m| !m.is_empty())
            .ok_or_else(|| AgentError::configuration("a model identifier is required"))?;

        let mut config = AgentConfig::new(model);
        config.max_iterations = self.max_iterations;
        config.default_gadget_timeout_ms = self.default_gadget_timeout_ms;
        config.stop_on_gadget_error = self.stop_on_gadget_error;
        config.text_only_handler = self.text_only_handler;
        config.markers = self.markers;
        config.temperature = self.temperature;
        config.top_p = self.top_p;
        config.stop_sequences = self.stop_sequences;

        let history = self
            .system_prompt
            .map(|prompt| vec![Message::system(prompt)])
            .unwrap_or_default();

        Ok(Agent {
            adapter,
            registry: Arc::new(self.registry),
            config,
            hooks: self.hooks,
            human_input: self.human_input,
            compactor: self.compactor,
            cost_model: self.cost_model,
            error_handler: self.error_handler,
            on_abort: self.on_abort,
            abort: self.abort.unwrap_or_default(),
            injected: InputQueue::default(),
            tree: self.tree.unwrap_or_default(),
            parent_node: self.parent_node,
            history,
            outputs: GadgetOutputStore::new(),
            media: MediaStore::new(),
            iteration: 0,
            run_tokens: TokenTotals::default(),
            run_cost: 0.0,
            outcome: None,
            abort_fired: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockAdapter;

    #[test]
    fn build_requires_adapter_and_model() {
        assert!(AgentBuilder::new().build().is_err());
        assert!(
            AgentBuilder::new()
                .adapter(MockAdapter::new(vec![]))
                .build()
                .is_err()
        );
        assert!(
            AgentBuilder::new()
                .adapter(MockAdapter::new(vec![]))
                .model("mock")
                .build()
                .is_ok()
        );
    }

    #[test]
    fn system_prompt_seeds_history() {
        let agent = AgentBuilder::new()
            .adapter(MockAdapter::new(vec![]))
            .model("mock")
            .system_prompt("be terse")
            .build()
            .unwrap();
        assert_eq!(agent.history().len(), 1);
        assert_eq!(agent.history()[0].content, "be terse");
    }
}
