//! The agent loop.
//!
//! An [`Agent`] drives an LLM through iterations: build messages → stream
//! the response → parse gadget invocations out of it → dispatch them in
//! dependency waves → append results → repeat, until a gadget breaks the
//! loop, the model stops calling gadgets, the iteration cap is hit, or the
//! abort signal fires.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut agent = Agent::builder()
//!     .adapter(my_adapter)
//!     .model("anthropic:claude-sonnet")
//!     .system_prompt("You can call gadgets with !!!GADGET_START markers.")
//!     .gadget(EditFile::new(fs))
//!     .build()?;
//!
//! agent.inject_user_message("Rename foo to bar in main.rs");
//! let result = agent.run().await;
//! ```

mod builder;
mod config;
mod dispatch;
mod events;
mod history;
mod hooks;
mod streaming;

pub use builder::AgentBuilder;
pub use config::{AgentConfig, TextOnlyAction, TextOnlyHandler};
pub use events::{LoopEvent, LoopItem, RunResult, RunState};
pub use hooks::{
    AfterGadgetAction, AfterLlmAction, AfterLlmErrorAction, AgentHooks, BeforeGadgetAction,
    BeforeLlmAction, LlmErrorContext, LlmRequestContext, LlmResponseContext, NoHooks,
};

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::{Stream, StreamExt, pin_mut};
use tracing::info;

use crate::abort::AbortSignal;
use crate::gadget::{GadgetExecutionResult, GadgetRegistry, HumanInput};
use crate::llm::{LlmAdapter, resolve_model_limits};
use crate::message::Message;
use crate::store::{GadgetOutputStore, MediaStore};
use crate::tree::{ExecutionTree, NodeId};
use crate::usage::{TokenTotals, Usage};

use events::RunOutcome;

/// History compaction collaborator. The heuristic lives outside the core;
/// the loop only consults it when the token estimate exceeds the model's
/// context window and swaps in whatever history it returns.
pub trait Compactor: Send + Sync {
    /// Produce a replacement history, or `None` to leave it untouched.
    fn compact(&self, history: &[Message]) -> Option<Vec<Message>>;
}

/// Computes LLM call cost in USD from the model id and reported usage.
pub type CostModel = Arc<dyn Fn(&str, &Usage) -> f64 + Send + Sync>;

/// Per-error override of `stop_on_gadget_error`; returns whether to stop.
pub type ErrorHandler = Arc<dyn Fn(&GadgetExecutionResult) -> bool + Send + Sync>;

/// Context passed to the abort callback.
#[derive(Debug, Clone)]
pub struct AbortInfo {
    /// Iteration at which the abort was observed (0 before the first).
    pub iteration: usize,
    /// The abort reason.
    pub reason: String,
}

/// Callback fired exactly once when a run ends through the abort signal.
pub type OnAbort = Arc<dyn Fn(&AbortInfo) + Send + Sync>;

/// Queue of user messages to merge into the conversation at the next
/// iteration boundary. Cloneable handle; clones share the queue.
#[derive(Debug, Clone, Default)]
pub struct InputQueue {
    inner: Arc<Mutex<VecDeque<Message>>>,
}

impl InputQueue {
    /// Enqueue a message.
    pub fn push(&self, message: Message) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
    }

    pub(crate) fn drain(&self) -> Vec<Message> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

/// The agent loop orchestrator.
pub struct Agent {
    pub(crate) adapter: Arc<dyn LlmAdapter>,
    pub(crate) registry: Arc<GadgetRegistry>,
    pub(crate) config: AgentConfig,
    pub(crate) hooks: Arc<dyn AgentHooks>,
    pub(crate) human_input: Option<Arc<dyn HumanInput>>,
    pub(crate) compactor: Option<Arc<dyn Compactor>>,
    pub(crate) cost_model: Option<CostModel>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) on_abort: Option<OnAbort>,
    pub(crate) abort: AbortSignal,
    pub(crate) injected: InputQueue,
    pub(crate) tree: ExecutionTree,
    pub(crate) parent_node: Option<NodeId>,
    pub(crate) history: Vec<Message>,
    pub(crate) outputs: GadgetOutputStore,
    pub(crate) media: MediaStore,
    pub(crate) iteration: usize,
    pub(crate) run_tokens: TokenTotals,
    pub(crate) run_cost: f64,
    pub(crate) outcome: Option<RunOutcome>,
    pub(crate) abort_fired: bool,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.config.model)
            .field("iteration", &self.iteration)
            .field("gadgets", &self.registry.list_names())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Run the loop to completion, returning the aggregate result.
    pub async fn run(&mut self) -> RunResult {
        {
            let stream = self.stream_execution();
            pin_mut!(stream);
            while stream.next().await.is_some() {}
        }
        self.run_result()
    }

    /// Run the loop, yielding events as they occur. The aggregate result is
    /// available through [`Agent::run_result`] once the stream is drained.
    pub fn stream(&mut self) -> impl Stream<Item = LoopItem> + '_ {
        self.stream_execution()
    }

    /// The result of the last (or current) run.
    #[must_use]
    pub fn run_result(&self) -> RunResult {
        let outcome = self.outcome.clone().unwrap_or_else(|| RunOutcome {
            state: RunState::Failed,
            final_text: String::new(),
            error: Some("run did not complete".to_string()),
        });
        RunResult {
            state: outcome.state,
            final_text: outcome.final_text,
            iterations: self.iteration,
            tokens: self.run_tokens,
            cost: self.run_cost,
            error: outcome.error,
        }
    }

    /// Enqueue a user message; it merges into the conversation at the next
    /// iteration boundary.
    pub fn inject_user_message(&self, content: impl Into<String>) {
        self.injected.push(Message::user(content));
    }

    /// A cloneable handle to the injection queue, for use while the loop
    /// runs.
    #[must_use]
    pub fn input_queue(&self) -> InputQueue {
        self.injected.clone()
    }

    /// The loop's root abort signal.
    #[must_use]
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// The execution tree.
    #[must_use]
    pub fn tree(&self) -> ExecutionTree {
        self.tree.clone()
    }

    /// The conversation so far.
    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The current iteration (0 before the first).
    #[must_use]
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub(crate) fn prepare_run(&mut self) {
        self.iteration = 0;
        self.outcome = None;
        self.abort_fired = false;
        self.run_tokens = TokenTotals::default();
        self.run_cost = 0.0;
    }

    pub(crate) fn finish_run(&mut self, outcome: RunOutcome) {
        self.outcome = Some(outcome);
        // Loop-owned stores never outlive the run.
        self.outputs.clear();
        self.media.clear();
        self.tree.finish_in_flight_interrupted();
    }

    pub(crate) fn fire_on_abort(&mut self, reason: &str) {
        if self.abort_fired {
            return;
        }
        self.abort_fired = true;
        info!(iteration = self.iteration, reason, "agent run aborted");
        if let Some(callback) = &self.on_abort {
            callback(&AbortInfo {
                iteration: self.iteration,
                reason: reason.to_string(),
            });
        }
    }

    pub(crate) fn maybe_compact(&mut self) -> Option<LoopEvent> {
        let compactor = self.compactor.as_ref()?;
        let limits = resolve_model_limits(self.adapter.as_ref(), &self.config.model)?;
        let window = limits.context_window?;
        let estimate = self.adapter.count_tokens(&self.history, &self.config.model);
        if estimate <= window {
            return None;
        }
        let replacement = compactor.compact(&self.history)?;
        let before = self.history.len();
        let after = replacement.len();
        info!(before, after, estimate, window, "conversation history compacted");
        self.history = replacement;
        Some(LoopEvent::Compaction { before, after })
    }
}
