//! Convenient re-exports for embedding applications.

pub use crate::abort::AbortSignal;
pub use crate::agent::{
    Agent, AgentBuilder, AgentConfig, AgentHooks, Compactor, LoopEvent, LoopItem, NoHooks,
    RunResult, RunState, TextOnlyAction, TextOnlyHandler,
};
pub use crate::error::{AgentError, Result};
pub use crate::gadget::{
    Gadget, GadgetContext, GadgetError, GadgetExecutionResult, GadgetOutput, GadgetRegistry,
    HumanInput,
};
pub use crate::llm::{LlmAdapter, ModelLimits, StreamDelta, StreamRequest};
pub use crate::message::{Message, Role};
pub use crate::parser::{MarkerConfig, ParsedGadgetCall, ParserEvent, StreamParser};
pub use crate::tree::{EventKind, ExecutionEvent, ExecutionTree, GadgetState, TreeNode};
pub use crate::usage::Usage;
