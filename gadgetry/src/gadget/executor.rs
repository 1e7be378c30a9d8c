//! Runs one gadget invocation under timeout, abort and cost accounting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use super::context::GadgetContext;
use super::errors::GadgetError;
use super::registry::GadgetRegistry;
use super::result::GadgetExecutionResult;
use super::traits::GadgetOutput;
use crate::abort::{REASON_ABORTED, REASON_TIMEOUT};
use crate::parser::ParsedGadgetCall;
use crate::store::resolve_references;
use crate::tree::{ExecutionTree, GadgetCompletion, GadgetState, NodeId, SkipReason, TreeNode};

/// A question/answer exchange that happened during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HumanExchange {
    /// The question the gadget raised.
    pub question: String,
    /// The user's answer.
    pub answer: String,
}

/// The executor's report for one invocation.
#[derive(Debug, Clone)]
pub struct ExecutedGadget {
    /// The invocation outcome.
    pub result: GadgetExecutionResult,
    /// A human-input exchange the loop must splice into history.
    pub human_input: Option<HumanExchange>,
}

/// Executes single invocations against the registry, recording transitions
/// in the execution tree.
#[derive(Debug, Clone)]
pub struct GadgetExecutor {
    registry: Arc<GadgetRegistry>,
    tree: ExecutionTree,
    default_timeout_ms: Option<u64>,
}

impl GadgetExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(
        registry: Arc<GadgetRegistry>,
        tree: ExecutionTree,
        default_timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            registry,
            tree,
            default_timeout_ms,
        }
    }

    /// Execute one invocation whose node is already recorded in the tree.
    ///
    /// The context's abort signal must be a child of the loop signal; the
    /// per-gadget timeout aborts that child with a timeout reason before the
    /// timeout error is raised, so the gadget can clean up cooperatively.
    pub async fn execute(
        &self,
        call: &ParsedGadgetCall,
        node: NodeId,
        ctx: GadgetContext,
    ) -> ExecutedGadget {
        // Resolution and validation failures surface to the model as gadget
        // results; nothing runs.
        let Some(gadget) = self.registry.get(&call.name) else {
            return self.fail(call, node, None, format!("unknown gadget '{}'", call.name), 0);
        };

        if let Some(parse_error) = &call.parse_error {
            return self.fail(call, node, None, parse_error.clone(), 0);
        }

        let params = call.params.clone().unwrap_or(Value::Null);
        let params = resolve_references(&params, &ctx.outputs);
        let params = match self.registry.validate_params(&call.name, &params) {
            Ok(normalized) => normalized,
            Err(message) => return self.fail(call, node, None, message, 0),
        };

        if let Some(failed) = self.first_failed_dependency(call) {
            let message = format!(
                "skipped: dependency '{failed}' did not complete successfully"
            );
            self.tree
                .skip_gadget(node, Some(&failed), &message, SkipReason::FailedDependency);
            return ExecutedGadget {
                result: GadgetExecutionResult {
                    name: call.name.clone(),
                    invocation_id: call.invocation_id.clone(),
                    params: Some(params),
                    result: None,
                    error: None,
                    execution_ms: 0,
                    breaks_loop: false,
                    cost: None,
                    skipped_due_to_failed_dependency: Some(failed),
                },
                human_input: None,
            };
        }

        if ctx.abort.aborted() {
            let reason = ctx.abort.reason().unwrap_or_else(|| REASON_ABORTED.to_string());
            let message = format!("skipped: run aborted ({reason})");
            self.tree.skip_gadget(node, None, &message, SkipReason::Cancelled);
            return ExecutedGadget {
                result: GadgetExecutionResult {
                    name: call.name.clone(),
                    invocation_id: call.invocation_id.clone(),
                    params: Some(params),
                    result: None,
                    error: None,
                    execution_ms: 0,
                    breaks_loop: false,
                    cost: None,
                    skipped_due_to_failed_dependency: None,
                },
                human_input: None,
            };
        }

        self.tree.start_gadget(node);
        debug!(gadget = %call.name, id = %call.invocation_id, "gadget started");
        let started = Instant::now();
        let timeout_ms = gadget.timeout_ms().or(self.default_timeout_ms);
        let outcome = self
            .run_guarded(gadget.invoke(params.clone(), ctx.clone()), &ctx, timeout_ms)
            .await;
        let execution_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => self.complete(call, node, params, output, &ctx, execution_ms, None),
            Err(GadgetError::TaskComplete { message }) => {
                let output = GadgetOutput::text(message).breaking();
                self.complete(call, node, params, output, &ctx, execution_ms, None)
            }
            Err(GadgetError::HumanInputRequired { question }) => {
                match &ctx.human_input {
                    Some(provider) => match provider.ask(&question).await {
                        Ok(answer) => {
                            let exchange = HumanExchange {
                                question,
                                answer: answer.clone(),
                            };
                            let output = GadgetOutput::text(answer);
                            self.complete(
                                call,
                                node,
                                params,
                                output,
                                &ctx,
                                execution_ms,
                                Some(exchange),
                            )
                        }
                        Err(err) => self.fail(
                            call,
                            node,
                            Some(params),
                            format!("human input failed: {err}"),
                            execution_ms,
                        ),
                    },
                    None => self.fail(
                        call,
                        node,
                        Some(params),
                        format!("human input required: {question}"),
                        execution_ms,
                    ),
                }
            }
            Err(err) => {
                warn!(gadget = %call.name, id = %call.invocation_id, error = %err, "gadget failed");
                self.fail(call, node, Some(params), err.to_string(), execution_ms)
            }
        }
    }

    async fn run_guarded(
        &self,
        fut: impl Future<Output = Result<GadgetOutput, GadgetError>>,
        ctx: &GadgetContext,
        timeout_ms: Option<u64>,
    ) -> Result<GadgetOutput, GadgetError> {
        let abort = ctx.abort.clone();
        let guarded = async move {
            tokio::select! {
                output = fut => output,
                () = abort.cancelled() => Err(GadgetError::Aborted {
                    reason: abort.reason().unwrap_or_else(|| REASON_ABORTED.to_string()),
                }),
            }
        };

        match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), guarded).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Trip the linked signal first so the gadget can clean
                    // up, then surface the typed error.
                    ctx.abort.abort(REASON_TIMEOUT);
                    Err(GadgetError::Timeout { timeout_ms: ms })
                }
            },
            None => guarded.await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete(
        &self,
        call: &ParsedGadgetCall,
        node: NodeId,
        params: Value,
        output: GadgetOutput,
        ctx: &GadgetContext,
        execution_ms: u64,
        human_input: Option<HumanExchange>,
    ) -> ExecutedGadget {
        let reported = ctx.reported_cost();
        let cost = match (reported > 0.0, output.cost) {
            (false, None) => None,
            (_, direct) => Some(reported + direct.unwrap_or(0.0)),
        };

        let media_ids: Vec<String> = output
            .media
            .into_iter()
            .map(|item| ctx.media.store(item.mime, item.data))
            .collect();

        ctx.outputs.record(&call.invocation_id, &output.result);
        self.tree.complete_gadget(
            node,
            GadgetCompletion {
                result: Some(output.result.clone()),
                error: None,
                execution_ms,
                media: media_ids,
                cost,
            },
        );

        ExecutedGadget {
            result: GadgetExecutionResult {
                name: call.name.clone(),
                invocation_id: call.invocation_id.clone(),
                params: Some(params),
                result: Some(output.result),
                error: None,
                execution_ms,
                breaks_loop: output.breaks_loop,
                cost,
                skipped_due_to_failed_dependency: None,
            },
            human_input,
        }
    }

    fn fail(
        &self,
        call: &ParsedGadgetCall,
        node: NodeId,
        params: Option<Value>,
        error: String,
        execution_ms: u64,
    ) -> ExecutedGadget {
        self.tree.complete_gadget(
            node,
            GadgetCompletion {
                error: Some(error.clone()),
                execution_ms,
                ..GadgetCompletion::default()
            },
        );
        ExecutedGadget {
            result: GadgetExecutionResult {
                name: call.name.clone(),
                invocation_id: call.invocation_id.clone(),
                params,
                result: None,
                error: Some(error),
                execution_ms,
                breaks_loop: false,
                cost: None,
                skipped_due_to_failed_dependency: None,
            },
            human_input: None,
        }
    }

    /// The first dependency (in id order) that ended failed or skipped.
    fn first_failed_dependency(&self, call: &ParsedGadgetCall) -> Option<String> {
        for dep in &call.dependencies {
            match self.tree.get_node_by_invocation_id(dep) {
                Some(TreeNode::Gadget(node))
                    if matches!(node.state, GadgetState::Failed | GadgetState::Skipped) =>
                {
                    return Some(dep.clone());
                }
                Some(TreeNode::Gadget(node)) if !node.state.is_terminal() => {
                    warn!(dependency = %dep, "dependency not yet terminal at dispatch; treating as satisfied");
                }
                // Unknown ids can't be ordered against; the gadget's own
                // execution surfaces any real problem.
                _ => {}
            }
        }
        None
    }
}
