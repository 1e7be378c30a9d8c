//! The per-iteration loop, yielding events as they occur.

use async_stream::stream;
use futures::{Stream, StreamExt, future::join_all};
use tracing::{debug, info, warn};

use super::Agent;
use super::config::{TextOnlyAction, TextOnlyHandler};
use super::dispatch::{PlannedCall, build_waves};
use super::events::{LoopEvent, LoopItem, RunOutcome, RunState};
use super::history;
use super::hooks::{
    AfterGadgetAction, AfterLlmAction, AfterLlmErrorAction, BeforeGadgetAction, BeforeLlmAction,
    LlmErrorContext, LlmRequestContext, LlmResponseContext,
};
use crate::abort::REASON_ABORTED;
use crate::error::AgentError;
use crate::gadget::{ExecutedGadget, GadgetContext, GadgetExecutor, HostExports};
use crate::id;
use crate::llm::{StreamRequest, resolve_model_limits};
use crate::message::Message;
use crate::parser::{ParsedGadgetCall, ParserEvent, SchemaSource, StreamParser, deps};
use crate::tree::{LlmCompletion, NodeId, SkipReason};
use crate::usage::Usage;

/// What the LLM phase of one iteration produced.
enum LlmPhase {
    /// A finalized response, ready for dispatch.
    Response,
    /// A hook recovered the failed call with fallback text; the caller
    /// replaces the response and re-parses.
    Recovered(String),
    /// A fatal error; the run ends.
    Fatal(AgentError),
}

impl Agent {
    /// The core loop. One yielded item per stream event, in order.
    pub(crate) fn stream_execution(&mut self) -> impl Stream<Item = LoopItem> + '_ {
        stream! {
            self.prepare_run();
            info!(model = %self.config.model, max_iterations = self.config.max_iterations,
                  "starting agent run");

            let mut outcome: Option<RunOutcome> = None;
            let mut last_response = String::new();

            'run: while outcome.is_none() {
                // Entry checks, same order as the end-of-iteration pass:
                // iteration cap first, then the abort signal.
                if self.iteration >= self.config.max_iterations {
                    outcome = Some(RunOutcome {
                        state: RunState::MaxIterationsReached,
                        final_text: last_response.clone(),
                        error: None,
                    });
                    break 'run;
                }
                if self.abort.aborted() {
                    let reason = self.abort.reason().unwrap_or_else(|| REASON_ABORTED.to_string());
                    self.fire_on_abort(&reason);
                    outcome = Some(RunOutcome::aborted(reason));
                    break 'run;
                }
                self.iteration += 1;
                let iteration = self.iteration;
                debug!(iteration, "iteration started");

                // Merge externally injected user messages.
                for message in self.injected.drain() {
                    self.history.push(message);
                }

                if let Some(event) = self.maybe_compact() {
                    yield Ok(event);
                }

                // ==== LLM phase ====
                let before = self
                    .hooks
                    .before_llm_call(&LlmRequestContext {
                        iteration,
                        model: &self.config.model,
                        messages: &self.history,
                    })
                    .await;
                if let Err(err) = before.validate() {
                    let message = err.to_string();
                    yield Err(err);
                    outcome = Some(RunOutcome::failed(message));
                    break 'run;
                }

                let llm_node = self.tree.add_llm_call(iteration, &self.config.model, self.parent_node);
                let mut parser = StreamParser::new(self.config.markers.clone())
                    .with_schemas(std::sync::Arc::clone(&self.registry) as std::sync::Arc<dyn SchemaSource>);

                let mut response_text = String::new();
                let mut usage: Option<Usage> = None;
                let mut finish_reason: Option<String> = None;
                let mut planned: Vec<PlannedCall> = Vec::new();

                let phase = match before {
                    BeforeLlmAction::Skip { synthetic_response } => {
                        debug!(iteration, "llm call skipped by hook; using synthetic response");
                        self.tree.append_llm_response(llm_node, &synthetic_response);
                        for event in self.absorb_parser_events(parser.feed(&synthetic_response), llm_node, &mut planned) {
                            yield Ok(event);
                        }
                        for event in self.absorb_parser_events(parser.finalize(), llm_node, &mut planned) {
                            yield Ok(event);
                        }
                        response_text = synthetic_response;
                        finish_reason = Some("hook_skip".to_string());
                        LlmPhase::Response
                    }
                    BeforeLlmAction::Continue => {
                        let limits = resolve_model_limits(self.adapter.as_ref(), &self.config.model);
                        let request = StreamRequest {
                            model: self.config.model.clone(),
                            messages: self.history.clone(),
                            temperature: self.config.temperature,
                            top_p: self.config.top_p,
                            max_tokens: limits.and_then(|l| l.max_output_tokens),
                            stop_sequences: self.config.stop_sequences.clone(),
                            signal: Some(self.abort.clone()),
                        };

                        let mut phase = LlmPhase::Response;
                        let attempt = {
                            let adapter = std::sync::Arc::clone(&self.adapter);
                            adapter.stream(request).await
                        };
                        match attempt {
                            Err(err) => {
                                phase = self.handle_llm_error(err, iteration, llm_node, usage).await;
                            }
                            Ok(mut llm_stream) => {
                                while let Some(delta_result) = llm_stream.next().await {
                                    match delta_result {
                                        Ok(delta) => {
                                            if let Some(text) = &delta.text {
                                                response_text.push_str(text);
                                                self.tree.append_llm_response(llm_node, text);
                                                for event in self.absorb_parser_events(parser.feed(text), llm_node, &mut planned) {
                                                    yield Ok(event);
                                                }
                                            }
                                            if let Some(delta_usage) = delta.usage {
                                                usage = Some(delta_usage);
                                            }
                                            if let Some(reason) = delta.finish_reason {
                                                finish_reason = Some(reason);
                                            }
                                        }
                                        Err(err) => {
                                            phase = self.handle_llm_error(err, iteration, llm_node, usage).await;
                                            break;
                                        }
                                    }
                                }
                                if let LlmPhase::Response = phase {
                                    for event in self.absorb_parser_events(parser.finalize(), llm_node, &mut planned) {
                                        yield Ok(event);
                                    }
                                }
                            }
                        }
                        phase
                    }
                };

                match phase {
                    LlmPhase::Fatal(err) => {
                        let message = err.to_string();
                        yield Err(err);
                        outcome = Some(RunOutcome::failed(message));
                        break 'run;
                    }
                    LlmPhase::Recovered(fallback) => {
                        // Partial stream state is discarded; the fallback is
                        // the response, and it may carry gadget calls of its
                        // own.
                        parser.reset();
                        for (_, node) in planned.drain(..) {
                            self.tree.skip_gadget(node, None, "superseded by llm error recovery", SkipReason::Hook);
                        }
                        self.tree.append_llm_response(llm_node, &fallback);
                        for event in self.absorb_parser_events(parser.feed(&fallback), llm_node, &mut planned) {
                            yield Ok(event);
                        }
                        for event in self.absorb_parser_events(parser.finalize(), llm_node, &mut planned) {
                            yield Ok(event);
                        }
                        response_text = fallback;
                    }
                    LlmPhase::Response => {}
                }

                // ==== post-LLM hook ====
                let after = self
                    .hooks
                    .after_llm_call(&LlmResponseContext {
                        iteration,
                        model: &self.config.model,
                        response_text: &response_text,
                        usage: usage.as_ref(),
                        finish_reason: finish_reason.as_deref(),
                    })
                    .await;
                if let Err(err) = after.validate() {
                    let message = err.to_string();
                    yield Err(err);
                    outcome = Some(RunOutcome::failed(message));
                    break 'run;
                }

                let mut reenter_messages: Option<Vec<Message>> = None;
                match after {
                    AfterLlmAction::Continue => {}
                    AfterLlmAction::AppendMessages { messages } => reenter_messages = Some(messages),
                    AfterLlmAction::ModifyAndContinue { response_text: replacement } => {
                        response_text = replacement;
                    }
                    AfterLlmAction::AppendAndModify { messages, response_text: replacement } => {
                        response_text = replacement;
                        reenter_messages = Some(messages);
                    }
                }

                let cost = match (&self.cost_model, &usage) {
                    (Some(model), Some(call_usage)) => Some(model(&self.config.model, call_usage)),
                    _ => None,
                };
                if let Some(call_usage) = &usage {
                    self.run_tokens.absorb(call_usage);
                }
                self.run_cost += cost.unwrap_or(0.0);
                self.tree.complete_llm_call(
                    llm_node,
                    LlmCompletion {
                        response: Some(response_text.clone()),
                        usage,
                        finish_reason: finish_reason.clone(),
                        cost,
                    },
                );

                if !response_text.is_empty() {
                    self.history.push(Message::assistant(&response_text));
                }
                last_response = response_text.clone();

                if let Some(messages) = reenter_messages {
                    // Re-enter without dispatching: parsed calls are
                    // superseded by the hook's messages.
                    for (_, node) in planned.drain(..) {
                        self.tree.skip_gadget(node, None, "superseded by after_llm_call hook", SkipReason::Hook);
                    }
                    for message in messages {
                        self.history.push(message);
                    }
                    continue 'run;
                }

                // ==== text-only policy ====
                if planned.is_empty() {
                    if response_text.trim().is_empty() {
                        outcome = Some(RunOutcome::completed(last_response.clone()));
                        break 'run;
                    }
                    let action = match &self.config.text_only_handler {
                        TextOnlyHandler::Terminate => TextOnlyAction::Terminate,
                        TextOnlyHandler::Acknowledge => TextOnlyAction::Acknowledge,
                        TextOnlyHandler::WaitForInput => TextOnlyAction::WaitForInput,
                        TextOnlyHandler::Custom(handler) => handler(&response_text),
                    };
                    match action {
                        TextOnlyAction::Terminate => {
                            outcome = Some(RunOutcome::completed(response_text.clone()));
                            break 'run;
                        }
                        TextOnlyAction::Acknowledge => {
                            self.history.push(Message::user("continue"));
                            continue 'run;
                        }
                        TextOnlyAction::WaitForInput => {
                            let Some(provider) = self.human_input.clone() else {
                                warn!("text_only_handler wait_for_input without a human input provider; terminating");
                                outcome = Some(RunOutcome::completed(response_text.clone()));
                                break 'run;
                            };
                            yield Ok(LoopEvent::HumanInputPrompt {
                                invocation_id: None,
                                question: response_text.clone(),
                            });
                            match provider.ask(&response_text).await {
                                Ok(answer) => {
                                    self.history.push(Message::user(answer));
                                    continue 'run;
                                }
                                Err(err) => {
                                    let message = err.to_string();
                                    yield Err(err);
                                    outcome = Some(RunOutcome::failed(message));
                                    break 'run;
                                }
                            }
                        }
                        TextOnlyAction::TriggerGadget { name, params } => {
                            let call = ParsedGadgetCall {
                                name,
                                invocation_id: id::next_invocation_id(),
                                params_raw: params.to_string(),
                                dependencies: deps::harvest(&params),
                                params: Some(params),
                                parse_error: None,
                            };
                            let node = self.tree.add_gadget(&call, Some(llm_node));
                            planned.push((call.clone(), node));
                            yield Ok(LoopEvent::GadgetCall(call));
                        }
                    }
                }

                // ==== gadget dispatch ====
                let executor = GadgetExecutor::new(
                    std::sync::Arc::clone(&self.registry),
                    self.tree.clone(),
                    self.config.default_gadget_timeout_ms,
                );

                let (waves, cycle) = build_waves(&planned);
                let mut results: Vec<(usize, ExecutedGadget)> = Vec::new();

                for index in cycle {
                    let (call, node) = &planned[index];
                    let first_dep = call.dependencies.iter().next().cloned().unwrap_or_default();
                    warn!(id = %call.invocation_id, "dependency cycle; skipping invocation");
                    let message = format!("skipped: dependency cycle involving '{first_dep}'");
                    self.tree.skip_gadget(*node, Some(&first_dep), &message, SkipReason::FailedDependency);
                    results.push((index, ExecutedGadget {
                        result: crate::gadget::GadgetExecutionResult {
                            name: call.name.clone(),
                            invocation_id: call.invocation_id.clone(),
                            params: call.params.clone(),
                            result: None,
                            error: None,
                            execution_ms: 0,
                            breaks_loop: false,
                            cost: None,
                            skipped_due_to_failed_dependency: Some(first_dep),
                        },
                        human_input: None,
                    }));
                }

                let mut breaking: Option<String> = None;
                let mut stop_error: Option<String> = None;
                let mut hook_failure: Option<AgentError> = None;

                'waves: for wave in waves {
                    let mut futures = Vec::new();
                    for index in wave {
                        let (call, node) = &planned[index];
                        let action = self.hooks.before_gadget_execution(call).await;
                        if let Err(err) = action.validate() {
                            hook_failure = Some(err);
                            break 'waves;
                        }
                        match action {
                            BeforeGadgetAction::Skip { synthetic_result } => {
                                self.tree.complete_gadget(*node, crate::tree::GadgetCompletion {
                                    result: Some(synthetic_result.clone()),
                                    ..crate::tree::GadgetCompletion::default()
                                });
                                results.push((index, ExecutedGadget {
                                    result: crate::gadget::GadgetExecutionResult {
                                        name: call.name.clone(),
                                        invocation_id: call.invocation_id.clone(),
                                        params: call.params.clone(),
                                        result: Some(synthetic_result),
                                        error: None,
                                        execution_ms: 0,
                                        breaks_loop: false,
                                        cost: None,
                                        skipped_due_to_failed_dependency: None,
                                    },
                                    human_input: None,
                                }));
                            }
                            BeforeGadgetAction::Proceed => {
                                let ctx = self.gadget_context(call, *node, stop_error.is_some());
                                let executor = executor.clone();
                                let call = call.clone();
                                let node = *node;
                                futures.push(async move {
                                    (index, executor.execute(&call, node, ctx).await)
                                });
                            }
                        }
                    }

                    // Within a wave: concurrent; across waves: happens-before.
                    let wave_results = join_all(futures).await;
                    for (_, executed) in &wave_results {
                        let result = &executed.result;
                        if !result.is_error() {
                            continue;
                        }
                        let stop = self
                            .error_handler
                            .as_ref()
                            .map_or(self.config.stop_on_gadget_error, |handler| handler(result));
                        if stop && stop_error.is_none() {
                            stop_error = Some(format!(
                                "gadget '{}' [{}] failed: {}",
                                result.name,
                                result.invocation_id,
                                result.error.clone().unwrap_or_default()
                            ));
                        }
                    }
                    results.extend(wave_results);
                }

                if let Some(err) = hook_failure {
                    let message = err.to_string();
                    yield Err(err);
                    outcome = Some(RunOutcome::failed(message));
                    break 'run;
                }

                // Anything never dispatched (later waves after a stop) gets a
                // terminal skip so the iteration's record is complete.
                let dispatched: std::collections::HashSet<usize> =
                    results.iter().map(|(index, _)| *index).collect();
                let leftover: Vec<usize> =
                    (0..planned.len()).filter(|i| !dispatched.contains(i)).collect();
                for index in leftover {
                    let (call, node) = &planned[index];
                    let ctx = self.gadget_context(call, *node, true);
                    let executed = executor.execute(call, *node, ctx).await;
                    results.push((index, executed));
                }

                // The conversation append order follows the order the start
                // markers appeared in the stream.
                results.sort_by_key(|(index, _)| *index);

                for (_, executed) in results {
                    let mut result = executed.result;

                    let action = self.hooks.after_gadget_execution(&result).await;
                    if let Err(err) = action.validate() {
                        let message = err.to_string();
                        yield Err(err);
                        outcome = Some(RunOutcome::failed(message));
                        break 'run;
                    }
                    if let AfterGadgetAction::Recover { result: recovered } = action
                        && result.is_error()
                    {
                        result.error = None;
                        result.result = Some(recovered);
                    }

                    if let Some(exchange) = executed.human_input {
                        yield Ok(LoopEvent::HumanInputPrompt {
                            invocation_id: Some(result.invocation_id.clone()),
                            question: exchange.question,
                        });
                        self.history.push(Message::user(exchange.answer));
                    }

                    self.run_cost += result.cost.unwrap_or(0.0);
                    if result.breaks_loop {
                        breaking = Some(result.result.clone().unwrap_or_default());
                    }

                    self.history.push(Message::user(history::render_result(&result)));
                    yield Ok(LoopEvent::GadgetResult(result));
                }

                // ==== end-of-iteration termination checks, one ordered pass:
                // breaks_loop, then error policy, then the iteration cap,
                // then the abort signal. Text-only termination happened
                // above, before dispatch (it is mutually exclusive with
                // gadget results).
                if let Some(final_text) = breaking {
                    outcome = Some(RunOutcome::completed(final_text));
                    break 'run;
                }
                if let Some(error) = stop_error {
                    outcome = Some(RunOutcome {
                        state: RunState::Failed,
                        final_text: last_response.clone(),
                        error: Some(error),
                    });
                    break 'run;
                }
                if self.iteration >= self.config.max_iterations {
                    outcome = Some(RunOutcome {
                        state: RunState::MaxIterationsReached,
                        final_text: last_response.clone(),
                        error: None,
                    });
                    break 'run;
                }
                if self.abort.aborted() {
                    let reason = self.abort.reason().unwrap_or_else(|| REASON_ABORTED.to_string());
                    self.fire_on_abort(&reason);
                    outcome = Some(RunOutcome::aborted(reason));
                    break 'run;
                }
            }

            let outcome = outcome.unwrap_or_else(|| RunOutcome::failed("loop ended without outcome"));
            info!(state = %outcome.state, iterations = self.iteration, "agent run finished");
            self.finish_run(outcome);
        }
    }

    /// Folds parser events into tree nodes and loop events.
    fn absorb_parser_events(
        &mut self,
        events: Vec<ParserEvent>,
        llm_node: NodeId,
        planned: &mut Vec<PlannedCall>,
    ) -> Vec<LoopEvent> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            match event {
                ParserEvent::Text(text) => out.push(LoopEvent::Text(text)),
                ParserEvent::GadgetCall(call) => {
                    let node = self.tree.add_gadget(&call, Some(llm_node));
                    planned.push((call.clone(), node));
                    out.push(LoopEvent::GadgetCall(call));
                }
            }
        }
        out
    }

    /// Builds the per-invocation context with a linked child signal.
    fn gadget_context(&self, call: &ParsedGadgetCall, node: NodeId, cancelled: bool) -> GadgetContext {
        let child = self.abort.child();
        if cancelled {
            child.abort("loop stopped before this gadget ran");
        }
        GadgetContext::new(
            &call.invocation_id,
            child,
            self.outputs.clone(),
            self.media.clone(),
            self.human_input.clone(),
            Some(HostExports {
                tree: self.tree.clone(),
                parent_node: node,
                adapter: std::sync::Arc::clone(&self.adapter),
                registry: std::sync::Arc::clone(&self.registry),
            }),
        )
    }

    /// Applies provider-error policy for one failed call.
    async fn handle_llm_error(
        &mut self,
        error: AgentError,
        iteration: usize,
        llm_node: NodeId,
        usage: Option<Usage>,
    ) -> LlmPhase {
        warn!(iteration, error = %error, "llm call failed");
        let action = self
            .hooks
            .after_llm_error(&LlmErrorContext {
                iteration,
                error: &error,
            })
            .await;
        if let Err(err) = action.validate() {
            return LlmPhase::Fatal(err);
        }
        match action {
            AfterLlmErrorAction::Rethrow => {
                let retryable = matches!(&error, AgentError::Provider { retryable: true, .. });
                self.tree
                    .fail_llm_call(llm_node, &error.to_string(), retryable, usage);
                LlmPhase::Fatal(error)
            }
            AfterLlmErrorAction::Recover { fallback_response } => {
                debug!(iteration, "recovered from llm error with fallback response");
                LlmPhase::Recovered(fallback_response)
            }
        }
    }
}
