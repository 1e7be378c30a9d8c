//! End-to-end loop tests against the mock adapter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::Deserialize;

use gadgetry::agent::{
    Agent, AgentHooks, BeforeLlmAction, Compactor, LlmRequestContext, LoopEvent, RunState,
    TextOnlyHandler,
};
use gadgetry::gadget::{Gadget, GadgetContext, GadgetError, GadgetOutput, HumanInput};
use gadgetry::llm::mock::{MockAdapter, MockTurn};
use gadgetry::llm::ModelLimits;
use gadgetry::message::{Message, Role};
use gadgetry::tree::{GadgetState, NodeKind};
use gadgetry::usage::Usage;

// ---------------------------------------------------------------------------
// Test gadgets
// ---------------------------------------------------------------------------

#[derive(Deserialize, JsonSchema)]
struct EchoArgs {
    text: String,
}

struct Echo;

impl Gadget for Echo {
    const NAME: &'static str = "Echo";
    type Args = EchoArgs;
    type Error = GadgetError;

    async fn invoke(&self, args: EchoArgs, _ctx: &GadgetContext) -> Result<GadgetOutput, GadgetError> {
        Ok(GadgetOutput::text(format!("echo: {}", args.text)))
    }
}

#[derive(Deserialize, JsonSchema)]
struct NoArgs {}

struct Fail;

impl Gadget for Fail {
    const NAME: &'static str = "Fail";
    type Args = NoArgs;
    type Error = GadgetError;

    async fn invoke(&self, _args: NoArgs, _ctx: &GadgetContext) -> Result<GadgetOutput, GadgetError> {
        Err(GadgetError::Execution("intentional failure".into()))
    }
}

struct Finish;

impl Gadget for Finish {
    const NAME: &'static str = "Finish";
    type Args = NoArgs;
    type Error = GadgetError;

    async fn invoke(&self, _args: NoArgs, _ctx: &GadgetContext) -> Result<GadgetOutput, GadgetError> {
        Ok(GadgetOutput::text("task finished").breaking())
    }
}

#[derive(Deserialize, JsonSchema)]
struct NapArgs {
    ms: u64,
}

struct Nap;

impl Gadget for Nap {
    const NAME: &'static str = "Nap";
    type Args = NapArgs;
    type Error = GadgetError;

    async fn invoke(&self, args: NapArgs, _ctx: &GadgetContext) -> Result<GadgetOutput, GadgetError> {
        tokio::time::sleep(Duration::from_millis(args.ms)).await;
        Ok(GadgetOutput::text(format!("napped {}ms", args.ms)))
    }
}

struct Asker;

impl Gadget for Asker {
    const NAME: &'static str = "Asker";
    type Args = NoArgs;
    type Error = GadgetError;

    async fn invoke(&self, _args: NoArgs, _ctx: &GadgetContext) -> Result<GadgetOutput, GadgetError> {
        Err(GadgetError::HumanInputRequired {
            question: "which branch?".into(),
        })
    }
}

struct Spender;

impl Gadget for Spender {
    const NAME: &'static str = "Spender";
    type Args = NoArgs;
    type Error = GadgetError;

    async fn invoke(&self, _args: NoArgs, ctx: &GadgetContext) -> Result<GadgetOutput, GadgetError> {
        ctx.report_cost(0.01);
        Ok(GadgetOutput::text("spent").with_cost(0.02))
    }
}

/// Runs a nested loop against the host's tree.
struct Subagent;

impl Gadget for Subagent {
    const NAME: &'static str = "Subagent";
    type Args = NoArgs;
    type Error = GadgetError;

    async fn invoke(&self, _args: NoArgs, ctx: &GadgetContext) -> Result<GadgetOutput, GadgetError> {
        let host = ctx
            .host
            .clone()
            .ok_or_else(|| GadgetError::Execution("no host exports".into()))?;
        let mut inner = Agent::builder()
            .adapter(MockAdapter::new(vec![MockTurn::text("inner answer")]))
            .model("mock")
            .tree(host.tree)
            .parent_node(host.parent_node)
            .build()
            .map_err(|err| GadgetError::Execution(err.to_string()))?;
        inner.inject_user_message("solve the subtask");
        let result = inner.run().await;
        Ok(GadgetOutput::text(result.final_text))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn gadget_block(name: &str, id: &str, body: &str) -> String {
    format!("!!!GADGET_START:{name}:{id}\n{body}\n!!!GADGET_END:{id}")
}

async fn collect_events(agent: &mut Agent) -> Vec<LoopEvent> {
    let mut events = Vec::new();
    {
        let stream = agent.stream();
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            if let Ok(event) = item {
                events.push(event);
            }
        }
    }
    events
}

fn user_messages(agent: &Agent) -> Vec<String> {
    agent
        .history()
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gadget_iteration_then_text_completion() {
    let turn1 = format!(
        "Working.{}",
        gadget_block("Echo", "e1", r#"{"text":"hi"}"#)
    );
    let adapter = MockAdapter::new(vec![MockTurn::text(turn1), MockTurn::text("All done.")]);
    let mut agent = Agent::builder()
        .adapter(adapter)
        .model("mock")
        .gadget(Echo)
        .build()
        .unwrap();
    agent.inject_user_message("go");

    let events = collect_events(&mut agent).await;
    let result = agent.run_result();

    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.final_text, "All done.");
    assert_eq!(result.iterations, 2);
    assert_eq!(result.tokens.input, 20);
    assert_eq!(result.tokens.output, 10);

    // Event shape: text, call, result in stream order, then final text.
    assert!(matches!(&events[0], LoopEvent::Text(t) if t == "Working."));
    assert!(matches!(&events[1], LoopEvent::GadgetCall(c) if c.invocation_id == "e1"));
    assert!(
        matches!(&events[2], LoopEvent::GadgetResult(r) if r.result.as_deref() == Some("echo: hi"))
    );
    assert!(matches!(&events[3], LoopEvent::Text(t) if t == "All done."));

    // History carries the assistant turn plus one result block.
    let users = user_messages(&agent);
    assert!(users.iter().any(|m| m.contains("Gadget Echo [e1] returned:\necho: hi")));

    let counts = agent.tree().node_count();
    assert_eq!(counts.llm_calls, 2);
    assert_eq!(counts.gadgets, 1);
}

#[tokio::test]
async fn chunked_stream_produces_identical_outcome() {
    let turn1 = format!("Let's go.{}", gadget_block("Echo", "c1", r#"{"text":"x"}"#));
    let adapter = MockAdapter::new(vec![
        MockTurn::text(turn1).chunked(1),
        MockTurn::text("done"),
    ]);
    let mut agent = Agent::builder()
        .adapter(adapter)
        .model("mock")
        .gadget(Echo)
        .build()
        .unwrap();

    let events = collect_events(&mut agent).await;
    let text: String = events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert!(text.starts_with("Let's go."));

    let calls: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::GadgetCall(c) => Some(c.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].invocation_id, "c1");
    assert_eq!(calls[0].params, Some(serde_json::json!({ "text": "x" })));
    assert_eq!(agent.run_result().state, RunState::Completed);
}

#[tokio::test]
async fn failed_dependency_skips_dependent() {
    let turn1 = format!(
        "{}{}",
        gadget_block("Fail", "a", "{}"),
        gadget_block("Echo", "b", r#"{"text":"@a"}"#)
    );
    let adapter = MockAdapter::new(vec![MockTurn::text(turn1)]);
    let mut agent = Agent::builder()
        .adapter(adapter)
        .model("mock")
        .gadget(Fail)
        .gadget(Echo)
        .build()
        .unwrap();

    let result = agent.run().await;
    assert_eq!(result.state, RunState::Failed);

    let tree = agent.tree();
    let failed = tree.get_node_by_invocation_id("a").unwrap();
    assert_eq!(failed.as_gadget().unwrap().state, GadgetState::Failed);
    let skipped = tree.get_node_by_invocation_id("b").unwrap();
    let skipped = skipped.as_gadget().unwrap();
    assert_eq!(skipped.state, GadgetState::Skipped);
    assert_eq!(skipped.failed_dependency.as_deref(), Some("a"));

    // Exactly one error message for A and one skip notice for B.
    let users = user_messages(&agent);
    let errors: Vec<_> = users.iter().filter(|m| m.contains("[a] failed")).collect();
    let skips: Vec<_> = users
        .iter()
        .filter(|m| m.contains("[b] was skipped"))
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(skips.len(), 1);
}

#[tokio::test]
async fn pre_aborted_loop_never_calls_the_adapter() {
    let adapter = Arc::new(MockAdapter::new(vec![MockTurn::text("never sent")]));
    let fired = Arc::new(Mutex::new(Vec::new()));
    let fired_sink = Arc::clone(&fired);

    let mut agent = Agent::builder()
        .adapter_arc(Arc::clone(&adapter) as Arc<dyn gadgetry::llm::LlmAdapter>)
        .model("mock")
        .on_abort(move |info| {
            fired_sink.lock().unwrap().push(info.clone());
        })
        .build()
        .unwrap();

    agent.abort_signal().abort("user cancelled");
    let events = collect_events(&mut agent).await;
    let result = agent.run_result();

    assert!(events.is_empty());
    assert_eq!(adapter.request_count(), 0);
    assert_eq!(result.state, RunState::Aborted);

    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].reason, "user cancelled");
    assert_eq!(fired[0].iteration, 0);
}

#[tokio::test]
async fn breaking_gadget_ends_the_run() {
    let turn1 = gadget_block("Finish", "f1", "{}");
    let adapter = Arc::new(MockAdapter::new(vec![
        MockTurn::text(turn1),
        MockTurn::text("unreachable"),
    ]));
    let mut agent = Agent::builder()
        .adapter_arc(Arc::clone(&adapter) as Arc<dyn gadgetry::llm::LlmAdapter>)
        .model("mock")
        .gadget(Finish)
        .build()
        .unwrap();

    let result = agent.run().await;
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.final_text, "task finished");
    assert_eq!(result.iterations, 1);
    assert_eq!(adapter.request_count(), 1);
}

#[tokio::test]
async fn acknowledge_policy_runs_to_iteration_cap() {
    let adapter = Arc::new(MockAdapter::new(vec![
        MockTurn::text("thinking"),
        MockTurn::text("still thinking"),
        MockTurn::text("more thinking"),
    ]));
    let mut agent = Agent::builder()
        .adapter_arc(Arc::clone(&adapter) as Arc<dyn gadgetry::llm::LlmAdapter>)
        .model("mock")
        .max_iterations(3)
        .text_only_handler(TextOnlyHandler::Acknowledge)
        .build()
        .unwrap();

    let result = agent.run().await;
    assert_eq!(result.state, RunState::MaxIterationsReached);
    assert_eq!(result.iterations, 3);
    assert_eq!(adapter.request_count(), 3);
    // Each acknowledge appended a synthetic "continue".
    assert_eq!(
        user_messages(&agent)
            .iter()
            .filter(|m| m.as_str() == "continue")
            .count(),
        3
    );
}

struct SkipFirstCall;

#[async_trait]
impl AgentHooks for SkipFirstCall {
    async fn before_llm_call(&self, ctx: &LlmRequestContext<'_>) -> BeforeLlmAction {
        if ctx.iteration == 1 {
            BeforeLlmAction::Skip {
                synthetic_response: format!(
                    "cached{}",
                    gadget_block("Echo", "s1", r#"{"text":"from hook"}"#)
                ),
            }
        } else {
            BeforeLlmAction::Continue
        }
    }
}

#[tokio::test]
async fn before_llm_hook_skips_the_provider() {
    let adapter = Arc::new(MockAdapter::new(vec![MockTurn::text("real answer")]));
    let mut agent = Agent::builder()
        .adapter_arc(Arc::clone(&adapter) as Arc<dyn gadgetry::llm::LlmAdapter>)
        .model("mock")
        .gadget(Echo)
        .hooks(SkipFirstCall)
        .build()
        .unwrap();

    let events = collect_events(&mut agent).await;
    let result = agent.run_result();

    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.final_text, "real answer");
    // Iteration 1 never reached the adapter.
    assert_eq!(adapter.request_count(), 1);
    assert!(events.iter().any(
        |e| matches!(e, LoopEvent::GadgetResult(r) if r.result.as_deref() == Some("echo: from hook"))
    ));
}

#[tokio::test]
async fn gadget_errors_surface_to_the_model_when_not_stopping() {
    let turn1 = gadget_block("Fail", "x1", "{}");
    let adapter = Arc::new(MockAdapter::new(vec![
        MockTurn::text(turn1),
        MockTurn::text("recovered, done"),
    ]));
    let mut agent = Agent::builder()
        .adapter_arc(Arc::clone(&adapter) as Arc<dyn gadgetry::llm::LlmAdapter>)
        .model("mock")
        .gadget(Fail)
        .stop_on_gadget_error(false)
        .build()
        .unwrap();

    let result = agent.run().await;
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(adapter.request_count(), 2);
    assert!(
        user_messages(&agent)
            .iter()
            .any(|m| m.contains("[x1] failed: intentional failure"))
    );
}

#[tokio::test]
async fn wave_results_append_in_parse_order() {
    // The slow gadget is parsed first; its result must still come first.
    let turn1 = format!(
        "{}{}",
        gadget_block("Nap", "slow", r#"{"ms":40}"#),
        gadget_block("Nap", "fast", r#"{"ms":1}"#)
    );
    let adapter = MockAdapter::new(vec![MockTurn::text(turn1), MockTurn::text("done")]);
    let mut agent = Agent::builder()
        .adapter(adapter)
        .model("mock")
        .gadget(Nap)
        .build()
        .unwrap();

    // Record start order from the tree bus to confirm wave concurrency.
    let starts = Arc::new(Mutex::new(Vec::new()));
    let completes = Arc::new(AtomicUsize::new(0));
    let starts_sink = Arc::clone(&starts);
    let completes_sink = Arc::clone(&completes);
    agent.tree().on_all(move |event| {
        use gadgetry::tree::EventKind;
        match event.kind() {
            EventKind::GadgetStart => {
                starts_sink
                    .lock()
                    .unwrap()
                    .push(completes_sink.load(Ordering::SeqCst));
            }
            EventKind::GadgetComplete => {
                completes_sink.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    });

    let events = collect_events(&mut agent).await;

    let result_ids: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::GadgetResult(r) => Some(r.invocation_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(result_ids, vec!["slow".to_string(), "fast".to_string()]);

    // Both gadgets started before either completed: concurrent wave.
    assert_eq!(starts.lock().unwrap().as_slice(), &[0, 0]);
}

#[tokio::test]
async fn human_input_exchange_is_spliced_into_history() {
    struct Canned;

    #[async_trait]
    impl HumanInput for Canned {
        async fn ask(&self, _question: &str) -> Result<String, gadgetry::AgentError> {
            Ok("take main".to_string())
        }
    }

    let turn1 = gadget_block("Asker", "q1", "{}");
    let adapter = MockAdapter::new(vec![MockTurn::text(turn1), MockTurn::text("done")]);
    let mut agent = Agent::builder()
        .adapter(adapter)
        .model("mock")
        .gadget(Asker)
        .human_input(Canned)
        .build()
        .unwrap();

    let events = collect_events(&mut agent).await;
    assert_eq!(agent.run_result().state, RunState::Completed);

    assert!(events.iter().any(|e| matches!(
        e,
        LoopEvent::HumanInputPrompt { invocation_id: Some(id), question }
            if id == "q1" && question == "which branch?"
    )));
    let users = user_messages(&agent);
    assert!(users.iter().any(|m| m == "take main"));
    assert!(users.iter().any(|m| m.contains("[q1] returned:\ntake main")));
}

#[tokio::test]
async fn costs_aggregate_across_llm_and_gadgets() {
    let turn1 = gadget_block("Spender", "s1", "{}");
    let adapter = MockAdapter::new(vec![MockTurn::text(turn1), MockTurn::text("done")]);
    let mut agent = Agent::builder()
        .adapter(adapter)
        .model("mock")
        .gadget(Spender)
        .cost_model(|_, usage: &Usage| usage.total_tokens as f64 * 0.001)
        .build()
        .unwrap();

    let result = agent.run().await;
    // Two LLM calls at 15 tokens each plus 0.03 of gadget cost.
    assert!((result.cost - 0.06).abs() < 1e-9, "cost = {}", result.cost);
    assert!((agent.tree().total_cost() - 0.06).abs() < 1e-9);
}

#[tokio::test]
async fn subagent_nests_under_the_gadget_node() {
    let turn1 = gadget_block("Subagent", "sub1", "{}");
    let adapter = MockAdapter::new(vec![MockTurn::text(turn1), MockTurn::text("done")]);
    let mut agent = Agent::builder()
        .adapter(adapter)
        .model("mock")
        .gadget(Subagent)
        .build()
        .unwrap();

    let result = agent.run().await;
    assert_eq!(result.state, RunState::Completed);

    let tree = agent.tree();
    let gadget_node = tree.get_node_by_invocation_id("sub1").unwrap();
    assert_eq!(
        tree.get_node_by_invocation_id("sub1")
            .unwrap()
            .as_gadget()
            .unwrap()
            .result
            .as_deref(),
        Some("inner answer")
    );

    let nested = tree.get_descendants(gadget_node.id(), Some(NodeKind::LlmCall));
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0].depth(), gadget_node.depth() + 1);
    assert_eq!(nested[0].parent_id(), Some(gadget_node.id()));

    // Nested usage rolls up through the subtree aggregate: the outer call
    // and the inner call both contribute.
    let root = tree.get_roots()[0];
    assert_eq!(tree.subtree_tokens(root).input, 20);
}

#[tokio::test]
async fn injected_messages_reach_the_adapter() {
    let adapter = Arc::new(MockAdapter::new(vec![MockTurn::text("ok")]));
    let mut agent = Agent::builder()
        .adapter_arc(Arc::clone(&adapter) as Arc<dyn gadgetry::llm::LlmAdapter>)
        .model("mock")
        .system_prompt("be brief")
        .build()
        .unwrap();
    agent.inject_user_message("first ask");

    let _ = agent.run().await;
    let requests = adapter.requests();
    assert_eq!(requests.len(), 1);
    let roles: Vec<Role> = requests[0].messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User]);
    assert_eq!(requests[0].messages[1].content, "first ask");
}

#[tokio::test]
async fn oversized_history_is_compacted() {
    struct KeepLast;

    impl Compactor for KeepLast {
        fn compact(&self, history: &[Message]) -> Option<Vec<Message>> {
            history.last().map(|last| vec![last.clone()])
        }
    }

    let adapter = MockAdapter::new(vec![MockTurn::text("ok")]).with_limits(
        "mock",
        ModelLimits {
            context_window: Some(10),
            max_output_tokens: Some(100),
        },
    );
    let mut agent = Agent::builder()
        .adapter(adapter)
        .model("mock")
        .system_prompt("a".repeat(80))
        .compactor(KeepLast)
        .build()
        .unwrap();
    agent.inject_user_message("the actual request");

    let events = collect_events(&mut agent).await;
    assert!(events.iter().any(
        |e| matches!(e, LoopEvent::Compaction { before, after } if *before == 2 && *after == 1)
    ));
    // The compacted history keeps only the injected request plus what the
    // run appended afterwards.
    assert_eq!(agent.history()[0].content, "the actual request");
}
