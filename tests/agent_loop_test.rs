//! End-to-end tests of the execution loop against scripted providers
//! and fake tools.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{make_bus, make_policy, DeleteFileTool, FakeFs, ListFilesTool, ReadFileTool, SlowTool, WriteFileTool};
use overlord::application::agent_loop::{AgentLoop, AgentLoopConfig, LoopOutcome};
use overlord::application::compaction::estimate_messages_tokens;
use overlord::domain::models::budget::Budget;
use overlord::domain::models::message::{Message, Role, ToolCall};
use overlord::domain::ports::host::NullHostGateway;
use overlord::domain::ports::provider::ChatResponse;
use overlord::domain::ports::tool::Tool;
use overlord::infrastructure::provider::mock::MockProvider;
use overlord::services::budget_tracker::BudgetTracker;
use overlord::services::cancellation::CancellationSource;
use overlord::services::event_bus::EventBus;
use overlord::services::phase_machine::{PhaseMachine, PhaseMachineConfig};

fn make_loop(
    responses: Vec<ChatResponse>,
    tools: Vec<Arc<dyn Tool>>,
    budget: Budget,
    event_bus: Arc<EventBus>,
) -> AgentLoop {
    let provider = Arc::new(MockProvider::new(responses));
    let policy = make_policy(&event_bus, true);
    let tracker = BudgetTracker::new("main", budget, Arc::clone(&event_bus));
    let phase = PhaseMachine::new("main", PhaseMachineConfig::default(), Arc::clone(&event_bus));
    AgentLoop::new(
        AgentLoopConfig::default(),
        provider,
        tools,
        policy,
        Arc::new(NullHostGateway),
        event_bus,
        tracker,
        phase,
    )
}

/// S1: an allowed read flows straight through: tool call, result,
/// final answer, no prompt raised.
#[tokio::test]
async fn test_allowed_read_flows_through() {
    let fs = FakeFs::with_files(&[("/etc/hosts", "127.0.0.1 localhost")]);
    let responses = vec![
        MockProvider::tool_call_response(
            "",
            vec![ToolCall::new("call_1", "read_file", json!({"path": "/etc/hosts"}))],
        ),
        MockProvider::text_response("The hosts file maps localhost to 127.0.0.1."),
    ];
    let mut agent_loop = make_loop(
        responses,
        vec![Arc::new(ReadFileTool(fs))],
        Budget::default(),
        make_bus(),
    );
    let source = CancellationSource::new();

    let result = agent_loop
        .run(vec![Message::user("Read /etc/hosts")], source.token())
        .await;

    match &result.outcome {
        LoopOutcome::Completed { final_text } => assert!(final_text.contains("localhost")),
        other => panic!("expected completion, got {other:?}"),
    }
    // The tool result was appended and references the call.
    let tool_result = result
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool result present");
    assert_eq!(tool_result.tool_call_id.as_deref(), Some("call_1"));
    assert!(tool_result.content.as_text().contains("127.0.0.1"));
}

/// S2: a hallucinated destructive call is blocked on intent evidence,
/// the model sees a synthetic result with a suggestion, and the
/// filesystem is untouched.
#[tokio::test]
async fn test_hallucinated_delete_blocked() {
    let fs = FakeFs::with_files(&[("data.db", "precious")]);
    let responses = vec![
        MockProvider::tool_call_response(
            "",
            vec![ToolCall::new("call_1", "delete_file", json!({"path": "data.db"}))],
        ),
        MockProvider::text_response("I listed the files instead of deleting anything."),
    ];
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(DeleteFileTool(Arc::clone(&fs))),
        Arc::new(ListFilesTool(Arc::clone(&fs))),
    ];
    let mut agent_loop = make_loop(responses, tools, Budget::default(), make_bus());
    let source = CancellationSource::new();

    let result = agent_loop
        .run(vec![Message::user("what files are here?")], source.token())
        .await;

    assert!(matches!(result.outcome, LoopOutcome::Completed { .. }));
    // No filesystem change.
    assert!(fs.contains("data.db"));
    assert!(fs.deletes.lock().unwrap().is_empty());
    // The synthetic block result suggests list_files.
    let block = result
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("synthetic tool result present");
    let text = block.content.as_text();
    assert!(text.starts_with("BLOCKED"));
    assert!(text.contains("list_files"));
}

/// S4: the first token-budget violation triggers one-shot recovery;
/// compaction brings the context under the target and the run
/// continues.
#[tokio::test]
async fn test_token_budget_recovery_succeeds_once() {
    let budget = Budget { max_tokens: Some(100_000), max_iterations: 10, ..Default::default() };
    let responses = vec![MockProvider::text_response("summarized and finished")];
    let mut agent_loop = make_loop(responses, Vec::new(), budget, make_bus());
    let source = CancellationSource::new();

    // ~110K tokens of conversation.
    let mut seed = vec![Message::user("work through this backlog")];
    for i in 0..22 {
        seed.push(Message::user(format!("item {i}: {}", "x".repeat(20_000))));
    }
    assert!(estimate_messages_tokens(&seed) > 100_000);

    let result = agent_loop.run(seed, source.token()).await;

    assert!(matches!(result.outcome, LoopOutcome::Completed { .. }));
    // The surviving conversation fits under the recovery target.
    assert!(estimate_messages_tokens(&result.messages) < 85_000);
    // A work-log summary was injected during recovery.
    assert!(result
        .messages
        .iter()
        .any(|m| m.role == Role::System && m.content.as_text().contains("WORK LOG")));
}

/// S4, failure half: when recovery cannot shrink the context (system
/// messages are never dropped) the run terminates with budget_limit.
#[tokio::test]
async fn test_token_budget_recovery_failure_is_terminal() {
    let budget = Budget { max_tokens: Some(10_000), max_iterations: 10, ..Default::default() };
    let mut agent_loop = make_loop(Vec::new(), Vec::new(), budget, make_bus());
    let source = CancellationSource::new();

    // One giant system message: undroppable, uncompactable.
    let seed = vec![Message::system("s".repeat(80_000)), Message::user("hello")];
    let result = agent_loop.run(seed, source.token()).await;

    match &result.outcome {
        LoopOutcome::BudgetExhausted { reason } => assert_eq!(reason, "budget_limit"),
        other => panic!("expected budget exhaustion, got {other:?}"),
    }
}

/// Iteration exhaustion surfaces the max_iterations reason.
#[tokio::test]
async fn test_iteration_budget_exhaustion() {
    let budget = Budget { max_iterations: 2, ..Default::default() };
    // The model keeps narrating forever.
    let responses = vec![
        MockProvider::text_response("i will create the parser now"),
        MockProvider::text_response("i will create the parser now"),
        MockProvider::text_response("i will create the parser now"),
    ];
    let mut agent_loop = make_loop(responses, Vec::new(), budget, make_bus());
    let source = CancellationSource::new();

    let result = agent_loop.run(vec![Message::user("build a parser")], source.token()).await;
    match &result.outcome {
        LoopOutcome::BudgetExhausted { reason } => assert_eq!(reason, "max_iterations reached"),
        other => panic!("expected budget exhaustion, got {other:?}"),
    }
}

/// Future-intent text without a tool call draws a system nudge.
#[tokio::test]
async fn test_incomplete_action_nudge() {
    let responses = vec![
        MockProvider::text_response("I'll write the fix next."),
        MockProvider::text_response("Done - the fix is in place."),
    ];
    let mut agent_loop = make_loop(responses, Vec::new(), Budget::default(), make_bus());
    let source = CancellationSource::new();

    let result = agent_loop.run(vec![Message::user("fix the bug")], source.token()).await;

    assert!(matches!(result.outcome, LoopOutcome::Completed { .. }));
    assert!(result
        .messages
        .iter()
        .any(|m| m.role == Role::System && m.content.as_text().contains("without performing it")));
}

/// A requested `.md` artifact draws a reminder before the loop accepts
/// a terminal answer without a write.
#[tokio::test]
async fn test_missing_artifact_reminder_then_write() {
    let fs = FakeFs::with_files(&[]);
    let responses = vec![
        MockProvider::text_response("Here is the summary of my findings: all good."),
        MockProvider::tool_call_response(
            "",
            vec![ToolCall::new(
                "call_1",
                "write_file",
                json!({"path": "REPORT.md", "content": "all good"}),
            )],
        ),
        MockProvider::text_response("Done - saved the report."),
    ];
    let mut agent_loop = make_loop(
        responses,
        vec![Arc::new(WriteFileTool(Arc::clone(&fs)))],
        Budget::default(),
        make_bus(),
    );
    let source = CancellationSource::new();

    let result = agent_loop
        .run(
            vec![Message::user("Investigate the failures and write a summary to REPORT.md")],
            source.token(),
        )
        .await;

    assert!(matches!(result.outcome, LoopOutcome::Completed { .. }));
    assert!(fs.contains("REPORT.md"));
    assert!(result
        .messages
        .iter()
        .any(|m| m.role == Role::System && m.content.as_text().contains("REPORT.md")));
}

/// Cancellation mid-tool discards the in-flight result; the
/// conversation stays intact up to the last fully-applied message.
#[tokio::test]
async fn test_cancellation_discards_in_flight_tool() {
    let responses = vec![MockProvider::tool_call_response(
        "",
        vec![ToolCall::new("call_1", "slow_tool", json!({}))],
    )];
    let mut agent_loop = make_loop(
        responses,
        vec![Arc::new(SlowTool(Duration::from_secs(30)))],
        Budget::default(),
        make_bus(),
    );
    let source = CancellationSource::new();
    let token = source.token();

    let handle = tokio::spawn(async move {
        agent_loop.run(vec![Message::user("do the slow thing")], token).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    source.cancel(Some("operator interrupt".into()));

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop should stop promptly")
        .expect("loop task should not panic");

    match &result.outcome {
        LoopOutcome::Cancelled { reason } => assert_eq!(reason, "operator interrupt"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    // No tool result was appended for the aborted call.
    assert!(result.messages.iter().all(|m| m.role != Role::Tool));
    assert_eq!(result.messages.last().unwrap().role, Role::Assistant);
}
