//! End-to-end orchestrator tests: judge gating, retry chains, terminal
//! events, streaming, and cancellation.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use planweave_controller::PlanRunner;
use planweave_core::{
    config::AppConfig,
    events::{ResultStatus, RunEvent},
    mocks::{MockCatalog, ScriptedLlm, ScriptedTool},
    traits::{ChatReply, HistoryStore},
    types::{RunContext, ToolResult},
};
use planweave_store::InMemoryHistoryStore;

const NO_TOOLS_SUMMARY: &str = "本次任务判定无需调用工具。";

fn judge_reply(need: bool, tool_names: &[&str]) -> ChatReply {
    ChatReply::function_call(
        "judge_tool_necessity",
        json!({
            "need": need,
            "summary": if need { "tools required" } else { "plain chat" },
            "toolNames": tool_names,
        }),
    )
}

fn plan_reply(steps: serde_json::Value) -> ChatReply {
    ChatReply::function_call("emit_plan", json!({ "steps": steps }))
}

fn eval_reply(success: bool, failed: serde_json::Value) -> ChatReply {
    ChatReply::function_call(
        "evaluate_run",
        json!({
            "success": success,
            "summary": if success { "all good" } else { "something failed" },
            "failedSteps": failed,
        }),
    )
}

async fn history_kinds(history: &InMemoryHistoryStore, run_id: &str) -> Vec<String> {
    history
        .list(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.event.kind().to_string())
        .collect()
}

#[tokio::test]
async fn test_judge_declares_no_tools() {
    // Race mode fires two plan requests; none should happen here.
    let llm = ScriptedLlm::new().on_function("judge_tool_necessity", vec![judge_reply(false, &[])]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let runner = PlanRunner::builder()
        .llm(Arc::new(llm))
        .catalog(Arc::new(MockCatalog::new().with_tool(ScriptedTool::new("echo"))))
        .history(history.clone())
        .build()
        .unwrap();

    let outcome = runner
        .plan_then_execute("say hello", RunContext::default(), vec![])
        .await
        .unwrap();

    assert!(!outcome.cancelled);
    assert_eq!(outcome.exec.attempted, 0);
    assert_eq!(outcome.summary.as_deref(), Some(NO_TOOLS_SUMMARY));

    let kinds = history_kinds(&history, &outcome.run_id).await;
    assert_eq!(kinds, vec!["start", "judge", "plan", "done", "summary"]);
}

#[tokio::test]
async fn test_happy_path_single_step() {
    let llm = ScriptedLlm::new()
        .on_function("judge_tool_necessity", vec![judge_reply(true, &["echo"])])
        .on_function(
            "emit_plan",
            vec![
                plan_reply(json!([{ "stepId": "s1", "aiName": "echo", "nextStep": "say it" }])),
                plan_reply(json!([{ "stepId": "s1", "aiName": "echo", "nextStep": "say it" }])),
            ],
        )
        .on_function("evaluate_run", vec![eval_reply(true, json!([]))])
        .on_plain(vec![ChatReply::text("Echoed the greeting.")])
        .with_fallback(ChatReply::function_call("emit_args", json!({})));

    let catalog = Arc::new(MockCatalog::new().with_tool(ScriptedTool::new("echo")));
    let history = Arc::new(InMemoryHistoryStore::new());
    let runner = PlanRunner::builder()
        .llm(Arc::new(llm))
        .catalog(catalog.clone())
        .history(history.clone())
        .build()
        .unwrap();

    let outcome = runner
        .plan_then_execute("echo a greeting", RunContext::default(), vec![])
        .await
        .unwrap();

    assert_eq!(outcome.exec.attempted, 1);
    assert_eq!(outcome.exec.succeeded, 1);
    assert_eq!(outcome.summary.as_deref(), Some("Echoed the greeting."));
    assert_eq!(catalog.calls_for("echo"), 1);

    let records = history.list(&outcome.run_id).await.unwrap();
    let events: Vec<RunEvent> = records.into_iter().map(|r| r.event).collect();

    // Exactly one terminal event, and it is the summary.
    let terminals: Vec<&RunEvent> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    assert_eq!(terminals[0].kind(), "summary");
    assert_eq!(events.last().unwrap().kind(), "summary");

    // Exactly one final result marker.
    let finals = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::ToolResult(r) => Some(r.result_status),
            _ => None,
        })
        .filter(|s| *s == Some(ResultStatus::Final))
        .count();
    assert_eq!(finals, 1);
}

#[tokio::test]
async fn test_retry_chain_reruns_failure_and_downstream_only() {
    // Plan s1 -> s2 -> s3; s2 fails once, then succeeds.
    let steps = json!([
        { "stepId": "s1", "aiName": "a" },
        { "stepId": "s2", "aiName": "b", "dependsOnStepIds": ["s1"] },
        { "stepId": "s3", "aiName": "c", "dependsOnStepIds": ["s2"] }
    ]);
    let llm = ScriptedLlm::new()
        .on_function("judge_tool_necessity", vec![judge_reply(true, &[])])
        .on_function(
            "emit_plan",
            vec![plan_reply(steps.clone()), plan_reply(steps)],
        )
        .on_function(
            "evaluate_run",
            vec![
                eval_reply(false, json!([{ "stepId": "s2", "aiName": "b" }])),
                eval_reply(true, json!([])),
            ],
        )
        .on_plain(vec![ChatReply::text("Recovered and finished.")])
        .with_fallback(ChatReply::function_call("emit_args", json!({})));

    let catalog = Arc::new(
        MockCatalog::new()
            .with_tool(ScriptedTool::new("a"))
            .with_tool(ScriptedTool::new("b").with_results(vec![
                ToolResult::fail("TOOL_ERROR", "flaky"),
                ToolResult::ok(json!({"ok": true})),
            ]))
            .with_tool(ScriptedTool::new("c")),
    );
    let history = Arc::new(InMemoryHistoryStore::new());
    let runner = PlanRunner::builder()
        .llm(Arc::new(llm))
        .catalog(catalog.clone())
        .history(history.clone())
        .build()
        .unwrap();

    let outcome = runner
        .plan_then_execute("do the chain", RunContext::default(), vec![])
        .await
        .unwrap();

    // s1 ran once; s2 and s3 ran twice (the retry chain is the closure
    // of the failure, not the whole plan).
    assert_eq!(catalog.calls_for("a"), 1);
    assert_eq!(catalog.calls_for("b"), 2);
    assert_eq!(catalog.calls_for("c"), 2);

    let records = history.list(&outcome.run_id).await.unwrap();
    let retry_begin = records
        .iter()
        .find_map(|r| match &r.event {
            RunEvent::RetryBegin(e) => Some(e.clone()),
            _ => None,
        })
        .expect("retry_begin record");
    assert_eq!(retry_begin.attempt, 1);
    assert!(retry_begin.step_ids.contains(&"s2".to_string()));
    assert!(retry_begin.step_ids.contains(&"s3".to_string()));
    assert!(!retry_begin.step_ids.contains(&"s1".to_string()));

    let kinds: Vec<String> = records.iter().map(|r| r.event.kind().to_string()).collect();
    assert!(kinds.contains(&"retry_done".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("summary"));

    // Final stats reflect the latest result per step.
    assert_eq!(outcome.exec.attempted, 3);
    assert_eq!(outcome.exec.succeeded, 3);
}

#[tokio::test]
async fn test_judge_failure_short_circuits() {
    // No scripted judge reply: the stage reports ok=false.
    let llm = ScriptedLlm::new();
    let history = Arc::new(InMemoryHistoryStore::new());
    let runner = PlanRunner::builder()
        .llm(Arc::new(llm))
        .catalog(Arc::new(MockCatalog::new().with_tool(ScriptedTool::new("echo"))))
        .history(history.clone())
        .build()
        .unwrap();

    let result = runner
        .plan_then_execute("anything", RunContext::default(), vec![])
        .await;
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("Judge"));
}

#[tokio::test]
async fn test_stream_ends_at_terminal_event() {
    let llm = ScriptedLlm::new().on_function("judge_tool_necessity", vec![judge_reply(false, &[])]);
    let runner = PlanRunner::builder()
        .llm(Arc::new(llm))
        .catalog(Arc::new(MockCatalog::new().with_tool(ScriptedTool::new("echo"))))
        .build()
        .unwrap();

    let (_run_id, stream) = runner
        .plan_then_execute_stream("say hello", RunContext::default(), vec![])
        .await;
    let events: Vec<RunEvent> = stream.collect().await;

    assert!(!events.is_empty());
    let last = events.last().unwrap();
    assert!(last.is_terminal());
    assert_eq!(last.kind(), "summary");
    // Nothing after the terminal event.
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_force_need_tools_bypasses_judge_and_runs() {
    let llm = ScriptedLlm::new()
        .on_function(
            "emit_plan",
            vec![
                plan_reply(json!([{ "stepId": "s1", "aiName": "echo" }])),
                plan_reply(json!([{ "stepId": "s1", "aiName": "echo" }])),
            ],
        )
        .on_function("evaluate_run", vec![eval_reply(true, json!([]))])
        .on_plain(vec![ChatReply::text("done")])
        .with_fallback(ChatReply::function_call("emit_args", json!({})));

    let catalog = Arc::new(MockCatalog::new().with_tool(ScriptedTool::new("echo")));
    let runner = PlanRunner::builder()
        .llm(Arc::new(llm))
        .catalog(catalog.clone())
        .build()
        .unwrap();

    let mut ctx = RunContext::default();
    ctx.judge.force_need_tools = true;

    let outcome = runner
        .plan_then_execute("just do it", ctx, vec![])
        .await
        .unwrap();
    assert_eq!(outcome.exec.attempted, 1);
    assert_eq!(catalog.calls_for("echo"), 1);
}

#[tokio::test]
async fn test_summary_disabled_ends_with_completed() {
    let llm = ScriptedLlm::new().on_function("judge_tool_necessity", vec![judge_reply(false, &[])]);
    let history = Arc::new(InMemoryHistoryStore::new());
    let mut config = AppConfig::default();
    config.flags.enable_summary = false;

    let runner = PlanRunner::builder()
        .llm(Arc::new(llm))
        .catalog(Arc::new(MockCatalog::new().with_tool(ScriptedTool::new("echo"))))
        .history(history.clone())
        .config(config)
        .build()
        .unwrap();

    let outcome = runner
        .plan_then_execute("say hello", RunContext::default(), vec![])
        .await
        .unwrap();

    let kinds = history_kinds(&history, &outcome.run_id).await;
    assert_eq!(kinds.last().map(String::as_str), Some("completed"));
    assert!(!kinds.contains(&"summary".to_string()));
}
