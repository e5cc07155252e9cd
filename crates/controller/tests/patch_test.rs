//! Plan-patch hook tests: append-with-retry-budget, stop, and the
//! patch/repair budget dedup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;

use planweave_controller::executor::{self, ExecuteOptions};
use planweave_controller::{PlanRunner, RunnerInner};
use planweave_core::{
    config::AppConfig,
    events::RunEvent,
    mocks::{MockCatalog, ScriptedLlm, ScriptedTool},
    traits::{ChatReply, HistoryStore},
    types::{Plan, RunContext, Step, ToolResult},
};
use planweave_store::{ActiveRunRegistry, InMemoryHistoryStore, RunEventBus};

fn patch_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.runner.enable_plan_patch = true;
    config
}

fn rt_with(llm: ScriptedLlm, catalog: Arc<MockCatalog>, config: AppConfig) -> RunnerInner {
    RunnerInner {
        llm: Arc::new(llm),
        catalog,
        history: Arc::new(InMemoryHistoryStore::new()),
        bus: Arc::new(RunEventBus::default()),
        registry: Arc::new(ActiveRunRegistry::new()),
        memory: None,
        reranker: None,
        config,
    }
}

fn step(id: &str, ai_name: &str, deps: &[&str]) -> Step {
    let mut s = Step::new(ai_name);
    s.step_id = id.to_string();
    s.depends_on_step_ids = deps.iter().map(|d| d.to_string()).collect();
    s
}

fn patch_reply(operations: serde_json::Value) -> ChatReply {
    ChatReply::function_call(
        "emit_plan_patch",
        json!({ "action": "patch", "operations": operations }),
    )
}

#[tokio::test]
async fn test_patch_appends_retry_step_and_consumes_budget() {
    let llm = ScriptedLlm::new()
        .on_function(
            "emit_plan_patch",
            vec![patch_reply(json!([
                { "op": "append", "steps": [
                    { "aiName": "a", "dependsOnStepIds": ["s1"], "nextStep": "try again" }
                ]}
            ]))],
        )
        .with_fallback(ChatReply::function_call("emit_args", json!({})));
    let catalog = Arc::new(MockCatalog::new().with_tool(
        ScriptedTool::new("a").with_results(vec![
            ToolResult::fail("TOOL_ERROR", "first attempt broke"),
            ToolResult::ok(json!({"fixed": true})),
        ]),
    ));
    let rt = rt_with(llm, catalog.clone(), patch_config());

    let manifest = rt.catalog.available_tools_detailed().await.unwrap();
    let mut plan = Plan::new(manifest, vec![step("s1", "a", &[])]);
    plan.renumber();

    let budget = Arc::new(StdMutex::new(HashMap::new()));
    let report = executor::execute_plan(
        &rt,
        "r1",
        "do it",
        &mut plan,
        ExecuteOptions {
            retry_budget: Arc::clone(&budget),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // The appended retry ran and succeeded.
    assert_eq!(catalog.calls_for("a"), 2);
    assert_eq!(plan.steps.len(), 2);
    assert_eq!(report.stats.attempted, 2);
    assert_eq!(report.stats.succeeded, 1);
    assert!(!report.stopped);

    // The retry budget for s1 is spent.
    assert_eq!(budget.lock().unwrap().get("s1"), Some(&0));

    // A plan_patch record was written, and the patched plan persisted.
    let records = rt.history.list("r1").await.unwrap();
    let patch = records
        .iter()
        .find_map(|r| match &r.event {
            RunEvent::PlanPatch(e) => Some(e.clone()),
            _ => None,
        })
        .expect("plan_patch record");
    assert_eq!(patch.action, "patch");
    assert_eq!(patch.at_step_id.as_deref(), Some("s1"));

    let stored = rt.history.get_plan("r1").await.unwrap().expect("stored plan");
    assert_eq!(stored.steps.len(), 2);
    assert_eq!(stored.steps[1].display_index, 2);

    // The failing step's result was force-flushed before the patch
    // record: results are visible when the patch lands.
    let patch_pos = records
        .iter()
        .position(|r| matches!(r.event, RunEvent::PlanPatch(_)))
        .unwrap();
    let first_result_pos = records
        .iter()
        .position(|r| matches!(r.event, RunEvent::ToolResult(_)))
        .unwrap();
    assert!(first_result_pos < patch_pos);
}

#[tokio::test]
async fn test_patch_stop_halts_remaining_steps() {
    let llm = ScriptedLlm::new()
        .on_function(
            "emit_plan_patch",
            vec![ChatReply::function_call(
                "emit_plan_patch",
                json!({ "action": "stop", "reason": "objective unreachable" }),
            )],
        )
        .with_fallback(ChatReply::function_call("emit_args", json!({})));
    let catalog = Arc::new(
        MockCatalog::new()
            .with_tool(ScriptedTool::new("a").with_results(vec![ToolResult::fail(
                "TOOL_ERROR",
                "broken",
            )]))
            .with_tool(ScriptedTool::new("b")),
    );
    let rt = rt_with(llm, catalog.clone(), patch_config());

    let manifest = rt.catalog.available_tools_detailed().await.unwrap();
    let mut plan = Plan::new(
        manifest,
        vec![step("s1", "a", &[]), step("s2", "b", &["s1"])],
    );
    plan.renumber();

    let report = executor::execute_plan(&rt, "r1", "go", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();

    assert!(report.stopped);
    assert_eq!(catalog.calls_for("b"), 0);

    let records = rt.history.list("r1").await.unwrap();
    let patch = records
        .iter()
        .find_map(|r| match &r.event {
            RunEvent::PlanPatch(e) => Some(e.clone()),
            _ => None,
        })
        .expect("plan_patch record");
    assert_eq!(patch.action, "stop");
    assert_eq!(patch.reason.as_deref(), Some("objective unreachable"));
}

#[tokio::test]
async fn test_patch_continue_is_a_noop() {
    let llm = ScriptedLlm::new()
        .on_function(
            "emit_plan_patch",
            vec![ChatReply::function_call(
                "emit_plan_patch",
                json!({ "action": "continue" }),
            )],
        )
        .with_fallback(ChatReply::function_call("emit_args", json!({})));
    let catalog = Arc::new(
        MockCatalog::new()
            .with_tool(ScriptedTool::new("a").with_results(vec![ToolResult::fail(
                "TOOL_ERROR",
                "broken",
            )]))
            .with_tool(ScriptedTool::new("b")),
    );
    let rt = rt_with(llm, catalog.clone(), patch_config());

    let manifest = rt.catalog.available_tools_detailed().await.unwrap();
    let mut plan = Plan::new(manifest, vec![step("s1", "a", &[]), step("s2", "b", &[])]);
    plan.renumber();

    let report = executor::execute_plan(&rt, "r1", "go", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();

    // Independent s2 still ran; no patch record, no stop.
    assert!(!report.stopped);
    assert_eq!(catalog.calls_for("b"), 1);
    assert_eq!(plan.steps.len(), 2);
    let records = rt.history.list("r1").await.unwrap();
    assert!(!records.iter().any(|r| matches!(r.event, RunEvent::PlanPatch(_))));
}

/// When both repair paths are enabled, the shared per-step retry budget
/// keeps a patch-appended retry and the evaluator's retry mask from both
/// re-running the same step.
#[tokio::test]
async fn test_patch_and_repair_share_retry_budget() {
    let plan_steps = json!([{ "stepId": "s1", "aiName": "a" }]);
    let llm = ScriptedLlm::new()
        .on_function(
            "judge_tool_necessity",
            vec![ChatReply::function_call(
                "judge_tool_necessity",
                json!({"need": true, "summary": "needs the tool"}),
            )],
        )
        .on_function(
            "emit_plan",
            vec![
                ChatReply::function_call("emit_plan", json!({ "steps": plan_steps })),
                ChatReply::function_call("emit_plan", json!({ "steps": plan_steps })),
            ],
        )
        .on_function(
            "emit_plan_patch",
            vec![patch_reply(json!([
                { "op": "append", "steps": [
                    { "aiName": "a", "dependsOnStepIds": ["s1"] }
                ]}
            ]))],
        )
        .on_function(
            "evaluate_run",
            vec![ChatReply::function_call(
                "evaluate_run",
                json!({
                    "success": false,
                    "summary": "first step failed",
                    "failedSteps": [{ "stepId": "s1" }]
                }),
            )],
        )
        .on_plain(vec![ChatReply::text("partially done")])
        .with_fallback(ChatReply::function_call("emit_args", json!({})));

    let catalog = Arc::new(MockCatalog::new().with_tool(
        ScriptedTool::new("a").with_results(vec![
            ToolResult::fail("TOOL_ERROR", "broken"),
            ToolResult::ok(json!({"ok": true})),
        ]),
    ));
    let history = Arc::new(InMemoryHistoryStore::new());
    let runner = PlanRunner::builder()
        .llm(Arc::new(llm))
        .catalog(catalog.clone())
        .history(history.clone())
        .config(patch_config())
        .build()
        .unwrap();

    let outcome = runner
        .plan_then_execute("do it", RunContext::default(), vec![])
        .await
        .unwrap();

    // Original attempt + patch-appended retry; the evaluator found the
    // budget exhausted and did not start a repair pass.
    assert_eq!(catalog.calls_for("a"), 2);
    let records = history.list(&outcome.run_id).await.unwrap();
    assert!(!records
        .iter()
        .any(|r| matches!(r.event, RunEvent::RetryBegin(_))));
    assert!(records
        .iter()
        .any(|r| matches!(r.event, RunEvent::PlanPatch(_))));
}
