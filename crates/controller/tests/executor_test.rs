//! Executor integration tests: grouping, ordered flushing, cooldown,
//! caps, cancellation, and short-circuit codes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use planweave_controller::executor::{self, ExecuteOptions};
use planweave_controller::RunnerInner;
use planweave_core::{
    config::AppConfig,
    events::{ResultStatus, RunEvent, ToolResultEvent},
    mocks::{MockCatalog, ScriptedLlm, ScriptedTool},
    traits::{ChatReply, HistoryStore, LlmClient, RunRegistry, ToolCallCtx, ToolCatalog},
    types::{codes, Plan, Step, ToolDescriptor, ToolResult},
    Result,
};
use planweave_store::{ActiveRunRegistry, InMemoryHistoryStore, RunEventBus};

fn runner(llm: impl LlmClient + 'static, catalog: impl ToolCatalog + 'static) -> RunnerInner {
    RunnerInner {
        llm: Arc::new(llm),
        catalog: Arc::new(catalog),
        history: Arc::new(InMemoryHistoryStore::new()),
        bus: Arc::new(RunEventBus::default()),
        registry: Arc::new(ActiveRunRegistry::new()),
        memory: None,
        reranker: None,
        config: AppConfig::default(),
    }
}

/// LLM whose every ArgGen call emits `{}` (valid against the permissive
/// scripted-tool schema).
fn arggen_llm() -> ScriptedLlm {
    ScriptedLlm::new().with_fallback(ChatReply::function_call("emit_args", json!({})))
}

fn step(id: &str, ai_name: &str, deps: &[&str]) -> Step {
    let mut s = Step::new(ai_name);
    s.step_id = id.to_string();
    s.depends_on_step_ids = deps.iter().map(|d| d.to_string()).collect();
    s
}

fn plan_of(manifest: &MockCatalogView, steps: Vec<Step>) -> Plan {
    let mut plan = Plan::new(manifest.0.clone(), steps);
    plan.renumber();
    plan
}

struct MockCatalogView(Vec<ToolDescriptor>);

async fn manifest_of(catalog: &dyn ToolCatalog) -> MockCatalogView {
    MockCatalogView(catalog.available_tools_detailed().await.unwrap())
}

async fn events_of(rt: &RunnerInner, run_id: &str) -> Vec<RunEvent> {
    rt.history
        .list(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.event)
        .collect()
}

fn all_results(events: &[RunEvent]) -> Vec<ToolResultEvent> {
    let mut out = Vec::new();
    for event in events {
        match event {
            RunEvent::ToolResult(e) => out.push(e.clone()),
            RunEvent::ToolResultGroup(g) => out.extend(g.events.iter().cloned()),
            _ => {}
        }
    }
    out
}

fn finals(events: &[RunEvent]) -> usize {
    all_results(events)
        .iter()
        .filter(|e| e.result_status == Some(ResultStatus::Final))
        .count()
}

#[tokio::test]
async fn test_linear_two_step_group_flushes_once() {
    let catalog = MockCatalog::new()
        .with_tool(ScriptedTool::new("a"))
        .with_tool(ScriptedTool::new("b"));
    let rt = runner(arggen_llm(), catalog);

    let manifest = manifest_of(rt.catalog.as_ref()).await;
    let mut plan = plan_of(
        &manifest,
        vec![step("s1", "a", &[]), step("s2", "b", &["s1"])],
    );

    let report = executor::execute_plan(&rt, "r1", "do both", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(report.stats.attempted, 2);
    assert_eq!(report.stats.succeeded, 2);
    assert!(report.stats.used);

    let events = events_of(&rt, "r1").await;
    let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["args_group", "tool_result_group"]);

    match (&events[0], &events[1]) {
        (RunEvent::ArgsGroup(args), RunEvent::ToolResultGroup(group)) => {
            assert_eq!(args.group_id, group.group_id);
            assert_eq!(group.events.len(), 2);
            // Topological order, s2 last and final.
            assert_eq!(group.events[0].step_id, "s1");
            assert_eq!(group.events[1].step_id, "s2");
            assert_eq!(group.events[0].execution_index, 0);
            assert_eq!(group.events[1].execution_index, 1);
            assert_eq!(group.events[0].result_status, Some(ResultStatus::Progress));
            assert_eq!(group.events[1].result_status, Some(ResultStatus::Final));
            assert_eq!(group.result_status, Some(ResultStatus::Final));
            assert_eq!(group.events[0].depended_by_step_ids, vec!["s2".to_string()]);
            assert_eq!(group.events[0].group_size, 2);
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

#[tokio::test]
async fn test_isolated_steps_stream_immediately_one_final() {
    let catalog = MockCatalog::new()
        .with_tool(ScriptedTool::new("a"))
        .with_tool(ScriptedTool::new("b"));
    let rt = runner(arggen_llm(), catalog);

    let manifest = manifest_of(rt.catalog.as_ref()).await;
    let mut plan = plan_of(&manifest, vec![step("s1", "a", &[]), step("s2", "b", &[])]);

    executor::execute_plan(&rt, "r1", "both", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();

    let events = events_of(&rt, "r1").await;
    let results = all_results(&events);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.result_stream));
    assert_eq!(finals(&events), 1);

    // Dense, monotonically increasing execution indices.
    let mut indices: Vec<u64> = results.iter().map(|r| r.execution_index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1]);

    // Every result has a preceding args event for the same step.
    for result in &results {
        let args_pos = events.iter().position(|e| {
            matches!(e, RunEvent::Args(a) if a.step_id == result.step_id)
        });
        let result_pos = events.iter().position(|e| {
            matches!(e, RunEvent::ToolResult(r) if r.step_id == result.step_id)
        });
        assert!(args_pos.unwrap() < result_pos.unwrap());
    }
}

#[tokio::test]
async fn test_cooldown_requeues_with_jittered_backoff() {
    let catalog = MockCatalog::new().with_tool(
        ScriptedTool::new("a").with_results(vec![
            ToolResult::cooldown(500),
            ToolResult::ok(json!({"done": true})),
        ]),
    );
    let rt = runner(arggen_llm(), catalog);

    let manifest = manifest_of(rt.catalog.as_ref()).await;
    let mut plan = plan_of(&manifest, vec![step("s1", "a", &[])]);

    let started = Instant::now();
    let report = executor::execute_plan(&rt, "r1", "go", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Re-dispatch waits at least remain + min jitter.
    assert!(elapsed >= Duration::from_millis(600), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);

    // One step, attempted once (the cooldown round does not count).
    assert_eq!(report.stats.attempted, 1);
    assert_eq!(report.stats.succeeded, 1);

    let events = events_of(&rt, "r1").await;
    let results = all_results(&events);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].result.code, codes::COOLDOWN_ACTIVE);
    assert_eq!(results[0].result_status, Some(ResultStatus::Progress));
    assert!(results[1].result.success);
    assert_eq!(results[1].result_status, Some(ResultStatus::Final));
    assert_eq!(results[0].execution_index, 0);
    assert_eq!(results[1].execution_index, 1);

    // Two args events for the same step id, one per dispatch.
    let args_count = events
        .iter()
        .filter(|e| matches!(e, RunEvent::Args(a) if a.step_id == "s1"))
        .count();
    assert_eq!(args_count, 2);
}

#[tokio::test]
async fn test_unknown_tool_yields_not_found() {
    let catalog = MockCatalog::new().with_tool(ScriptedTool::new("a"));
    let rt = runner(arggen_llm(), catalog);

    let manifest = manifest_of(rt.catalog.as_ref()).await;
    let mut plan = plan_of(&manifest, vec![step("s1", "ghost", &[])]);

    let report = executor::execute_plan(&rt, "r1", "go", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(report.stats.attempted, 1);
    assert_eq!(report.stats.succeeded, 0);

    let events = events_of(&rt, "r1").await;
    let results = all_results(&events);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result.code, codes::NOT_FOUND);
    assert!(!results[0].result.success);
}

#[tokio::test]
async fn test_skipped_step_never_dispatches() {
    let catalog = Arc::new(
        MockCatalog::new()
            .with_tool(ScriptedTool::new("a"))
            .with_tool(ScriptedTool::new("b")),
    );
    let rt = RunnerInner {
        llm: Arc::new(arggen_llm()),
        catalog: catalog.clone(),
        history: Arc::new(InMemoryHistoryStore::new()),
        bus: Arc::new(RunEventBus::default()),
        registry: Arc::new(ActiveRunRegistry::new()),
        memory: None,
        reranker: None,
        config: AppConfig::default(),
    };

    let manifest = manifest_of(rt.catalog.as_ref()).await;
    let mut skipped = step("s1", "a", &[]);
    skipped.skip = true;
    let mut plan = plan_of(&manifest, vec![skipped, step("s2", "b", &[])]);

    let report = executor::execute_plan(&rt, "r1", "go", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(report.stats.attempted, 1);
    assert_eq!(catalog.calls_for("a"), 0);
    assert_eq!(catalog.calls_for("b"), 1);

    let events = events_of(&rt, "r1").await;
    let results = all_results(&events);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].step_id, "s2");
    assert_eq!(finals(&events), 1);
}

#[tokio::test]
async fn test_retry_mode_skips_downstream_of_failure() {
    let catalog = MockCatalog::new()
        .with_tool(ScriptedTool::new("a").with_results(vec![ToolResult::fail(
            codes::TOOL_ERROR,
            "still broken",
        )]))
        .with_tool(ScriptedTool::new("b"));
    let rt = runner(arggen_llm(), catalog);

    let manifest = manifest_of(rt.catalog.as_ref()).await;
    let mut plan = plan_of(
        &manifest,
        vec![step("s1", "a", &[]), step("s2", "b", &["s1"])],
    );

    let report = executor::execute_plan(
        &rt,
        "r1",
        "go",
        &mut plan,
        ExecuteOptions {
            retry_steps: Some(HashSet::from([0, 1])),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(report.stats.attempted, 2);
    assert_eq!(report.stats.succeeded, 0);

    let events = events_of(&rt, "r1").await;
    let results = all_results(&events);
    let s2 = results.iter().find(|r| r.step_id == "s2").unwrap();
    assert_eq!(s2.result.code, codes::SKIP_UPSTREAM_FAILED);
    assert!(s2.result.message.as_deref().unwrap().contains("s1"));
}

/// Catalog that records the maximum number of concurrent in-flight
/// calls.
struct ConcurrencyProbe {
    tools: Vec<ToolDescriptor>,
    current: AtomicUsize,
    max_seen: AtomicUsize,
    delay: Duration,
}

impl ConcurrencyProbe {
    fn new(names: &[&str], delay: Duration) -> Self {
        Self {
            tools: names
                .iter()
                .map(|n| ToolDescriptor {
                    ai_name: n.to_string(),
                    description: format!("{} probe", n),
                    input_schema: json!({"type": "object", "additionalProperties": true}),
                    provider: None,
                    meta: None,
                })
                .collect(),
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            delay,
        }
    }

    fn max_seen(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolCatalog for ConcurrencyProbe {
    async fn available_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.tools.clone())
    }

    async fn available_tools_detailed(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.tools.clone())
    }

    async fn call_by_ai_name(
        &self,
        _ai_name: &str,
        _args: Value,
        _ctx: ToolCallCtx,
    ) -> Result<ToolResult> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolResult::ok(Value::Null))
    }
}

#[tokio::test]
async fn test_per_tool_cap_serializes_same_tool() {
    let probe = Arc::new(ConcurrencyProbe::new(&["a"], Duration::from_millis(50)));
    let mut rt = RunnerInner {
        llm: Arc::new(arggen_llm()),
        catalog: probe.clone(),
        history: Arc::new(InMemoryHistoryStore::new()),
        bus: Arc::new(RunEventBus::default()),
        registry: Arc::new(ActiveRunRegistry::new()),
        memory: None,
        reranker: None,
        config: AppConfig::default(),
    };
    rt.config.planner.max_concurrency = 8;

    let manifest = MockCatalogView(probe.available_tools().await.unwrap());
    let mut plan = plan_of(
        &manifest,
        vec![
            step("s1", "a", &[]),
            step("s2", "a", &[]),
            step("s3", "a", &[]),
        ],
    );

    executor::execute_plan(&rt, "r1", "go", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();

    // Default per-tool cap is 1.
    assert_eq!(probe.max_seen(), 1);
}

#[tokio::test]
async fn test_global_cap_bounds_fanout() {
    let probe = Arc::new(ConcurrencyProbe::new(
        &["a", "b", "c", "d", "e"],
        Duration::from_millis(50),
    ));
    let mut rt = RunnerInner {
        llm: Arc::new(arggen_llm()),
        catalog: probe.clone(),
        history: Arc::new(InMemoryHistoryStore::new()),
        bus: Arc::new(RunEventBus::default()),
        registry: Arc::new(ActiveRunRegistry::new()),
        memory: None,
        reranker: None,
        config: AppConfig::default(),
    };
    rt.config.planner.max_concurrency = 2;

    let manifest = MockCatalogView(probe.available_tools().await.unwrap());
    let mut plan = plan_of(
        &manifest,
        vec![
            step("s1", "a", &[]),
            step("s2", "b", &[]),
            step("s3", "c", &[]),
            step("s4", "d", &[]),
            step("s5", "e", &[]),
        ],
    );

    let report = executor::execute_plan(&rt, "r1", "go", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(report.stats.attempted, 5);
    assert!(probe.max_seen() <= 2, "max concurrent {}", probe.max_seen());
}

/// Catalog that cancels the run from inside the first tool call.
struct CancellingCatalog {
    tools: Vec<ToolDescriptor>,
    registry: Arc<ActiveRunRegistry>,
    calls: StdMutex<HashMap<String, usize>>,
}

impl CancellingCatalog {
    fn new(registry: Arc<ActiveRunRegistry>) -> Self {
        Self {
            tools: ["a", "b"]
                .iter()
                .map(|n| ToolDescriptor {
                    ai_name: n.to_string(),
                    description: format!("{} tool", n),
                    input_schema: json!({"type": "object", "additionalProperties": true}),
                    provider: None,
                    meta: None,
                })
                .collect(),
            registry,
            calls: StdMutex::new(HashMap::new()),
        }
    }

    fn calls_for(&self, ai_name: &str) -> usize {
        self.calls.lock().unwrap().get(ai_name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ToolCatalog for CancellingCatalog {
    async fn available_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.tools.clone())
    }

    async fn available_tools_detailed(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.tools.clone())
    }

    async fn call_by_ai_name(
        &self,
        ai_name: &str,
        _args: Value,
        ctx: ToolCallCtx,
    ) -> Result<ToolResult> {
        *self.calls.lock().unwrap().entry(ai_name.to_string()).or_insert(0) += 1;
        // First tool cancels the run after "replying".
        self.registry.request_cancel(&ctx.run_id).await;
        Ok(ToolResult::ok(json!({"from": ai_name})))
    }
}

#[tokio::test]
async fn test_cancellation_stops_dispatch_and_never_emits_final() {
    let registry = Arc::new(ActiveRunRegistry::new());
    let catalog = Arc::new(CancellingCatalog::new(registry.clone()));
    let rt = RunnerInner {
        llm: Arc::new(arggen_llm()),
        catalog: catalog.clone(),
        history: Arc::new(InMemoryHistoryStore::new()),
        bus: Arc::new(RunEventBus::default()),
        registry: registry.clone(),
        memory: None,
        reranker: None,
        config: AppConfig::default(),
    };

    use planweave_core::traits::RunStartInfo;
    registry
        .register_run_start(RunStartInfo {
            run_id: "r1".to_string(),
            ..Default::default()
        })
        .await;

    let manifest = MockCatalogView(catalog.available_tools().await.unwrap());
    let mut plan = plan_of(
        &manifest,
        vec![step("s1", "a", &[]), step("s2", "b", &["s1"])],
    );

    let report = executor::execute_plan(&rt, "r1", "go", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(catalog.calls_for("a"), 1);
    assert_eq!(catalog.calls_for("b"), 0);

    let events = events_of(&rt, "r1").await;
    // The buffered s1 result is force-flushed as a progress singleton.
    assert_eq!(finals(&events), 0);
    let results = all_results(&events);
    let s1 = results.iter().find(|r| r.step_id == "s1").unwrap();
    assert!(s1.result.success);
    assert_eq!(s1.result_status, Some(ResultStatus::Progress));
}

#[tokio::test]
async fn test_single_step_pre_reply_skip_tool_omits_completion() {
    let catalog = MockCatalog::new().with_tool(ScriptedTool::new("a"));
    let mut rt = runner(arggen_llm(), catalog);
    rt.config.flags.tool_pre_reply_single_skip_tools = vec!["a".to_string()];

    let manifest = manifest_of(rt.catalog.as_ref()).await;
    let mut plan = plan_of(&manifest, vec![step("s1", "a", &[])]);

    executor::execute_plan(&rt, "r1", "go", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();

    let events = events_of(&rt, "r1").await;
    let results = all_results(&events);
    assert!(results[0].result.success);
    assert!(results[0].completion.is_none());
}

#[tokio::test]
async fn test_schedule_argument_defers_execution() {
    let schedule_schema = json!({
        "type": "object",
        "properties": {
            "content": { "type": "string" },
            "schedule": { "type": "object" }
        },
        "additionalProperties": true
    });
    let catalog =
        MockCatalog::new().with_tool(ScriptedTool::new("remind").with_schema(schedule_schema));
    let llm = ScriptedLlm::new().with_fallback(ChatReply::function_call(
        "emit_args",
        json!({"content": "tea", "schedule": {"text": "in 2 hours"}}),
    ));
    let rt = runner(llm, catalog);

    let manifest = manifest_of(rt.catalog.as_ref()).await;
    let mut plan = plan_of(&manifest, vec![step("s1", "remind", &[])]);

    let report = executor::execute_plan(&rt, "r1", "remind me", &mut plan, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(report.stats.attempted, 1);
    assert_eq!(report.stats.succeeded, 1);

    let events = events_of(&rt, "r1").await;
    let choice = events
        .iter()
        .find_map(|e| match e {
            RunEvent::ToolChoice(c) => Some(c.clone()),
            _ => None,
        })
        .expect("tool_choice event");
    assert_eq!(choice.status, "scheduled");
    assert!(choice.delay_ms > 0);

    let results = all_results(&events);
    assert_eq!(results[0].result.code, codes::SCHEDULED);
    assert!(results[0].result.success);
    assert_eq!(results[0].result.data["scheduled"], true);
    // The placeholder carries no terminal completion marker.
    assert!(results[0].completion.is_none());
}
