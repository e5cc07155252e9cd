//! Run orchestration: `plan_then_execute` and its streaming variant.
//!
//! Flow: judge → (maybe) plan → execute → evaluate → bounded repair
//! loop → optional reflection → summary. Registry bookkeeping and bus
//! teardown happen on every exit path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use futures::stream::BoxStream;
use futures::StreamExt;

use planweave_core::{
    config::AppConfig,
    events::{
        CancelledEvent, CompletedEvent, DoneEvent, EvaluationEvent, HistoryRecord, PlanEvent,
        RetryBeginEvent, RetryDoneEvent, RunEvent, StartEvent, SummaryEvent,
    },
    traits::{
        HistoryStore, LlmClient, PlanMemory, Reranker, RunRegistry, RunStartInfo, ToolCatalog,
    },
    types::{new_run_id, ChatMessage, ExecStats, Plan, RunContext},
    Error, Result,
};
use planweave_store::{ActiveRunRegistry, InMemoryHistoryStore, RunEventBus};

use crate::executor::{self, graph::DepGraph, ExecuteOptions, RecentResult};
use crate::planner;
use crate::prompts;
use crate::runtime::RunnerInner;
use crate::stages::{self, evaluate::evaluate_run, judge::judge_tool_necessity};

/// Final outcome of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub exec: ExecStats,
    pub summary: Option<String>,
    pub cancelled: bool,
}

/// The plan-and-execute runtime front door.
#[derive(Clone)]
pub struct PlanRunner {
    inner: Arc<RunnerInner>,
}

/// Builder for [`PlanRunner`].
#[derive(Default)]
pub struct RunnerBuilder {
    llm: Option<Arc<dyn LlmClient>>,
    catalog: Option<Arc<dyn ToolCatalog>>,
    history: Option<Arc<dyn HistoryStore>>,
    bus: Option<Arc<RunEventBus>>,
    registry: Option<Arc<dyn RunRegistry>>,
    memory: Option<Arc<dyn PlanMemory>>,
    reranker: Option<Arc<dyn Reranker>>,
    config: Option<AppConfig>,
}

impl RunnerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn ToolCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn bus(mut self, bus: Arc<RunEventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn RunRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn PlanMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the runner. The LLM client and tool catalog are required;
    /// stores default to in-memory implementations.
    pub fn build(self) -> Result<PlanRunner> {
        let llm = self
            .llm
            .ok_or_else(|| Error::internal("PlanRunner requires an LLM client"))?;
        let catalog = self
            .catalog
            .ok_or_else(|| Error::internal("PlanRunner requires a tool catalog"))?;

        Ok(PlanRunner {
            inner: Arc::new(RunnerInner {
                llm,
                catalog,
                history: self
                    .history
                    .unwrap_or_else(|| Arc::new(InMemoryHistoryStore::new())),
                bus: self.bus.unwrap_or_else(|| Arc::new(RunEventBus::default())),
                registry: self
                    .registry
                    .unwrap_or_else(|| Arc::new(ActiveRunRegistry::new())),
                memory: self.memory,
                reranker: self.reranker,
                config: self.config.unwrap_or_default(),
            }),
        })
    }
}

impl PlanRunner {
    /// Start building a runner.
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::new()
    }

    /// The event bus (for external subscribers such as the gateway).
    pub fn bus(&self) -> Arc<RunEventBus> {
        Arc::clone(&self.inner.bus)
    }

    /// The history store.
    pub fn history(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.inner.history)
    }

    /// The tool catalog.
    pub fn catalog(&self) -> Arc<dyn ToolCatalog> {
        Arc::clone(&self.inner.catalog)
    }

    /// Request cancellation of a run. Idempotent.
    pub async fn cancel_run(&self, run_id: &str) -> bool {
        self.inner.registry.request_cancel(run_id).await
    }

    /// Run an objective to completion and return the outcome.
    pub async fn plan_then_execute(
        &self,
        objective: impl Into<String>,
        ctx: RunContext,
        conversation: Vec<ChatMessage>,
    ) -> Result<RunOutcome> {
        let run_id = new_run_id();
        self.run(run_id, objective.into(), ctx, conversation).await
    }

    /// Run an objective in the background and stream its events. The
    /// stream ends at the first terminal event (`completed`, `summary`,
    /// or `cancelled`) or when the run's channel closes.
    pub async fn plan_then_execute_stream(
        &self,
        objective: impl Into<String>,
        ctx: RunContext,
        conversation: Vec<ChatMessage>,
    ) -> (String, BoxStream<'static, RunEvent>) {
        let run_id = new_run_id();
        let subscription = self.inner.bus.subscribe(&run_id);

        let producer = self.clone();
        let producer_run_id = run_id.clone();
        let objective = objective.into();
        tokio::spawn(async move {
            if let Err(e) = producer
                .run(producer_run_id.clone(), objective, ctx, conversation)
                .await
            {
                tracing::warn!(run_id = %producer_run_id, error = %e, "Run failed");
            }
        });

        let stream = futures::stream::unfold(
            (subscription, false),
            |(mut subscription, done)| async move {
                if done {
                    return None;
                }
                let event = subscription.next().await?;
                let terminal = event.is_terminal();
                Some((event, (subscription, terminal)))
            },
        )
        .boxed();

        (run_id, stream)
    }

    /// Run with a caller-chosen run id. Registry and bus teardown happen
    /// on every exit path.
    pub async fn run(
        &self,
        run_id: String,
        objective: String,
        ctx: RunContext,
        conversation: Vec<ChatMessage>,
    ) -> Result<RunOutcome> {
        let info = RunStartInfo {
            run_id: run_id.clone(),
            channel_id: ctx.channel_id.clone(),
            identity_key: ctx.identity_key.clone(),
            objective: objective.clone(),
        };
        self.inner.registry.register_run_start(info.clone()).await;

        let result = self
            .run_inner(&run_id, &objective, ctx, conversation, &info)
            .await;

        if let Err(e) = &result {
            self.inner
                .emit(
                    &run_id,
                    RunEvent::Done(DoneEvent {
                        exec: None,
                        error: Some(e.to_string()),
                    }),
                )
                .await;
        }

        let cancelled = matches!(&result, Ok(outcome) if outcome.cancelled);
        self.inner.registry.mark_run_finished(&run_id, cancelled).await;
        self.inner.registry.clear_run_cancelled(&run_id).await;
        self.inner.registry.remove_run(&run_id).await;
        self.inner.bus.close(&run_id);

        result
    }

    async fn run_inner(
        &self,
        run_id: &str,
        objective: &str,
        mut ctx: RunContext,
        conversation: Vec<ChatMessage>,
        info: &RunStartInfo,
    ) -> Result<RunOutcome> {
        let rt = &*self.inner;
        let flags = &rt.config.flags;
        let runner_cfg = &rt.config.runner;

        tracing::info!(run_id = %run_id, objective = %objective, "Run starting");
        rt.emit(
            run_id,
            RunEvent::Start(StartEvent {
                run_id: run_id.to_string(),
                objective: objective.to_string(),
                channel_id: ctx.channel_id.clone(),
                identity_key: ctx.identity_key.clone(),
            }),
        )
        .await;

        // Make sibling runs visible to the planner.
        if let Some(overlay) = rt.registry.build_concurrency_overlay(info).await {
            ctx.overlays.global = Some(match ctx.overlays.global.take() {
                Some(global) => format!("{}\n\n{}", global, overlay),
                None => overlay,
            });
        }

        // Judge.
        let tools = rt.catalog.available_tools().await?;
        let judge = judge_tool_necessity(rt, objective, &ctx, &conversation, &tools).await;
        rt.emit(run_id, RunEvent::Judge(judge.clone())).await;

        if !judge.ok {
            return Err(Error::judge_failed(judge.summary));
        }
        if !judge.need {
            return self.finish_without_tools(run_id, true).await;
        }
        if !judge.tool_names.is_empty() {
            ctx.judge.tool_names = Some(judge.tool_names.clone());
        }
        if rt.registry.is_run_cancelled(run_id).await {
            return self.finish_cancelled(run_id, ExecStats::default()).await;
        }

        // Plan. Planner infrastructure errors degrade to an empty plan.
        let mut plan =
            match planner::generate_plan(rt, Some(run_id), objective, &ctx, &conversation).await {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "Planning failed; using empty plan");
                    Plan::default()
                }
            };
        rt.emit(run_id, RunEvent::Plan(PlanEvent::from_plan(&plan))).await;
        if let Err(e) = rt.history.set_plan(run_id, &plan).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to persist plan");
        }
        if rt.registry.is_run_cancelled(run_id).await {
            return self.finish_cancelled(run_id, ExecStats::default()).await;
        }
        if plan.is_empty() {
            return self.finish_without_tools(run_id, false).await;
        }

        // Execute.
        let retry_budget: Arc<StdMutex<HashMap<String, usize>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let report = executor::execute_plan(
            rt,
            run_id,
            objective,
            &mut plan,
            ExecuteOptions {
                conversation: conversation.clone(),
                context: ctx.clone(),
                retry_budget: Arc::clone(&retry_budget),
                ..Default::default()
            },
        )
        .await?;
        let mut exec = report.stats;
        let mut attempts = 1;
        if report.cancelled {
            return self.finish_cancelled(run_id, exec).await;
        }

        // Evaluate + bounded repair loop.
        let mut last_eval: Option<EvaluationEvent> = None;
        if flags.enable_eval {
            let mut repairs = 0;
            loop {
                let records = rt.history.list(run_id).await.unwrap_or_default();
                let Some(eval) = evaluate_run(rt, objective, &ctx, &records).await else {
                    break;
                };
                rt.emit(run_id, RunEvent::Evaluation(eval.clone())).await;
                let verdict_success = eval.success;
                let failed = eval.failed_steps.clone();
                last_eval = Some(eval);

                if verdict_success
                    || failed.is_empty()
                    || !runner_cfg.enable_repair
                    || repairs >= runner_cfg.max_repairs
                {
                    break;
                }

                // Map failed ids to indices, consuming the shared retry
                // budget so a patch-appended retry and this pass cannot
                // both re-run the same step.
                let mut seeds: Vec<usize> = Vec::new();
                {
                    let mut budget = retry_budget.lock().unwrap();
                    for failed_step in &failed {
                        let Some(index) = plan.index_of(&failed_step.step_id) else {
                            continue;
                        };
                        let remaining = budget
                            .entry(failed_step.step_id.clone())
                            .or_insert(runner_cfg.retry_budget_per_step);
                        if *remaining == 0 {
                            tracing::debug!(
                                step_id = %failed_step.step_id,
                                "Retry budget exhausted; not re-running"
                            );
                            continue;
                        }
                        *remaining -= 1;
                        seeds.push(index);
                    }
                }
                if seeds.is_empty() {
                    break;
                }

                // Re-run every transitive dependent of a failure.
                let chain = DepGraph::build(&plan).downstream_closure(&seeds);
                let chain_ids: Vec<String> = chain
                    .iter()
                    .map(|&i| plan.steps[i].step_id.clone())
                    .collect();
                repairs += 1;
                attempts += 1;
                rt.emit(
                    run_id,
                    RunEvent::RetryBegin(RetryBeginEvent {
                        attempt: repairs,
                        step_ids: chain_ids,
                    }),
                )
                .await;

                let report = executor::execute_plan(
                    rt,
                    run_id,
                    objective,
                    &mut plan,
                    ExecuteOptions {
                        retry_steps: Some(chain.into_iter().collect::<HashSet<_>>()),
                        seed_recent: seed_recent_from(&records),
                        conversation: conversation.clone(),
                        context: ctx.clone(),
                        retry_budget: Arc::clone(&retry_budget),
                        ..Default::default()
                    },
                )
                .await?;
                if report.cancelled {
                    return self.finish_cancelled(run_id, exec).await;
                }

                let records = rt.history.list(run_id).await.unwrap_or_default();
                exec = exec_stats_from_history(&records);
                rt.emit(
                    run_id,
                    RunEvent::RetryDone(RetryDoneEvent {
                        attempt: repairs,
                        exec,
                    }),
                )
                .await;
            }
        }

        // Reflection: supplement missing operations.
        let incomplete = last_eval.as_ref().map(|e| e.incomplete).unwrap_or(false);
        if flags.enable_reflection && incomplete {
            for round in 1..=flags.reflection_max_supplements.max(1) {
                let records = rt.history.list(run_id).await.unwrap_or_default();
                let Some(reflection) =
                    stages::reflect::check_task_completeness(rt, objective, &ctx, &records).await
                else {
                    break;
                };
                rt.emit(run_id, RunEvent::Reflection(reflection.clone())).await;
                if reflection.is_complete || reflection.supplements.is_empty() {
                    break;
                }

                let supp_objective =
                    stages::reflect::supplement_objective(objective, &records, &reflection.supplements);
                let mut supp_plan = match planner::generate_plan(
                    rt,
                    Some(run_id),
                    &supp_objective,
                    &ctx,
                    &conversation,
                )
                .await
                {
                    Ok(plan) => plan,
                    Err(e) => {
                        tracing::warn!(error = %e, "Supplementary planning failed");
                        break;
                    }
                };
                if supp_plan.is_empty() {
                    break;
                }
                // Supplementary steps execute independently.
                supp_plan.strip_dependencies();
                supp_plan.renumber();
                rt.emit(
                    run_id,
                    RunEvent::ReflectionPlan(PlanEvent::from_plan(&supp_plan)),
                )
                .await;

                let report = executor::execute_plan(
                    rt,
                    run_id,
                    objective,
                    &mut supp_plan,
                    ExecuteOptions {
                        seed_recent: seed_recent_from(&records),
                        conversation: conversation.clone(),
                        context: ctx.clone(),
                        retry_budget: Arc::clone(&retry_budget),
                        ..Default::default()
                    },
                )
                .await?;
                if report.cancelled {
                    return self.finish_cancelled(run_id, exec).await;
                }

                let records = rt.history.list(run_id).await.unwrap_or_default();
                exec = exec_stats_from_history(&records);
                rt.emit(
                    run_id,
                    RunEvent::ReflectionExec(RetryDoneEvent {
                        attempt: round,
                        exec,
                    }),
                )
                .await;
            }
        }

        rt.emit(
            run_id,
            RunEvent::Done(DoneEvent {
                exec: Some(exec),
                error: None,
            }),
        )
        .await;

        // Summary.
        let success = last_eval
            .as_ref()
            .map(|e| e.success)
            .unwrap_or(exec.attempted == exec.succeeded);
        if flags.enable_summary {
            let records = rt.history.list(run_id).await.unwrap_or_default();
            let summary = stages::summarize::summarize_run(rt, objective, &ctx, &records).await;
            if let Err(e) = rt.history.set_summary(run_id, &summary).await {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to persist summary");
            }
            rt.emit(
                run_id,
                RunEvent::Summary(SummaryEvent {
                    summary: summary.clone(),
                    success,
                    error: None,
                    attempts,
                }),
            )
            .await;
            Ok(RunOutcome {
                run_id: run_id.to_string(),
                exec,
                summary: Some(summary),
                cancelled: false,
            })
        } else {
            rt.emit(run_id, RunEvent::Completed(CompletedEvent { exec })).await;
            Ok(RunOutcome {
                run_id: run_id.to_string(),
                exec,
                summary: None,
                cancelled: false,
            })
        }
    }

    /// Terminal path for runs the judge declared tool-free (or where no
    /// plan could be produced).
    async fn finish_without_tools(&self, run_id: &str, emit_plan: bool) -> Result<RunOutcome> {
        let rt = &*self.inner;
        let exec = ExecStats::default();

        if emit_plan {
            rt.emit(
                run_id,
                RunEvent::Plan(PlanEvent {
                    steps: Vec::new(),
                    manifest_size: 0,
                }),
            )
            .await;
        }
        rt.emit(
            run_id,
            RunEvent::Done(DoneEvent {
                exec: Some(exec),
                error: None,
            }),
        )
        .await;

        let summary = prompts::NO_TOOLS_SUMMARY.to_string();
        if rt.config.flags.enable_summary {
            if let Err(e) = rt.history.set_summary(run_id, &summary).await {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to persist summary");
            }
            rt.emit(
                run_id,
                RunEvent::Summary(SummaryEvent {
                    summary: summary.clone(),
                    success: true,
                    error: None,
                    attempts: 1,
                }),
            )
            .await;
        } else {
            rt.emit(run_id, RunEvent::Completed(CompletedEvent { exec })).await;
        }

        Ok(RunOutcome {
            run_id: run_id.to_string(),
            exec,
            summary: Some(summary),
            cancelled: false,
        })
    }

    /// Terminal path for cancelled runs: no evaluation, no reflection,
    /// no summary.
    async fn finish_cancelled(&self, run_id: &str, exec: ExecStats) -> Result<RunOutcome> {
        tracing::info!(run_id = %run_id, "Run cancelled");
        self.inner
            .emit(run_id, RunEvent::Cancelled(CancelledEvent { reason: None }))
            .await;
        Ok(RunOutcome {
            run_id: run_id.to_string(),
            exec,
            summary: None,
            cancelled: true,
        })
    }
}

/// Rebuild aggregate stats from every recorded terminal tool result
/// (latest result per step wins).
pub fn exec_stats_from_history(records: &[HistoryRecord]) -> ExecStats {
    let mut latest: HashMap<String, bool> = HashMap::new();
    for event in stages::flatten_tool_results(records) {
        if event.result.is_cooldown() {
            continue;
        }
        latest.insert(event.step_id.clone(), event.result.success);
    }
    ExecStats::from_counts(latest.len(), latest.values().filter(|s| **s).count())
}

/// Successful results recorded so far, as seed for the recent window of a
/// retry pass.
pub fn seed_recent_from(records: &[HistoryRecord]) -> Vec<RecentResult> {
    stages::flatten_tool_results(records)
        .into_iter()
        .filter(|e| e.result.success && !e.result.is_cooldown())
        .map(|e| RecentResult {
            step_id: e.step_id.clone(),
            ai_name: e.ai_name.clone(),
            args: e.args.clone(),
            result: e.result.clone(),
        })
        .collect()
}
