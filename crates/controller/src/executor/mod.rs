//! The dependency-group executor.
//!
//! A single-owner cooperative scheduler drives one plan: step pipelines
//! (arg-gen, validation, schedule detection, dispatch) run as independent
//! tasks and report back through an inbox; the scheduler loop is the only
//! mutator of plan, graph, and buffer state.

pub mod graph;
pub mod schedule_arg;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;

use planweave_core::{
    events::{
        ArgsEvent, ArgsGroupEvent, CompletionNote, ResultStatus, RunEvent, StageErrorEvent,
        ToolChoiceEvent, ToolResultEvent, ToolResultGroupEvent,
    },
    traits::{LlmClient, RunRegistry, ToolCallCtx, ToolCatalog},
    types::{codes, ChatMessage, ExecStats, Plan, RunContext, Step, ToolDescriptor, ToolResult},
    Result,
};

use crate::patch::{self, PatchDecision, PatchRequest};
use crate::runtime::RunnerInner;
use crate::stages::arg_gen::{self, ArgCache};
use self::graph::DepGraph;

/// Scheduler poll tick: upper bound on how late cancellation and
/// cooldown wake-ups are observed.
const POLL_TICK: Duration = Duration::from_millis(100);

/// One entry of the rolling recent-results window.
#[derive(Debug, Clone)]
pub struct RecentResult {
    pub step_id: String,
    pub ai_name: String,
    pub args: Value,
    pub result: ToolResult,
}

/// Options for one `execute_plan` invocation.
pub struct ExecuteOptions {
    /// Steps before this index are treated as already finished.
    pub start_index: usize,
    /// Retry mask: only these indices run; everything else is treated as
    /// finished. Enables retry-mode semantics (no arg reuse, upstream
    /// failure propagation).
    pub retry_steps: Option<HashSet<usize>>,
    /// Seed for the rolling recent-results window.
    pub seed_recent: Vec<RecentResult>,
    /// Prior conversation forwarded to ArgGen.
    pub conversation: Vec<ChatMessage>,
    /// Caller context.
    pub context: RunContext,
    /// Per-step retry budget, shared with the outer repair loop.
    pub retry_budget: Arc<StdMutex<HashMap<String, usize>>>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            start_index: 0,
            retry_steps: None,
            seed_recent: Vec::new(),
            conversation: Vec::new(),
            context: RunContext::default(),
            retry_budget: Arc::new(StdMutex::new(HashMap::new())),
        }
    }
}

/// Outcome of one `execute_plan` invocation.
#[derive(Debug, Clone)]
pub struct ExecReport {
    pub stats: ExecStats,
    pub cancelled: bool,
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    Finished,
}

#[derive(Debug, Clone)]
struct StepState {
    phase: Phase,
    short_circuited: bool,
    delay_until: Option<Instant>,
}

impl StepState {
    fn pending() -> Self {
        Self {
            phase: Phase::Pending,
            short_circuited: false,
            delay_until: None,
        }
    }

    fn pre_finished() -> Self {
        Self {
            phase: Phase::Finished,
            short_circuited: true,
            delay_until: None,
        }
    }
}

#[derive(Default)]
struct GroupBuffer {
    args: Vec<ArgsEvent>,
    results: Vec<ToolResultEvent>,
}

enum StepMsg {
    Args { index: usize, event: ArgsEvent },
    ToolChoice(ToolChoiceEvent),
    ArggenError(StageErrorEvent),
    ToolError(StageErrorEvent),
    Completed { index: usize, outcome: StepOutcome },
}

struct StepOutcome {
    args: Value,
    result: ToolResult,
    elapsed_ms: u64,
    completion: Option<CompletionNote>,
}

/// Execute a plan. Emits the dense event stream on the bus and mirrors
/// every event to the history store; returns aggregate stats.
pub async fn execute_plan(
    rt: &RunnerInner,
    run_id: &str,
    objective: &str,
    plan: &mut Plan,
    options: ExecuteOptions,
) -> Result<ExecReport> {
    if plan.steps.is_empty() {
        return Ok(ExecReport {
            stats: ExecStats::from_counts(0, 0),
            cancelled: false,
            stopped: false,
        });
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(rt, run_id, objective, plan, options, tx).await?;
    scheduler.run(rx).await
}

struct Scheduler<'a> {
    rt: &'a RunnerInner,
    run_id: String,
    objective: String,
    conversation: Arc<Vec<ChatMessage>>,
    context: RunContext,
    retry_mask: Option<HashSet<usize>>,
    retry_budget: Arc<StdMutex<HashMap<String, usize>>>,

    plan: &'a mut Plan,
    graph: DepGraph,
    states: Vec<StepState>,
    results: Vec<Option<ToolResult>>,
    catalog_map: HashMap<String, ToolDescriptor>,

    recent: VecDeque<RecentResult>,
    arg_cache: Option<Arc<ArgCache>>,

    running: usize,
    tool_running: HashMap<String, usize>,
    provider_running: HashMap<String, usize>,

    group_pending: Vec<usize>,
    group_buffers: HashMap<usize, GroupBuffer>,
    groups_flushed: Vec<bool>,

    exec_index: u64,
    terminal_emitted: usize,
    final_emitted: bool,

    attempted: usize,
    succeeded: usize,
    dispatched_any: bool,

    known_failed: HashSet<usize>,
    pending_patch: Option<PatchRequest>,
    patch_calls: usize,
    patches_applied: usize,
    stop_requested: bool,
    cancelled: bool,

    tx: mpsc::UnboundedSender<StepMsg>,
}

impl<'a> Scheduler<'a> {
    async fn new(
        rt: &'a RunnerInner,
        run_id: &str,
        objective: &str,
        plan: &'a mut Plan,
        options: ExecuteOptions,
        tx: mpsc::UnboundedSender<StepMsg>,
    ) -> Result<Self> {
        let catalog_map: HashMap<String, ToolDescriptor> = rt
            .catalog
            .available_tools_detailed()
            .await?
            .into_iter()
            .map(|t| (t.ai_name.clone(), t))
            .collect();

        // The execution index is run-wide: a retry pass continues where
        // the previous pass left off.
        let prior_results: usize = rt
            .history
            .list(run_id)
            .await
            .map(|records| {
                records
                    .iter()
                    .map(|r| match &r.event {
                        RunEvent::ToolResult(_) => 1,
                        RunEvent::ToolResultGroup(g) => g.events.len(),
                        _ => 0,
                    })
                    .sum()
            })
            .unwrap_or(0);

        let graph = DepGraph::build(plan);
        let retry_mode = options.retry_steps.is_some();

        let mut states = Vec::with_capacity(plan.steps.len());
        for (i, step) in plan.steps.iter().enumerate() {
            let masked_out = options
                .retry_steps
                .as_ref()
                .map(|mask| !mask.contains(&i))
                .unwrap_or(false);
            if i < options.start_index || step.skip || masked_out {
                states.push(StepState::pre_finished());
            } else {
                states.push(StepState::pending());
            }
        }

        let group_pending: Vec<usize> = graph
            .groups
            .iter()
            .map(|members| {
                members
                    .iter()
                    .filter(|&&i| states[i].phase != Phase::Finished)
                    .count()
            })
            .collect();
        let groups_flushed: Vec<bool> = group_pending.iter().map(|&p| p == 0).collect();

        let limit = rt.config.flags.recent_context_limit.max(1);
        let mut recent: VecDeque<RecentResult> = options.seed_recent.into();
        while recent.len() > limit {
            recent.pop_front();
        }

        tracing::info!(
            run_id = %run_id,
            steps = plan.steps.len(),
            groups = graph.groups.len(),
            retry = retry_mode,
            "Executor starting"
        );

        Ok(Self {
            rt,
            run_id: run_id.to_string(),
            objective: objective.to_string(),
            conversation: Arc::new(options.conversation),
            context: options.context,
            retry_mask: options.retry_steps,
            retry_budget: options.retry_budget,
            plan,
            graph,
            states,
            results: Vec::new(),
            catalog_map,
            recent,
            arg_cache: if retry_mode {
                None
            } else {
                Some(Arc::new(ArgCache::new()))
            },
            running: 0,
            tool_running: HashMap::new(),
            provider_running: HashMap::new(),
            group_pending,
            group_buffers: HashMap::new(),
            groups_flushed,
            exec_index: prior_results as u64,
            terminal_emitted: 0,
            final_emitted: false,
            attempted: 0,
            succeeded: 0,
            dispatched_any: false,
            known_failed: HashSet::new(),
            pending_patch: None,
            patch_calls: 0,
            patches_applied: 0,
            stop_requested: false,
            cancelled: false,
            tx,
        })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<StepMsg>) -> Result<ExecReport> {
        self.results = vec![None; self.plan.steps.len()];

        loop {
            if !self.cancelled && self.rt.registry.is_run_cancelled(&self.run_id).await {
                tracing::info!(run_id = %self.run_id, "Cancellation observed");
                self.cancelled = true;
            }

            if self.cancelled {
                if self.running == 0 {
                    self.force_flush_buffers().await;
                    break;
                }
            } else if self.pending_patch.is_some() {
                if self.running == 0 {
                    self.run_patch_cycle().await;
                    continue;
                }
            } else if self.stop_requested {
                if self.running == 0 {
                    break;
                }
            } else {
                if self.all_finished() && self.running == 0 {
                    break;
                }
                self.fill_slots().await;

                if self.running == 0 {
                    if self.all_finished() {
                        break;
                    }
                    if let Some(nearest) = self.nearest_delay() {
                        let wait = nearest
                            .saturating_duration_since(Instant::now())
                            .min(POLL_TICK);
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    // Nothing running, nothing delayed, steps remain: the
                    // dependency graph hides a cycle.
                    tracing::warn!(
                        run_id = %self.run_id,
                        "Unreachable steps detected; force-finishing remainder"
                    );
                    self.force_finish_remainder().await;
                    continue;
                }
            }

            match tokio::time::timeout(POLL_TICK, rx.recv()).await {
                Ok(Some(msg)) => self.handle_msg(msg).await,
                Ok(None) => break,
                Err(_) => {} // poll tick: re-check cancellation and delays
            }
        }

        let mut stats = ExecStats::from_counts(self.attempted, self.succeeded);
        stats.used = stats.used || self.dispatched_any;
        tracing::info!(
            run_id = %self.run_id,
            attempted = stats.attempted,
            succeeded = stats.succeeded,
            cancelled = self.cancelled,
            "Executor finished"
        );
        Ok(ExecReport {
            stats,
            cancelled: self.cancelled,
            stopped: self.stop_requested,
        })
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn all_finished(&self) -> bool {
        self.states.iter().all(|s| s.phase == Phase::Finished)
    }

    fn runnable_total(&self) -> usize {
        self.states.iter().filter(|s| !s.short_circuited).count()
    }

    fn nearest_delay(&self) -> Option<Instant> {
        self.states
            .iter()
            .filter(|s| s.phase == Phase::Pending)
            .filter_map(|s| s.delay_until)
            .min()
    }

    fn deps_satisfied(&self, index: usize) -> bool {
        self.graph.deps[index]
            .iter()
            .all(|&d| self.states[d].phase == Phase::Finished)
    }

    fn is_schedulable(&self, index: usize, now: Instant) -> bool {
        let state = &self.states[index];
        if state.phase != Phase::Pending || state.short_circuited {
            return false;
        }
        if let Some(until) = state.delay_until {
            if until > now {
                return false;
            }
        }
        if let Some(mask) = &self.retry_mask {
            if !mask.contains(&index) {
                return false;
            }
        }
        if !self.deps_satisfied(index) {
            return false;
        }

        let step = &self.plan.steps[index];
        let planner = &self.rt.config.planner;
        let tool_in_flight = self.tool_running.get(&step.ai_name).copied().unwrap_or(0);
        if tool_in_flight >= planner.tool_cap(&step.ai_name) {
            return false;
        }
        let provider = self.provider_of(&step.ai_name);
        let provider_in_flight = self.provider_running.get(&provider).copied().unwrap_or(0);
        provider_in_flight < planner.provider_cap(&provider)
    }

    fn provider_of(&self, ai_name: &str) -> String {
        self.catalog_map
            .get(ai_name)
            .map(|t| t.provider_label().to_string())
            .unwrap_or_else(|| "local".to_string())
    }

    async fn fill_slots(&mut self) {
        let now = Instant::now();
        let max = self.rt.config.planner.max_concurrency.max(1);

        for index in 0..self.plan.steps.len() {
            if self.running >= max {
                break;
            }
            if !self.is_schedulable(index, now) {
                continue;
            }

            // Upstream-failure propagation (retry mode only).
            if self.retry_mask.is_some() {
                let failed_dep = self.graph.deps[index]
                    .iter()
                    .copied()
                    .find(|d| self.known_failed.contains(d));
                if let Some(failed_dep) = failed_dep {
                    let upstream = &self.plan.steps[failed_dep];
                    let reason = self.results[failed_dep]
                        .as_ref()
                        .and_then(|r| r.message.clone())
                        .unwrap_or_else(|| "upstream step failed".to_string());
                    let result = ToolResult::fail(
                        codes::SKIP_UPSTREAM_FAILED,
                        format!("{} ({}): {}", upstream.step_id, upstream.ai_name, reason),
                    );
                    self.complete_inline(index, result).await;
                    continue;
                }
            }

            // Unknown tool short-circuit.
            if !self
                .catalog_map
                .contains_key(&self.plan.steps[index].ai_name)
            {
                let ai_name = self.plan.steps[index].ai_name.clone();
                let result = ToolResult::fail(
                    codes::NOT_FOUND,
                    format!("tool '{}' is not in the catalog", ai_name),
                );
                self.complete_inline(index, result).await;
                continue;
            }

            self.spawn_step(index);
        }
    }

    /// Complete a step without dispatching: emits the draft-args event and
    /// a synthetic result through the normal completion path.
    async fn complete_inline(&mut self, index: usize, result: ToolResult) {
        let step = &self.plan.steps[index];
        let draft = Value::Object(step.draft_args.clone());
        let draft_args = if self.rt.config.flags.enable_verbose_steps {
            Some(draft.clone())
        } else {
            None
        };
        let args_event = ArgsEvent {
            step_id: step.step_id.clone(),
            planned_step_index: index,
            ai_name: step.ai_name.clone(),
            args: draft.clone(),
            draft_args,
            group_id: self.graph.group_of[index],
        };
        self.route_args(index, args_event).await;

        // Count it as running so handle_completion's bookkeeping is
        // uniform; no caps were taken for inline completions.
        self.states[index].phase = Phase::Running;
        self.running += 1;
        let completion = Some(CompletionNote::completed());
        self.handle_completion(
            index,
            StepOutcome {
                args: draft,
                result,
                elapsed_ms: 0,
                completion,
            },
        )
        .await;
    }

    fn spawn_step(&mut self, index: usize) {
        let step = self.plan.steps[index].clone();
        let descriptor = self.catalog_map.get(&step.ai_name).cloned();
        let provider = self.provider_of(&step.ai_name);

        self.states[index].phase = Phase::Running;
        self.running += 1;
        *self.tool_running.entry(step.ai_name.clone()).or_insert(0) += 1;
        *self.provider_running.entry(provider).or_insert(0) += 1;
        self.dispatched_any = true;

        // A lone-step plan whose tool opts out of the single-step
        // pre-reply gets no completion marker on its result.
        let flags = &self.rt.config.flags;
        let single_step = self.plan.steps.iter().filter(|s| !s.skip).count() == 1;
        let suppress_completion = single_step
            && flags
                .tool_pre_reply_single_skip_tools
                .contains(&self.plan.steps[index].ai_name);

        let dep_context = self.render_dep_context(index);
        let env = StepTaskEnv {
            index,
            step,
            group_id: self.graph.group_of[index],
            descriptor,
            suppress_completion,
            dep_context,
            recent: self.recent.iter().cloned().collect(),
            conversation: Arc::clone(&self.conversation),
            objective: self.objective.clone(),
            context: self.context.clone(),
            run_id: self.run_id.clone(),
            retry_mode: self.retry_mask.is_some(),
            arg_cache: self.arg_cache.clone(),
            llm: Arc::clone(&self.rt.llm),
            catalog: Arc::clone(&self.rt.catalog),
            registry: Arc::clone(&self.rt.registry),
            config: self.rt.config.clone(),
            tx: self.tx.clone(),
        };
        tokio::spawn(run_step_task(env));
    }

    fn render_dep_context(&self, index: usize) -> String {
        let mut lines = Vec::new();
        for &dep in &self.graph.deps[index] {
            if let Some(result) = &self.results[dep] {
                let step = &self.plan.steps[dep];
                let payload: String = result.data.to_string().chars().take(400).collect();
                lines.push(format!(
                    "[{}] {} ({}): {}",
                    step.step_id,
                    step.ai_name,
                    if result.success { "ok" } else { "failed" },
                    payload
                ));
            }
        }
        lines.join("\n")
    }

    // =========================================================================
    // Message handling
    // =========================================================================

    async fn handle_msg(&mut self, msg: StepMsg) {
        match msg {
            StepMsg::Args { index, event } => self.route_args(index, event).await,
            StepMsg::ToolChoice(event) => {
                self.rt
                    .emit(&self.run_id, RunEvent::ToolChoice(event))
                    .await;
            }
            StepMsg::ArggenError(event) => {
                self.rt
                    .emit(&self.run_id, RunEvent::ArggenError(event))
                    .await;
            }
            StepMsg::ToolError(event) => {
                self.rt.emit(&self.run_id, RunEvent::ToolError(event)).await;
            }
            StepMsg::Completed { index, outcome } => {
                self.release_caps(index);
                self.handle_completion(index, outcome).await;
            }
        }
    }

    fn release_caps(&mut self, index: usize) {
        let ai_name = self.plan.steps[index].ai_name.clone();
        if let Some(count) = self.tool_running.get_mut(&ai_name) {
            *count = count.saturating_sub(1);
        }
        let provider = self.provider_of(&ai_name);
        if let Some(count) = self.provider_running.get_mut(&provider) {
            *count = count.saturating_sub(1);
        }
    }

    async fn route_args(&mut self, index: usize, event: ArgsEvent) {
        let group = self.graph.group_of[index];
        if self.graph.is_isolated(index) {
            self.rt.emit(&self.run_id, RunEvent::Args(event)).await;
        } else {
            self.group_buffers.entry(group).or_default().args.push(event);
        }
    }

    async fn handle_completion(&mut self, index: usize, outcome: StepOutcome) {
        self.running = self.running.saturating_sub(1);
        let group = self.graph.group_of[index];
        let is_cooldown = outcome.result.is_cooldown();
        let event = self.build_result_event(index, &outcome);

        if is_cooldown {
            let remain = outcome
                .result
                .cooldown_remain_ms()
                .unwrap_or(self.rt.config.planner.cooldown_default_ms);
            let jitter = rand::thread_rng().gen_range(100..=300);
            let requeue_ms = (remain + jitter).max(200);

            tracing::info!(
                run_id = %self.run_id,
                step = index,
                remain_ms = remain,
                requeue_ms,
                "Cooldown active; requeueing step"
            );

            self.states[index].phase = Phase::Pending;
            self.states[index].delay_until =
                Some(Instant::now() + Duration::from_millis(requeue_ms));

            if self.graph.is_isolated(index) {
                self.emit_singleton_result(event).await;
            } else {
                self.group_buffers
                    .entry(group)
                    .or_default()
                    .results
                    .push(event);
            }
            return;
        }

        let success = outcome.result.success;
        self.states[index].phase = Phase::Finished;
        self.states[index].delay_until = None;
        self.results[index] = Some(outcome.result.clone());
        self.attempted += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.known_failed.insert(index);
            self.maybe_stage_patch(index, &outcome.result);
        }

        let limit = self.rt.config.flags.recent_context_limit.max(1);
        self.recent.push_back(RecentResult {
            step_id: self.plan.steps[index].step_id.clone(),
            ai_name: self.plan.steps[index].ai_name.clone(),
            args: outcome.args.clone(),
            result: outcome.result.clone(),
        });
        while self.recent.len() > limit {
            self.recent.pop_front();
        }

        if self.group_pending[group] > 0 {
            self.group_pending[group] -= 1;
        }

        if self.graph.is_isolated(index) {
            self.try_flush_groups().await;
            self.emit_singleton_result(event).await;
        } else {
            self.group_buffers
                .entry(group)
                .or_default()
                .results
                .push(event);
            self.try_flush_groups().await;
        }
    }

    fn maybe_stage_patch(&mut self, index: usize, result: &ToolResult) {
        use planweave_core::config::PatchTriggerMode;

        let runner = &self.rt.config.runner;
        if !runner.enable_plan_patch || self.pending_patch.is_some() {
            return;
        }
        let triggered = match runner.plan_patch_trigger_mode {
            PatchTriggerMode::Never => false,
            PatchTriggerMode::Always | PatchTriggerMode::OnError => true,
        };
        if !triggered
            || self.patch_calls >= runner.max_plan_patch_calls
            || self.patches_applied >= runner.max_patches
        {
            return;
        }

        let step = &self.plan.steps[index];
        self.pending_patch = Some(PatchRequest {
            at_index: index,
            at_step_id: step.step_id.clone(),
            ai_name: step.ai_name.clone(),
            last_result: result.clone(),
        });
    }

    fn build_result_event(&self, index: usize, outcome: &StepOutcome) -> ToolResultEvent {
        let step = &self.plan.steps[index];
        let group = self.graph.group_of[index];
        let depended_by: Vec<String> = self.graph.rev_deps[index]
            .iter()
            .map(|&i| self.plan.steps[i].step_id.clone())
            .collect();
        let depends_note = if step.depends_on_step_ids.is_empty() {
            None
        } else {
            Some(format!("after {}", step.depends_on_step_ids.join(", ")))
        };

        ToolResultEvent {
            planned_step_index: index,
            step_id: step.step_id.clone(),
            execution_index: 0, // assigned at emit time
            ai_name: step.ai_name.clone(),
            reason: step.reason.clone(),
            next_step: step.next_step.clone(),
            args: outcome.args.clone(),
            result: outcome.result.clone(),
            elapsed_ms: outcome.elapsed_ms,
            depends_on_step_ids: step.depends_on_step_ids.clone(),
            depended_by_step_ids: depended_by,
            depends_note,
            group_id: group,
            group_size: self.graph.groups[group].len(),
            tool_meta: self.catalog_map.get(&step.ai_name).and_then(|t| t.meta.clone()),
            completion: outcome.completion.clone(),
            result_stream: false,
            result_status: None,
        }
    }

    // =========================================================================
    // Emission & flushing
    // =========================================================================

    fn buffers_empty(&self) -> bool {
        self.group_buffers
            .values()
            .all(|b| b.args.is_empty() && b.results.is_empty())
    }

    /// Stamp the execution index and result status on an event about to
    /// be emitted. `last_of_batch` marks the last result of a group
    /// flush (true for singleton emissions).
    fn stamp(&mut self, event: &mut ToolResultEvent, singleton: bool, last_of_batch: bool) {
        event.execution_index = self.exec_index;
        self.exec_index += 1;
        event.result_stream = singleton;

        let terminal = !event.result.is_cooldown();
        if terminal {
            self.terminal_emitted += 1;
        }

        let run_complete = terminal
            && last_of_batch
            && !self.cancelled
            && !self.final_emitted
            && self.all_finished()
            && self.buffers_empty()
            && self.terminal_emitted == self.runnable_total();
        event.result_status = Some(if run_complete {
            self.final_emitted = true;
            ResultStatus::Final
        } else {
            ResultStatus::Progress
        });
    }

    async fn emit_singleton_result(&mut self, mut event: ToolResultEvent) {
        self.stamp(&mut event, true, true);
        self.rt.emit(&self.run_id, RunEvent::ToolResult(event)).await;
    }

    /// Flush completed dependency groups in group-id order. An earlier
    /// incomplete multi-step group holds every later one back.
    async fn try_flush_groups(&mut self) {
        for group in 0..self.graph.groups.len() {
            if self.graph.groups[group].len() <= 1 {
                continue;
            }
            if self.groups_flushed[group] {
                continue;
            }
            if self.group_pending[group] > 0 {
                break;
            }
            self.flush_group(group).await;
        }
    }

    async fn flush_group(&mut self, group: usize) {
        self.groups_flushed[group] = true;
        let buffer = self.group_buffers.remove(&group).unwrap_or_default();
        if buffer.args.is_empty() && buffer.results.is_empty() {
            return;
        }

        if !buffer.args.is_empty() {
            self.rt
                .emit(
                    &self.run_id,
                    RunEvent::ArgsGroup(ArgsGroupEvent {
                        group_id: group,
                        events: buffer.args,
                    }),
                )
                .await;
        }

        // Topological order, stable by planned index.
        let order = self.graph.topo_order(&self.graph.groups[group]);
        let rank: HashMap<usize, usize> =
            order.iter().enumerate().map(|(r, &i)| (i, r)).collect();
        let mut results = buffer.results;
        results.sort_by_key(|e| rank.get(&e.planned_step_index).copied().unwrap_or(usize::MAX));

        let last = results.len().saturating_sub(1);
        for (k, event) in results.iter_mut().enumerate() {
            self.stamp(event, false, k == last);
        }

        let status = results.last().and_then(|e| e.result_status);
        self.rt
            .emit(
                &self.run_id,
                RunEvent::ToolResultGroup(ToolResultGroupEvent {
                    group_id: group,
                    events: results,
                    result_status: status,
                }),
            )
            .await;
    }

    /// Emit every buffered event as a singleton (quiesce for a patch, or
    /// cancellation teardown). Never emits a `final` marker.
    async fn force_flush_buffers(&mut self) {
        let mut groups: Vec<usize> = self.group_buffers.keys().copied().collect();
        groups.sort_unstable();

        for group in groups {
            let buffer = self.group_buffers.remove(&group).unwrap_or_default();
            for event in buffer.args {
                self.rt.emit(&self.run_id, RunEvent::Args(event)).await;
            }
            for mut event in buffer.results {
                // A force-flush never ends the run's output.
                event.execution_index = self.exec_index;
                self.exec_index += 1;
                event.result_stream = true;
                if !event.result.is_cooldown() {
                    self.terminal_emitted += 1;
                }
                event.result_status = Some(ResultStatus::Progress);
                self.rt.emit(&self.run_id, RunEvent::ToolResult(event)).await;
            }
        }
    }

    async fn force_finish_remainder(&mut self) {
        for state in &mut self.states {
            if state.phase != Phase::Finished {
                state.phase = Phase::Finished;
                state.short_circuited = true;
            }
        }
        for pending in self.group_pending.iter_mut() {
            *pending = 0;
        }
        self.try_flush_groups().await;
    }

    // =========================================================================
    // Plan patching
    // =========================================================================

    async fn run_patch_cycle(&mut self) {
        let Some(request) = self.pending_patch.take() else {
            return;
        };
        let runner = &self.rt.config.runner;
        if self.patch_calls >= runner.max_plan_patch_calls
            || self.patches_applied >= runner.max_patches
        {
            return;
        }
        self.patch_calls += 1;

        // Quiesced already (running == 0); make buffered results visible
        // before the model reasons about them.
        self.force_flush_buffers().await;

        let ancestor_context = self.render_ancestor_context(request.at_index);
        let decision = patch::maybe_plan_patch(
            self.rt,
            &self.objective,
            &self.context,
            self.plan,
            &request,
            &ancestor_context,
        )
        .await;

        match decision {
            PatchDecision::Stop { reason, .. } => {
                tracing::info!(run_id = %self.run_id, reason = %reason, "Plan patch requested stop");
                self.stop_requested = true;
                self.rt
                    .emit(
                        &self.run_id,
                        RunEvent::PlanPatch(planweave_core::events::PlanPatchEvent {
                            action: "stop".to_string(),
                            reason: Some(reason),
                            at_step_id: Some(request.at_step_id),
                            operations: None,
                        }),
                    )
                    .await;
            }
            PatchDecision::Patch { operations } => {
                let locked: Vec<bool> = self
                    .states
                    .iter()
                    .map(|s| s.phase != Phase::Pending)
                    .collect();
                let op_count = operations.len();
                let applied = {
                    let mut budget = self.retry_budget.lock().unwrap();
                    patch::apply_patch(
                        self.plan,
                        &request,
                        operations,
                        &locked,
                        &mut budget,
                        runner.retry_budget_per_step,
                    )
                };

                if applied.operations > 0 {
                    self.patches_applied += 1;
                    self.rebuild_after_patch();

                    if let Err(e) = self.rt.history.set_plan(&self.run_id, self.plan).await {
                        tracing::warn!(error = %e, "Failed to persist patched plan");
                    }
                    self.rt
                        .emit(
                            &self.run_id,
                            RunEvent::PlanPatch(planweave_core::events::PlanPatchEvent {
                                action: "patch".to_string(),
                                reason: None,
                                at_step_id: Some(request.at_step_id),
                                operations: Some(serde_json::json!({
                                    "requested": op_count,
                                    "applied": applied.operations,
                                    "appended": applied.appended,
                                })),
                            }),
                        )
                        .await;
                    tracing::info!(
                        run_id = %self.run_id,
                        applied = applied.operations,
                        "Plan patched"
                    );
                }
            }
            PatchDecision::Continue => {
                tracing::debug!(run_id = %self.run_id, "Plan patch: continue");
            }
        }
    }

    fn render_ancestor_context(&self, index: usize) -> String {
        // Transitive dependencies of the failing step only.
        let mut seen = HashSet::new();
        let mut stack: Vec<usize> = self.graph.deps[index].to_vec();
        while let Some(d) = stack.pop() {
            if seen.insert(d) {
                stack.extend(self.graph.deps[d].iter().copied());
            }
        }
        let mut ancestors: Vec<usize> = seen.into_iter().collect();
        ancestors.sort_unstable();

        let mut lines = Vec::new();
        for a in ancestors {
            if let Some(result) = &self.results[a] {
                let step = &self.plan.steps[a];
                let payload: String = result.data.to_string().chars().take(300).collect();
                lines.push(format!(
                    "[{}] {} ({}): {}",
                    step.step_id,
                    step.ai_name,
                    result.code,
                    payload
                ));
            }
        }
        lines.join("\n")
    }

    fn rebuild_after_patch(&mut self) {
        self.graph = DepGraph::build(self.plan);

        while self.states.len() < self.plan.steps.len() {
            self.states.push(StepState::pending());
            self.results.push(None);
        }
        for (i, step) in self.plan.steps.iter().enumerate() {
            if step.skip && self.states[i].phase == Phase::Pending {
                self.states[i] = StepState::pre_finished();
            }
        }

        self.group_pending = self
            .graph
            .groups
            .iter()
            .map(|members| {
                members
                    .iter()
                    .filter(|&&i| self.states[i].phase != Phase::Finished)
                    .count()
            })
            .collect();
        // Fully-finished groups have already had their events emitted by
        // the pre-patch force-flush.
        self.groups_flushed = self.group_pending.iter().map(|&p| p == 0).collect();
        self.group_buffers.clear();
    }
}

// =============================================================================
// Per-step task
// =============================================================================

struct StepTaskEnv {
    index: usize,
    step: Step,
    group_id: usize,
    descriptor: Option<ToolDescriptor>,
    suppress_completion: bool,
    dep_context: String,
    recent: Vec<RecentResult>,
    conversation: Arc<Vec<ChatMessage>>,
    objective: String,
    context: RunContext,
    run_id: String,
    retry_mode: bool,
    arg_cache: Option<Arc<ArgCache>>,
    llm: Arc<dyn LlmClient>,
    catalog: Arc<dyn ToolCatalog>,
    registry: Arc<dyn RunRegistry>,
    config: planweave_core::config::AppConfig,
    tx: mpsc::UnboundedSender<StepMsg>,
}

impl StepTaskEnv {
    fn send_args(&self, args: Value, draft: &Value) {
        // Draft args are verbose diagnostics.
        let draft_args = if self.config.flags.enable_verbose_steps {
            Some(draft.clone())
        } else {
            None
        };
        let _ = self.tx.send(StepMsg::Args {
            index: self.index,
            event: ArgsEvent {
                step_id: self.step.step_id.clone(),
                planned_step_index: self.index,
                ai_name: self.step.ai_name.clone(),
                args,
                draft_args,
                group_id: self.group_id,
            },
        });
    }

    fn send_completed(&self, args: Value, result: ToolResult, started: Instant, terminal: bool) {
        let completion = if terminal && !self.suppress_completion {
            Some(CompletionNote::completed())
        } else {
            None
        };
        let _ = self.tx.send(StepMsg::Completed {
            index: self.index,
            outcome: StepOutcome {
                args,
                result,
                elapsed_ms: started.elapsed().as_millis() as u64,
                completion,
            },
        });
    }
}

async fn run_step_task(env: StepTaskEnv) {
    let started = Instant::now();
    let draft = Value::Object(env.step.draft_args.clone());

    if env.registry.is_run_cancelled(&env.run_id).await {
        env.send_args(draft.clone(), &draft);
        env.send_completed(
            draft,
            ToolResult::fail(codes::RUN_CANCELLED, "run cancelled before dispatch"),
            started,
            true,
        );
        return;
    }

    let schema = env
        .descriptor
        .as_ref()
        .map(|d| d.input_schema.clone())
        .unwrap_or_else(|| serde_json::json!({ "type": "object" }));

    // ArgGen → validate → repair. Reuse is disabled during retries.
    let cache = if env.retry_mode {
        None
    } else {
        env.arg_cache.as_deref()
    };
    let outcome = arg_gen::generate_args(
        env.llm.as_ref(),
        &env.config,
        &env.step,
        &schema,
        &env.dep_context,
        &env.recent,
        &env.conversation,
        &env.objective,
        &env.context,
        cache,
    )
    .await;

    if let Some(error) = &outcome.error {
        let _ = env.tx.send(StepMsg::ArggenError(StageErrorEvent {
            step_id: env.step.step_id.clone(),
            ai_name: env.step.ai_name.clone(),
            error: error.clone(),
        }));
    }

    env.send_args(outcome.args.clone(), &draft);

    if let Some(errors) = outcome.invalid {
        env.send_completed(
            outcome.args,
            ToolResult::fail(codes::ARGS_INVALID, errors.join("; ")),
            started,
            true,
        );
        return;
    }

    // Schedule-argument detection: only when the schema declares it.
    if schedule_arg::schema_declares_schedule(&schema) {
        if let Some(delay_ms) = schedule_arg::schedule_delay_ms(&outcome.args, chrono::Utc::now())
        {
            let schedule = outcome.args.get("schedule").cloned();
            let _ = env.tx.send(StepMsg::ToolChoice(ToolChoiceEvent {
                step_id: env.step.step_id.clone(),
                ai_name: env.step.ai_name.clone(),
                status: "scheduled".to_string(),
                delay_ms,
                schedule: schedule.clone(),
            }));

            let schedule_cfg = &env.config.schedule;
            let immediate = schedule_cfg
                .immediate_allowlist
                .contains(&env.step.ai_name)
                && !schedule_cfg.immediate_denylist.contains(&env.step.ai_name);

            if !immediate {
                // Delayed execution: a placeholder stands in for the real
                // call, which upstream workers perform at the target time.
                let result = ToolResult {
                    success: true,
                    code: codes::SCHEDULED.to_string(),
                    data: serde_json::json!({
                        "scheduled": true,
                        "delayMs": delay_ms,
                        "schedule": schedule,
                    }),
                    message: None,
                    remain_ms: None,
                    ttl: None,
                };
                env.send_completed(outcome.args, result, started, false);
                return;
            }
        }
    }

    if env.registry.is_run_cancelled(&env.run_id).await {
        env.send_completed(
            outcome.args,
            ToolResult::fail(codes::RUN_CANCELLED, "run cancelled before dispatch"),
            started,
            true,
        );
        return;
    }

    let call_ctx = ToolCallCtx {
        run_id: env.run_id.clone(),
        step_index: env.index,
    };
    match env
        .catalog
        .call_by_ai_name(&env.step.ai_name, outcome.args.clone(), call_ctx)
        .await
    {
        Ok(result) => env.send_completed(outcome.args, result, started, true),
        Err(e) => {
            let _ = env.tx.send(StepMsg::ToolError(StageErrorEvent {
                step_id: env.step.step_id.clone(),
                ai_name: env.step.ai_name.clone(),
                error: e.to_string(),
            }));
            env.send_completed(
                outcome.args,
                ToolResult::fail(codes::TOOL_ERROR, e.to_string()),
                started,
                true,
            );
        }
    }
}
