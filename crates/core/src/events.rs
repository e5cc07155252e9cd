//! Structured run events.
//!
//! Every event emitted on the run bus is mirrored to the history store in
//! emission order. The `type` tag is snake_case; payload fields are
//! camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ExecStats, Plan, Step, ToolResult};

/// Discriminated union of all events a run can emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Run accepted; first record of every run.
    Start(StartEvent),
    /// Judge verdict on tool necessity.
    Judge(JudgeEvent),
    /// Catalog snapshot taken for planning.
    SkillsLoaded(SkillsLoadedEvent),
    /// Manifest after rerank / whitelist shrink.
    SkillsSelected(SkillsSelectedEvent),
    /// The validated plan (also re-emitted after a patch).
    Plan(PlanEvent),
    /// Audit pick among plan candidates.
    PlanAudit(PlanAuditEvent),
    /// Final arguments for a single step.
    Args(ArgsEvent),
    /// Buffered args of a dependency group, flushed together.
    ArgsGroup(ArgsGroupEvent),
    /// Scheduling decision for a step carrying a `schedule` argument.
    ToolChoice(ToolChoiceEvent),
    /// Terminal (or cooldown-progress) result of a single step.
    ToolResult(ToolResultEvent),
    /// Buffered results of a dependency group in topological order.
    ToolResultGroup(ToolResultGroupEvent),
    /// ArgGen stage error; the step fell back to draft args.
    ArggenError(StageErrorEvent),
    /// Tool dispatch raised a transport-level error.
    ToolError(StageErrorEvent),
    /// A repair pass over failed steps is starting.
    RetryBegin(RetryBeginEvent),
    /// A repair pass finished.
    RetryDone(RetryDoneEvent),
    /// Mid-run plan patch decision.
    PlanPatch(PlanPatchEvent),
    /// Post-execution evaluation verdict.
    Evaluation(EvaluationEvent),
    /// Completeness check verdict.
    Reflection(ReflectionEvent),
    /// Supplementary plan generated by reflection.
    ReflectionPlan(PlanEvent),
    /// Execution stats of a supplementary pass.
    ReflectionExec(RetryDoneEvent),
    /// Execution phase finished (terminal when summarization is off).
    Completed(CompletedEvent),
    /// Run cancelled (terminal).
    Cancelled(CancelledEvent),
    /// Final natural-language summary (terminal).
    Summary(SummaryEvent),
    /// Execution stats record, or the fatal-error terminal.
    Done(DoneEvent),
}

impl RunEvent {
    /// The snake_case tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Judge(_) => "judge",
            Self::SkillsLoaded(_) => "skills_loaded",
            Self::SkillsSelected(_) => "skills_selected",
            Self::Plan(_) => "plan",
            Self::PlanAudit(_) => "plan_audit",
            Self::Args(_) => "args",
            Self::ArgsGroup(_) => "args_group",
            Self::ToolChoice(_) => "tool_choice",
            Self::ToolResult(_) => "tool_result",
            Self::ToolResultGroup(_) => "tool_result_group",
            Self::ArggenError(_) => "arggen_error",
            Self::ToolError(_) => "tool_error",
            Self::RetryBegin(_) => "retry_begin",
            Self::RetryDone(_) => "retry_done",
            Self::PlanPatch(_) => "plan_patch",
            Self::Evaluation(_) => "evaluation",
            Self::Reflection(_) => "reflection",
            Self::ReflectionPlan(_) => "reflection_plan",
            Self::ReflectionExec(_) => "reflection_exec",
            Self::Completed(_) => "completed",
            Self::Cancelled(_) => "cancelled",
            Self::Summary(_) => "summary",
            Self::Done(_) => "done",
        }
    }

    /// Whether a subscriber should stop consuming after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::Summary(_) | Self::Cancelled(_)
        )
    }
}

/// Timestamped, sequenced history record wrapping a run event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// Per-run sequence number, assigned by the store.
    pub seq: u64,
    /// Epoch milliseconds at append time.
    pub timestamp_ms: i64,
    /// The recorded event.
    #[serde(flatten)]
    pub event: RunEvent,
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartEvent {
    pub run_id: String,
    pub objective: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeEvent {
    pub need: bool,
    pub summary: String,
    #[serde(default)]
    pub tool_names: Vec<String>,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillsLoadedEvent {
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillsSelectedEvent {
    pub ai_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEvent {
    pub steps: Vec<Step>,
    pub manifest_size: usize,
}

impl PlanEvent {
    /// Snapshot a plan for emission.
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            steps: plan.steps.clone(),
            manifest_size: plan.manifest.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanAuditEvent {
    pub candidates: usize,
    pub best: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgsEvent {
    pub step_id: String,
    pub planned_step_index: usize,
    pub ai_name: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_args: Option<Value>,
    pub group_id: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgsGroupEvent {
    pub group_id: usize,
    pub events: Vec<ArgsEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolChoiceEvent {
    pub step_id: String,
    pub ai_name: String,
    /// `"scheduled"` is the only status the executor labels today.
    pub status: String,
    pub delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Value>,
}

/// Whether a result is an intermediate or the run's last visible output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Progress,
    Final,
}

/// Marker attached to terminal step results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNote {
    pub state: String,
    pub must_answer_from_result: bool,
}

impl CompletionNote {
    /// The standard completed marker.
    pub fn completed() -> Self {
        Self {
            state: "completed".to_string(),
            must_answer_from_result: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEvent {
    pub planned_step_index: usize,
    pub step_id: String,
    /// Run-wide counter assigned at emit time, dense from 0.
    pub execution_index: u64,
    pub ai_name: String,
    #[serde(default)]
    pub reason: Vec<String>,
    #[serde(default)]
    pub next_step: String,
    pub args: Value,
    pub result: ToolResult,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub depends_on_step_ids: Vec<String>,
    #[serde(default)]
    pub depended_by_step_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_note: Option<String>,
    pub group_id: usize,
    pub group_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionNote>,
    /// True when emitted as a singleton (isolated step or force-flush).
    pub result_stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_status: Option<ResultStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultGroupEvent {
    pub group_id: usize,
    /// Step results in topological order.
    pub events: Vec<ToolResultEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_status: Option<ResultStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageErrorEvent {
    pub step_id: String,
    pub ai_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBeginEvent {
    pub attempt: usize,
    pub step_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDoneEvent {
    pub attempt: usize,
    pub exec: ExecStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPatchEvent {
    /// `"stop"`, `"patch"` or `"continue"`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStepRef {
    pub step_id: String,
    #[serde(default)]
    pub display_index: usize,
    #[serde(default)]
    pub ai_name: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationEvent {
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub incomplete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_steps: Vec<FailedStepRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionEvent {
    pub is_complete: bool,
    #[serde(default)]
    pub supplements: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEvent {
    pub exec: ExecStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEvent {
    pub summary: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
