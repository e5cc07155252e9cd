//! Plan-Patch hook: LLM-driven mid-run re-authoring of remaining steps.

use std::collections::HashMap;

use serde_json::{json, Value};

use planweave_core::{
    traits::{ChatRequest, ToolDecl},
    types::{new_step_id, ChatMessage, Plan, RunContext, Step, ToolResult},
};

use crate::prompts;
use crate::runtime::RunnerInner;
use crate::stages::parse_json_loose;

const PATCH_FN: &str = "emit_plan_patch";

/// What triggered the patch call.
#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub at_index: usize,
    pub at_step_id: String,
    pub ai_name: String,
    pub last_result: ToolResult,
}

/// A single edit to the remaining plan.
#[derive(Debug, Clone)]
pub enum PatchOp {
    Append { steps: Vec<Step> },
    Replace { target_step_id: String, step: Step },
    Delete { target_step_id: String },
}

/// The hook's verdict.
#[derive(Debug, Clone)]
pub enum PatchDecision {
    Stop { reason: String, is_complete: bool },
    Patch { operations: Vec<PatchOp> },
    Continue,
}

impl PatchDecision {
    /// Wire label for events and history.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Stop { .. } => "stop",
            Self::Patch { .. } => "patch",
            Self::Continue => "continue",
        }
    }
}

fn patch_decl(allowed_ai_names: &[String]) -> ToolDecl {
    let step_schema = json!({
        "type": "object",
        "properties": {
            "aiName": { "type": "string", "enum": allowed_ai_names },
            "reason": { "type": "array", "items": { "type": "string" } },
            "nextStep": { "type": "string" },
            "draftArgs": { "type": "object" },
            "dependsOnStepIds": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["aiName"]
    });

    ToolDecl {
        name: PATCH_FN.to_string(),
        description: "Decide how to adjust the remaining plan after a failed step".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["continue", "patch", "stop"] },
                "reason": { "type": "string" },
                "isComplete": { "type": "boolean" },
                "operations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "op": { "type": "string", "enum": ["append", "replace", "delete"] },
                            "targetStepId": { "type": "string" },
                            "step": step_schema,
                            "steps": { "type": "array", "items": step_schema }
                        },
                        "required": ["op"]
                    }
                }
            },
            "required": ["action"]
        }),
    }
}

fn parse_step(value: &Value) -> Option<Step> {
    let mut step = Step::new(value["aiName"].as_str()?);
    step.reason = value["reason"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    step.next_step = value["nextStep"].as_str().unwrap_or_default().to_string();
    if let Some(args) = value["draftArgs"].as_object() {
        step.draft_args = args.clone();
    }
    step.depends_on_step_ids = value["dependsOnStepIds"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Some(step)
}

fn parse_decision(value: &Value) -> PatchDecision {
    match value["action"].as_str() {
        Some("stop") => PatchDecision::Stop {
            reason: value["reason"].as_str().unwrap_or_default().to_string(),
            is_complete: value["isComplete"].as_bool().unwrap_or(false),
        },
        Some("patch") => {
            let operations = value["operations"]
                .as_array()
                .map(|ops| {
                    ops.iter()
                        .filter_map(|op| match op["op"].as_str()? {
                            "append" => {
                                let steps: Vec<Step> = op["steps"]
                                    .as_array()
                                    .map(|a| a.iter().filter_map(parse_step).collect())
                                    .unwrap_or_default();
                                if steps.is_empty() {
                                    None
                                } else {
                                    Some(PatchOp::Append { steps })
                                }
                            }
                            "replace" => Some(PatchOp::Replace {
                                target_step_id: op["targetStepId"].as_str()?.to_string(),
                                step: parse_step(&op["step"])?,
                            }),
                            "delete" => Some(PatchOp::Delete {
                                target_step_id: op["targetStepId"].as_str()?.to_string(),
                            }),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            PatchDecision::Patch { operations }
        }
        // "continue" and anything unknown are no-ops.
        _ => PatchDecision::Continue,
    }
}

/// Ask the model how to proceed after a failed step.
///
/// `ancestor_context` is the dependency-restricted history: only results
/// of the failing step's ancestors. Errors degrade to `Continue`.
pub async fn maybe_plan_patch(
    rt: &RunnerInner,
    objective: &str,
    ctx: &RunContext,
    plan: &Plan,
    request: &PatchRequest,
    ancestor_context: &str,
) -> PatchDecision {
    let allowed: Vec<String> = plan.manifest.iter().map(|t| t.ai_name.clone()).collect();

    let remaining: Vec<String> = plan
        .steps
        .iter()
        .enumerate()
        .skip(request.at_index + 1)
        .filter(|(_, s)| !s.skip)
        .map(|(i, s)| format!("{}. [{}] {} — {}", i + 1, s.step_id, s.ai_name, s.next_step))
        .collect();

    let system = prompts::compose_system(prompts::PLAN_PATCH_BASE, &ctx.overlays, None);
    let user = format!(
        "Objective: {}\n\nFailed step: [{}] {} (code {}): {}\n\nAncestor results:\n{}\n\nRemaining steps:\n{}",
        objective,
        request.at_step_id,
        request.ai_name,
        request.last_result.code,
        request.last_result.message.as_deref().unwrap_or("-"),
        if ancestor_context.is_empty() { "-" } else { ancestor_context },
        if remaining.is_empty() { "(none)".to_string() } else { remaining.join("\n") }
    );

    let chat = ChatRequest::from_messages(vec![
        ChatMessage::system(system),
        ChatMessage::user(user),
    ])
    .force_function(patch_decl(&allowed))
    .with_timeout_ms(rt.config.llm.stage_timeouts.patch_ms);

    let reply = match rt.llm.chat(chat).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "Plan-patch call failed");
            return PatchDecision::Continue;
        }
    };

    let value = reply
        .call_named(PATCH_FN)
        .and_then(|c| c.parse_arguments().ok())
        .or_else(|| parse_json_loose(&reply.content));

    match value {
        Some(value) => parse_decision(&value),
        None => PatchDecision::Continue,
    }
}

/// Result of applying a patch decision.
#[derive(Debug, Default)]
pub struct PatchApplied {
    /// Number of operations that actually changed the plan.
    pub operations: usize,
    /// Indices of appended steps (post-append positions).
    pub appended: Vec<usize>,
}

/// Apply patch operations to the plan.
///
/// `locked[i]` marks steps that already started or finished; replace and
/// delete only touch unlocked, unskipped steps strictly after the failing
/// index. Appended step ids are regenerated, and at most one retry of the
/// failed step is admitted per failure, gated by the per-step retry
/// budget.
pub fn apply_patch(
    plan: &mut Plan,
    request: &PatchRequest,
    operations: Vec<PatchOp>,
    locked: &[bool],
    retry_budget: &mut HashMap<String, usize>,
    default_budget: usize,
) -> PatchApplied {
    let mut applied = PatchApplied::default();
    let mut retry_admitted = false;

    for op in operations {
        match op {
            PatchOp::Append { steps } => {
                for mut step in steps {
                    let is_retry = step.ai_name == request.ai_name
                        && step
                            .depends_on_step_ids
                            .contains(&request.at_step_id);
                    if is_retry {
                        if retry_admitted {
                            tracing::debug!("Dropping second retry step in one patch");
                            continue;
                        }
                        let budget = retry_budget
                            .entry(request.at_step_id.clone())
                            .or_insert(default_budget);
                        if *budget == 0 {
                            tracing::debug!(
                                step_id = %request.at_step_id,
                                "Retry budget exhausted; dropping retry step"
                            );
                            continue;
                        }
                        *budget -= 1;
                        retry_admitted = true;
                    }
                    step.step_id = new_step_id();
                    plan.steps.push(step);
                    applied.appended.push(plan.steps.len() - 1);
                    applied.operations += 1;
                }
            }
            PatchOp::Replace {
                target_step_id,
                step,
            } => {
                if let Some(idx) = plan.index_of(&target_step_id) {
                    if idx > request.at_index
                        && !locked.get(idx).copied().unwrap_or(true)
                        && !plan.steps[idx].skip
                    {
                        let keep_id = plan.steps[idx].step_id.clone();
                        plan.steps[idx] = Step {
                            step_id: keep_id,
                            ..step
                        };
                        applied.operations += 1;
                    } else {
                        tracing::debug!(target = %target_step_id, "Replace target not editable");
                    }
                }
            }
            PatchOp::Delete { target_step_id } => {
                if let Some(idx) = plan.index_of(&target_step_id) {
                    if idx > request.at_index
                        && !locked.get(idx).copied().unwrap_or(true)
                        && !plan.steps[idx].skip
                    {
                        plan.steps[idx].skip = true;
                        applied.operations += 1;
                    } else {
                        tracing::debug!(target = %target_step_id, "Delete target not editable");
                    }
                }
            }
        }
    }

    plan.sanitize_dependencies();
    plan.renumber();
    applied
}
