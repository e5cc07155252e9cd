//! Planner: turn an objective into a validated tool plan.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::task::JoinSet;

use planweave_core::{
    config::ToolStrategy,
    events::{PlanAuditEvent, RunEvent, SkillsLoadedEvent, SkillsSelectedEvent},
    traits::{ChatRequest, LlmClient, ToolDecl},
    types::{ChatMessage, Plan, RunContext, Step},
    Result,
};

use crate::manifest;
use crate::prompts;
use crate::runtime::RunnerInner;
use crate::stages::{parse_fc_block, parse_json_loose, pre_thought::pre_thought};

const EMIT_PLAN_FN: &str = "emit_plan";
const SELECT_PLAN_FN: &str = "select_plan";

/// JSON schema of the `emit_plan` function, with `aiName` constrained to
/// the allowed names.
fn plan_decl(allowed: &[String], max_steps: usize) -> ToolDecl {
    ToolDecl {
        name: EMIT_PLAN_FN.to_string(),
        description: "Emit the tool invocation plan".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "steps": {
                    "type": "array",
                    "maxItems": max_steps,
                    "items": {
                        "type": "object",
                        "properties": {
                            "stepId": { "type": "string" },
                            "aiName": { "type": "string", "enum": allowed },
                            "reason": { "type": "array", "items": { "type": "string" } },
                            "nextStep": { "type": "string" },
                            "draftArgs": { "type": "object" },
                            "dependsOnStepIds": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "stepIds of EARLIER steps this one needs"
                            }
                        },
                        "required": ["aiName"]
                    }
                }
            },
            "required": ["steps"]
        }),
    }
}

fn parse_steps(value: &Value) -> Vec<Step> {
    let Some(raw_steps) = value.get("steps").and_then(|s| s.as_array()) else {
        return Vec::new();
    };

    raw_steps
        .iter()
        .filter_map(|raw| {
            let mut step = Step::new(raw.get("aiName")?.as_str()?);
            if let Some(id) = raw.get("stepId").and_then(|v| v.as_str()) {
                step.step_id = id.trim().to_string();
            }
            step.reason = raw["reason"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            step.next_step = raw["nextStep"].as_str().unwrap_or_default().to_string();
            if let Some(args) = raw["draftArgs"].as_object() {
                step.draft_args = args.clone();
            }
            step.depends_on_step_ids = raw["dependsOnStepIds"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            Some(step)
        })
        .collect()
}

/// Everything one plan request needs, cloneable into spawned candidates.
#[derive(Clone)]
struct PlanCall {
    llm: Arc<dyn LlmClient>,
    strategy: ToolStrategy,
    timeout_ms: u64,
    temperature: f32,
    messages: Vec<ChatMessage>,
    allowed: Vec<String>,
    max_steps: usize,
    model: Option<String>,
}

/// One planning request. Errors and unparseable replies degrade to an
/// empty step list.
async fn request_plan(call: PlanCall) -> Vec<Step> {
    let decl = plan_decl(&call.allowed, call.max_steps);
    let mut request = ChatRequest::from_messages(call.messages)
        .with_temperature(call.temperature)
        .with_timeout_ms(call.timeout_ms);
    if let Some(model) = call.model {
        request = request.with_model(model);
    }

    match call.strategy {
        ToolStrategy::Auto => {
            request = request.force_function(decl);
        }
        ToolStrategy::Fc => {
            request.messages.push(ChatMessage::system(format!(
                "Reply with exactly one <tool_call>{{\"name\": \"{}\", \"arguments\": {{...}}}}</tool_call> block. Arguments schema: {}",
                EMIT_PLAN_FN, decl.parameters
            )));
        }
    }

    let reply = match call.llm.chat(request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "Plan request failed");
            return Vec::new();
        }
    };

    let value = reply
        .call_named(EMIT_PLAN_FN)
        .and_then(|c| c.parse_arguments().ok())
        .or_else(|| {
            parse_fc_block(&reply.content)
                .filter(|(name, _)| name == EMIT_PLAN_FN)
                .map(|(_, args)| args)
        })
        .or_else(|| parse_json_loose(&reply.content));

    value.map(|v| parse_steps(&v)).unwrap_or_default()
}

/// Keep only steps naming a known tool.
fn filter_known(steps: Vec<Step>, known: &HashSet<String>) -> Vec<Step> {
    steps
        .into_iter()
        .filter(|s| known.contains(&s.ai_name))
        .collect()
}

/// Dynamic deadline for stragglers after the first half of candidates
/// completes: `clamp(mean · factor · (1 + 0.25·(K − ⌈K/2⌉)), min, max)`.
fn straggler_deadline_ms(
    mean_ms: f64,
    total: usize,
    half: usize,
    factor: f64,
    min_ms: u64,
    max_ms: u64,
) -> u64 {
    let scaled = mean_ms * factor * (1.0 + 0.25 * (total.saturating_sub(half)) as f64);
    (scaled as u64).clamp(min_ms, max_ms)
}

/// Run K candidate requests with the dynamic deadline, then pick one via
/// the audit call (or index 0).
async fn multi_candidate_plan(
    rt: &RunnerInner,
    run_id: Option<&str>,
    objective: &str,
    call: PlanCall,
    known: &HashSet<String>,
) -> Vec<Step> {
    let planner = &rt.config.planner;
    let models: Vec<Option<String>> = if rt.config.plan.models.is_empty() {
        vec![None; planner.candidates()]
    } else {
        rt.config.plan.models.iter().cloned().map(Some).collect()
    };
    let total = models.len();
    let half = total.div_ceil(2);

    let mut set = JoinSet::new();
    let started = Instant::now();
    for model in models {
        let mut candidate_call = call.clone();
        candidate_call.model = model.or(candidate_call.model);
        set.spawn(async move { request_plan(candidate_call).await });
    }

    let mut candidates: Vec<Vec<Step>> = Vec::new();
    let mut elapsed: Vec<f64> = Vec::new();
    while candidates.len() < half {
        match set.join_next().await {
            Some(Ok(steps)) => {
                elapsed.push(started.elapsed().as_millis() as f64);
                candidates.push(filter_known(steps, known));
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Plan candidate panicked");
                elapsed.push(started.elapsed().as_millis() as f64);
                candidates.push(Vec::new());
            }
            None => break,
        }
    }

    if !set.is_empty() {
        let mean = elapsed.iter().sum::<f64>() / elapsed.len().max(1) as f64;
        let wait_ms = straggler_deadline_ms(
            mean,
            total,
            half,
            planner.candidate_time_factor,
            planner.candidate_min_timeout_ms,
            planner.candidate_max_timeout_ms,
        );
        let deadline = tokio::time::sleep(std::time::Duration::from_millis(wait_ms));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok(steps)) => candidates.push(filter_known(steps, known)),
                    Some(Err(e)) => tracing::warn!(error = %e, "Plan candidate panicked"),
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::debug!(pending = set.len(), "Abandoning straggler plan candidates");
                    set.abort_all();
                    break;
                }
            }
        }
    }

    let valid: Vec<Vec<Step>> = candidates.into_iter().filter(|c| !c.is_empty()).collect();
    match valid.len() {
        0 => Vec::new(),
        1 => valid.into_iter().next().unwrap_or_default(),
        _ => {
            let (best, reason) = if planner.audit_enable {
                audit_pick(rt, objective, &valid).await
            } else {
                (0, "audit disabled".to_string())
            };
            let best = best.min(valid.len() - 1);
            if let Some(run_id) = run_id {
                rt.emit(
                    run_id,
                    RunEvent::PlanAudit(PlanAuditEvent {
                        candidates: valid.len(),
                        best,
                        reason,
                    }),
                )
                .await;
            }
            valid.into_iter().nth(best).unwrap_or_default()
        }
    }
}

/// Audit call: pick the best candidate via a forced `select_plan`.
async fn audit_pick(rt: &RunnerInner, objective: &str, candidates: &[Vec<Step>]) -> (usize, String) {
    let rendered: Vec<String> = candidates
        .iter()
        .enumerate()
        .map(|(i, steps)| {
            let lines: Vec<String> = steps
                .iter()
                .map(|s| format!("  - {} ({})", s.ai_name, s.next_step))
                .collect();
            format!("Candidate {}:\n{}", i, lines.join("\n"))
        })
        .collect();

    let request = ChatRequest::from_messages(vec![
        ChatMessage::system(
            "Pick the candidate plan that best accomplishes the objective with the fewest, \
             best-ordered steps."
                .to_string(),
        ),
        ChatMessage::user(format!(
            "Objective: {}\n\n{}",
            objective,
            rendered.join("\n\n")
        )),
    ])
    .force_function(ToolDecl {
        name: SELECT_PLAN_FN.to_string(),
        description: "Select the best candidate plan".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "best": { "type": "integer", "minimum": 0 },
                "reason": { "type": "string" }
            },
            "required": ["best", "reason"]
        }),
    })
    .with_timeout_ms(rt.config.llm.stage_timeouts.plan_ms);

    match rt.llm.chat(request).await {
        Ok(reply) => {
            let value = reply
                .call_named(SELECT_PLAN_FN)
                .and_then(|c| c.parse_arguments().ok())
                .or_else(|| parse_json_loose(&reply.content));
            match value {
                Some(v) => (
                    v["best"].as_u64().unwrap_or(0) as usize,
                    v["reason"].as_str().unwrap_or_default().to_string(),
                ),
                None => (0, "audit reply unparseable".to_string()),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Plan audit failed");
            (0, format!("audit error: {}", e))
        }
    }
}

/// Fire two identical requests and use whichever returns first with a
/// non-empty plan.
async fn race_two(call: PlanCall) -> Vec<Step> {
    let mut set = JoinSet::new();
    for _ in 0..2 {
        let candidate_call = call.clone();
        set.spawn(async move { request_plan(candidate_call).await });
    }

    while let Some(joined) = set.join_next().await {
        if let Ok(steps) = joined {
            if !steps.is_empty() {
                set.abort_all();
                return steps;
            }
        }
    }
    Vec::new()
}

/// Generate a validated plan for the objective.
///
/// Returns an empty plan (never an error) when the model produces nothing
/// usable; infrastructure failures of the catalog still propagate.
pub async fn generate_plan(
    rt: &RunnerInner,
    run_id: Option<&str>,
    objective: &str,
    ctx: &RunContext,
    conversation: &[ChatMessage],
) -> Result<Plan> {
    let full_manifest = manifest::build_manifest(rt, objective).await?;
    if let Some(run_id) = run_id {
        rt.emit(
            run_id,
            RunEvent::SkillsLoaded(SkillsLoadedEvent {
                count: full_manifest.len(),
            }),
        )
        .await;
    }

    let whitelist = ctx.judge.tool_names.clone();
    let manifest = manifest::apply_whitelist(full_manifest, whitelist.as_deref());
    if let Some(run_id) = run_id {
        rt.emit(
            run_id,
            RunEvent::SkillsSelected(SkillsSelectedEvent {
                ai_names: manifest.iter().map(|t| t.ai_name.clone()).collect(),
            }),
        )
        .await;
    }
    if manifest.is_empty() {
        return Ok(Plan::default());
    }

    let allowed: Vec<String> = manifest.iter().map(|t| t.ai_name.clone()).collect();
    let known: HashSet<String> = allowed.iter().cloned().collect();

    let thought = if rt.config.flags.plan_use_pre_thought {
        pre_thought(rt, objective, ctx, conversation, &manifest).await
    } else {
        None
    };
    let snippets = manifest::memory_snippets(rt, objective).await;

    let system = prompts::compose_system(
        prompts::PLANNER_BASE,
        &ctx.overlays,
        ctx.overlays.plan.as_deref(),
    );
    let mut user = format!(
        "Objective: {}\n\nAvailable tools:\n{}",
        objective,
        manifest::render_bullets(&manifest)
    );
    if let Some(thought) = &thought {
        user.push_str(&format!("\n\nPrior thinking:\n{}", thought));
    }
    if !snippets.is_empty() {
        user.push_str(&format!("\n\n{}", snippets.join("\n\n")));
    }
    let messages = prompts::stage_messages(system, conversation, user);

    let call = PlanCall {
        llm: Arc::clone(&rt.llm),
        strategy: rt.config.llm.tool_strategy,
        timeout_ms: rt.config.llm.stage_timeouts.plan_ms,
        temperature: (rt.config.llm.temperature - 0.1).max(0.0),
        messages,
        allowed: allowed.clone(),
        max_steps: rt.config.planner.max_steps,
        model: Some(rt.config.plan.model.clone()),
    };

    let mut steps = if rt.config.planner.multi_enable {
        multi_candidate_plan(rt, run_id, objective, call.clone(), &known).await
    } else {
        race_two(call.clone()).await
    };

    // One strict re-plan when the model used unknown tools or nothing.
    let has_unknown = steps.iter().any(|s| !known.contains(&s.ai_name));
    if steps.is_empty() || has_unknown {
        let mut strict = call.clone();
        strict.messages.push(ChatMessage::assistant(format!(
            "The previous plan was empty or used unavailable tools. The ONLY legal aiName \
             values are: {}. Every other name is forbidden. Emit the full plan again.",
            allowed.join(", ")
        )));
        let retry = filter_known(request_plan(strict).await, &known);
        if !retry.is_empty() {
            steps = retry;
        } else {
            steps = filter_known(steps, &known);
        }
    }

    steps.truncate(rt.config.planner.max_steps.max(1));
    let mut plan = Plan::new(manifest, steps);
    plan.assign_step_ids();
    plan.renumber();

    // Dependency validation: one strict re-plan, then the
    // strip-everything fallback (never deadlock).
    let errors = plan.dependency_errors();
    if !errors.is_empty() {
        tracing::debug!(errors = errors.len(), "Plan has invalid dependencies; re-planning");
        let mut strict = call;
        strict.messages.push(ChatMessage::assistant(format!(
            "The previous plan had invalid dependencies:\n{}\nEvery dependsOnStepIds entry \
             must name the stepId of an EARLIER step of your own plan — never itself, never \
             a later step, never an unknown id. Emit the full plan again.",
            errors
                .iter()
                .map(|e| format!("- {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )));
        let retry = filter_known(request_plan(strict).await, &known);
        if !retry.is_empty() {
            let mut retry_plan = Plan::new(plan.manifest.clone(), retry);
            retry_plan.assign_step_ids();
            retry_plan.renumber();
            if retry_plan.dependency_errors().is_empty() {
                plan = retry_plan;
            } else {
                plan.strip_dependencies();
            }
        } else {
            plan.strip_dependencies();
        }
    }

    if rt.config.memory.enable && !plan.is_empty() {
        if let Some(memory) = rt.memory.as_ref() {
            if let Err(e) = memory.upsert(objective, &plan).await {
                tracing::warn!(error = %e, "Plan-memory upsert failed");
            }
        }
    }

    tracing::info!(
        steps = plan.steps.len(),
        manifest = plan.manifest.len(),
        "Plan generated"
    );
    Ok(plan)
}
