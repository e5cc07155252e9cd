//! Reflection stage: completeness check and supplement discovery.

use serde_json::json;

use planweave_core::{
    events::{HistoryRecord, ReflectionEvent},
    traits::{ChatRequest, ToolDecl},
    types::{ChatMessage, RunContext},
};

use crate::prompts;
use crate::runtime::RunnerInner;
use crate::stages::{condense_results, parse_json_loose};

const REFLECT_FN: &str = "check_task_completeness";

fn reflect_decl() -> ToolDecl {
    ToolDecl {
        name: REFLECT_FN.to_string(),
        description: "Report whether the executed steps fully cover the objective".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "isComplete": { "type": "boolean" },
                "supplements": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Missing operations, one imperative phrase each"
                }
            },
            "required": ["isComplete"]
        }),
    }
}

/// Check whether the run covered the objective. Returns `None` on stage
/// error; reflection is then bypassed.
pub async fn check_task_completeness(
    rt: &RunnerInner,
    objective: &str,
    ctx: &RunContext,
    records: &[HistoryRecord],
) -> Option<ReflectionEvent> {
    let system = prompts::compose_system(prompts::REFLECT_BASE, &ctx.overlays, None);
    let user = format!(
        "Objective: {}\n\nExecuted steps and results:\n{}",
        objective,
        condense_results(records, 300)
    );

    let request = ChatRequest::from_messages(vec![
        ChatMessage::system(system),
        ChatMessage::user(user),
    ])
    .force_function(reflect_decl())
    .with_timeout_ms(rt.config.llm.stage_timeouts.reflect_ms);

    let reply = match rt.llm.chat(request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "Reflection stage failed");
            return None;
        }
    };

    let value = reply
        .call_named(REFLECT_FN)
        .and_then(|c| c.parse_arguments().ok())
        .or_else(|| parse_json_loose(&reply.content))?;

    Some(ReflectionEvent {
        is_complete: value["isComplete"].as_bool().unwrap_or(true),
        supplements: value["supplements"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .filter(|s| !s.trim().is_empty())
                    .collect()
            })
            .unwrap_or_default(),
    })
}

/// Synthetic objective for a supplementary plan: the original objective,
/// what already ran, and the missing operations.
pub fn supplement_objective(
    objective: &str,
    records: &[HistoryRecord],
    supplements: &[String],
) -> String {
    format!(
        "{}\n\nAlready completed steps:\n{}\n\nStill missing (plan only these):\n{}",
        objective,
        condense_results(records, 200),
        supplements
            .iter()
            .map(|s| format!("- {}", s))
            .collect::<Vec<_>>()
            .join("\n")
    )
}
