//! Evaluate stage: post-execution verdict driving the retry loop.

use serde_json::json;

use planweave_core::{
    events::{EvaluationEvent, FailedStepRef, HistoryRecord},
    traits::{ChatRequest, ToolDecl},
    types::{ChatMessage, RunContext},
};

use crate::prompts;
use crate::runtime::RunnerInner;
use crate::stages::{condense_results, parse_json_loose};

const EVALUATE_FN: &str = "evaluate_run";

fn evaluate_decl() -> ToolDecl {
    ToolDecl {
        name: EVALUATE_FN.to_string(),
        description: "Report the run verdict".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "success": { "type": "boolean" },
                "summary": { "type": "string" },
                "incomplete": {
                    "type": "boolean",
                    "description": "True when the objective is only partially covered"
                },
                "failedSteps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "stepId": { "type": "string" },
                            "displayIndex": { "type": "integer" },
                            "aiName": { "type": "string" },
                            "reason": { "type": "string" }
                        },
                        "required": ["stepId"]
                    }
                }
            },
            "required": ["success", "summary"]
        }),
    }
}

/// Evaluate the run so far. Returns `None` when the stage itself errors;
/// the orchestrator then skips repair and reflection gating.
pub async fn evaluate_run(
    rt: &RunnerInner,
    objective: &str,
    ctx: &RunContext,
    records: &[HistoryRecord],
) -> Option<EvaluationEvent> {
    let system = prompts::compose_system(prompts::EVALUATE_BASE, &ctx.overlays, None);
    let user = format!(
        "Objective: {}\n\nStep results:\n{}",
        objective,
        condense_results(records, 400)
    );

    let request = ChatRequest::from_messages(vec![
        ChatMessage::system(system),
        ChatMessage::user(user),
    ])
    .force_function(evaluate_decl())
    .with_timeout_ms(rt.config.llm.stage_timeouts.evaluate_ms);

    let reply = match rt.llm.chat(request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "Evaluate stage failed");
            return None;
        }
    };

    let value = reply
        .call_named(EVALUATE_FN)
        .and_then(|c| c.parse_arguments().ok())
        .or_else(|| parse_json_loose(&reply.content))?;

    let failed_steps = value["failedSteps"]
        .as_array()
        .map(|steps| {
            steps
                .iter()
                .filter_map(|s| {
                    Some(FailedStepRef {
                        step_id: s["stepId"].as_str()?.to_string(),
                        display_index: s["displayIndex"].as_u64().unwrap_or(0) as usize,
                        ai_name: s["aiName"].as_str().unwrap_or_default().to_string(),
                        reason: s["reason"].as_str().unwrap_or_default().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(EvaluationEvent {
        success: value["success"].as_bool().unwrap_or(false),
        summary: value["summary"].as_str().unwrap_or_default().to_string(),
        incomplete: value["incomplete"].as_bool().unwrap_or(false),
        failed_steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::runner_inner_with;
    use planweave_core::mocks::ScriptedLlm;
    use planweave_core::traits::ChatReply;

    #[tokio::test]
    async fn test_evaluate_parses_failed_steps() {
        let llm = ScriptedLlm::new().on_function(
            EVALUATE_FN,
            vec![ChatReply::function_call(
                EVALUATE_FN,
                json!({
                    "success": false,
                    "summary": "step two broke",
                    "failedSteps": [
                        {"stepId": "s2", "aiName": "searcher", "reason": "timeout"}
                    ]
                }),
            )],
        );
        let rt = runner_inner_with(llm);

        let verdict = evaluate_run(&rt, "find it", &RunContext::default(), &[])
            .await
            .unwrap();
        assert!(!verdict.success);
        assert_eq!(verdict.failed_steps.len(), 1);
        assert_eq!(verdict.failed_steps[0].step_id, "s2");
    }

    #[tokio::test]
    async fn test_evaluate_error_is_none() {
        let rt = runner_inner_with(ScriptedLlm::new());
        assert!(
            evaluate_run(&rt, "find it", &RunContext::default(), &[])
                .await
                .is_none()
        );
    }
}
