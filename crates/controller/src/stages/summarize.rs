//! Summarize stage: the run's final natural-language answer.

use planweave_core::{
    events::HistoryRecord,
    traits::ChatRequest,
    types::{ChatMessage, RunContext},
};

use crate::prompts;
use crate::runtime::RunnerInner;
use crate::stages::{condense_results, flatten_tool_results};

/// Produce the final summary from the run's recorded history. Falls back
/// to a terse synthetic line when the LLM call fails.
pub async fn summarize_run(
    rt: &RunnerInner,
    objective: &str,
    ctx: &RunContext,
    records: &[HistoryRecord],
) -> String {
    let results = flatten_tool_results(records);
    if results.is_empty() {
        return prompts::NO_TOOLS_SUMMARY.to_string();
    }

    let system = prompts::compose_system(prompts::SUMMARIZE_BASE, &ctx.overlays, None);
    let user = format!(
        "Objective: {}\n\nTool results:\n{}",
        objective,
        condense_results(records, 600)
    );

    let request = ChatRequest::from_messages(vec![
        ChatMessage::system(system),
        ChatMessage::user(user),
    ])
    .with_timeout_ms(rt.config.llm.stage_timeouts.summary_ms);

    match rt.llm.chat(request).await {
        Ok(reply) if !reply.content.trim().is_empty() => reply.content.trim().to_string(),
        Ok(_) => fallback_summary(records),
        Err(e) => {
            tracing::warn!(error = %e, "Summarize stage failed — using fallback");
            fallback_summary(records)
        }
    }
}

fn fallback_summary(records: &[HistoryRecord]) -> String {
    let results = flatten_tool_results(records);
    let succeeded = results.iter().filter(|r| r.result.success).count();
    format!(
        "Executed {} tool step(s), {} succeeded.",
        results.len(),
        succeeded
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::runner_inner_with;
    use planweave_core::mocks::ScriptedLlm;
    use planweave_core::traits::ChatReply;

    #[tokio::test]
    async fn test_empty_history_uses_no_tools_summary() {
        let rt = runner_inner_with(ScriptedLlm::new());
        let summary = summarize_run(&rt, "say hello", &RunContext::default(), &[]).await;
        assert_eq!(summary, prompts::NO_TOOLS_SUMMARY);
    }

    #[tokio::test]
    async fn test_summary_uses_llm_text() {
        use planweave_core::events::{RunEvent, ToolResultEvent};
        use planweave_core::types::ToolResult;

        let llm = ScriptedLlm::new().on_plain(vec![ChatReply::text("The weather is sunny.")]);
        let rt = runner_inner_with(llm);

        let record = HistoryRecord {
            seq: 0,
            timestamp_ms: 0,
            event: RunEvent::ToolResult(ToolResultEvent {
                planned_step_index: 0,
                step_id: "s1".to_string(),
                execution_index: 0,
                ai_name: "weather".to_string(),
                reason: vec![],
                next_step: String::new(),
                args: serde_json::json!({}),
                result: ToolResult::ok(serde_json::json!({"forecast": "sunny"})),
                elapsed_ms: 1,
                depends_on_step_ids: vec![],
                depended_by_step_ids: vec![],
                depends_note: None,
                group_id: 0,
                group_size: 1,
                tool_meta: None,
                completion: None,
                result_stream: true,
                result_status: None,
            }),
        };

        let summary = summarize_run(&rt, "weather?", &RunContext::default(), &[record]).await;
        assert_eq!(summary, "The weather is sunny.");
    }
}
