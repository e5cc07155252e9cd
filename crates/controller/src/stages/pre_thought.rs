//! Pre-thought stage: a short plan-in-prose appended to the planner
//! prompt.

use planweave_core::{
    traits::ChatRequest,
    types::{ChatMessage, RunContext, ToolDescriptor},
};

use crate::prompts;
use crate::runtime::RunnerInner;

/// Produce a short free-text sketch of how to tackle the objective, or
/// `None` when the call fails or returns nothing useful.
pub async fn pre_thought(
    rt: &RunnerInner,
    objective: &str,
    ctx: &RunContext,
    conversation: &[ChatMessage],
    tools: &[ToolDescriptor],
) -> Option<String> {
    let listing: Vec<String> = tools
        .iter()
        .map(|t| format!("- {}: {}", t.ai_name, t.description))
        .collect();

    let system = prompts::compose_system(prompts::PRE_THOUGHT_BASE, &ctx.overlays, None);
    let user = format!(
        "Objective: {}\n\nAvailable tools:\n{}",
        objective,
        listing.join("\n")
    );

    let request = ChatRequest::from_messages(prompts::stage_messages(system, conversation, user))
        .with_timeout_ms(rt.config.llm.stage_timeouts.pre_thought_ms);

    match rt.llm.chat(request).await {
        Ok(reply) => {
            let text = reply.content.trim().to_string();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Pre-thought stage failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::runner_inner_with;
    use planweave_core::mocks::ScriptedLlm;
    use planweave_core::traits::ChatReply;

    #[tokio::test]
    async fn test_pre_thought_returns_text() {
        let llm = ScriptedLlm::new().on_plain(vec![ChatReply::text("first search, then draw")]);
        let rt = runner_inner_with(llm);

        let thought = pre_thought(&rt, "make a cat picture", &RunContext::default(), &[], &[])
            .await
            .unwrap();
        assert!(thought.contains("search"));
    }

    #[tokio::test]
    async fn test_pre_thought_empty_is_none() {
        let rt = runner_inner_with(ScriptedLlm::new());
        assert!(
            pre_thought(&rt, "x", &RunContext::default(), &[], &[])
                .await
                .is_none()
        );
    }
}
