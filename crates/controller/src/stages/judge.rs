//! Judge stage: does this objective need tools at all?

use serde_json::json;

use planweave_core::{
    events::JudgeEvent,
    traits::{ChatRequest, FunctionChoice, ToolDecl},
    types::{ChatMessage, RunContext, ToolDescriptor},
};

use crate::prompts;
use crate::runtime::RunnerInner;
use crate::stages::{parse_fc_block, parse_json_loose};

const JUDGE_FN: &str = "judge_tool_necessity";

fn judge_decl(tool_names: &[String]) -> ToolDecl {
    ToolDecl {
        name: JUDGE_FN.to_string(),
        description: "Report whether the objective requires tool calls".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "need": {
                    "type": "boolean",
                    "description": "Whether any tool call is required"
                },
                "summary": {
                    "type": "string",
                    "description": "One-sentence verdict"
                },
                "toolNames": {
                    "type": "array",
                    "items": { "type": "string", "enum": tool_names },
                    "description": "Tools likely needed, from the catalog"
                }
            },
            "required": ["need", "summary"]
        }),
    }
}

/// Decide whether the objective needs tools.
///
/// Never fails: LLM or parse errors yield `ok: false`, which the
/// orchestrator surfaces as a `JUDGE_FAILED` short-circuit. A
/// `force_need_tools` hint bypasses the model entirely.
pub async fn judge_tool_necessity(
    rt: &RunnerInner,
    objective: &str,
    ctx: &RunContext,
    conversation: &[ChatMessage],
    tools: &[ToolDescriptor],
) -> JudgeEvent {
    if ctx.judge.force_need_tools {
        return JudgeEvent {
            need: true,
            summary: "forced".to_string(),
            tool_names: ctx.judge.tool_names.clone().unwrap_or_default(),
            ok: true,
        };
    }

    let tool_names: Vec<String> = tools.iter().map(|t| t.ai_name.clone()).collect();
    let listing: Vec<String> = tools
        .iter()
        .map(|t| format!("- {}: {}", t.ai_name, t.description))
        .collect();

    let system = prompts::compose_system(prompts::JUDGE_BASE, &ctx.overlays, None);
    let user = format!(
        "Objective: {}\n\nAvailable tools:\n{}",
        objective,
        listing.join("\n")
    );

    let use_fc = matches!(
        rt.config.llm.tool_strategy,
        planweave_core::config::ToolStrategy::Auto
    );
    let mut request = ChatRequest::from_messages(prompts::stage_messages(
        system,
        conversation,
        user,
    ))
    .with_timeout_ms(rt.config.llm.stage_timeouts.judge_ms);
    if use_fc {
        request = request.force_function(judge_decl(&tool_names));
    } else {
        let decl = judge_decl(&tool_names);
        request.messages.push(ChatMessage::system(format!(
            "Reply with exactly one <tool_call>{{\"name\": \"{}\", \"arguments\": {{...}}}}</tool_call> block. Arguments schema: {}",
            JUDGE_FN, decl.parameters
        )));
    }

    let reply = match rt.llm.chat(request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "Judge stage failed");
            return JudgeEvent {
                need: false,
                summary: format!("judge error: {}", e),
                tool_names: Vec::new(),
                ok: false,
            };
        }
    };

    let parsed = reply
        .call_named(JUDGE_FN)
        .and_then(|c| c.parse_arguments().ok())
        .or_else(|| {
            parse_fc_block(&reply.content)
                .filter(|(name, _)| name == JUDGE_FN)
                .map(|(_, args)| args)
        })
        .or_else(|| parse_json_loose(&reply.content));

    match parsed {
        Some(value) => {
            let mut names: Vec<String> = value["toolNames"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            // Drop hallucinated names up front.
            names.retain(|n| tool_names.contains(n));

            JudgeEvent {
                need: value["need"].as_bool().unwrap_or(false),
                summary: value["summary"].as_str().unwrap_or_default().to_string(),
                tool_names: names,
                ok: true,
            }
        }
        None => JudgeEvent {
            need: false,
            summary: "judge returned no verdict".to_string(),
            tool_names: Vec::new(),
            ok: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::runner_inner_with;
    use planweave_core::mocks::ScriptedLlm;
    use planweave_core::traits::ChatReply;

    fn tools() -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            ai_name: "weather".to_string(),
            description: "weather lookup".to_string(),
            input_schema: json!({"type": "object"}),
            provider: None,
            meta: None,
        }]
    }

    #[tokio::test]
    async fn test_judge_parses_function_call() {
        let llm = ScriptedLlm::new().on_function(
            JUDGE_FN,
            vec![ChatReply::function_call(
                JUDGE_FN,
                json!({"need": true, "summary": "needs lookup", "toolNames": ["weather", "ghost"]}),
            )],
        );
        let rt = runner_inner_with(llm);

        let verdict = judge_tool_necessity(
            &rt,
            "what's the weather",
            &RunContext::default(),
            &[],
            &tools(),
        )
        .await;

        assert!(verdict.ok);
        assert!(verdict.need);
        assert_eq!(verdict.tool_names, vec!["weather".to_string()]);
    }

    #[tokio::test]
    async fn test_judge_error_yields_not_ok() {
        // Empty scripted reply carries no verdict at all.
        let rt = runner_inner_with(ScriptedLlm::new());
        let verdict =
            judge_tool_necessity(&rt, "hi", &RunContext::default(), &[], &tools()).await;
        assert!(!verdict.ok);
        assert!(!verdict.need);
    }

    #[tokio::test]
    async fn test_force_need_tools_bypasses_llm() {
        let llm = ScriptedLlm::new();
        let rt = runner_inner_with(llm);
        let mut ctx = RunContext::default();
        ctx.judge.force_need_tools = true;

        let verdict = judge_tool_necessity(&rt, "hi", &ctx, &[], &tools()).await;
        assert!(verdict.need);
        assert!(verdict.ok);
    }
}
