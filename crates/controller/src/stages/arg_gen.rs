//! ArgGen stage: synthesize, validate, and repair tool arguments.
//!
//! At most two LLM calls per step: one generation call (skippable via the
//! reuse cache) and, only when schema validation fails, one repair call
//! whose output is validated once more.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Value};

use planweave_core::{
    config::AppConfig,
    traits::{ChatRequest, LlmClient, ToolDecl},
    types::{ChatMessage, RunContext, Step},
};

use crate::executor::RecentResult;
use crate::prompts;
use crate::stages::{parse_fc_block, parse_json_loose};

const ARG_GEN_FN: &str = "emit_args";
const FIX_ARGS_FN: &str = "fix_args";

/// Outcome of the ArgGen pipeline for one step.
#[derive(Debug, Clone)]
pub struct ArgGenOutcome {
    /// Final arguments (the draft args when generation failed).
    pub args: Value,
    /// Generation-stage error, reported as `arggen_error`.
    pub error: Option<String>,
    /// Validation errors that survived the repair call; the step fails
    /// with `ARGS_INVALID` when set.
    pub invalid: Option<Vec<String>>,
}

/// Per-execution cache of generated arguments, keyed on the step's tool
/// and draft. Disabled during retry passes.
#[derive(Default)]
pub struct ArgCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl ArgCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(step: &Step) -> String {
        format!(
            "{}|{}",
            step.ai_name,
            Value::Object(step.draft_args.clone())
        )
    }

    fn get(&self, step: &Step) -> Option<Value> {
        self.entries.lock().unwrap().get(&Self::key(step)).cloned()
    }

    fn put(&self, step: &Step, args: &Value) {
        self.entries
            .lock()
            .unwrap()
            .insert(Self::key(step), args.clone());
    }
}

fn validate(schema: &Value, args: &Value) -> Vec<String> {
    match jsonschema::validator_for(schema) {
        Ok(validator) => validator
            .iter_errors(args)
            .map(|e| format!("{} (at {})", e, e.instance_path))
            .collect(),
        Err(e) => {
            // A broken schema must not block the tool.
            tracing::warn!(error = %e, "Tool schema does not compile; skipping validation");
            Vec::new()
        }
    }
}

fn render_recent(recent: &[RecentResult]) -> String {
    recent
        .iter()
        .map(|r| {
            format!(
                "- {} ({}): {}",
                r.ai_name,
                if r.result.success { "ok" } else { "failed" },
                truncate(&r.result.data.to_string(), 300)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn extract_args(reply: &planweave_core::traits::ChatReply, function: &str) -> Option<Value> {
    reply
        .call_named(function)
        .and_then(|c| c.parse_arguments().ok())
        .or_else(|| {
            parse_fc_block(&reply.content)
                .filter(|(name, _)| name == function)
                .map(|(_, args)| args)
        })
        .or_else(|| parse_json_loose(&reply.content))
        .filter(Value::is_object)
}

/// Run the ArgGen pipeline for one step.
#[allow(clippy::too_many_arguments)]
pub async fn generate_args(
    llm: &dyn LlmClient,
    config: &AppConfig,
    step: &Step,
    schema: &Value,
    dep_context: &str,
    recent: &[RecentResult],
    conversation: &[ChatMessage],
    objective: &str,
    ctx: &RunContext,
    cache: Option<&ArgCache>,
) -> ArgGenOutcome {
    let draft = Value::Object(step.draft_args.clone());

    if let Some(cached) = cache.and_then(|c| c.get(step)) {
        tracing::debug!(step_id = %step.step_id, "Reusing cached arguments");
        return ArgGenOutcome {
            args: cached,
            error: None,
            invalid: None,
        };
    }

    let system = prompts::compose_system(prompts::ARG_GEN_BASE, &ctx.overlays, None);
    let mut user = format!(
        "Objective: {}\nTool: {}\nTool schema: {}\nDraft arguments: {}\nStep intent: {}",
        objective, step.ai_name, schema, draft, step.next_step
    );
    if !dep_context.is_empty() {
        user.push_str(&format!("\nUpstream results:\n{}", dep_context));
    }
    if !recent.is_empty() {
        user.push_str(&format!("\nRecent results:\n{}", render_recent(recent)));
    }

    let request = ChatRequest::from_messages(prompts::stage_messages(system, conversation, user))
        .force_function(ToolDecl {
            name: ARG_GEN_FN.to_string(),
            description: format!("Emit the final arguments for {}", step.ai_name),
            parameters: schema.clone(),
        })
        .with_timeout_ms(config.llm.stage_timeouts.arggen_ms);

    let (mut args, mut error) = match llm.chat(request).await {
        Ok(reply) => match extract_args(&reply, ARG_GEN_FN) {
            Some(args) => (args, None),
            None => (
                draft.clone(),
                Some("arggen returned no arguments".to_string()),
            ),
        },
        Err(e) => (draft.clone(), Some(e.to_string())),
    };

    let mut errors = validate(schema, &args);
    if !errors.is_empty() {
        match fix_args(llm, config, step, schema, &draft, &args, &errors).await {
            Some(fixed) => {
                let fixed_errors = validate(schema, &fixed);
                if fixed_errors.is_empty() {
                    args = fixed;
                    errors.clear();
                } else {
                    errors = fixed_errors;
                }
            }
            None => {
                if error.is_none() {
                    error = Some("fix_args produced no arguments".to_string());
                }
            }
        }
    }

    if errors.is_empty() {
        if let Some(cache) = cache {
            cache.put(step, &args);
        }
        ArgGenOutcome {
            args,
            error,
            invalid: None,
        }
    } else {
        ArgGenOutcome {
            args,
            error,
            invalid: Some(errors),
        }
    }
}

/// One-shot remediation call fed with the validator's error list.
async fn fix_args(
    llm: &dyn LlmClient,
    config: &AppConfig,
    step: &Step,
    schema: &Value,
    draft: &Value,
    current: &Value,
    errors: &[String],
) -> Option<Value> {
    let user = format!(
        "Tool: {}\nSchema: {}\nDraft arguments: {}\nCurrent arguments: {}\nValidation errors:\n{}",
        step.ai_name,
        schema,
        draft,
        current,
        errors
            .iter()
            .map(|e| format!("- {}", e))
            .collect::<Vec<_>>()
            .join("\n")
    );

    let request = ChatRequest::from_messages(vec![
        ChatMessage::system(prompts::FIX_ARGS_BASE.to_string()),
        ChatMessage::user(user),
    ])
    .force_function(ToolDecl {
        name: FIX_ARGS_FN.to_string(),
        description: "Emit corrected arguments".to_string(),
        parameters: schema.clone(),
    })
    .with_timeout_ms(config.llm.stage_timeouts.arggen_ms);

    match llm.chat(request).await {
        Ok(reply) => extract_args(&reply, FIX_ARGS_FN),
        Err(e) => {
            tracing::warn!(step_id = %step.step_id, error = %e, "FixArgs call failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planweave_core::mocks::ScriptedLlm;
    use planweave_core::traits::ChatReply;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" }
            },
            "required": ["message"]
        })
    }

    fn step() -> Step {
        let mut step = Step::new("echo");
        step.draft_args
            .insert("message".to_string(), json!("draft"));
        step
    }

    #[tokio::test]
    async fn test_generate_uses_llm_args() {
        let llm = ScriptedLlm::new().on_function(
            ARG_GEN_FN,
            vec![ChatReply::function_call(
                ARG_GEN_FN,
                json!({"message": "generated"}),
            )],
        );

        let outcome = generate_args(
            &llm,
            &AppConfig::default(),
            &step(),
            &schema(),
            "",
            &[],
            &[],
            "say something",
            &RunContext::default(),
            None,
        )
        .await;

        assert_eq!(outcome.args["message"], "generated");
        assert!(outcome.error.is_none());
        assert!(outcome.invalid.is_none());
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_draft() {
        // No scripted reply: extract fails, draft args survive validation.
        let llm = ScriptedLlm::new();
        let outcome = generate_args(
            &llm,
            &AppConfig::default(),
            &step(),
            &schema(),
            "",
            &[],
            &[],
            "say",
            &RunContext::default(),
            None,
        )
        .await;

        assert_eq!(outcome.args["message"], "draft");
        assert!(outcome.error.is_some());
        assert!(outcome.invalid.is_none());
    }

    #[tokio::test]
    async fn test_fix_args_repairs_invalid_output() {
        let llm = ScriptedLlm::new()
            .on_function(
                ARG_GEN_FN,
                vec![ChatReply::function_call(ARG_GEN_FN, json!({"message": 7}))],
            )
            .on_function(
                FIX_ARGS_FN,
                vec![ChatReply::function_call(
                    FIX_ARGS_FN,
                    json!({"message": "seven"}),
                )],
            );

        let outcome = generate_args(
            &llm,
            &AppConfig::default(),
            &step(),
            &schema(),
            "",
            &[],
            &[],
            "say",
            &RunContext::default(),
            None,
        )
        .await;

        assert_eq!(outcome.args["message"], "seven");
        assert!(outcome.invalid.is_none());
    }

    #[tokio::test]
    async fn test_second_validation_failure_is_invalid() {
        let llm = ScriptedLlm::new()
            .on_function(
                ARG_GEN_FN,
                vec![ChatReply::function_call(ARG_GEN_FN, json!({"message": 7}))],
            )
            .on_function(
                FIX_ARGS_FN,
                vec![ChatReply::function_call(FIX_ARGS_FN, json!({"message": 8}))],
            );

        let outcome = generate_args(
            &llm,
            &AppConfig::default(),
            &step(),
            &schema(),
            "",
            &[],
            &[],
            "say",
            &RunContext::default(),
            None,
        )
        .await;

        assert!(outcome.invalid.is_some());
    }

    #[tokio::test]
    async fn test_cache_short_circuits_second_call() {
        let llm = ScriptedLlm::new().on_function(
            ARG_GEN_FN,
            vec![ChatReply::function_call(
                ARG_GEN_FN,
                json!({"message": "once"}),
            )],
        );
        let cache = ArgCache::new();
        let config = AppConfig::default();

        let first = generate_args(
            &llm,
            &config,
            &step(),
            &schema(),
            "",
            &[],
            &[],
            "say",
            &RunContext::default(),
            Some(&cache),
        )
        .await;
        let second = generate_args(
            &llm,
            &config,
            &step(),
            &schema(),
            "",
            &[],
            &[],
            "say",
            &RunContext::default(),
            Some(&cache),
        )
        .await;

        assert_eq!(first.args, second.args);
        assert_eq!(llm.call_count(), 1);
    }
}
