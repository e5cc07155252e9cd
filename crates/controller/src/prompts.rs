//! Prompt assembly for the LLM stages.
//!
//! Every stage builds its system text the same way: a base template plus
//! the caller's global overlay, plus any stage-specific overlay blocks.

use planweave_core::types::{ChatMessage, PromptOverlays};

/// Fixed summary for runs the judge declares tool-free.
pub const NO_TOOLS_SUMMARY: &str = "本次任务判定无需调用工具。";

pub const PLANNER_BASE: &str = "\
You are a task planner. Given an objective and a catalog of callable \
tools, produce the smallest plan of tool invocations that accomplishes \
the objective. Only use tools from the catalog. Steps that need the \
output of an earlier step must list that step's id in dependsOnStepIds; \
independent steps must not be chained. Dependencies may only reference \
earlier steps.";

pub const JUDGE_BASE: &str = "\
You decide whether accomplishing the user's objective requires calling \
external tools. Answer strictly; plain conversation, opinions, and \
recall of common knowledge need no tools.";

pub const PRE_THOUGHT_BASE: &str = "\
Sketch, in a few short lines of prose, how you would accomplish the \
objective with the available tools. No lists, no JSON, just a compact \
plan of attack.";

pub const ARG_GEN_BASE: &str = "\
You produce the final JSON arguments for one tool invocation. Respect \
the tool's schema exactly. Prefer concrete values from the execution \
context over placeholders; leave optional fields out unless needed.";

pub const FIX_ARGS_BASE: &str = "\
The previous arguments failed schema validation. Produce corrected \
arguments that satisfy the schema, changing as little as possible.";

pub const EVALUATE_BASE: &str = "\
You review a finished tool run against the original objective. Decide \
whether it succeeded, whether anything is missing, and which steps \
failed. Judge by the tool results only.";

pub const REFLECT_BASE: &str = "\
You check whether the executed steps fully cover the objective. If \
operations are missing, name each one as a short imperative phrase.";

pub const SUMMARIZE_BASE: &str = "\
Write the final answer for the user from the run's tool results. Be \
concise, factual, and answer in the language of the objective. Do not \
mention tools, plans, or internal steps.";

pub const PLAN_PATCH_BASE: &str = "\
A step of the running plan failed. Decide whether to keep going, patch \
the remaining steps, or stop the run. Only edit steps that have not \
started; prefer the smallest change that still reaches the objective.";

/// Compose a stage's system prompt from its base template and overlays.
///
/// `stage_overlay` is the stage-specific block (for the planner this is
/// the `plan` overlay plus the concurrency hint).
pub fn compose_system(base: &str, overlays: &PromptOverlays, stage_overlay: Option<&str>) -> String {
    let mut out = String::from(base);
    if let Some(global) = overlays.global.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push_str("\n\n");
        out.push_str(global.trim());
    }
    if let Some(stage) = stage_overlay.filter(|s| !s.trim().is_empty()) {
        out.push_str("\n\n");
        out.push_str(stage.trim());
    }
    out
}

/// Build the message list for a stage: system text, prior conversation,
/// then the stage's user payload.
pub fn stage_messages(
    system: String,
    conversation: &[ChatMessage],
    user: String,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(conversation.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(conversation.iter().cloned());
    messages.push(ChatMessage::user(user));
    messages
}
