//! LLM-driven sub-stages of a run.
//!
//! Each stage is a thin wrapper over one or two LLM calls with a tolerant
//! fallback: stage exceptions never fail the run.

pub mod arg_gen;
pub mod evaluate;
pub mod judge;
pub mod pre_thought;
pub mod reflect;
pub mod summarize;

use serde_json::Value;

use planweave_core::events::{HistoryRecord, RunEvent, ToolResultEvent};

/// Parse a JSON object out of model text, tolerating code fences and
/// surrounding prose.
pub fn parse_json_loose(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    // Strip a fenced block if present.
    if let Some(start) = trimmed.find("```") {
        let inner = &trimmed[start + 3..];
        let inner = inner.strip_prefix("json").unwrap_or(inner);
        if let Some(end) = inner.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(inner[..end].trim()) {
                return Some(value);
            }
        }
    }

    // Last resort: the widest brace span.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(trimmed[start..=end].trim()).ok()
}

/// Parse a raw `<tool_call>` block from plain content (the `fc` tool
/// strategy): `<tool_call>{"name": "...", "arguments": {...}}</tool_call>`.
pub fn parse_fc_block(content: &str) -> Option<(String, Value)> {
    let start = content.find("<tool_call>")?;
    let rest = &content[start + "<tool_call>".len()..];
    let end = rest.find("</tool_call>")?;
    let value = parse_json_loose(&rest[..end])?;

    let name = value.get("name")?.as_str()?.to_string();
    let arguments = value.get("arguments").cloned().unwrap_or(Value::Null);
    Some((name, arguments))
}

/// All step results recorded so far, flattened out of singleton and group
/// events, in emission order.
pub fn flatten_tool_results(records: &[HistoryRecord]) -> Vec<&ToolResultEvent> {
    let mut results = Vec::new();
    for record in records {
        match &record.event {
            RunEvent::ToolResult(event) => results.push(event),
            RunEvent::ToolResultGroup(group) => results.extend(group.events.iter()),
            _ => {}
        }
    }
    results
}

/// Condense recorded tool results into a prompt block, newest last.
pub fn condense_results(records: &[HistoryRecord], max_chars_per_result: usize) -> String {
    let mut lines = Vec::new();
    for event in flatten_tool_results(records) {
        let payload = if let Some(message) = &event.result.message {
            message.clone()
        } else {
            event.result.data.to_string()
        };
        let mut payload: String = payload.chars().take(max_chars_per_result).collect();
        if payload.is_empty() {
            payload = "(empty)".to_string();
        }
        lines.push(format!(
            "[{}] {} {} -> {}: {}",
            event.step_id,
            event.ai_name,
            if event.result.success { "ok" } else { "failed" },
            event.result.code,
            payload
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_loose_plain() {
        assert_eq!(
            parse_json_loose(r#"{"a": 1}"#).unwrap()["a"],
            Value::from(1)
        );
    }

    #[test]
    fn test_parse_json_loose_fenced() {
        let text = "Sure, here you go:\n```json\n{\"need\": true}\n```";
        assert_eq!(parse_json_loose(text).unwrap()["need"], Value::Bool(true));
    }

    #[test]
    fn test_parse_json_loose_embedded() {
        let text = "the verdict is {\"ok\": false} as discussed";
        assert_eq!(parse_json_loose(text).unwrap()["ok"], Value::Bool(false));
    }

    #[test]
    fn test_parse_fc_block() {
        let content = "thinking...\n<tool_call>{\"name\": \"emit_plan\", \"arguments\": {\"steps\": []}}</tool_call>";
        let (name, args) = parse_fc_block(content).unwrap();
        assert_eq!(name, "emit_plan");
        assert!(args["steps"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_parse_fc_block_missing() {
        assert!(parse_fc_block("no call here").is_none());
    }
}
