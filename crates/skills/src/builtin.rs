//! Built-in tools.

use async_trait::async_trait;
use serde_json::{json, Value};

use planweave_core::{
    traits::ToolCallCtx,
    types::{codes, ToolResult},
    Result,
};

use crate::registry::SkillTool;

// =============================================================================
// Echo Tool
// =============================================================================

/// Simple echo tool for testing.
pub struct EchoTool;

#[async_trait]
impl SkillTool for EchoTool {
    fn ai_name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes the input message back"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo"
                }
            },
            "required": ["message"]
        })
    }

    async fn call(&self, args: Value, _ctx: &ToolCallCtx) -> Result<ToolResult> {
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("No message provided");

        Ok(ToolResult::ok(json!({ "message": message })))
    }
}

// =============================================================================
// Calculator Tool
// =============================================================================

/// Simple four-operation calculator.
pub struct CalculatorTool;

#[async_trait]
impl SkillTool for CalculatorTool {
    fn ai_name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Performs basic arithmetic: add, subtract, multiply, divide"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["add", "subtract", "multiply", "divide"],
                    "description": "The operation to perform"
                },
                "a": { "type": "number", "description": "First operand" },
                "b": { "type": "number", "description": "Second operand" }
            },
            "required": ["operation", "a", "b"]
        })
    }

    async fn call(&self, args: Value, _ctx: &ToolCallCtx) -> Result<ToolResult> {
        let operation = args.get("operation").and_then(|v| v.as_str()).unwrap_or("");
        let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let value = match operation {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b == 0.0 {
                    return Ok(ToolResult::fail(codes::TOOL_ERROR, "Division by zero"));
                }
                a / b
            }
            other => {
                return Ok(ToolResult::fail(
                    codes::TOOL_ERROR,
                    format!("Unknown operation: {}", other),
                ))
            }
        };

        Ok(ToolResult::ok(json!({ "value": value })))
    }
}

// =============================================================================
// Remind Tool
// =============================================================================

/// Reminder tool. Declares a `schedule` argument, so the executor may
/// defer it and return a placeholder instead of dispatching.
pub struct RemindTool;

#[async_trait]
impl SkillTool for RemindTool {
    fn ai_name(&self) -> &str {
        "remind"
    }

    fn description(&self) -> &str {
        "Records a reminder to deliver at a later time"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "What to remind about"
                },
                "schedule": {
                    "type": "object",
                    "description": "When to deliver the reminder",
                    "properties": {
                        "text": { "type": "string", "description": "Natural-language time, e.g. 'in 10 minutes'" },
                        "when": { "type": "string" },
                        "targetISO": { "type": "string", "description": "Preprocessed RFC3339 target" }
                    }
                }
            },
            "required": ["content"]
        })
    }

    async fn call(&self, args: Value, _ctx: &ToolCallCtx) -> Result<ToolResult> {
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        Ok(ToolResult::ok(json!({
            "content": content,
            "recordedAt": chrono::Utc::now().to_rfc3339(),
        })))
    }
}
