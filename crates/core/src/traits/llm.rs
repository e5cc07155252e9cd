use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::ChatMessage;

// =============================================================================
// LLM Client
// =============================================================================

/// Declaration of a callable function offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecl {
    /// Function name.
    pub name: String,
    /// What the function does.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// How the model is allowed to use the offered functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionChoice {
    /// Model decides.
    Auto,
    /// Function calling disabled.
    None,
    /// The named function must be called.
    Required(String),
}

/// A single chat-completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Ordered conversation.
    pub messages: Vec<ChatMessage>,
    /// Functions offered to the model.
    pub tools: Vec<ToolDecl>,
    /// Function-choice constraint.
    pub tool_choice: Option<FunctionChoice>,
    /// Sampling temperature override.
    pub temperature: Option<f32>,
    /// Per-call timeout override.
    pub timeout_ms: Option<u64>,
    /// Model override.
    pub model: Option<String>,
}

impl ChatRequest {
    /// Build a plain request from messages.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            tool_choice: None,
            temperature: None,
            timeout_ms: None,
            model: None,
        }
    }

    /// Force a call to the given function.
    pub fn force_function(mut self, decl: ToolDecl) -> Self {
        self.tool_choice = Some(FunctionChoice::Required(decl.name.clone()));
        self.tools = vec![decl];
        self
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the per-call timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A function call returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallReply {
    /// Called function name.
    pub name: String,
    /// Raw JSON argument string as produced by the model.
    pub arguments: String,
}

impl FunctionCallReply {
    /// Parse the argument string, tolerating fenced or prefixed output.
    pub fn parse_arguments(&self) -> Result<Value> {
        let trimmed = self.arguments.trim();
        let unfenced = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .map(|s| s.trim_end_matches("```").trim())
            .unwrap_or(trimmed);
        Ok(serde_json::from_str(unfenced)?)
    }
}

/// First-choice message of a chat completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatReply {
    /// Assistant content (may be empty on a pure function call).
    pub content: String,
    /// Function calls, in model order.
    #[serde(default)]
    pub tool_calls: Vec<FunctionCallReply>,
}

impl ChatReply {
    /// Plain-content reply.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Reply consisting of a single function call.
    pub fn function_call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            content: String::new(),
            tool_calls: vec![FunctionCallReply {
                name: name.into(),
                arguments: arguments.to_string(),
            }],
        }
    }

    /// The first call to the named function, if present.
    pub fn call_named(&self, name: &str) -> Option<&FunctionCallReply> {
        self.tool_calls.iter().find(|c| c.name == name)
    }
}

/// One content delta of a streamed completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Content fragment.
    pub delta: String,
}

/// Chat-completion client over an OpenAI-compatible contract.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Non-streaming completion; the forced-function-call path used by
    /// the planner, audit, and arg repair lives here.
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply>;

    /// Streaming completion. Implementations must tolerate servers that
    /// answer a `stream:true` request with a single JSON payload by
    /// synthesizing pseudo-chunks.
    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>>;

    /// Generate an embedding for the given text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
