//! Mock implementations of core traits for testing.
//!
//! Scripted doubles for the LLM client and the tool catalog, used across
//! the workspace for unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::traits::{
    ChatReply, ChatRequest, FunctionChoice, LlmClient, StreamDelta, ToolCallCtx, ToolCatalog,
};
use crate::types::{ToolDescriptor, ToolResult};

// =============================================================================
// Scripted LLM Client
// =============================================================================

/// Scripted mock LLM.
///
/// Replies are keyed by forced-function name so multi-stage tests do not
/// depend on call order; plain-chat calls drain a separate queue. Every
/// request is recorded for assertions.
#[derive(Default)]
pub struct ScriptedLlm {
    by_function: Mutex<HashMap<String, VecDeque<ChatReply>>>,
    plain: Mutex<VecDeque<ChatReply>>,
    fallback: Mutex<Option<ChatReply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for calls that force the named function.
    pub fn on_function(self, name: &str, replies: Vec<ChatReply>) -> Self {
        self.by_function
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .extend(replies);
        self
    }

    /// Queue replies for plain (non-forced) chat calls.
    pub fn on_plain(self, replies: Vec<ChatReply>) -> Self {
        self.plain.lock().unwrap().extend(replies);
        self
    }

    /// Reply returned when every matching queue is empty.
    pub fn with_fallback(self, reply: ChatReply) -> Self {
        *self.fallback.lock().unwrap() = Some(reply);
        self
    }

    /// All requests seen so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of chat calls made.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_reply(&self, request: &ChatRequest) -> ChatReply {
        if let Some(FunctionChoice::Required(name)) = &request.tool_choice {
            if let Some(queue) = self.by_function.lock().unwrap().get_mut(name) {
                if let Some(reply) = queue.pop_front() {
                    return reply;
                }
            }
        } else if let Some(reply) = self.plain.lock().unwrap().pop_front() {
            return reply;
        }
        self.fallback
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| ChatReply::text(""))
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply> {
        let reply = self.next_reply(&request);
        self.requests.lock().unwrap().push(request);
        Ok(reply)
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        let reply = self.chat(request).await?;
        let chunks: Vec<Result<StreamDelta>> = reply
            .content
            .chars()
            .collect::<Vec<_>>()
            .chunks(80)
            .map(|c| {
                Ok(StreamDelta {
                    delta: c.iter().collect(),
                })
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(bag_of_words_embedding(text, 64))
    }
}

/// Deterministic bag-of-words embedding for tests and fallbacks.
pub fn bag_of_words_embedding(text: &str, dim: usize) -> Vec<f32> {
    let mut embedding = vec![0.0f32; dim];
    for word in text.split_whitespace() {
        let mut hash: u32 = 5381;
        for byte in word.bytes() {
            hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
        }
        embedding[(hash as usize) % dim] += 1.0;
    }
    let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for v in &mut embedding {
            *v /= magnitude;
        }
    }
    embedding
}

// =============================================================================
// Scripted Tool Catalog
// =============================================================================

/// One recorded tool invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub ai_name: String,
    pub args: Value,
    pub run_id: String,
    pub step_index: usize,
}

/// A scripted tool: drains a result queue, then repeats the last result.
pub struct ScriptedTool {
    descriptor: ToolDescriptor,
    results: Mutex<VecDeque<ToolResult>>,
    last: Mutex<ToolResult>,
}

impl ScriptedTool {
    pub fn new(ai_name: &str) -> Self {
        Self {
            descriptor: ToolDescriptor {
                ai_name: ai_name.to_string(),
                description: format!("scripted tool {}", ai_name),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {},
                    "additionalProperties": true
                }),
                provider: None,
                meta: None,
            },
            results: Mutex::new(VecDeque::new()),
            last: Mutex::new(ToolResult::ok(Value::Null)),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.descriptor.description = description.to_string();
        self
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.descriptor.provider = Some(provider.to_string());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.descriptor.input_schema = schema;
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.descriptor.meta = Some(meta);
        self
    }

    /// Queue results for successive calls.
    pub fn with_results(self, results: Vec<ToolResult>) -> Self {
        self.results.lock().unwrap().extend(results);
        self
    }

    fn next_result(&self) -> ToolResult {
        let mut queue = self.results.lock().unwrap();
        if let Some(result) = queue.pop_front() {
            *self.last.lock().unwrap() = result.clone();
            result
        } else {
            self.last.lock().unwrap().clone()
        }
    }
}

/// Catalog over scripted tools, recording every dispatch.
#[derive(Default)]
pub struct MockCatalog {
    tools: Vec<Arc<ScriptedTool>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: ScriptedTool) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// All invocations seen so far, in dispatch order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocation count for one tool.
    pub fn calls_for(&self, ai_name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.ai_name == ai_name)
            .count()
    }
}

#[async_trait]
impl ToolCatalog for MockCatalog {
    async fn available_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self
            .tools
            .iter()
            .map(|t| ToolDescriptor {
                meta: None,
                ..t.descriptor.clone()
            })
            .collect())
    }

    async fn available_tools_detailed(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.tools.iter().map(|t| t.descriptor.clone()).collect())
    }

    async fn call_by_ai_name(
        &self,
        ai_name: &str,
        args: Value,
        ctx: ToolCallCtx,
    ) -> Result<ToolResult> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.descriptor.ai_name == ai_name)
            .ok_or_else(|| Error::tool_not_found(ai_name))?;

        self.calls.lock().unwrap().push(RecordedCall {
            ai_name: ai_name.to_string(),
            args,
            run_id: ctx.run_id,
            step_index: ctx.step_index,
        });

        Ok(tool.next_result())
    }
}
