//! OpenAI-compatible LLM client.
//!
//! One client covers both paths the runtime needs: the non-streaming
//! forced-function-call path (plan emission, audit, argument repair) and
//! a streaming path that tolerates servers answering `stream:true` with a
//! single JSON payload.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::{json, Value};

use planweave_core::{
    traits::{ChatReply, ChatRequest, FunctionCallReply, FunctionChoice, LlmClient, StreamDelta},
    Error, Result,
};

use crate::sse::{pseudo_chunks, SseParser};

/// Maximum characters per synthesized pseudo-chunk.
const PSEUDO_CHUNK_CHARS: usize = 80;

/// Configuration for the OpenAI-compatible client.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL up to and including the version segment.
    pub base_url: String,
    /// Bearer token; requests go out unauthenticated when unset.
    pub api_key: Option<Secret<String>>,
    /// Default chat model.
    pub model: String,
    /// Embedding model.
    pub embedding_model: String,
    /// Default request timeout.
    pub request_timeout_ms: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            request_timeout_ms: 60_000,
        }
    }
}

impl OpenAiConfig {
    /// Create a config for the given endpoint and model.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(Secret::new(key.into()));
        self
    }

    /// Set the default request timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }
}

/// OpenAI-compatible chat-completion client.
pub struct OpenAiClient {
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl OpenAiClient {
    /// Create a new client.
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.config.model),
            "messages": request.messages,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if stream {
            body["stream"] = json!(true);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        match &request.tool_choice {
            Some(FunctionChoice::Auto) => body["tool_choice"] = json!("auto"),
            Some(FunctionChoice::None) => body["tool_choice"] = json!("none"),
            Some(FunctionChoice::Required(name)) => {
                body["tool_choice"] = json!({
                    "type": "function",
                    "function": { "name": name }
                });
            }
            None => {}
        }

        body
    }

    async fn post(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let timeout_ms = request.timeout_ms.unwrap_or(self.config.request_timeout_ms);
        let body = self.build_body(request, stream);

        tracing::debug!(
            model = body["model"].as_str().unwrap_or_default(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            stream,
            "Calling LLM"
        );

        let mut builder = self
            .http
            .post(self.endpoint("chat/completions"))
            .timeout(Duration::from_millis(timeout_ms))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::LlmTimeout(timeout_ms)
            } else {
                Error::llm(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::llm(format!("HTTP {}: {}", status, detail)));
        }

        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize, Default)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn into_reply(message: CompletionMessage) -> ChatReply {
    ChatReply {
        content: message.content.unwrap_or_default(),
        tool_calls: message
            .tool_calls
            .into_iter()
            .map(|c| FunctionCallReply {
                name: c.function.name,
                arguments: c.function.arguments,
            })
            .collect(),
    }
}

/// Extract the content delta from one streamed chunk payload.
fn delta_from_chunk(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let delta = value.get("choices")?.get(0)?.get("delta")?;
    delta
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
}

/// Extract plain content from a non-streamed completion body.
fn content_from_completion(payload: &str) -> Option<String> {
    let parsed: CompletionResponse = serde_json::from_str(payload).ok()?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply> {
        let response = self.post(&request, false).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::llm(format!("invalid completion body: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm("completion returned no choices"))?;

        Ok(into_reply(choice.message))
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        let response = self.post(&request, true).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let stream = futures::stream::unfold(
                (response.bytes_stream(), SseParser::new(), Vec::new()),
                |(mut body, mut parser, mut pending): (_, _, Vec<String>)| async move {
                    loop {
                        if let Some(delta) = pending.pop() {
                            return Some((Ok(StreamDelta { delta }), (body, parser, pending)));
                        }
                        if parser.is_done() {
                            return None;
                        }
                        match body.next().await {
                            Some(Ok(chunk)) => {
                                let text = String::from_utf8_lossy(&chunk).into_owned();
                                let mut deltas: Vec<String> = parser
                                    .feed(&text)
                                    .iter()
                                    .filter_map(|p| delta_from_chunk(p))
                                    .filter(|d| !d.is_empty())
                                    .collect();
                                // Popped from the back; keep arrival order.
                                deltas.reverse();
                                pending = deltas;
                            }
                            Some(Err(e)) => {
                                return Some((
                                    Err(Error::llm(format!("stream error: {}", e))),
                                    (body, parser, pending),
                                ));
                            }
                            None => return None,
                        }
                    }
                },
            );
            return Ok(Box::pin(stream));
        }

        // The server ignored `stream:true` and answered with one JSON
        // payload; synthesize pseudo-chunks, yielding between them.
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm(format!("invalid stream body: {}", e)))?;
        let content = content_from_completion(&body).unwrap_or(body);
        let chunks = pseudo_chunks(&content, PSEUDO_CHUNK_CHARS);

        let stream = futures::stream::unfold(chunks.into_iter(), |mut it| async move {
            let delta = it.next()?;
            tokio::task::yield_now().await;
            Some((Ok(StreamDelta { delta }), it))
        });
        Ok(Box::pin(stream))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut builder = self
            .http
            .post(self.endpoint("embeddings"))
            .timeout(Duration::from_millis(self.config.request_timeout_ms))
            .json(&json!({
                "model": self.config.embedding_model,
                "input": text,
            }));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::llm(format!("embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::llm(format!("embedding HTTP {}", status)));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::llm(format!("invalid embedding body: {}", e)))?;

        value["data"][0]["embedding"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
            .ok_or_else(|| Error::llm("no embedding returned"))
    }
}
