//! Model gateway for Planweave.
//!
//! This crate provides the OpenAI-compatible chat-completion client used
//! by every LLM stage (non-streaming forced function calls plus a
//! streaming path), and the embedding-based manifest reranker.

pub mod openai;
pub mod rerank;
pub mod sse;

pub use openai::{OpenAiClient, OpenAiConfig};
pub use rerank::EmbeddingReranker;
