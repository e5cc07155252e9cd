//! Embedding-based manifest reranker.

use std::sync::Arc;

use async_trait::async_trait;

use planweave_core::{
    traits::{LlmClient, Reranker},
    types::ToolDescriptor,
    Result,
};

/// Reranks the tool manifest by cosine similarity between the objective
/// embedding and each tool's `name: description` embedding. Falls back to
/// the catalog order when the embedding backend fails.
pub struct EmbeddingReranker {
    llm: Arc<dyn LlmClient>,
}

impl EmbeddingReranker {
    /// Create a reranker over the given LLM client.
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn try_rerank(
        &self,
        objective: &str,
        tools: &[ToolDescriptor],
        top_n: usize,
    ) -> Result<Vec<ToolDescriptor>> {
        let query = self.llm.embed(objective).await?;

        let texts: Vec<String> = tools
            .iter()
            .map(|t| format!("{}: {}", t.ai_name, t.description))
            .collect();
        let embeddings =
            futures::future::join_all(texts.iter().map(|t| self.llm.embed(t))).await;

        let mut scored: Vec<(f32, &ToolDescriptor)> = Vec::with_capacity(tools.len());
        for (tool, embedding) in tools.iter().zip(embeddings) {
            let embedding = embedding?;
            scored.push((cosine(&query, &embedding), tool));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(top_n)
            .map(|(_, t)| t.clone())
            .collect())
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    async fn rerank(
        &self,
        objective: &str,
        tools: Vec<ToolDescriptor>,
        top_n: usize,
    ) -> Result<Vec<ToolDescriptor>> {
        if tools.len() <= 1 {
            return Ok(tools);
        }

        match self.try_rerank(objective, &tools, top_n).await {
            Ok(reranked) => Ok(reranked),
            Err(e) => {
                tracing::warn!(error = %e, "Rerank failed; keeping catalog order");
                Ok(tools.into_iter().take(top_n).collect())
            }
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
