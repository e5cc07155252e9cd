use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Plan, ToolDescriptor};

// =============================================================================
// Plan Memory & Reranker (optional collaborators)
// =============================================================================

/// A remembered plan scored against the current objective.
#[derive(Debug, Clone)]
pub struct PlanMemoryHit {
    /// Objective the plan was stored under.
    pub objective: String,
    /// Condensed plan text injected into the planner prompt.
    pub snippet: String,
    /// Relevance score in `[0, 1]`.
    pub score: f64,
}

/// Historical plan memory keyed on objectives.
#[async_trait]
pub trait PlanMemory: Send + Sync {
    /// Search for plans relevant to the objective, best first.
    async fn search(&self, objective: &str, limit: usize) -> Result<Vec<PlanMemoryHit>>;

    /// Store (or refresh) the plan produced for an objective.
    async fn upsert(&self, objective: &str, plan: &Plan) -> Result<()>;
}

/// Semantic reranker over the tool manifest.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Reorder `tools` by relevance to the objective and keep the top
    /// `top_n`. Implementations fall back to the input order on error.
    async fn rerank(
        &self,
        objective: &str,
        tools: Vec<ToolDescriptor>,
        top_n: usize,
    ) -> Result<Vec<ToolDescriptor>>;
}
