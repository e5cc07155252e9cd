//! Shared dependencies threaded through the planner, executor, and stages.

use std::sync::Arc;

use planweave_core::{
    config::AppConfig,
    events::RunEvent,
    traits::{HistoryStore, LlmClient, PlanMemory, Reranker, RunRegistry, ToolCatalog},
};
use planweave_store::RunEventBus;

/// Immutable bundle of collaborators owned by a [`crate::PlanRunner`].
pub struct RunnerInner {
    pub llm: Arc<dyn LlmClient>,
    pub catalog: Arc<dyn ToolCatalog>,
    pub history: Arc<dyn HistoryStore>,
    pub bus: Arc<RunEventBus>,
    pub registry: Arc<dyn RunRegistry>,
    pub memory: Option<Arc<dyn PlanMemory>>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub config: AppConfig,
}

impl RunnerInner {
    /// Mirror an event to the history store and the live bus, in that
    /// order. History failures are logged, never fatal.
    pub async fn emit(&self, run_id: &str, event: RunEvent) {
        tracing::debug!(run_id = %run_id, kind = event.kind(), "Emitting run event");
        if let Err(e) = self.history.append(run_id, event.clone()).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to append history record");
        }
        use planweave_core::traits::EventSink;
        self.bus.publish(run_id, event).await;
    }
}
