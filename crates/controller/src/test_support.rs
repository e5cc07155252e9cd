//! Shared fixtures for the crate's unit tests.

use std::sync::Arc;

use planweave_core::{
    config::AppConfig,
    mocks::MockCatalog,
    traits::{LlmClient, ToolCatalog},
};
use planweave_store::{ActiveRunRegistry, InMemoryHistoryStore, RunEventBus};

use crate::runtime::RunnerInner;

/// Runner over the given LLM and an empty mock catalog.
pub(crate) fn runner_inner_with(llm: impl LlmClient + 'static) -> RunnerInner {
    runner_inner(llm, MockCatalog::new())
}

/// Runner over the given LLM and catalog, default config.
pub(crate) fn runner_inner(
    llm: impl LlmClient + 'static,
    catalog: impl ToolCatalog + 'static,
) -> RunnerInner {
    RunnerInner {
        llm: Arc::new(llm),
        catalog: Arc::new(catalog),
        history: Arc::new(InMemoryHistoryStore::new()),
        bus: Arc::new(RunEventBus::default()),
        registry: Arc::new(ActiveRunRegistry::new()),
        memory: None,
        reranker: None,
        config: AppConfig::default(),
    }
}
