//! Planweave — agentic plan-and-execute runtime.
//!
//! Wires configuration, stores, the tool catalog, the LLM client, and the
//! orchestrator together behind the HTTP gateway.

use std::sync::Arc;

use planweave_controller::PlanRunner;
use planweave_core::config::AppConfig;
use planweave_core::traits::HistoryStore;
use planweave_gateway::{AppState, GatewayConfig};
use planweave_model_gateway::{EmbeddingReranker, OpenAiClient, OpenAiConfig};
use planweave_skills::{CalculatorTool, EchoTool, RemindTool, SkillRegistry};
use planweave_store::{
    ActiveRunRegistry, InMemoryHistoryStore, InMemoryPlanMemory, RunEventBus, SqliteHistoryStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,planweave=debug".into()),
        )
        .init();

    tracing::info!("Starting Planweave v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let app_config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Config load failed; using defaults");
        AppConfig::default()
    });

    // =========================================================================
    // History store
    // =========================================================================
    let history: Arc<dyn HistoryStore> = if let Some(path) = &app_config.store.sqlite_path {
        tracing::info!(path = %path, "Initializing SQLite history store");
        Arc::new(SqliteHistoryStore::open(path)?)
    } else {
        tracing::info!("Initializing in-memory history store");
        Arc::new(InMemoryHistoryStore::new())
    };

    let bus = Arc::new(RunEventBus::default());
    let registry = Arc::new(ActiveRunRegistry::new());

    // =========================================================================
    // Tool catalog
    // =========================================================================
    let catalog = Arc::new(SkillRegistry::new());
    catalog.register(Arc::new(EchoTool))?;
    catalog.register(Arc::new(CalculatorTool))?;
    catalog.register(Arc::new(RemindTool))?;
    tracing::info!(tools = catalog.len(), "Tool catalog ready");

    // =========================================================================
    // LLM client
    // =========================================================================
    let mut llm_config = OpenAiConfig::new(
        app_config.llm.base_url.clone(),
        app_config.plan.model.clone(),
    )
    .with_timeout_ms(app_config.llm.request_timeout_ms);
    if let Some(key) = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()) {
        llm_config = llm_config.with_api_key(key);
    }
    let llm = Arc::new(OpenAiClient::new(llm_config));

    // =========================================================================
    // Runner
    // =========================================================================
    let mut builder = PlanRunner::builder()
        .llm(llm.clone())
        .catalog(catalog)
        .history(history)
        .bus(bus)
        .registry(registry)
        .config(app_config.clone());
    if app_config.rerank.enable {
        builder = builder.reranker(Arc::new(EmbeddingReranker::new(llm)));
    }
    if app_config.memory.enable {
        builder = builder.memory(Arc::new(InMemoryPlanMemory::new()));
    }
    let runner = builder.build()?;

    // =========================================================================
    // Gateway
    // =========================================================================
    let gateway_config = GatewayConfig {
        host: app_config.server.host.clone(),
        port: app_config.server.port,
        ..Default::default()
    };
    planweave_gateway::serve(AppState { runner }, gateway_config).await
}
