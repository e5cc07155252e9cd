//! Axum-based HTTP server for the runtime.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use planweave_controller::PlanRunner;
use planweave_core::types::{ChatMessage, RunContext};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
    /// Enable CORS.
    pub enable_cors: bool,
    /// Enable request tracing.
    pub enable_tracing: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The plan-and-execute runtime.
    pub runner: PlanRunner,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunRequest {
    objective: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    identity_key: String,
    #[serde(default)]
    conversation: Vec<ChatMessage>,
    #[serde(default)]
    context: Option<RunContext>,
}

impl CreateRunRequest {
    fn into_parts(self) -> (String, RunContext, Vec<ChatMessage>) {
        let mut ctx = self.context.unwrap_or_default();
        if ctx.channel_id.is_empty() {
            ctx.channel_id = self.channel_id;
        }
        if ctx.identity_key.is_empty() {
            ctx.identity_key = self.identity_key;
        }
        (self.objective, ctx, self.conversation)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunResponse {
    run_id: String,
}

/// Build the HTTP router.
pub fn build_router(state: AppState, config: &GatewayConfig) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(health))
        .route("/v1/tools", get(list_tools))
        .route("/v1/runs", post(create_run))
        .route("/v1/runs/stream", post(create_run_stream))
        .route("/v1/runs/:run_id/events", get(run_events))
        .route("/v1/runs/:run_id/cancel", post(cancel_run))
        .route("/v1/runs/:run_id/history", get(run_history))
        .with_state(state);

    if config.enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    if config.enable_tracing {
        router = router.layer(TraceLayer::new_for_http());
    }
    router
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, config: GatewayConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let router = build_router(state, &config);

    tracing::info!(addr = %addr, "Gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    match state.runner.catalog().available_tools().await {
        Ok(tools) => Json(serde_json::json!({ "tools": tools })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to list tools");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Start a run in the background and return its id.
async fn create_run(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> impl IntoResponse {
    if request.objective.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "objective must not be empty").into_response();
    }

    let (objective, ctx, conversation) = request.into_parts();
    let (run_id, mut events) = state
        .runner
        .plan_then_execute_stream(objective, ctx, conversation)
        .await;

    // Drain the subscription so the producer never depends on a client
    // attaching to /events.
    tokio::spawn(async move { while events.next().await.is_some() {} });

    Json(CreateRunResponse { run_id }).into_response()
}

/// Start a run and stream its events on the same connection.
async fn create_run_stream(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> axum::response::Response {
    if request.objective.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "objective must not be empty").into_response();
    }

    let (objective, ctx, conversation) = request.into_parts();
    let (run_id, events) = state
        .runner
        .plan_then_execute_stream(objective, ctx, conversation)
        .await;
    tracing::info!(run_id = %run_id, "Streaming run started");

    sse_response(events.map(|event| event_to_sse(&event))).into_response()
}

/// Attach to an already-running run's event stream.
async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> axum::response::Response {
    let bus = state.runner.bus();
    let subscription = bus.subscribe(&run_id);

    let stream = futures::stream::unfold(
        (subscription, false),
        |(mut subscription, done)| async move {
            if done {
                return None;
            }
            let event = subscription.next().await?;
            let terminal = event.is_terminal();
            Some((event_to_sse(&event), (subscription, terminal)))
        },
    );

    sse_response(stream).into_response()
}

fn event_to_sse(event: &planweave_core::events::RunEvent) -> Result<Event, Infallible> {
    let payload = serde_json::to_string(event).unwrap_or_else(|e| {
        format!("{{\"type\":\"error\",\"error\":\"{}\"}}", e)
    });
    Ok(Event::default().data(payload))
}

/// SSE response with the `: stream-open` preamble and a 15 s heartbeat.
fn sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let preamble = futures::stream::once(async { Ok(Event::default().comment("stream-open")) });
    Sse::new(preamble.chain(stream)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    let cancelled = state.runner.cancel_run(&run_id).await;
    Json(serde_json::json!({ "runId": run_id, "cancelled": cancelled }))
}

async fn run_history(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    match state.runner.history().list(&run_id).await {
        Ok(records) if records.is_empty() => {
            (StatusCode::NOT_FOUND, "unknown run").into_response()
        }
        Ok(records) => Json(serde_json::json!({ "runId": run_id, "records": records })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to load history");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
