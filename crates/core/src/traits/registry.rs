use async_trait::async_trait;

// =============================================================================
// Run Registry & Cancellation Plane
// =============================================================================

/// Identity of an active run, keyed by `(channel_id, identity_key)`.
#[derive(Debug, Clone, Default)]
pub struct RunStartInfo {
    pub run_id: String,
    pub channel_id: String,
    pub identity_key: String,
    pub objective: String,
}

/// Tracks run liveness and owns the cancellation flags.
///
/// The registry is the single authority on whether a run is alive or
/// cancelled; the executor polls it at safe points.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Record a run as active.
    async fn register_run_start(&self, info: RunStartInfo);

    /// Flip the run to finished (optionally as cancelled).
    async fn mark_run_finished(&self, run_id: &str, cancelled: bool);

    /// Drop the run's entry entirely.
    async fn remove_run(&self, run_id: &str);

    /// Request cancellation. Returns false when the run is unknown or the
    /// flag was already set (idempotent).
    async fn request_cancel(&self, run_id: &str) -> bool;

    /// Whether cancellation has been requested for the run.
    async fn is_run_cancelled(&self, run_id: &str) -> bool;

    /// Clear the cancellation flag after teardown.
    async fn clear_run_cancelled(&self, run_id: &str);

    /// Plain-text block describing other active runs on the same channel
    /// and identity, merged into the planner's global overlay. `None` when
    /// the run has no siblings.
    async fn build_concurrency_overlay(&self, info: &RunStartInfo) -> Option<String>;
}
