//! Run registry & cancellation plane.

use async_trait::async_trait;
use dashmap::DashMap;

use planweave_core::{
    traits::{RunRegistry, RunStartInfo},
    types::now_ms,
};

struct ActiveRun {
    info: RunStartInfo,
    started_at_ms: i64,
    finished: bool,
    cancelled: bool,
    cancel_requested: bool,
}

/// Process-wide registry of active runs, keyed by run id.
///
/// This is the single owner of run liveness and cancellation flags; the
/// executor polls `is_run_cancelled` at safe points.
#[derive(Default)]
pub struct ActiveRunRegistry {
    runs: DashMap<String, ActiveRun>,
}

impl ActiveRunRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered runs (finished ones included until removal).
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether the registry has no runs.
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Whether a run finished as cancelled (false for unknown or live
    /// runs).
    pub fn was_cancelled(&self, run_id: &str) -> bool {
        self.runs
            .get(run_id)
            .map(|run| run.finished && run.cancelled)
            .unwrap_or(false)
    }
}

#[async_trait]
impl RunRegistry for ActiveRunRegistry {
    async fn register_run_start(&self, info: RunStartInfo) {
        tracing::info!(
            run_id = %info.run_id,
            channel = %info.channel_id,
            identity = %info.identity_key,
            "Run registered"
        );
        self.runs.insert(
            info.run_id.clone(),
            ActiveRun {
                info,
                started_at_ms: now_ms(),
                finished: false,
                cancelled: false,
                cancel_requested: false,
            },
        );
    }

    async fn mark_run_finished(&self, run_id: &str, cancelled: bool) {
        if let Some(mut run) = self.runs.get_mut(run_id) {
            run.finished = true;
            run.cancelled = cancelled;
        }
    }

    async fn remove_run(&self, run_id: &str) {
        self.runs.remove(run_id);
    }

    async fn request_cancel(&self, run_id: &str) -> bool {
        match self.runs.get_mut(run_id) {
            Some(mut run) if !run.cancel_requested && !run.finished => {
                run.cancel_requested = true;
                tracing::info!(run_id = %run_id, "Run cancellation requested");
                true
            }
            _ => false,
        }
    }

    async fn is_run_cancelled(&self, run_id: &str) -> bool {
        self.runs
            .get(run_id)
            .map(|run| run.cancel_requested)
            .unwrap_or(false)
    }

    async fn clear_run_cancelled(&self, run_id: &str) {
        if let Some(mut run) = self.runs.get_mut(run_id) {
            run.cancel_requested = false;
        }
    }

    async fn build_concurrency_overlay(&self, info: &RunStartInfo) -> Option<String> {
        let mut siblings: Vec<(i64, String)> = self
            .runs
            .iter()
            .filter(|entry| {
                let run = entry.value();
                run.info.run_id != info.run_id
                    && !run.finished
                    && run.info.channel_id == info.channel_id
                    && run.info.identity_key == info.identity_key
            })
            .map(|entry| {
                let run = entry.value();
                (
                    run.started_at_ms,
                    format!("- [{}] {}", run.info.run_id, run.info.objective),
                )
            })
            .collect();

        if siblings.is_empty() {
            return None;
        }
        siblings.sort();

        let lines: Vec<String> = siblings.into_iter().map(|(_, line)| line).collect();
        Some(format!(
            "Other tasks are currently running for the same requester:\n{}\nAvoid duplicating their work.",
            lines.join("\n")
        ))
    }
}
