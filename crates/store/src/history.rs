//! In-memory history store.

use async_trait::async_trait;
use dashmap::DashMap;

use planweave_core::{
    events::{HistoryRecord, RunEvent},
    traits::HistoryStore,
    types::{now_ms, Plan},
    Result,
};

#[derive(Default)]
struct RunLog {
    records: Vec<HistoryRecord>,
    plan: Option<Plan>,
    summary: Option<String>,
    next_seq: u64,
}

/// In-memory append-only history store.
///
/// Appends for one run are serialized by the map shard lock, so a reader
/// that starts after an append observes it.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    runs: DashMap<String, RunLog>,
}

impl InMemoryHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs with any recorded state.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, run_id: &str, event: RunEvent) -> Result<()> {
        let mut log = self.runs.entry(run_id.to_string()).or_default();
        let seq = log.next_seq;
        log.next_seq += 1;
        log.records.push(HistoryRecord {
            seq,
            timestamp_ms: now_ms(),
            event,
        });
        Ok(())
    }

    async fn list(&self, run_id: &str) -> Result<Vec<HistoryRecord>> {
        Ok(self
            .runs
            .get(run_id)
            .map(|log| log.records.clone())
            .unwrap_or_default())
    }

    async fn set_plan(&self, run_id: &str, plan: &Plan) -> Result<()> {
        self.runs.entry(run_id.to_string()).or_default().plan = Some(plan.clone());
        Ok(())
    }

    async fn get_plan(&self, run_id: &str) -> Result<Option<Plan>> {
        Ok(self.runs.get(run_id).and_then(|log| log.plan.clone()))
    }

    async fn set_summary(&self, run_id: &str, summary: &str) -> Result<()> {
        self.runs.entry(run_id.to_string()).or_default().summary = Some(summary.to_string());
        Ok(())
    }

    async fn get_summary(&self, run_id: &str) -> Result<Option<String>> {
        Ok(self.runs.get(run_id).and_then(|log| log.summary.clone()))
    }
}
