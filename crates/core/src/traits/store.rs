use async_trait::async_trait;

use crate::error::Result;
use crate::events::{HistoryRecord, RunEvent};
use crate::types::Plan;

// =============================================================================
// History Store
// =============================================================================

/// Append-only run history plus key/value metadata per run id.
///
/// Appends are serialized per run; a read that starts after an append for
/// the same run observes it.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append an event to the run's log.
    async fn append(&self, run_id: &str, event: RunEvent) -> Result<()>;

    /// List the run's records in append order.
    async fn list(&self, run_id: &str) -> Result<Vec<HistoryRecord>>;

    /// Store the current plan snapshot.
    async fn set_plan(&self, run_id: &str, plan: &Plan) -> Result<()>;

    /// Load the stored plan snapshot.
    async fn get_plan(&self, run_id: &str) -> Result<Option<Plan>>;

    /// Store the final summary.
    async fn set_summary(&self, run_id: &str, summary: &str) -> Result<()>;

    /// Load the final summary.
    async fn get_summary(&self, run_id: &str) -> Result<Option<String>>;
}
