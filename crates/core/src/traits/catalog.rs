use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{ToolDescriptor, ToolResult};

// =============================================================================
// Tool Catalog
// =============================================================================

/// Invocation context passed to tools.
#[derive(Debug, Clone, Default)]
pub struct ToolCallCtx {
    /// Run the invocation belongs to.
    pub run_id: String,
    /// Planned index of the invoking step.
    pub step_index: usize,
}

/// Read-mostly view over the tool layer.
///
/// The catalog is shared process-wide; it is never mutated during a run.
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    /// Enumerate tools without metadata.
    async fn available_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Enumerate tools including free-form metadata.
    async fn available_tools_detailed(&self) -> Result<Vec<ToolDescriptor>>;

    /// Dispatch a tool by its `ai_name`.
    ///
    /// Returns `Err` only for transport-level failures; tool-reported
    /// failures come back as `ToolResult { success: false, .. }`.
    async fn call_by_ai_name(
        &self,
        ai_name: &str,
        args: Value,
        ctx: ToolCallCtx,
    ) -> Result<ToolResult>;
}
