//! Tool registry implementation.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use planweave_core::{
    traits::{ToolCallCtx, ToolCatalog},
    types::{ToolDescriptor, ToolResult},
    Error, Result,
};

/// A registrable tool.
///
/// `ai_name` is the stable identifier the planner references; `provider`
/// labels the upstream service for concurrency capping.
#[async_trait]
pub trait SkillTool: Send + Sync {
    /// Stable catalog identifier.
    fn ai_name(&self) -> &str;

    /// Human-readable description offered to the planner.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn input_schema(&self) -> Value;

    /// Provider label; `None` maps to `"local"`.
    fn provider(&self) -> Option<&str> {
        None
    }

    /// Free-form metadata exposed in the detailed catalog view.
    fn meta(&self) -> Option<Value> {
        None
    }

    /// Execute the tool.
    async fn call(&self, args: Value, ctx: &ToolCallCtx) -> Result<ToolResult>;
}

/// Default process-wide registry backed by a DashMap.
#[derive(Default)]
pub struct SkillRegistry {
    tools: DashMap<String, Arc<dyn SkillTool>>,
}

impl SkillRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails when the `ai_name` is already taken.
    pub fn register(&self, tool: Arc<dyn SkillTool>) -> Result<()> {
        let name = tool.ai_name().to_string();
        tracing::info!(tool = %name, "Registering tool");

        if self.tools.contains_key(&name) {
            return Err(Error::internal(format!(
                "Tool '{}' is already registered",
                name
            )));
        }

        self.tools.insert(name, tool);
        Ok(())
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn describe(&self, tool: &Arc<dyn SkillTool>, with_meta: bool) -> ToolDescriptor {
        ToolDescriptor {
            ai_name: tool.ai_name().to_string(),
            description: tool.description().to_string(),
            input_schema: tool.input_schema(),
            provider: tool.provider().map(str::to_string),
            meta: if with_meta { tool.meta() } else { None },
        }
    }
}

#[async_trait]
impl ToolCatalog for SkillRegistry {
    async fn available_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools: Vec<_> = self
            .tools
            .iter()
            .map(|entry| self.describe(entry.value(), false))
            .collect();
        tools.sort_by(|a, b| a.ai_name.cmp(&b.ai_name));
        Ok(tools)
    }

    async fn available_tools_detailed(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools: Vec<_> = self
            .tools
            .iter()
            .map(|entry| self.describe(entry.value(), true))
            .collect();
        tools.sort_by(|a, b| a.ai_name.cmp(&b.ai_name));
        Ok(tools)
    }

    async fn call_by_ai_name(
        &self,
        ai_name: &str,
        args: Value,
        ctx: ToolCallCtx,
    ) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(ai_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::tool_not_found(ai_name))?;

        tracing::debug!(tool = %ai_name, run_id = %ctx.run_id, step = ctx.step_index, "Dispatching tool");

        tool.call(args, &ctx).await
    }
}
