use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// Run Types
// =============================================================================

/// Generate a fresh opaque run id.
pub fn new_run_id() -> String {
    format!("run-{}", Uuid::new_v4())
}

/// One message of the prior conversation handed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role (system, user, assistant, tool).
    pub role: String,
    /// Message content.
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Prompt overlays merged into the planner system text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptOverlays {
    /// Overlay appended to every stage prompt.
    #[serde(default)]
    pub global: Option<String>,
    /// Overlay appended to the planner prompt only.
    #[serde(default)]
    pub plan: Option<String>,
}

/// Caller-provided hints for the judge stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeHints {
    /// Skip the judge and inject `need = true`.
    #[serde(default)]
    pub force_need_tools: bool,
    /// Whitelist of tool names the planner may use.
    #[serde(default)]
    pub tool_names: Option<Vec<String>>,
}

/// Opaque caller context threaded through a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    /// Channel the run belongs to.
    #[serde(default)]
    pub channel_id: String,
    /// Identity of the requester within the channel.
    #[serde(default)]
    pub identity_key: String,
    /// Prompt overlays.
    #[serde(default)]
    pub overlays: PromptOverlays,
    /// Judge hints.
    #[serde(default)]
    pub judge: JudgeHints,
    /// Free-form extras the core does not interpret.
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// Aggregate execution statistics for a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecStats {
    /// Whether any tool was dispatched.
    pub used: bool,
    /// Number of steps that produced a terminal result.
    pub attempted: usize,
    /// Number of steps whose result reported success.
    pub succeeded: usize,
    /// `succeeded / attempted` (0.0 when nothing was attempted).
    pub success_rate: f64,
}

impl ExecStats {
    /// Build stats from attempt counters.
    pub fn from_counts(attempted: usize, succeeded: usize) -> Self {
        Self {
            used: attempted > 0,
            attempted,
            succeeded,
            success_rate: if attempted == 0 {
                0.0
            } else {
                succeeded as f64 / attempted as f64
            },
        }
    }

    /// Merge another stats block into this one.
    pub fn absorb(&mut self, other: ExecStats) {
        *self = Self::from_counts(
            self.attempted + other.attempted,
            self.succeeded + other.succeeded,
        );
        self.used = self.used || other.used;
    }
}

/// Current timestamp in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
