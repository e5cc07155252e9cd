use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Tool Types
// =============================================================================

/// Well-known result codes surfaced by the executor and by tools.
pub mod codes {
    /// Generic success.
    pub const OK: &str = "OK";
    /// Generic tool-reported failure.
    pub const TOOL_ERROR: &str = "TOOL_ERROR";
    /// Soft rate-limit; the step is requeued after the advertised delay.
    pub const COOLDOWN_ACTIVE: &str = "COOLDOWN_ACTIVE";
    /// The run was cancelled before the step could dispatch.
    pub const RUN_CANCELLED: &str = "RUN_CANCELLED";
    /// A transitive dependency failed during a retry pass.
    pub const SKIP_UPSTREAM_FAILED: &str = "SKIP_UPSTREAM_FAILED";
    /// The planned tool does not exist in the catalog.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// Arguments failed schema validation twice.
    pub const ARGS_INVALID: &str = "ARGS_INVALID";
    /// Placeholder result for a step deferred by a schedule argument.
    pub const SCHEDULED: &str = "SCHEDULED";
}

/// Outcome of a tool invocation.
///
/// `data` is an opaque per-tool payload; `code` is the discriminator
/// consumers switch on. A failed result with [`codes::COOLDOWN_ACTIVE`]
/// carries `remain_ms` (or `ttl` seconds) as a retry-after hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Whether the invocation succeeded.
    pub success: bool,

    /// Result discriminator (see [`codes`]).
    pub code: String,

    /// Opaque structured payload.
    #[serde(default)]
    pub data: Value,

    /// Optional human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Cooldown remainder in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remain_ms: Option<u64>,

    /// Cooldown remainder in seconds (fallback for `remain_ms`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl ToolResult {
    /// Create a successful result carrying a payload.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            code: codes::OK.to_string(),
            data,
            message: None,
            remain_ms: None,
            ttl: None,
        }
    }

    /// Create a failed result with a code and message.
    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.into(),
            data: Value::Null,
            message: Some(message.into()),
            remain_ms: None,
            ttl: None,
        }
    }

    /// Create a cooldown result with a retry-after hint in milliseconds.
    pub fn cooldown(remain_ms: u64) -> Self {
        Self {
            success: false,
            code: codes::COOLDOWN_ACTIVE.to_string(),
            data: Value::Null,
            message: None,
            remain_ms: Some(remain_ms),
            ttl: None,
        }
    }

    /// Attach a structured payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Whether this result signals a soft rate-limit.
    pub fn is_cooldown(&self) -> bool {
        !self.success && self.code == codes::COOLDOWN_ACTIVE
    }

    /// The retry-after hint in milliseconds, if any.
    pub fn cooldown_remain_ms(&self) -> Option<u64> {
        self.remain_ms.or_else(|| self.ttl.map(|t| t * 1000))
    }
}

/// Tool descriptor as exposed by the catalog and offered to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Stable tool identifier.
    pub ai_name: String,

    /// Human-readable description.
    pub description: String,

    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,

    /// Provider label for concurrency capping; unknown providers fall
    /// back to `"local"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Optional free-form metadata (only present in the detailed view).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ToolDescriptor {
    /// The effective provider label.
    pub fn provider_label(&self) -> &str {
        self.provider.as_deref().unwrap_or("local")
    }
}
