//! Error types for Planweave.

use thiserror::Error;

/// Result type alias using Planweave's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Planweave.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Planner Errors
    // =========================================================================
    #[error("Planner error: {0}")]
    Planner(String),

    #[error("Judge stage failed: {0}")]
    JudgeFailed(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    // =========================================================================
    // Executor Errors
    // =========================================================================
    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // =========================================================================
    // Tool Catalog Errors
    // =========================================================================
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    // =========================================================================
    // LLM Errors
    // =========================================================================
    #[error("LLM provider error: {0}")]
    Llm(String),

    #[error("LLM call timed out after {0}ms")]
    LlmTimeout(u64),

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Store error: {0}")]
    Store(String),

    // =========================================================================
    // Gateway Errors
    // =========================================================================
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a planner error.
    pub fn planner(msg: impl Into<String>) -> Self {
        Self::Planner(msg.into())
    }

    /// Create a judge-failed error.
    pub fn judge_failed(msg: impl Into<String>) -> Self {
        Self::JudgeFailed(msg.into())
    }

    /// Create an invalid-plan error.
    pub fn invalid_plan(msg: impl Into<String>) -> Self {
        Self::InvalidPlan(msg.into())
    }

    /// Create an executor error.
    pub fn executor(msg: impl Into<String>) -> Self {
        Self::Executor(msg.into())
    }

    /// Create a tool not found error.
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound(name.into())
    }

    /// Create a tool execution error.
    pub fn tool_execution(msg: impl Into<String>) -> Self {
        Self::ToolExecution(msg.into())
    }

    /// Create an LLM provider error.
    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    /// Create a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a gateway error.
    pub fn gateway(msg: impl Into<String>) -> Self {
        Self::Gateway(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
