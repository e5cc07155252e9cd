use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub plan: PlanConfig,
    pub planner: PlannerConfig,
    pub rerank: RerankConfig,
    pub memory: MemoryConfig,
    pub runner: RunnerConfig,
    pub schedule: ScheduleConfig,
    pub flags: FlagsConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStrategy {
    /// Native function calling.
    Auto,
    /// Raw function-call block rendered into the prompt.
    Fc,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<Secret<String>>,
    pub temperature: f32,
    pub tool_strategy: ToolStrategy,
    pub request_timeout_ms: u64,
    pub stage_timeouts: StageTimeouts,
}

/// Per-stage LLM timeouts in milliseconds.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StageTimeouts {
    pub judge_ms: u64,
    pub pre_thought_ms: u64,
    pub plan_ms: u64,
    pub arggen_ms: u64,
    pub evaluate_ms: u64,
    pub reflect_ms: u64,
    pub summary_ms: u64,
    pub patch_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PlanConfig {
    /// Primary planning model.
    pub model: String,
    /// Model set for one-candidate-per-model mode.
    pub models: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PlannerConfig {
    /// Global fan-out cap.
    pub max_concurrency: usize,
    /// Per-tool cap fallback.
    pub tool_concurrency_default: usize,
    /// Per-tool cap overrides.
    pub tool_concurrency: HashMap<String, usize>,
    /// Per-provider cap fallback.
    pub provider_concurrency_default: usize,
    /// Per-provider cap overrides.
    pub provider_concurrency: HashMap<String, usize>,
    /// Multi-candidate planning.
    pub multi_enable: bool,
    /// Candidate count, clamped to 2..=5.
    pub multi_candidates: usize,
    pub candidate_min_timeout_ms: u64,
    pub candidate_max_timeout_ms: u64,
    pub candidate_time_factor: f64,
    /// LLM audit over surviving candidates.
    pub audit_enable: bool,
    /// Per-candidate step ceiling.
    pub max_steps: usize,
    /// Fallback cooldown when a tool gives no retry-after hint.
    pub cooldown_default_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RerankConfig {
    pub enable: bool,
    pub candidate_k: usize,
    pub top_n: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    pub enable: bool,
    pub min_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchTriggerMode {
    Never,
    Always,
    OnError,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunnerConfig {
    /// Evaluate-driven retry loop.
    pub enable_repair: bool,
    pub max_repairs: usize,
    /// Mid-run plan patching.
    pub enable_plan_patch: bool,
    pub plan_patch_trigger_mode: PatchTriggerMode,
    pub max_plan_patch_calls: usize,
    pub max_patches: usize,
    /// Retry-step budget per step id, shared by patch and repair paths.
    pub retry_budget_per_step: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Tools allowed to run now and defer delivery.
    pub immediate_allowlist: Vec<String>,
    /// Tools excluded from immediate execution even when allowlisted.
    pub immediate_denylist: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FlagsConfig {
    /// Length of the rolling recent-results window.
    pub recent_context_limit: usize,
    pub plan_use_pre_thought: bool,
    pub enable_eval: bool,
    pub enable_reflection: bool,
    pub reflection_max_supplements: usize,
    pub enable_summary: bool,
    pub enable_verbose_steps: bool,
    pub tool_pre_reply_single_skip_tools: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Path for the SQLite history store; in-memory when unset.
    pub sqlite_path: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("PLANWEAVE_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map APP__SERVER__PORT=3000 to app.server.port
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            plan: PlanConfig::default(),
            planner: PlannerConfig::default(),
            rerank: RerankConfig::default(),
            memory: MemoryConfig::default(),
            runner: RunnerConfig::default(),
            schedule: ScheduleConfig::default(),
            flags: FlagsConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            temperature: 0.7,
            tool_strategy: ToolStrategy::Auto,
            request_timeout_ms: 60_000,
            stage_timeouts: StageTimeouts::default(),
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            judge_ms: 20_000,
            pre_thought_ms: 20_000,
            plan_ms: 60_000,
            arggen_ms: 30_000,
            evaluate_ms: 30_000,
            reflect_ms: 30_000,
            summary_ms: 45_000,
            patch_ms: 45_000,
        }
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            models: Vec::new(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            tool_concurrency_default: 1,
            tool_concurrency: HashMap::new(),
            provider_concurrency_default: 4,
            provider_concurrency: HashMap::new(),
            multi_enable: false,
            multi_candidates: 3,
            candidate_min_timeout_ms: 2_000,
            candidate_max_timeout_ms: 20_000,
            candidate_time_factor: 1.5,
            audit_enable: true,
            max_steps: 12,
            cooldown_default_ms: 3_000,
        }
    }
}

impl PlannerConfig {
    /// Candidate count clamped to the supported 2..=5 range.
    pub fn candidates(&self) -> usize {
        self.multi_candidates.clamp(2, 5)
    }

    /// Effective cap for a tool name.
    pub fn tool_cap(&self, ai_name: &str) -> usize {
        self.tool_concurrency
            .get(ai_name)
            .copied()
            .unwrap_or(self.tool_concurrency_default)
            .max(1)
    }

    /// Effective cap for a provider label.
    pub fn provider_cap(&self, provider: &str) -> usize {
        self.provider_concurrency
            .get(provider)
            .copied()
            .unwrap_or(self.provider_concurrency_default)
            .max(1)
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enable: false,
            candidate_k: 24,
            top_n: 12,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enable: false,
            min_score: 0.35,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            enable_repair: true,
            max_repairs: 1,
            enable_plan_patch: false,
            plan_patch_trigger_mode: PatchTriggerMode::OnError,
            max_plan_patch_calls: 40,
            max_patches: 12,
            retry_budget_per_step: 1,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            immediate_allowlist: Vec::new(),
            immediate_denylist: Vec::new(),
        }
    }
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            recent_context_limit: 5,
            plan_use_pre_thought: false,
            enable_eval: true,
            enable_reflection: false,
            reflection_max_supplements: 2,
            enable_summary: true,
            enable_verbose_steps: false,
            tool_pre_reply_single_skip_tools: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_caps() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.planner.max_concurrency, 3);
        assert_eq!(cfg.planner.tool_concurrency_default, 1);
        assert_eq!(cfg.planner.provider_concurrency_default, 4);
        assert_eq!(cfg.runner.max_repairs, 1);
        assert_eq!(cfg.runner.max_plan_patch_calls, 40);
        assert_eq!(cfg.runner.max_patches, 12);
        assert_eq!(cfg.flags.recent_context_limit, 5);
    }

    #[test]
    fn test_candidate_clamp() {
        let mut cfg = PlannerConfig::default();
        cfg.multi_candidates = 9;
        assert_eq!(cfg.candidates(), 5);
        cfg.multi_candidates = 0;
        assert_eq!(cfg.candidates(), 2);
    }

    #[test]
    fn test_cap_lookup_falls_back() {
        let mut cfg = PlannerConfig::default();
        cfg.tool_concurrency.insert("searcher".into(), 2);
        assert_eq!(cfg.tool_cap("searcher"), 2);
        assert_eq!(cfg.tool_cap("other"), 1);
        assert_eq!(cfg.provider_cap("local"), 4);
    }
}
