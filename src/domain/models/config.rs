//! Runtime configuration model.
//!
//! Loaded hierarchically by `infrastructure::config::ConfigLoader`
//! (defaults → `.overlord/config.yaml` → `.overlord/local.yaml` →
//! `OVERLORD_*` environment variables).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::budget::EnforcementMode;
use super::policy::PolicyAction;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub exploration: ExplorationConfig,
    #[serde(default)]
    pub swarm: SwarmConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Policy engine options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Fallback when no per-tool rule exists.
    #[serde(default = "default_policy_action")]
    pub default_policy: PolicyAction,
    /// Classify intent before prompting.
    #[serde(default = "default_true")]
    pub intent_aware: bool,
    /// Deliberate-intent confidence at which prompts auto-allow.
    #[serde(default = "default_intent_threshold")]
    pub intent_threshold: f64,
    /// Record every decision to the audit log.
    #[serde(default = "default_true")]
    pub audit_log: bool,
    #[serde(default = "default_audit_max_entries")]
    pub audit_max_entries: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_policy: default_policy_action(),
            intent_aware: true,
            intent_threshold: default_intent_threshold(),
            audit_log: true,
            audit_max_entries: default_audit_max_entries(),
        }
    }
}

/// Execution-economics options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_target_iterations")]
    pub target_iterations: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_cost: Option<f64>,
    #[serde(default = "default_soft_threshold")]
    pub soft_threshold: f64,
    #[serde(default = "default_enforcement_mode")]
    pub enforcement_mode: EnforcementMode,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            target_iterations: default_target_iterations(),
            max_iterations: default_max_iterations(),
            max_tokens: None,
            max_cost: None,
            soft_threshold: default_soft_threshold(),
            enforcement_mode: default_enforcement_mode(),
        }
    }
}

/// Saturation thresholds for the exploring phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationConfig {
    /// Unique files read at which a transition is recommended.
    #[serde(default = "default_exploration_file_threshold")]
    pub file_threshold: usize,
    /// Iterations without new files at which a transition is recommended.
    #[serde(default = "default_exploration_iter_threshold")]
    pub iter_threshold: u32,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            file_threshold: default_exploration_file_threshold(),
            iter_threshold: default_exploration_iter_threshold(),
        }
    }
}

/// Tool visibility for dispatched workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolAccessMode {
    /// Workers see the host's full tool set.
    #[default]
    All,
    /// Workers see only the configured allow-list.
    Whitelist,
}

/// Swarm orchestration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Stagger between dispatches to avoid thundering-herd rate limits.
    #[serde(default = "default_dispatch_stagger_ms")]
    pub dispatch_stagger_ms: u64,
    #[serde(default = "default_true")]
    pub quality_gate_enabled: bool,
    /// Minimum judge score in `[0, 5]` to accept a worker's output.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_worker_retries")]
    pub worker_retries: u32,
    /// Total token budget shared by the whole swarm.
    #[serde(default = "default_total_token_budget")]
    pub total_token_budget: u64,
    #[serde(default)]
    pub max_cost: Option<f64>,
    /// Tokens set aside for decomposition, review, and synthesis.
    #[serde(default = "default_orchestrator_reserve")]
    pub orchestrator_reserve_tokens: u64,
    #[serde(default = "default_max_tokens_per_worker")]
    pub max_tokens_per_worker: u64,
    /// Character bound on aggregated dependency outputs fed to synthesis.
    #[serde(default = "default_dependency_context_max_length")]
    pub dependency_context_max_length: usize,
    /// Identical-fingerprint count across producers that trips the
    /// global doom-loop detector.
    #[serde(default = "default_global_doom_loop_threshold")]
    pub global_doom_loop_threshold: usize,
    /// Add fixup tasks consuming a failed task's output as context.
    #[serde(default = "default_true")]
    pub fixup_tasks_enabled: bool,
    #[serde(default)]
    pub tool_access_mode: ToolAccessMode,
    #[serde(default)]
    pub tool_whitelist: Vec<String>,
    /// Restrict dispatch to paid models only.
    #[serde(default)]
    pub paid_only: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            dispatch_stagger_ms: default_dispatch_stagger_ms(),
            quality_gate_enabled: true,
            quality_threshold: default_quality_threshold(),
            worker_retries: default_worker_retries(),
            total_token_budget: default_total_token_budget(),
            max_cost: None,
            orchestrator_reserve_tokens: default_orchestrator_reserve(),
            max_tokens_per_worker: default_max_tokens_per_worker(),
            dependency_context_max_length: default_dependency_context_max_length(),
            global_doom_loop_threshold: default_global_doom_loop_threshold(),
            fixup_tasks_enabled: true,
            tool_access_mode: ToolAccessMode::All,
            tool_whitelist: Vec::new(),
            paid_only: false,
        }
    }
}

/// Model provider connection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens_per_request")]
    pub max_tokens_per_request: u32,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_provider_max_retries")]
    pub max_retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_tokens_per_request: default_max_tokens_per_request(),
            requests_per_minute: default_requests_per_minute(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_provider_max_retries(),
        }
    }
}

/// Session persistence options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Directory for rolling log files; stdout-only when absent.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            enable_stdout: true,
        }
    }
}

/// Resource monitor limits and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_cpu_time_secs")]
    pub max_cpu_time_secs: u64,
    #[serde(default = "default_max_operations")]
    pub max_operations: usize,
    /// Fraction of any axis at which status becomes `warning`.
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    /// Fraction of any axis at which status becomes `critical`.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_cpu_time_secs: default_max_cpu_time_secs(),
            max_operations: default_max_operations(),
            warn_threshold: default_warn_threshold(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

/// Checkpoint retention and auto-checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Create a labelled checkpoint every N messages (0 disables).
    #[serde(default = "default_auto_every_messages")]
    pub auto_every_messages: usize,
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            auto_every_messages: default_auto_every_messages(),
            keep_last_n: default_keep_last_n(),
        }
    }
}

/// Live swarm telemetry output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_live_dir")]
    pub live_dir: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enabled: true, live_dir: default_live_dir() }
    }
}

const fn default_policy_action() -> PolicyAction {
    PolicyAction::Prompt
}

const fn default_true() -> bool {
    true
}

const fn default_intent_threshold() -> f64 {
    0.8
}

const fn default_audit_max_entries() -> usize {
    10_000
}

const fn default_target_iterations() -> u32 {
    20
}

const fn default_max_iterations() -> u32 {
    50
}

const fn default_soft_threshold() -> f64 {
    0.8
}

const fn default_enforcement_mode() -> EnforcementMode {
    EnforcementMode::Soft
}

const fn default_exploration_file_threshold() -> usize {
    10
}

const fn default_exploration_iter_threshold() -> u32 {
    3
}

const fn default_max_concurrency() -> usize {
    4
}

const fn default_dispatch_stagger_ms() -> u64 {
    250
}

const fn default_quality_threshold() -> f64 {
    3.0
}

const fn default_worker_retries() -> u32 {
    2
}

const fn default_total_token_budget() -> u64 {
    2_000_000
}

const fn default_orchestrator_reserve() -> u64 {
    200_000
}

const fn default_max_tokens_per_worker() -> u64 {
    300_000
}

const fn default_dependency_context_max_length() -> usize {
    40_000
}

const fn default_global_doom_loop_threshold() -> usize {
    5
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

const fn default_max_tokens_per_request() -> u32 {
    8192
}

const fn default_requests_per_minute() -> u32 {
    50
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    120
}

const fn default_provider_max_retries() -> u32 {
    3
}

fn default_db_path() -> String {
    ".overlord/sessions.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

const fn default_max_memory_mb() -> u64 {
    4096
}

const fn default_max_cpu_time_secs() -> u64 {
    3600
}

const fn default_max_operations() -> usize {
    32
}

const fn default_warn_threshold() -> f64 {
    0.7
}

const fn default_critical_threshold() -> f64 {
    0.9
}

const fn default_auto_every_messages() -> usize {
    10
}

const fn default_keep_last_n() -> usize {
    20
}

fn default_live_dir() -> PathBuf {
    PathBuf::from(".overlord/live")
}
