//! Budget model: iteration/token/cost limits, usage totals, and the
//! verdict returned by the economics layer each iteration.

use serde::{Deserialize, Serialize};

/// How hard limits are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Hard stop at the limit.
    Strict,
    /// Budget-aware prompting past the soft threshold, stop at the limit.
    Soft,
}

/// The active budget for a loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    /// Iterations the run is expected to take.
    pub target_iterations: u32,
    /// Absolute iteration ceiling.
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Maximum spend in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    pub enforcement_mode: EnforcementMode,
    /// Fraction of any budget axis at which soft-limit behaviour starts.
    pub soft_threshold: f64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            target_iterations: 20,
            max_iterations: 50,
            max_tokens: None,
            max_cost: None,
            enforcement_mode: EnforcementMode::Soft,
            soft_threshold: 0.8,
        }
    }
}

/// Cumulative usage for the current run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub iterations: u32,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Which budget axis a verdict refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetType {
    Iterations,
    Tokens,
    Cost,
}

impl std::fmt::Display for BudgetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iterations => write!(f, "iterations"),
            Self::Tokens => write!(f, "tokens"),
            Self::Cost => write!(f, "cost"),
        }
    }
}

/// The compaction steps the loop should take to recover a token overrun.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub compact_tool_outputs: bool,
    pub drop_oldest_non_system: bool,
    pub inject_work_log: bool,
    /// Context must drop below this token estimate to count as recovered.
    pub target_tokens: u64,
}

/// Verdict from `check_budget`, consumed once per iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub can_continue: bool,
    pub is_soft_limit: bool,
    /// Suppress the tool catalog on the next provider call.
    pub force_text_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injected_prompt: Option<String>,
    pub allow_task_continuation: bool,
    /// Fraction of the most-loaded budget axis consumed.
    pub percent_used: f64,
    pub budget_type: BudgetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
    /// Present when the loop should attempt one-shot token recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryPlan>,
}

impl BudgetCheck {
    /// A verdict letting the iteration proceed without constraints.
    pub fn proceed(percent_used: f64, budget_type: BudgetType) -> Self {
        Self {
            can_continue: true,
            is_soft_limit: false,
            force_text_only: false,
            injected_prompt: None,
            allow_task_continuation: true,
            percent_used,
            budget_type,
            reason: None,
            suggested_action: None,
            recovery: None,
        }
    }
}
