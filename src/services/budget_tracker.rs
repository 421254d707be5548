//! Execution economics: iteration/token/cost budgets, soft limits, and
//! the one-shot token-recovery decision.
//!
//! The tracker is synchronous and owned by its loop. `check_budget`
//! also surfaces doom-loop verdicts: the per-agent detector takes
//! precedence over the shared global detector when both fire.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::models::budget::{Budget, BudgetCheck, BudgetType, EnforcementMode, RecoveryPlan, UsageTotals};
use crate::domain::models::message::ToolCall;
use crate::domain::models::phase::Phase;
use crate::domain::ports::provider::TokenUsage;
use crate::services::doom_loop::{AgentLoopDetector, GlobalLoopDetector};
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};

/// Fraction of `max_tokens` the context must drop below for a recovery
/// attempt to count as successful.
const RECOVERY_MARGIN: f64 = 0.2;

/// Percent-used at which soft-limit mode also suppresses tool calls.
const FORCE_TEXT_ONLY_AT: f64 = 0.95;

/// Per-loop budget tracker.
pub struct BudgetTracker {
    agent: String,
    budget: Budget,
    usage: UsageTotals,
    /// Token recovery is one-shot per budget window.
    recovery_attempted: bool,
    agent_detector: AgentLoopDetector,
    global_detector: Option<Arc<GlobalLoopDetector>>,
    /// Global fingerprints already surfaced to this agent.
    global_fired: HashSet<String>,
    last_call: Option<ToolCall>,
    event_bus: Arc<EventBus>,
}

impl BudgetTracker {
    pub fn new(agent: impl Into<String>, budget: Budget, event_bus: Arc<EventBus>) -> Self {
        Self {
            agent: agent.into(),
            budget,
            usage: UsageTotals::default(),
            recovery_attempted: false,
            agent_detector: AgentLoopDetector::default(),
            global_detector: None,
            global_fired: HashSet::new(),
            last_call: None,
            event_bus,
        }
    }

    /// Share the cross-worker fingerprint history.
    pub fn with_global_detector(mut self, detector: Arc<GlobalLoopDetector>) -> Self {
        self.global_detector = Some(detector);
        self
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn begin_iteration(&mut self) {
        self.usage.iterations += 1;
    }

    pub fn record_model_usage(&mut self, usage: &TokenUsage, cost_usd: f64) {
        self.usage.tokens += usage.total();
        self.usage.cost_usd += cost_usd;
    }

    /// Feed the doom-loop detectors.
    pub fn record_tool_call(&mut self, call: &ToolCall, phase: Phase) {
        self.agent_detector.observe(call, phase);
        if let Some(detector) = &self.global_detector {
            detector.observe(&self.agent, call);
        }
        self.last_call = Some(call.clone());
    }

    /// The per-iteration verdict. `context_tokens` is the estimated size
    /// of the conversation about to be sent.
    pub fn check_budget(&mut self, context_tokens: u64) -> BudgetCheck {
        if let Some(check) = self.check_doom_loops() {
            return check;
        }

        let (budget_type, percent_used) = self.most_loaded_axis(context_tokens);

        if percent_used >= 1.0 {
            return self.over_limit(budget_type, percent_used, context_tokens);
        }

        if percent_used >= self.budget.soft_threshold
            && self.budget.enforcement_mode == EnforcementMode::Soft
        {
            let prompt = format!(
                "BUDGET NOTICE: {:.0}% of the {budget_type} budget is used. \
                 Prioritize finishing the task; avoid exploratory detours and \
                 keep remaining responses focused.",
                percent_used * 100.0
            );
            self.event_bus.publish(
                EventSeverity::Warning,
                EventCategory::Budget,
                EventPayload::BudgetSoftLimit {
                    agent: self.agent.clone(),
                    budget_type,
                    percent_used,
                },
            );
            return BudgetCheck {
                can_continue: true,
                is_soft_limit: true,
                force_text_only: percent_used >= FORCE_TEXT_ONLY_AT,
                injected_prompt: Some(prompt),
                allow_task_continuation: true,
                percent_used,
                budget_type,
                reason: None,
                suggested_action: Some("wrap up the current task".to_string()),
                recovery: None,
            };
        }

        BudgetCheck::proceed(percent_used, budget_type)
    }

    /// Report the context size after a recovery compaction. Returns true
    /// if the context shrank below the recovery target.
    pub fn report_recovery(&mut self, new_context_tokens: u64) -> bool {
        let target = self.recovery_target();
        let success = new_context_tokens <= target;
        self.event_bus.publish(
            if success { EventSeverity::Info } else { EventSeverity::Error },
            EventCategory::Budget,
            EventPayload::RecoveryAttempted {
                agent: self.agent.clone(),
                new_context_tokens,
                target_tokens: target,
                success,
            },
        );
        if success {
            info!(agent = %self.agent, new_context_tokens, target, "token recovery succeeded");
        } else {
            warn!(agent = %self.agent, new_context_tokens, target, "token recovery failed");
        }
        success
    }

    fn recovery_target(&self) -> u64 {
        let max = self.budget.max_tokens.unwrap_or(0);
        (max as f64 * (1.0 - RECOVERY_MARGIN)) as u64
    }

    fn check_doom_loops(&mut self) -> Option<BudgetCheck> {
        // Per-agent detection takes precedence.
        if let Some(hit) = self.agent_detector.check() {
            self.agent_detector.reset();
            self.event_bus.publish(
                EventSeverity::Warning,
                EventCategory::Budget,
                EventPayload::DoomLoopDetected {
                    agent: self.agent.clone(),
                    tool: hit.tool.clone(),
                    count: hit.count,
                    global: false,
                },
            );
            let prompt = format!(
                "DOOM LOOP: the last {} calls to '{}' were identical. \
                 Repeating it again will not produce new information; change \
                 approach or explain what is blocking you.",
                hit.count, hit.tool
            );
            return Some(soft_limit_check(prompt));
        }

        let hit = {
            let detector = self.global_detector.as_ref()?;
            let call = self.last_call.as_ref()?;
            detector.check(call)?
        };
        if !self.global_fired.insert(hit.fingerprint.clone()) {
            return None;
        }
        self.event_bus.publish(
            EventSeverity::Warning,
            EventCategory::Budget,
            EventPayload::DoomLoopDetected {
                agent: self.agent.clone(),
                tool: hit.tool.clone(),
                count: hit.count,
                global: true,
            },
        );
        let prompt = format!(
            "GLOBAL DOOM LOOP: '{}' has been called with identical arguments \
             {} times across workers. Consult the blackboard for the shared \
             result instead of repeating the call.",
            hit.tool, hit.count
        );
        Some(soft_limit_check(prompt))
    }

    fn most_loaded_axis(&self, context_tokens: u64) -> (BudgetType, f64) {
        let mut axis = (
            BudgetType::Iterations,
            f64::from(self.usage.iterations) / f64::from(self.budget.max_iterations.max(1)),
        );
        if let Some(max_tokens) = self.budget.max_tokens {
            let pct = context_tokens as f64 / max_tokens.max(1) as f64;
            if pct > axis.1 {
                axis = (BudgetType::Tokens, pct);
            }
        }
        if let Some(max_cost) = self.budget.max_cost {
            if max_cost > 0.0 {
                let pct = self.usage.cost_usd / max_cost;
                if pct > axis.1 {
                    axis = (BudgetType::Cost, pct);
                }
            }
        }
        axis
    }

    fn over_limit(&mut self, budget_type: BudgetType, percent_used: f64, context_tokens: u64) -> BudgetCheck {
        match budget_type {
            BudgetType::Tokens if !self.recovery_attempted => {
                // One-shot: latched so it cannot fire twice in a window.
                self.recovery_attempted = true;
                warn!(agent = %self.agent, context_tokens, "token budget exceeded; attempting recovery");
                BudgetCheck {
                    can_continue: false,
                    is_soft_limit: false,
                    force_text_only: false,
                    injected_prompt: None,
                    allow_task_continuation: true,
                    percent_used,
                    budget_type,
                    reason: Some("token budget exceeded; attempting context recovery".to_string()),
                    suggested_action: Some("compact tool outputs and drop oldest messages".to_string()),
                    recovery: Some(RecoveryPlan {
                        compact_tool_outputs: true,
                        drop_oldest_non_system: true,
                        inject_work_log: true,
                        target_tokens: self.recovery_target(),
                    }),
                }
            }
            _ => {
                let reason = match budget_type {
                    BudgetType::Iterations => "max_iterations reached".to_string(),
                    _ => "budget_limit".to_string(),
                };
                self.event_bus.publish(
                    EventSeverity::Error,
                    EventCategory::Budget,
                    EventPayload::BudgetExhausted {
                        agent: self.agent.clone(),
                        budget_type,
                        reason: reason.clone(),
                    },
                );
                BudgetCheck {
                    can_continue: false,
                    is_soft_limit: false,
                    force_text_only: false,
                    injected_prompt: None,
                    allow_task_continuation: false,
                    percent_used,
                    budget_type,
                    reason: Some(reason),
                    suggested_action: None,
                    recovery: None,
                }
            }
        }
    }
}

fn soft_limit_check(prompt: String) -> BudgetCheck {
    BudgetCheck {
        can_continue: true,
        is_soft_limit: true,
        force_text_only: false,
        injected_prompt: Some(prompt),
        allow_task_continuation: true,
        percent_used: 0.0,
        budget_type: BudgetType::Iterations,
        reason: None,
        suggested_action: None,
        recovery: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventBusConfig;
    use serde_json::json;

    fn make_tracker(budget: Budget) -> BudgetTracker {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        BudgetTracker::new("main", budget, bus)
    }

    #[test]
    fn test_proceed_under_threshold() {
        let mut tracker = make_tracker(Budget::default());
        tracker.begin_iteration();
        let check = tracker.check_budget(1_000);
        assert!(check.can_continue);
        assert!(!check.is_soft_limit);
        assert!(check.injected_prompt.is_none());
    }

    #[test]
    fn test_soft_limit_injects_prompt() {
        let budget = Budget { max_iterations: 10, soft_threshold: 0.8, ..Default::default() };
        let mut tracker = make_tracker(budget);
        for _ in 0..8 {
            tracker.begin_iteration();
        }
        let check = tracker.check_budget(0);
        assert!(check.can_continue);
        assert!(check.is_soft_limit);
        assert!(check.injected_prompt.unwrap().contains("BUDGET NOTICE"));
        assert_eq!(check.budget_type, BudgetType::Iterations);
    }

    #[test]
    fn test_strict_mode_skips_soft_prompting() {
        let budget = Budget {
            max_iterations: 10,
            soft_threshold: 0.5,
            enforcement_mode: EnforcementMode::Strict,
            ..Default::default()
        };
        let mut tracker = make_tracker(budget);
        for _ in 0..8 {
            tracker.begin_iteration();
        }
        let check = tracker.check_budget(0);
        assert!(check.can_continue);
        assert!(!check.is_soft_limit);
    }

    #[test]
    fn test_iteration_exhaustion_stops() {
        let budget = Budget { max_iterations: 3, ..Default::default() };
        let mut tracker = make_tracker(budget);
        for _ in 0..3 {
            tracker.begin_iteration();
        }
        let check = tracker.check_budget(0);
        assert!(!check.can_continue);
        assert_eq!(check.reason.as_deref(), Some("max_iterations reached"));
        assert!(check.recovery.is_none());
    }

    #[test]
    fn test_token_overrun_offers_one_shot_recovery() {
        let budget = Budget { max_tokens: Some(100_000), max_iterations: 1_000, ..Default::default() };
        let mut tracker = make_tracker(budget);
        tracker.begin_iteration();

        let check = tracker.check_budget(110_000);
        assert!(!check.can_continue);
        assert_eq!(check.budget_type, BudgetType::Tokens);
        let plan = check.recovery.expect("first violation offers recovery");
        assert_eq!(plan.target_tokens, 80_000);
        assert!(plan.compact_tool_outputs && plan.drop_oldest_non_system);

        // Compaction brought the context under the target.
        assert!(tracker.report_recovery(75_000));

        // Second violation in the same window is terminal.
        let second = tracker.check_budget(120_000);
        assert!(!second.can_continue);
        assert!(second.recovery.is_none());
        assert_eq!(second.reason.as_deref(), Some("budget_limit"));
    }

    #[test]
    fn test_failed_recovery_reported() {
        let budget = Budget { max_tokens: Some(100_000), max_iterations: 1_000, ..Default::default() };
        let mut tracker = make_tracker(budget);
        let check = tracker.check_budget(150_000);
        assert!(check.recovery.is_some());
        assert!(!tracker.report_recovery(95_000));
    }

    #[test]
    fn test_cost_exhaustion_is_terminal() {
        let budget = Budget { max_cost: Some(1.0), max_iterations: 1_000, ..Default::default() };
        let mut tracker = make_tracker(budget);
        tracker.record_model_usage(
            &TokenUsage { input_tokens: 0, output_tokens: 0, ..Default::default() },
            1.5,
        );
        let check = tracker.check_budget(0);
        assert!(!check.can_continue);
        assert_eq!(check.budget_type, BudgetType::Cost);
        assert_eq!(check.reason.as_deref(), Some("budget_limit"));
    }

    #[test]
    fn test_agent_doom_loop_names_tool() {
        let mut tracker = make_tracker(Budget::default());
        let call = ToolCall::new("1", "grep", json!({"pattern": "foo"}));
        for _ in 0..3 {
            tracker.record_tool_call(&call, Phase::Acting);
        }
        let check = tracker.check_budget(0);
        assert!(check.can_continue);
        assert!(check.is_soft_limit);
        let prompt = check.injected_prompt.unwrap();
        assert!(prompt.contains("DOOM LOOP"));
        assert!(prompt.contains("grep"));

        // The detector re-arms after firing.
        let calm = tracker.check_budget(0);
        assert!(!calm.is_soft_limit);
    }

    #[test]
    fn test_global_doom_loop_fires_once_per_fingerprint() {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        let global = Arc::new(GlobalLoopDetector::new(5));
        let call = ToolCall::new("1", "read_file", json!({"path": "/config.json"}));

        // Four other workers already made the identical call.
        for worker in ["w1", "w2", "w3", "w4"] {
            global.observe(worker, &call);
        }

        let mut tracker =
            BudgetTracker::new("w5", Budget::default(), bus).with_global_detector(global);
        tracker.record_tool_call(&call, Phase::Exploring);

        let check = tracker.check_budget(0);
        assert!(check.can_continue);
        assert!(check.is_soft_limit);
        let prompt = check.injected_prompt.unwrap();
        assert!(prompt.contains("GLOBAL DOOM LOOP"));
        assert!(prompt.contains("read_file"));

        // The same fingerprint does not refire for this agent.
        let again = tracker.check_budget(0);
        assert!(!again.is_soft_limit);
    }

    #[test]
    fn test_agent_doom_loop_takes_precedence_over_global() {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        let global = Arc::new(GlobalLoopDetector::new(2));
        let call = ToolCall::new("1", "grep", json!({"pattern": "x"}));
        global.observe("w1", &call);
        global.observe("w2", &call);

        let mut tracker =
            BudgetTracker::new("w3", Budget::default(), bus).with_global_detector(global);
        for _ in 0..3 {
            tracker.record_tool_call(&call, Phase::Acting);
        }

        let check = tracker.check_budget(0);
        let prompt = check.injected_prompt.unwrap();
        // The per-agent message, not the global one.
        assert!(prompt.starts_with("DOOM LOOP"));
    }
}
