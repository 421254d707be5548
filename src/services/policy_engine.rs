//! Policy engine: resolve `{tool, args, context}` into an execution
//! decision.
//!
//! The decision procedure is fixed-order: grant check, base policy
//! lookup, condition scan (first match wins), then intent-aware
//! resolution of `prompt` policies. Grants precede policies; within
//! conditions, list order breaks ties. Every decision is recorded to
//! the bounded audit log and published on the event bus.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::models::intent::{IntentClassification, IntentType};
use crate::domain::models::message::ToolCall;
use crate::domain::models::policy::{
    ArgPattern, Condition, EvaluationContext, PermissionGrant, PolicyAction, PolicyDecision,
    PolicyRule, RiskLevel,
};
use crate::services::audit_log::AuditLog;
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};
use crate::services::intent_classifier::IntentClassifier;

/// Engine options, usually derived from `PolicyConfig`.
#[derive(Debug, Clone)]
pub struct PolicyEngineConfig {
    /// Fallback when no per-tool rule exists.
    pub default_policy: PolicyAction,
    /// Risk assigned to tools without a rule.
    pub default_risk: RiskLevel,
    /// Classify intent before prompting.
    pub intent_aware: bool,
    /// Deliberate-intent confidence at which prompts auto-allow.
    pub intent_threshold: f64,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            default_policy: PolicyAction::Prompt,
            default_risk: RiskLevel::Medium,
            intent_aware: true,
            intent_threshold: 0.8,
        }
    }
}

struct Inner {
    rules: HashMap<String, PolicyRule>,
    grants: Vec<PermissionGrant>,
}

/// The policy engine. Single writer for its grant store; the loop only
/// observes grants through snapshots.
pub struct PolicyEngine {
    config: PolicyEngineConfig,
    classifier: IntentClassifier,
    audit: Arc<AuditLog>,
    event_bus: Arc<EventBus>,
    inner: Arc<RwLock<Inner>>,
}

impl PolicyEngine {
    pub fn new(
        config: PolicyEngineConfig,
        classifier: IntentClassifier,
        audit: Arc<AuditLog>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            classifier,
            audit,
            event_bus,
            inner: Arc::new(RwLock::new(Inner { rules: HashMap::new(), grants: Vec::new() })),
        }
    }

    /// Engine pre-seeded with the built-in rule set for common coding
    /// tools.
    pub fn with_default_rules(
        config: PolicyEngineConfig,
        classifier: IntentClassifier,
        audit: Arc<AuditLog>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let engine = Self::new(config, classifier, audit, event_bus);
        let rules = default_rules();
        // Seeding happens before the engine is shared, so this cannot race.
        if let Ok(mut inner) = engine.inner.try_write() {
            inner.rules = rules;
        }
        engine
    }

    // -------------------------------------------------------------------------
    // Rule and grant administration
    // -------------------------------------------------------------------------

    pub async fn set_rule(&self, tool: impl Into<String>, rule: PolicyRule) {
        let mut inner = self.inner.write().await;
        inner.rules.insert(tool.into(), rule);
    }

    pub async fn rule_for(&self, tool: &str) -> Option<PolicyRule> {
        let inner = self.inner.read().await;
        inner.rules.get(tool).cloned()
    }

    pub async fn add_grant(&self, grant: PermissionGrant) {
        self.event_bus.publish(
            EventSeverity::Info,
            EventCategory::Policy,
            EventPayload::GrantMinted {
                grant_id: grant.id,
                tool: grant.tool.clone(),
                reason: grant.reason.clone(),
            },
        );
        let mut inner = self.inner.write().await;
        inner.grants.push(grant);
    }

    pub async fn revoke_grant(&self, grant_id: uuid::Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let before = inner.grants.len();
        inner.grants.retain(|g| g.id != grant_id);
        inner.grants.len() < before
    }

    /// Read-only snapshot of the live grants.
    pub async fn grants_snapshot(&self) -> Vec<PermissionGrant> {
        let inner = self.inner.read().await;
        inner.grants.clone()
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Resolve one tool call. See the module docs for the fixed order.
    pub async fn evaluate(
        &self,
        agent: &str,
        call: &ToolCall,
        ctx: &EvaluationContext,
    ) -> PolicyDecision {
        let now = chrono::Utc::now();

        // Intent is classified up front when intent-aware mode is on so
        // conditions gating on confidence see the same value step 6 uses.
        let intent = if self.config.intent_aware {
            Some(self.classifier.classify(call, ctx))
        } else {
            None
        };
        let intent_confidence = intent.as_ref().map(|i| i.confidence);

        let decision = {
            let mut guard = self.inner.write().await;
            let inner = &mut *guard;

            // Lazily reap inert grants.
            inner.grants.retain(|g| !g.is_inert(now));

            // 1. Grant check: a matching grant bypasses the rule set.
            if let Some(grant) = inner
                .grants
                .iter_mut()
                .find(|g| g.covers(&call.name, &call.arguments))
            {
                let grant_id = grant.id;
                let reason = format!("covered by grant: {}", grant.reason);
                if let Some(uses) = grant.remaining_uses.as_mut() {
                    *uses = uses.saturating_sub(1);
                }
                let remaining = grant.remaining_uses;
                self.event_bus.publish(
                    EventSeverity::Info,
                    EventCategory::Policy,
                    EventPayload::GrantConsumed {
                        grant_id,
                        tool: call.name.clone(),
                        remaining_uses: remaining,
                    },
                );
                PolicyDecision {
                    allowed: true,
                    policy: PolicyAction::Allow,
                    reason,
                    risk_level: inner
                        .rules
                        .get(&call.name)
                        .map_or(self.config.default_risk, |r| r.risk_level),
                    prompt_required: false,
                    intent,
                    used_grant: Some(grant_id),
                    matched_condition: None,
                    suggestions: Vec::new(),
                }
            } else {
                // 2. Base policy lookup.
                let rule = inner.rules.get(&call.name).cloned().unwrap_or_else(|| {
                    PolicyRule::new(self.config.default_policy, self.config.default_risk)
                });

                // 3. Condition scan; first match wins.
                let mut effective = rule.policy;
                let mut reason = format!("base policy for '{}'", call.name);
                let mut matched_condition = None;
                let mut condition_suggestions = Vec::new();
                for (index, condition) in rule.conditions.iter().enumerate() {
                    if condition.matches(&call.arguments, ctx, intent_confidence) {
                        effective = condition.policy;
                        reason = condition.reason.clone();
                        matched_condition = Some(index);
                        condition_suggestions = condition.suggestions.clone();
                        break;
                    }
                }

                let mut suggestions = condition_suggestions;
                suggestions.extend(rule.suggestions.iter().cloned());

                match effective {
                    // 4. Forbidden blocks outright.
                    PolicyAction::Forbidden => PolicyDecision {
                        allowed: false,
                        policy: PolicyAction::Forbidden,
                        reason,
                        risk_level: RiskLevel::Critical,
                        prompt_required: false,
                        intent,
                        used_grant: None,
                        matched_condition,
                        suggestions,
                    },
                    // 5. Allow passes without prompting.
                    PolicyAction::Allow => PolicyDecision {
                        allowed: true,
                        policy: PolicyAction::Allow,
                        reason,
                        risk_level: rule.risk_level,
                        prompt_required: false,
                        intent,
                        used_grant: None,
                        matched_condition,
                        suggestions: Vec::new(),
                    },
                    // 6/7. Prompt: intent-aware resolution or a host prompt.
                    PolicyAction::Prompt => self.resolve_prompt(
                        inner,
                        call,
                        &rule,
                        reason,
                        matched_condition,
                        suggestions,
                        intent,
                    ),
                }
            }
        };

        self.audit
            .record(agent, call.name.clone(), call.arguments.clone(), decision.clone())
            .await;
        self.event_bus.publish(
            if decision.allowed { EventSeverity::Info } else { EventSeverity::Warning },
            EventCategory::Policy,
            EventPayload::PolicyDecisionRecorded {
                agent: agent.to_string(),
                tool: call.name.clone(),
                allowed: decision.allowed,
                policy: decision.policy,
                risk_level: decision.risk_level,
                reason: decision.reason.clone(),
                prompt_required: decision.prompt_required,
            },
        );
        debug!(
            agent,
            tool = %call.name,
            allowed = decision.allowed,
            policy = %decision.policy,
            "policy decision"
        );
        decision
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_prompt(
        &self,
        inner: &mut Inner,
        call: &ToolCall,
        rule: &PolicyRule,
        reason: String,
        matched_condition: Option<usize>,
        suggestions: Vec<String>,
        intent: Option<IntentClassification>,
    ) -> PolicyDecision {
        let Some(classification) = intent else {
            // 7. Intent-aware mode off: the host must answer.
            return PolicyDecision {
                allowed: false,
                policy: PolicyAction::Prompt,
                reason,
                risk_level: rule.risk_level,
                prompt_required: true,
                intent: None,
                used_grant: None,
                matched_condition,
                suggestions,
            };
        };

        let threshold = self.config.intent_threshold;
        let confidence = classification.confidence;

        if classification.intent_type == IntentType::Deliberate && confidence >= threshold {
            // Auto-allow and mint a one-time implicit grant for the
            // exact arguments.
            let grant = PermissionGrant::one_time(
                call.name.clone(),
                &call.arguments,
                format!("implicit: deliberate intent at {confidence:.2}"),
            );
            self.event_bus.publish(
                EventSeverity::Info,
                EventCategory::Policy,
                EventPayload::GrantMinted {
                    grant_id: grant.id,
                    tool: grant.tool.clone(),
                    reason: grant.reason.clone(),
                },
            );
            inner.grants.push(grant);
            return PolicyDecision {
                allowed: true,
                policy: PolicyAction::Allow,
                reason: format!("deliberate intent (confidence {confidence:.2})"),
                risk_level: rule.risk_level,
                prompt_required: false,
                intent: Some(classification),
                used_grant: None,
                matched_condition,
                suggestions: Vec::new(),
            };
        }

        let blocks = classification.intent_type == IntentType::Accidental
            || (classification.intent_type != IntentType::Unknown && confidence < threshold * 0.5);
        if blocks {
            let mut block_suggestions = suggestions;
            block_suggestions.extend(blocked_intent_suggestions(&call.name));
            warn!(tool = %call.name, confidence, "blocked on intent evidence");
            return PolicyDecision {
                allowed: false,
                policy: PolicyAction::Forbidden,
                reason: format!(
                    "intent looks {} (confidence {confidence:.2}); refusing without an explicit request",
                    classification.intent_type
                ),
                risk_level: rule.risk_level,
                prompt_required: false,
                intent: Some(classification),
                used_grant: None,
                matched_condition,
                suggestions: block_suggestions,
            };
        }

        PolicyDecision {
            allowed: false,
            policy: PolicyAction::Prompt,
            reason,
            risk_level: rule.risk_level,
            prompt_required: true,
            intent: Some(classification),
            used_grant: None,
            matched_condition,
            suggestions,
        }
    }
}

/// Safer alternatives offered when intent evidence blocks a call.
fn blocked_intent_suggestions(tool: &str) -> Vec<String> {
    let mut suggestions =
        vec!["use list_files to inspect the workspace before acting".to_string()];
    if tool.contains("delete") || tool.contains("remove") {
        suggestions.push("confirm the exact target with the user first".to_string());
    }
    suggestions
}

/// Built-in rules for the common coding tool surface.
pub fn default_rules() -> HashMap<String, PolicyRule> {
    let mut rules = HashMap::new();

    for tool in ["read_file", "list_files", "grep"] {
        rules.insert(tool.to_string(), PolicyRule::new(PolicyAction::Allow, RiskLevel::Low));
    }

    for tool in ["write_file", "edit_file"] {
        rules.insert(tool.to_string(), PolicyRule::new(PolicyAction::Prompt, RiskLevel::Medium));
    }

    rules.insert(
        "delete_file".to_string(),
        PolicyRule::new(PolicyAction::Prompt, RiskLevel::High)
            .with_suggestion("use list_files to confirm the target first"),
    );

    let mut rm_args = HashMap::new();
    rm_args.insert("command".to_string(), ArgPattern::StartsWith("rm ".to_string()));
    let mut safe_args = HashMap::new();
    safe_args.insert(
        "command".to_string(),
        ArgPattern::Regex(r"^(ls|pwd|cat|head|tail|wc|echo|git (status|diff|log))( |$)".to_string()),
    );
    rules.insert(
        "bash".to_string(),
        PolicyRule::new(PolicyAction::Prompt, RiskLevel::High)
            .with_condition(Condition {
                arg_match: Some(rm_args),
                context: None,
                policy: PolicyAction::Forbidden,
                reason: "destructive rm is forbidden".to_string(),
                suggestions: vec![
                    "move the target aside with mv instead".to_string(),
                    "use a trash utility so the action is reversible".to_string(),
                ],
            })
            .with_condition(Condition {
                arg_match: Some(safe_args),
                context: None,
                policy: PolicyAction::Allow,
                reason: "safe-prefix command".to_string(),
                suggestions: vec![],
            }),
    );

    rules
}
