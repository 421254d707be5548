//! Policy data model: per-tool rules, conditions, argument patterns,
//! permission grants, and the decision record the engine produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::intent::IntentClassification;
use super::message::Message;

/// Three-tier execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Prompt,
    Forbidden,
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Prompt => write!(f, "prompt"),
            Self::Forbidden => write!(f, "forbidden"),
        }
    }
}

/// Risk classification for a tool or decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Pattern over a single argument value.
///
/// `Regex` accepts either a raw pattern or a `/pattern/flags` string
/// (supported flag: `i`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgPattern {
    Equals(Value),
    Regex(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    OneOf(Vec<Value>),
    NotOneOf(Vec<Value>),
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
}

impl ArgPattern {
    /// Test the pattern against an argument value.
    ///
    /// String-shaped patterns match only string values; `Range` matches
    /// only numbers. A missing value never matches.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Equals(expected) => value == expected,
            Self::Regex(pattern) => value.as_str().is_some_and(|s| regex_matches(pattern, s)),
            Self::Contains(needle) => value.as_str().is_some_and(|s| s.contains(needle.as_str())),
            Self::StartsWith(prefix) => value.as_str().is_some_and(|s| s.starts_with(prefix.as_str())),
            Self::EndsWith(suffix) => value.as_str().is_some_and(|s| s.ends_with(suffix.as_str())),
            Self::OneOf(options) => options.contains(value),
            Self::NotOneOf(options) => !options.contains(value),
            Self::Range { min, max } => value.as_f64().is_some_and(|n| {
                min.is_none_or(|lo| n >= lo) && max.is_none_or(|hi| n <= hi)
            }),
        }
    }
}

/// Compile-and-match for `ArgPattern::Regex`, handling `/pattern/flags`.
fn regex_matches(pattern: &str, text: &str) -> bool {
    let (raw, case_insensitive) = parse_regex_literal(pattern);
    regex::RegexBuilder::new(raw)
        .case_insensitive(case_insensitive)
        .build()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

/// Split a `/pattern/flags` literal; anything else is a raw pattern.
fn parse_regex_literal(pattern: &str) -> (&str, bool) {
    if let Some(rest) = pattern.strip_prefix('/') {
        if let Some(slash) = rest.rfind('/') {
            let (raw, flags) = rest.split_at(slash);
            return (raw, flags[1..].contains('i'));
        }
    }
    (pattern, false)
}

/// Pattern over the evaluation context rather than arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextPattern {
    /// Require an interactive (true) or batch (false) session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive: Option<bool>,
    /// Require a specific user role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    /// Require the classified intent confidence to be at least this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_intent_confidence: Option<f64>,
    /// Require the last N tool calls to all have been low-risk and allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_low_risk_streak: Option<usize>,
}

impl ContextPattern {
    pub fn matches(&self, ctx: &EvaluationContext, intent_confidence: Option<f64>) -> bool {
        if let Some(interactive) = self.interactive {
            if ctx.interactive != interactive {
                return false;
            }
        }
        if let Some(role) = &self.user_role {
            if ctx.user_role.as_deref() != Some(role.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_intent_confidence {
            if intent_confidence.is_none_or(|c| c < min) {
                return false;
            }
        }
        if let Some(n) = self.recent_low_risk_streak {
            let recent = &ctx.recent_tool_calls;
            if recent.len() < n {
                return false;
            }
            let streak_ok = recent[recent.len() - n..]
                .iter()
                .all(|h| h.allowed && h.risk_level == RiskLevel::Low);
            if !streak_ok {
                return false;
            }
        }
        true
    }
}

/// A conditional override within a rule. First matching condition wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Every named argument must match its pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg_match: Option<HashMap<String, ArgPattern>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextPattern>,
    pub policy: PolicyAction,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl Condition {
    pub fn matches(
        &self,
        arguments: &Value,
        ctx: &EvaluationContext,
        intent_confidence: Option<f64>,
    ) -> bool {
        if let Some(arg_match) = &self.arg_match {
            for (arg, pattern) in arg_match {
                let value = arguments.get(arg).unwrap_or(&Value::Null);
                if !pattern.matches(value) {
                    return false;
                }
            }
        }
        if let Some(context) = &self.context {
            if !context.matches(ctx, intent_confidence) {
                return false;
            }
        }
        true
    }
}

/// The per-tool policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub policy: PolicyAction,
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Safer alternatives suggested when the effective policy blocks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl PolicyRule {
    pub fn new(policy: PolicyAction, risk_level: RiskLevel) -> Self {
        Self { policy, risk_level, conditions: Vec::new(), suggestions: Vec::new() }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// A time- or count-bounded allowance that bypasses a `prompt` policy
/// for matching arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub id: Uuid,
    pub tool: String,
    /// Literal argument scope: every named argument must equal the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_args: Option<HashMap<String, Value>>,
    /// Pattern argument scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<HashMap<String, ArgPattern>>,
    /// `None` means unbounded uses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_uses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl PermissionGrant {
    /// An unbounded grant for a tool with no argument scope.
    pub fn for_tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool: tool.into(),
            allowed_args: None,
            pattern: None,
            remaining_uses: None,
            expires_at: None,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }

    /// A single-use grant scoped to exact arguments.
    pub fn one_time(tool: impl Into<String>, arguments: &Value, reason: impl Into<String>) -> Self {
        let allowed_args = arguments.as_object().map(|map| {
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<HashMap<_, _>>()
        });
        Self {
            id: Uuid::new_v4(),
            tool: tool.into(),
            allowed_args,
            pattern: None,
            remaining_uses: Some(1),
            expires_at: None,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_uses(mut self, uses: u32) -> Self {
        self.remaining_uses = Some(uses);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Exhausted or expired grants are inert and lazily reaped.
    pub fn is_inert(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now) || self.remaining_uses == Some(0)
    }

    /// Whether this grant covers the given call.
    pub fn covers(&self, tool: &str, arguments: &Value) -> bool {
        if self.tool != tool {
            return false;
        }
        if let Some(allowed) = &self.allowed_args {
            for (arg, expected) in allowed {
                if arguments.get(arg) != Some(expected) {
                    return false;
                }
            }
        }
        if let Some(pattern) = &self.pattern {
            for (arg, pat) in pattern {
                let value = arguments.get(arg).unwrap_or(&Value::Null);
                if !pat.matches(value) {
                    return false;
                }
            }
        }
        true
    }
}

/// History entry describing a recently evaluated tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHistoryEntry {
    pub tool: String,
    pub risk_level: RiskLevel,
    pub allowed: bool,
}

/// Everything the engine may consult besides the rule set and grants.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    /// Recent conversation, newest last.
    pub recent_messages: Vec<Message>,
    /// Interactive session (a human can answer prompts) vs batch.
    pub interactive: bool,
    pub user_role: Option<String>,
    /// Recently evaluated tool calls, newest last.
    pub recent_tool_calls: Vec<ToolHistoryEntry>,
}

/// The engine's verdict for one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    /// The effective policy after grants and conditions.
    pub policy: PolicyAction,
    pub reason: String,
    pub risk_level: RiskLevel,
    pub prompt_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentClassification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_grant: Option<Uuid>,
    /// Index of the matched condition within the rule, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_condition: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}
