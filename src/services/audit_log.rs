//! Bounded audit log for policy decisions.
//!
//! Every decision the engine takes is recorded with its rationale and a
//! monotonically increasing entry id, then published on the event bus.
//! The in-memory window is bounded; older entries fall off the front.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::models::policy::PolicyDecision;

/// Configuration for the audit log.
#[derive(Debug, Clone)]
pub struct AuditLogConfig {
    /// Maximum entries kept in memory.
    pub max_entries: usize,
    /// Disable recording entirely.
    pub enabled: bool,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self { max_entries: 10_000, enabled: true }
    }
}

/// One recorded decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonically increasing within this log.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub arguments: Value,
    pub decision: PolicyDecision,
    /// The agent or worker the call came from.
    pub agent: String,
}

/// Query over recorded entries.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub tool: Option<String>,
    pub agent: Option<String>,
    pub allowed: Option<bool>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(tool) = &self.tool {
            if &entry.tool != tool {
                return false;
            }
        }
        if let Some(agent) = &self.agent {
            if &entry.agent != agent {
                return false;
            }
        }
        if let Some(allowed) = self.allowed {
            if entry.decision.allowed != allowed {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        true
    }
}

struct Inner {
    entries: VecDeque<AuditEntry>,
    next_id: u64,
}

/// Bounded, queryable decision log. Single writer (the policy engine);
/// readers see consistent snapshots.
pub struct AuditLog {
    config: AuditLogConfig,
    inner: Arc<RwLock<Inner>>,
}

impl AuditLog {
    pub fn new(config: AuditLogConfig) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(Inner { entries: VecDeque::new(), next_id: 1 })),
        }
    }

    /// Record a decision; returns the entry id (0 when disabled).
    pub async fn record(
        &self,
        agent: impl Into<String>,
        tool: impl Into<String>,
        arguments: Value,
        decision: PolicyDecision,
    ) -> u64 {
        if !self.config.enabled {
            return 0;
        }
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push_back(AuditEntry {
            id,
            timestamp: Utc::now(),
            tool: tool.into(),
            arguments,
            decision,
            agent: agent.into(),
        });
        while inner.entries.len() > self.config.max_entries {
            inner.entries.pop_front();
        }
        id
    }

    /// Entries matching the query, oldest first.
    pub async fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let inner = self.inner.read().await;
        inner.entries.iter().filter(|e| query.matches(e)).cloned().collect()
    }

    /// The newest `n` entries, oldest first.
    pub async fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let inner = self.inner.read().await;
        let skip = inner.entries.len().saturating_sub(n);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(AuditLogConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::policy::{PolicyAction, RiskLevel};
    use serde_json::json;

    fn decision(allowed: bool) -> PolicyDecision {
        PolicyDecision {
            allowed,
            policy: if allowed { PolicyAction::Allow } else { PolicyAction::Forbidden },
            reason: "test".into(),
            risk_level: RiskLevel::Low,
            prompt_required: false,
            intent: None,
            used_grant: None,
            matched_condition: None,
            suggestions: vec![],
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let log = AuditLog::default();
        let a = log.record("main", "read_file", json!({}), decision(true)).await;
        let b = log.record("main", "bash", json!({}), decision(false)).await;
        let c = log.record("main", "grep", json!({}), decision(true)).await;
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_bounded_window_drops_oldest() {
        let log = AuditLog::new(AuditLogConfig { max_entries: 3, enabled: true });
        for i in 0..5 {
            log.record("main", format!("tool{i}"), json!({}), decision(true)).await;
        }
        assert_eq!(log.len().await, 3);
        let entries = log.recent(10).await;
        assert_eq!(entries[0].tool, "tool2");
        assert_eq!(entries[2].tool, "tool4");
    }

    #[tokio::test]
    async fn test_query_by_tool_and_outcome() {
        let log = AuditLog::default();
        log.record("main", "bash", json!({"command": "ls"}), decision(true)).await;
        log.record("main", "bash", json!({"command": "rm"}), decision(false)).await;
        log.record("worker-1", "read_file", json!({}), decision(true)).await;

        let blocked_bash = log
            .query(&AuditQuery { tool: Some("bash".into()), allowed: Some(false), ..Default::default() })
            .await;
        assert_eq!(blocked_bash.len(), 1);
        assert_eq!(blocked_bash[0].arguments["command"], json!("rm"));

        let by_agent = log
            .query(&AuditQuery { agent: Some("worker-1".into()), ..Default::default() })
            .await;
        assert_eq!(by_agent.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_log_records_nothing() {
        let log = AuditLog::new(AuditLogConfig { max_entries: 10, enabled: false });
        let id = log.record("main", "bash", json!({}), decision(true)).await;
        assert_eq!(id, 0);
        assert!(log.is_empty().await);
    }
}
