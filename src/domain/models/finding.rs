//! Blackboard findings: append-only cross-worker coordination records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of finding posted to the blackboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingType {
    Discovery,
    /// A resource claim; the producer is responsible for releasing it.
    Claim,
    Warning,
    Question,
    Answer,
    Handoff,
}

impl std::fmt::Display for FindingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovery => write!(f, "discovery"),
            Self::Claim => write!(f, "claim"),
            Self::Warning => write!(f, "warning"),
            Self::Question => write!(f, "question"),
            Self::Answer => write!(f, "answer"),
            Self::Handoff => write!(f, "handoff"),
        }
    }
}

/// One blackboard record. Ordered by arrival; never mutated after post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub finding_type: FindingType,
    pub producer_worker: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// For claims: the kind of claim (e.g. `edit`, `own-module`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_type: Option<String>,
    /// For claim releases: the claim finding being released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub releases: Option<Uuid>,
}

impl Finding {
    pub fn new(finding_type: FindingType, producer: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            finding_type,
            producer_worker: producer.into(),
            payload,
            created_at: Utc::now(),
            tags: Vec::new(),
            claim_type: None,
            releases: None,
        }
    }

    pub fn claim(producer: impl Into<String>, claim_type: impl Into<String>, payload: Value) -> Self {
        let mut finding = Self::new(FindingType::Claim, producer, payload);
        finding.claim_type = Some(claim_type.into());
        finding
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Filter for queries and subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindingFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finding_type: Option<FindingType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
    /// All listed tags must be present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

impl FindingFilter {
    pub fn matches(&self, finding: &Finding) -> bool {
        if let Some(ft) = self.finding_type {
            if finding.finding_type != ft {
                return false;
            }
        }
        if let Some(producer) = &self.producer {
            if &finding.producer_worker != producer {
                return false;
            }
        }
        if !self.tags.iter().all(|t| finding.tags.contains(t)) {
            return false;
        }
        if let Some(since) = self.since {
            if finding.created_at < since {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_by_type_and_producer() {
        let finding = Finding::new(FindingType::Discovery, "worker-1", json!({"file": "src/lib.rs"}));

        let mut filter = FindingFilter { finding_type: Some(FindingType::Discovery), ..Default::default() };
        assert!(filter.matches(&finding));

        filter.producer = Some("worker-2".to_string());
        assert!(!filter.matches(&finding));
    }

    #[test]
    fn test_filter_requires_all_tags() {
        let finding = Finding::new(FindingType::Warning, "w", json!({}))
            .with_tags(vec!["parser".to_string(), "deps".to_string()]);

        let filter = FindingFilter { tags: vec!["parser".to_string()], ..Default::default() };
        assert!(filter.matches(&finding));

        let filter = FindingFilter {
            tags: vec!["parser".to_string(), "missing".to_string()],
            ..Default::default()
        };
        assert!(!filter.matches(&finding));
    }

    #[test]
    fn test_filter_since() {
        let finding = Finding::new(FindingType::Answer, "w", json!({}));
        let before = finding.created_at - chrono::Duration::seconds(10);
        let after = finding.created_at + chrono::Duration::seconds(10);

        assert!(FindingFilter { since: Some(before), ..Default::default() }.matches(&finding));
        assert!(!FindingFilter { since: Some(after), ..Default::default() }.matches(&finding));
    }

    #[test]
    fn test_claim_constructor() {
        let claim = Finding::claim("worker-3", "edit", json!({"path": "src/main.rs"}));
        assert_eq!(claim.finding_type, FindingType::Claim);
        assert_eq!(claim.claim_type.as_deref(), Some("edit"));
    }
}
