//! Shared blackboard: append-only findings and resource claims across
//! workers, with filtered subscriptions.
//!
//! Findings are ordered by arrival and never mutated after post.
//! Delivery to each live subscription is at-least-once, in post order.
//! A claim stays visible to competing workers until its producer posts
//! a release referencing it.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::domain::models::finding::{Finding, FindingFilter, FindingType};

struct Subscriber {
    id: u64,
    filter: FindingFilter,
    tx: mpsc::UnboundedSender<Finding>,
}

struct Inner {
    findings: Vec<Finding>,
    by_id: HashMap<Uuid, usize>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

/// A live subscription; dropping it ends delivery.
pub struct Subscription {
    pub id: u64,
    rx: mpsc::UnboundedReceiver<Finding>,
}

impl Subscription {
    /// Receive the next matching finding, in post order.
    pub async fn recv(&mut self) -> Option<Finding> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Finding> {
        self.rx.try_recv().ok()
    }
}

/// The shared blackboard.
pub struct Blackboard {
    inner: Arc<RwLock<Inner>>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                findings: Vec::new(),
                by_id: HashMap::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 1,
            })),
        }
    }

    /// Append a finding and fan it out to matching subscriptions.
    pub async fn post(&self, finding: Finding) -> Uuid {
        let id = finding.id;
        let mut inner = self.inner.write().await;
        let index = inner.findings.len();
        inner.by_id.insert(id, index);
        inner.findings.push(finding.clone());

        // Deliver, dropping subscribers whose receiver is gone.
        inner.subscribers.retain(|sub| {
            if sub.filter.matches(&finding) {
                sub.tx.send(finding.clone()).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
        debug!(finding_id = %id, finding_type = %finding.finding_type, producer = %finding.producer_worker, "finding posted");
        id
    }

    /// Post a release for an earlier claim. The release is itself an
    /// append-only finding.
    pub async fn release_claim(&self, producer: impl Into<String>, claim_id: Uuid) -> Uuid {
        let mut release = Finding::new(FindingType::Claim, producer, json!({ "released": claim_id }));
        release.releases = Some(claim_id);
        self.post(release).await
    }

    pub async fn get(&self, id: Uuid) -> Option<Finding> {
        let inner = self.inner.read().await;
        inner.by_id.get(&id).and_then(|&i| inner.findings.get(i)).cloned()
    }

    /// Findings matching the filter, in post order.
    pub async fn query(&self, filter: &FindingFilter) -> Vec<Finding> {
        let inner = self.inner.read().await;
        inner.findings.iter().filter(|f| filter.matches(f)).cloned().collect()
    }

    /// Claims not yet released, in post order.
    pub async fn active_claims(&self) -> Vec<Finding> {
        let inner = self.inner.read().await;
        let released: std::collections::HashSet<Uuid> =
            inner.findings.iter().filter_map(|f| f.releases).collect();
        inner
            .findings
            .iter()
            .filter(|f| {
                f.finding_type == FindingType::Claim
                    && f.releases.is_none()
                    && !released.contains(&f.id)
            })
            .cloned()
            .collect()
    }

    /// Subscribe to findings matching `filter`, delivered in post order.
    pub async fn subscribe(&self, filter: FindingFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber { id, filter, tx });
        Subscription { id, rx }
    }

    /// Remove a subscription by id.
    pub async fn unsubscribe(&self, subscription_id: u64) {
        let mut inner = self.inner.write().await;
        inner.subscribers.retain(|sub| sub.id != subscription_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.findings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}
