//! Swarm budget pool: a shared token budget with an orchestrator
//! reserve and per-worker caps.
//!
//! Reserve/release is atomic behind a single mutex. The orchestrator
//! reserve is never lent to workers, and the sum of outstanding worker
//! grants never exceeds `total − orchestrator_reserve`.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// A worker's slice of the pool. Must be released with the actual usage.
#[derive(Debug, Clone)]
pub struct PoolGrant {
    pub worker_id: String,
    pub granted: u64,
}

struct PoolInner {
    /// Tokens currently available to workers.
    available: u64,
    /// Outstanding grants keyed by worker id.
    outstanding: HashMap<String, u64>,
    spent_tokens: u64,
    spent_cost_usd: f64,
    orchestrator_spent: u64,
}

/// The shared pool.
pub struct SwarmBudgetPool {
    total: u64,
    orchestrator_reserve: u64,
    max_per_worker: u64,
    max_cost_usd: Option<f64>,
    inner: Mutex<PoolInner>,
}

impl SwarmBudgetPool {
    /// `total` is the whole swarm budget; `orchestrator_reserve` is
    /// carved out up front and never lent to workers.
    pub fn new(total: u64, orchestrator_reserve: u64, max_per_worker: u64, max_cost_usd: Option<f64>) -> Self {
        let reserve = orchestrator_reserve.min(total);
        Self {
            total,
            orchestrator_reserve: reserve,
            max_per_worker,
            max_cost_usd,
            inner: Mutex::new(PoolInner {
                available: total - reserve,
                outstanding: HashMap::new(),
                spent_tokens: 0,
                spent_cost_usd: 0.0,
                orchestrator_spent: 0,
            }),
        }
    }

    /// Atomically reserve up to `min(requested, max_per_worker)` tokens.
    /// Returns `None` when that much is not available.
    pub fn reserve(&self, worker_id: &str, requested: u64) -> Option<PoolGrant> {
        let grant_size = requested.min(self.max_per_worker);
        if grant_size == 0 {
            return None;
        }
        let mut inner = self.inner.lock().ok()?;
        if inner.available < grant_size {
            return None;
        }
        inner.available -= grant_size;
        *inner.outstanding.entry(worker_id.to_string()).or_insert(0) += grant_size;
        debug!(worker_id, grant_size, available = inner.available, "pool reservation");
        Some(PoolGrant { worker_id: worker_id.to_string(), granted: grant_size })
    }

    /// Return a grant's unused remainder to the pool and account the
    /// spend.
    pub fn release(&self, grant: &PoolGrant, actually_used: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let used = actually_used.min(grant.granted);
        inner.available += grant.granted - used;
        inner.spent_tokens += actually_used;
        if let Some(outstanding) = inner.outstanding.get_mut(&grant.worker_id) {
            *outstanding = outstanding.saturating_sub(grant.granted);
            if *outstanding == 0 {
                inner.outstanding.remove(&grant.worker_id);
            }
        }
        debug!(
            worker_id = %grant.worker_id,
            granted = grant.granted,
            actually_used,
            available = inner.available,
            "pool release"
        );
    }

    /// Cheap dispatch-time check: any worker tokens left and cost under
    /// the cap.
    pub fn has_capacity(&self) -> bool {
        let Ok(inner) = self.inner.lock() else {
            return false;
        };
        if inner.available == 0 {
            return false;
        }
        match self.max_cost_usd {
            Some(max) => inner.spent_cost_usd < max,
            None => true,
        }
    }

    /// Account spend against the orchestrator reserve (decomposition,
    /// review, synthesis).
    pub fn record_orchestrator_usage(&self, tokens: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.orchestrator_spent += tokens;
            inner.spent_tokens += tokens;
        }
    }

    pub fn record_cost(&self, cost_usd: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.spent_cost_usd += cost_usd;
        }
    }

    /// Release every outstanding grant without accounting further spend.
    /// Used on cancellation.
    pub fn release_all_outstanding(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            let returned: u64 = inner.outstanding.values().sum();
            inner.available += returned;
            inner.outstanding.clear();
        }
    }

    pub fn available(&self) -> u64 {
        self.inner.lock().map(|i| i.available).unwrap_or(0)
    }

    pub fn outstanding_total(&self) -> u64 {
        self.inner.lock().map(|i| i.outstanding.values().sum()).unwrap_or(0)
    }

    pub fn spent_tokens(&self) -> u64 {
        self.inner.lock().map(|i| i.spent_tokens).unwrap_or(0)
    }

    pub fn spent_cost_usd(&self) -> f64 {
        self.inner.lock().map(|i| i.spent_cost_usd).unwrap_or(0.0)
    }

    pub fn orchestrator_reserve(&self) -> u64 {
        self.orchestrator_reserve
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}
