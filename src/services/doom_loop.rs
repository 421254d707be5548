//! Doom-loop detection over tool-call fingerprints.
//!
//! A fingerprint is `tool_name:canonical_json(args)`. The per-agent
//! detector fires on N consecutive identical fingerprints within a
//! single phase; the global detector fires when the same fingerprint
//! crosses a threshold across producers. When both fire, the per-agent
//! detection takes precedence (handled by the budget tracker).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::domain::models::message::ToolCall;
use crate::domain::models::phase::Phase;

/// A detection with enough context to name the offending tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoomLoopHit {
    pub tool: String,
    pub fingerprint: String,
    pub count: usize,
}

/// Per-agent detector: consecutive identical calls within one phase.
#[derive(Debug)]
pub struct AgentLoopDetector {
    threshold: usize,
    last_fingerprint: Option<String>,
    last_tool: String,
    last_phase: Option<Phase>,
    count: usize,
}

impl AgentLoopDetector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            last_fingerprint: None,
            last_tool: String::new(),
            last_phase: None,
            count: 0,
        }
    }

    /// Record a call; a phase change or a different fingerprint resets
    /// the run.
    pub fn observe(&mut self, call: &ToolCall, phase: Phase) {
        let fingerprint = call.fingerprint();
        let same_run =
            self.last_phase == Some(phase) && self.last_fingerprint.as_deref() == Some(&fingerprint);
        if same_run {
            self.count += 1;
        } else {
            self.count = 1;
            self.last_fingerprint = Some(fingerprint);
            self.last_tool = call.name.clone();
            self.last_phase = Some(phase);
        }
    }

    /// The current hit, if the run has reached the threshold.
    pub fn check(&self) -> Option<DoomLoopHit> {
        if self.count >= self.threshold {
            Some(DoomLoopHit {
                tool: self.last_tool.clone(),
                fingerprint: self.last_fingerprint.clone().unwrap_or_default(),
                count: self.count,
            })
        } else {
            None
        }
    }

    /// Re-arm after the hit has been surfaced.
    pub fn reset(&mut self) {
        self.count = 0;
        self.last_fingerprint = None;
        self.last_phase = None;
    }
}

impl Default for AgentLoopDetector {
    fn default() -> Self {
        Self::new(3)
    }
}

struct FingerprintRecord {
    tool: String,
    producers: HashSet<String>,
    count: usize,
}

/// Global detector shared across workers. Counts every observation of a
/// fingerprint regardless of producer; the producer set is kept so the
/// hit can report how widespread the repetition is.
pub struct GlobalLoopDetector {
    threshold: usize,
    inner: Mutex<HashMap<String, FingerprintRecord>>,
}

impl GlobalLoopDetector {
    pub fn new(threshold: usize) -> Self {
        Self { threshold, inner: Mutex::new(HashMap::new()) }
    }

    /// Record one observation from `producer`.
    pub fn observe(&self, producer: &str, call: &ToolCall) {
        let fingerprint = call.fingerprint();
        if let Ok(mut inner) = self.inner.lock() {
            let record = inner.entry(fingerprint).or_insert_with(|| FingerprintRecord {
                tool: call.name.clone(),
                producers: HashSet::new(),
                count: 0,
            });
            record.producers.insert(producer.to_string());
            record.count += 1;
        }
    }

    /// The hit for `call`'s fingerprint, if its total count has crossed
    /// the threshold.
    pub fn check(&self, call: &ToolCall) -> Option<DoomLoopHit> {
        let fingerprint = call.fingerprint();
        let inner = self.inner.lock().ok()?;
        let record = inner.get(&fingerprint)?;
        if record.count >= self.threshold {
            Some(DoomLoopHit { tool: record.tool.clone(), fingerprint, count: record.count })
        } else {
            None
        }
    }

    /// Number of distinct producers that repeated `call`.
    pub fn producer_count(&self, call: &ToolCall) -> usize {
        let fingerprint = call.fingerprint();
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.get(&fingerprint).map(|r| r.producers.len()))
            .unwrap_or(0)
    }
}
