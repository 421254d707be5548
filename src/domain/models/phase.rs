//! Phase model: the labelled operating modes of the execution loop and
//! the per-phase counters used for saturation and doom-loop detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Operating mode of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Exploring,
    Acting,
    Verifying,
    Planning,
}

impl Phase {
    /// The legal-transition table. All other pairs are rejected.
    ///
    /// `exploring → {acting, planning}`, `acting → {verifying, exploring}`,
    /// `verifying → acting`, `planning → {acting, exploring}`.
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Exploring, Self::Acting)
                | (Self::Exploring, Self::Planning)
                | (Self::Acting, Self::Verifying)
                | (Self::Acting, Self::Exploring)
                | (Self::Verifying, Self::Acting)
                | (Self::Planning, Self::Acting)
                | (Self::Planning, Self::Exploring)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exploring => write!(f, "exploring"),
            Self::Acting => write!(f, "acting"),
            Self::Verifying => write!(f, "verifying"),
            Self::Planning => write!(f, "planning"),
        }
    }
}

/// Mutable per-phase counters and sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: Phase,
    pub iterations_in_phase: u32,
    pub unique_files_read: HashSet<String>,
    pub unique_searches: HashSet<String>,
    pub files_modified: HashSet<String>,
    pub consecutive_bash_failures: u32,
    pub consecutive_test_failures: u32,
    pub in_test_fix_cycle: bool,
    pub last_test_passed: Option<bool>,
    pub entered_at: DateTime<Utc>,
}

impl PhaseState {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            iterations_in_phase: 0,
            unique_files_read: HashSet::new(),
            unique_searches: HashSet::new(),
            files_modified: HashSet::new(),
            consecutive_bash_failures: 0,
            consecutive_test_failures: 0,
            in_test_fix_cycle: false,
            last_test_passed: None,
            entered_at: Utc::now(),
        }
    }
}

impl Default for PhaseState {
    fn default() -> Self {
        Self::new(Phase::Exploring)
    }
}
