//! Agent state machine: phase transitions, saturation detection, and
//! per-phase doom-loop counters.
//!
//! The machine is synchronous and owned by its loop. Every accepted
//! transition emits exactly one event on the bus; rejected transitions
//! are no-ops that emit none.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::domain::error::RuntimeError;
use crate::domain::models::message::ToolCall;
use crate::domain::models::phase::{Phase, PhaseState};
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};

/// Thresholds for exploration saturation.
#[derive(Debug, Clone)]
pub struct PhaseMachineConfig {
    /// Unique files read at which a transition is recommended.
    pub exploration_file_threshold: usize,
    /// Iterations adding no new files at which a transition is
    /// recommended.
    pub exploration_iter_threshold: u32,
}

impl Default for PhaseMachineConfig {
    fn default() -> Self {
        Self { exploration_file_threshold: 10, exploration_iter_threshold: 3 }
    }
}

/// One accepted transition.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub from: Phase,
    pub to: Phase,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// The per-agent phase machine.
pub struct PhaseMachine {
    agent: String,
    config: PhaseMachineConfig,
    state: PhaseState,
    history: Vec<TransitionEvent>,
    /// Unique-file counts at the end of recent iterations, for the
    /// no-new-files saturation rule.
    file_count_window: Vec<usize>,
    event_bus: Arc<EventBus>,
}

impl PhaseMachine {
    pub fn new(agent: impl Into<String>, config: PhaseMachineConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            agent: agent.into(),
            config,
            state: PhaseState::default(),
            history: Vec::new(),
            file_count_window: Vec::new(),
            event_bus,
        }
    }

    pub fn state(&self) -> &PhaseState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn history(&self) -> &[TransitionEvent] {
        &self.history
    }

    /// Request a transition. Accepts iff the pair is in the legal table
    /// (self-transitions never are); emits exactly one event on accept
    /// and none on reject.
    pub fn transition(&mut self, to: Phase, reason: &str) -> Result<TransitionEvent, RuntimeError> {
        let from = self.state.phase;
        if !from.can_transition_to(to) {
            return Err(RuntimeError::InvalidPhaseTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.state = PhaseState::new(to);
        self.file_count_window.clear();
        let event = TransitionEvent { from, to, reason: reason.to_string(), at: Utc::now() };
        self.history.push(event.clone());
        self.event_bus.publish(
            EventSeverity::Info,
            EventCategory::Phase,
            EventPayload::PhaseTransitioned {
                agent: self.agent.clone(),
                from,
                to,
                reason: reason.to_string(),
            },
        );
        debug!(agent = %self.agent, %from, %to, reason, "phase transition");
        Ok(event)
    }

    /// Record a tool call and its success flag; updates counters and
    /// performs auto-transitions. Returns any transitions that fired.
    pub fn record_tool_call(&mut self, call: &ToolCall, success: Option<bool>) -> Vec<TransitionEvent> {
        let mut transitions = Vec::new();
        let succeeded = success.unwrap_or(true);

        if is_read_tool(&call.name) {
            if let Some(path) = str_arg(&call.arguments, &["path", "file", "file_path"]) {
                self.state.unique_files_read.insert(path);
            }
        }

        if is_search_tool(&call.name) {
            self.state.unique_searches.insert(call.fingerprint());
        }

        if is_modify_tool(&call.name) && succeeded {
            if let Some(path) = str_arg(&call.arguments, &["path", "file", "file_path"]) {
                self.state.files_modified.insert(path);
            }
            // First successful modification moves the loop into acting.
            if matches!(self.state.phase, Phase::Exploring | Phase::Planning) {
                let files = self.state.files_modified.clone();
                if let Ok(event) = self.transition(Phase::Acting, "first file modification") {
                    // Carry the modification across the phase boundary.
                    self.state.files_modified = files;
                    transitions.push(event);
                }
            }
        }

        if call.name == "bash" {
            self.record_bash(call, succeeded, &mut transitions);
        }

        transitions
    }

    fn record_bash(&mut self, call: &ToolCall, succeeded: bool, transitions: &mut Vec<TransitionEvent>) {
        if succeeded {
            self.state.consecutive_bash_failures = 0;
        } else {
            self.state.consecutive_bash_failures += 1;
        }

        let is_test = str_arg(&call.arguments, &["command"])
            .is_some_and(|command| looks_like_test_command(&command));
        if !is_test {
            return;
        }

        if succeeded {
            self.state.last_test_passed = Some(true);
            self.state.consecutive_test_failures = 0;
            self.state.in_test_fix_cycle = false;
            // A passing test after modifications moves acting → verifying.
            if self.state.phase == Phase::Acting && !self.state.files_modified.is_empty() {
                let state_snapshot = self.state.clone();
                if let Ok(event) = self.transition(Phase::Verifying, "tests passing after modifications") {
                    self.state.last_test_passed = state_snapshot.last_test_passed;
                    transitions.push(event);
                }
            }
        } else {
            self.state.last_test_passed = Some(false);
            self.state.consecutive_test_failures += 1;
            if self.state.consecutive_test_failures >= 2 {
                self.state.in_test_fix_cycle = true;
            }
        }
    }

    /// Close out one loop iteration for saturation accounting.
    pub fn end_iteration(&mut self) {
        self.state.iterations_in_phase += 1;
        self.file_count_window.push(self.state.unique_files_read.len());
        let window = self.config.exploration_iter_threshold as usize;
        if self.file_count_window.len() > window + 1 {
            self.file_count_window.remove(0);
        }
    }

    /// In `exploring`: recommend moving on once enough files are read,
    /// or once the last N iterations added no new files.
    pub fn saturation_recommended(&self) -> bool {
        if self.state.phase != Phase::Exploring {
            return false;
        }
        if self.state.unique_files_read.len() >= self.config.exploration_file_threshold {
            return true;
        }
        let window = self.config.exploration_iter_threshold as usize;
        if window == 0 || self.file_count_window.len() <= window {
            return false;
        }
        let recent = &self.file_count_window[self.file_count_window.len() - window - 1..];
        recent.windows(2).all(|pair| pair[0] == pair[1])
    }
}

fn is_read_tool(name: &str) -> bool {
    matches!(name, "read_file" | "cat" | "view_file")
}

fn is_search_tool(name: &str) -> bool {
    matches!(name, "grep" | "search" | "find" | "list_files")
}

fn is_modify_tool(name: &str) -> bool {
    matches!(name, "write_file" | "edit_file" | "delete_file" | "patch_file")
}

fn looks_like_test_command(command: &str) -> bool {
    let command = command.to_lowercase();
    ["cargo test", "pytest", "npm test", "go test", "make test", "ctest"]
        .iter()
        .any(|t| command.contains(t))
}

fn str_arg(arguments: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| arguments.get(k).and_then(Value::as_str))
        .map(str::to_string)
}
