//! Unified event bus: broadcast-based event streaming with sequence
//! numbering.
//!
//! Every subsystem publishes here; the host, telemetry writer, and
//! tests subscribe. Sequence numbers are monotonically increasing per
//! bus, assigned at publish time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::budget::BudgetType;
use crate::domain::models::phase::Phase;
use crate::domain::models::policy::{PolicyAction, RiskLevel};
use crate::domain::models::swarm::{ClosureReport, SwarmTask, SwarmTaskStatus, SwarmTaskType};

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Event category for filtering and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Agent,
    Policy,
    Phase,
    Budget,
    Checkpoint,
    Resource,
    Swarm,
    Tool,
}

/// Compact task view carried in swarm lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmTaskBrief {
    pub id: Uuid,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: SwarmTaskType,
    pub status: SwarmTaskStatus,
    pub wave: u32,
    pub attempts: u32,
}

impl From<&SwarmTask> for SwarmTaskBrief {
    fn from(task: &SwarmTask) -> Self {
        Self {
            id: task.id,
            description: task.description.clone(),
            task_type: task.task_type,
            status: task.status,
            wave: task.wave,
            attempts: task.attempts,
        }
    }
}

/// Typed payload of a runtime event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    // Agent loop
    AgentMessage {
        agent: String,
        content: String,
    },
    ToolExecuted {
        agent: String,
        tool: String,
        success: bool,
        duration_ms: u64,
    },
    LoopCompleted {
        agent: String,
        outcome: String,
        iterations: u32,
    },

    // Policy
    PolicyDecisionRecorded {
        agent: String,
        tool: String,
        allowed: bool,
        policy: PolicyAction,
        risk_level: RiskLevel,
        reason: String,
        prompt_required: bool,
    },
    GrantMinted {
        grant_id: Uuid,
        tool: String,
        reason: String,
    },
    GrantConsumed {
        grant_id: Uuid,
        tool: String,
        remaining_uses: Option<u32>,
    },

    // Phase machine
    PhaseTransitioned {
        agent: String,
        from: Phase,
        to: Phase,
        reason: String,
    },

    // Economics
    BudgetSoftLimit {
        agent: String,
        budget_type: BudgetType,
        percent_used: f64,
    },
    BudgetExhausted {
        agent: String,
        budget_type: BudgetType,
        reason: String,
    },
    RecoveryAttempted {
        agent: String,
        new_context_tokens: u64,
        target_tokens: u64,
        success: bool,
    },
    DoomLoopDetected {
        agent: String,
        tool: String,
        count: usize,
        global: bool,
    },

    // Checkpoints
    CheckpointCreated {
        checkpoint_id: Uuid,
        thread_id: Uuid,
        label: Option<String>,
    },

    // Resource monitor
    ResourceStatusChanged {
        status: String,
        message: Option<String>,
    },

    // Swarm lifecycle
    SwarmTasksLoaded {
        tasks: Vec<SwarmTaskBrief>,
    },
    SwarmTaskDispatched {
        task_id: Uuid,
        worker: String,
        wave: u32,
        attempt: u32,
    },
    SwarmTaskCompleted {
        task_id: Uuid,
        output: String,
        quality_score: Option<f64>,
        quality_feedback: Option<String>,
        closure_report: Option<ClosureReport>,
    },
    SwarmTaskRetry {
        task_id: Uuid,
        attempt: u32,
        previous_score: f64,
    },
    SwarmTaskFailed {
        task_id: Uuid,
        reason: String,
        attempts: u32,
    },
    SwarmTaskSkipped {
        task_id: Uuid,
        reason: String,
    },
    SwarmCompleted {
        completed: usize,
        failed: usize,
        skipped: usize,
        total_tokens: u64,
        cancelled: bool,
    },
}

/// The envelope put on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub id: Uuid,
    /// Monotonically increasing per bus, assigned at publish.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub category: EventCategory,
    pub payload: EventPayload,
}

/// Bus options.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity; slow subscribers lag past this.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { channel_capacity: 1024 }
    }
}

/// Broadcast event bus with sequence numbering.
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
    next_seq: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity);
        Self { tx, next_seq: AtomicU64::new(1) }
    }

    /// Build, stamp, and broadcast an event. Delivery is best-effort:
    /// a bus with no subscribers drops events silently.
    pub fn publish(
        &self,
        severity: EventSeverity,
        category: EventCategory,
        payload: EventPayload,
    ) -> RuntimeEvent {
        let event = RuntimeEvent {
            id: Uuid::new_v4(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            severity,
            category,
            payload,
        };
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}
