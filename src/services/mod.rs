//! Core services: concurrency primitives, policy, economics, and swarm
//! support.

pub mod audit_log;
pub mod blackboard;
pub mod budget_pool;
pub mod budget_tracker;
pub mod cancellation;
pub mod checkpoint_store;
pub mod decomposer;
pub mod doom_loop;
pub mod event_bus;
pub mod intent_classifier;
pub mod phase_machine;
pub mod policy_engine;
pub mod quality_gate;
pub mod worker_pool;
pub mod worker_prompts;

pub use audit_log::{AuditEntry, AuditLog, AuditLogConfig, AuditQuery};
pub use blackboard::{Blackboard, Subscription};
pub use budget_pool::{PoolGrant, SwarmBudgetPool};
pub use budget_tracker::BudgetTracker;
pub use cancellation::{sleep, CancellationSource, CancellationToken};
pub use checkpoint_store::{AutoCheckpointer, CheckpointStore};
pub use decomposer::{Decomposition, DecomposerConfig, SmartDecomposer};
pub use doom_loop::{AgentLoopDetector, DoomLoopHit, GlobalLoopDetector};
pub use event_bus::{EventBus, EventBusConfig, EventCategory, EventPayload, EventSeverity, RuntimeEvent};
pub use intent_classifier::{IntentClassifier, IntentClassifierConfig};
pub use phase_machine::{PhaseMachine, PhaseMachineConfig, TransitionEvent};
pub use policy_engine::{default_rules, PolicyEngine, PolicyEngineConfig};
pub use quality_gate::{QualityGate, QualityGateConfig, QualityVerdict};
pub use worker_pool::{
    default_roles, WorkerExecutor, WorkerPool, WorkerPoolConfig, WorkerRunOutcome, WorkerRunRequest,
};
pub use worker_prompts::{PromptTier, WorkerPromptBuilder};
