//! Domain models for the agent runtime.

pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod finding;
pub mod intent;
pub mod message;
pub mod phase;
pub mod policy;
pub mod swarm;

pub use budget::{Budget, BudgetCheck, BudgetType, EnforcementMode, RecoveryPlan, UsageTotals};
pub use checkpoint::{Checkpoint, SerializedState};
pub use config::{
    BudgetConfig, CheckpointConfig, ExplorationConfig, LogConfig, LogFormat, PolicyConfig,
    ProviderConfig, ResourceConfig, RuntimeConfig, SessionConfig, SwarmConfig, TelemetryConfig,
    ToolAccessMode,
};
pub use finding::{Finding, FindingFilter, FindingType};
pub use intent::{Evidence, EvidenceKind, IntentClassification, IntentType};
pub use message::{canonical_json, ContentBlock, Message, MessageContent, Role, Thread, ToolCall};
pub use phase::{Phase, PhaseState};
pub use policy::{
    ArgPattern, Condition, ContextPattern, EvaluationContext, PermissionGrant, PolicyAction,
    PolicyDecision, PolicyRule, RiskLevel, ToolHistoryEntry,
};
pub use swarm::{
    Capability, ClosureReport, RetryContext, SwarmResult, SwarmTask, SwarmTaskStatus,
    SwarmTaskType, WorkerResult, WorkerRole,
};
