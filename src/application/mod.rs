//! Application layer: the execution loop, the swarm orchestrator, and
//! their direct supports.

pub mod agent_loop;
pub mod compaction;
pub mod resource_monitor;
pub mod swarm_orchestrator;

pub use agent_loop::{AgentLoop, AgentLoopConfig, FinalResult, LoopOutcome};
pub use compaction::{
    apply_recovery, compact_tool_outputs, estimate_messages_tokens, estimate_tokens,
    CompactionConfig,
};
pub use resource_monitor::{OperationGuard, ResourceCheck, ResourceHealth, ResourceMonitor, ResourceUsage};
pub use swarm_orchestrator::{LoopWorkerExecutor, SwarmOrchestrator, SwarmOrchestratorConfig};
