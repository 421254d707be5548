//! Overlord - an LLM coding-agent runtime.
//!
//! The execution-and-coordination core between a raw model call and
//! the filesystem:
//! - Single-agent execution loop with budgets, compaction, phase
//!   tracking, and doom-loop detection
//! - Three-tier policy engine (allow / prompt / forbidden) with
//!   conditional rules, grants, intent classification, and audit
//! - Swarm orchestrator: LLM-assisted decomposition into a DAG, wave
//!   scheduling under a shared budget pool, quality-gated retries
//! - Supporting primitives: cancellation tokens, checkpoint store,
//!   resource monitor, shared blackboard

pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;
