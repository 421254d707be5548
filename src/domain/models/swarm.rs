//! Swarm data model: tasks, worker roles, results, and closure reports.
//!
//! Once the orchestrator seals the DAG it owns the tasks; workers
//! receive a read-only task spec and report through a `WorkerResult`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Semantic type of a decomposed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwarmTaskType {
    Design,
    Implement,
    Test,
    Refactor,
    Research,
    Analysis,
    Document,
    Merge,
}

impl SwarmTaskType {
    /// Map a task type to the capability a worker must cover.
    pub fn required_capability(self) -> Capability {
        match self {
            Self::Research => Capability::Research,
            Self::Implement | Self::Refactor | Self::Test => Capability::Code,
            Self::Merge => Capability::Write,
            Self::Document => Capability::Document,
            Self::Design | Self::Analysis => Capability::Analyze,
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "design" => Some(Self::Design),
            "implement" => Some(Self::Implement),
            "test" => Some(Self::Test),
            "refactor" => Some(Self::Refactor),
            "research" => Some(Self::Research),
            "analysis" => Some(Self::Analysis),
            "document" => Some(Self::Document),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

impl std::fmt::Display for SwarmTaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Design => write!(f, "design"),
            Self::Implement => write!(f, "implement"),
            Self::Test => write!(f, "test"),
            Self::Refactor => write!(f, "refactor"),
            Self::Research => write!(f, "research"),
            Self::Analysis => write!(f, "analysis"),
            Self::Document => write!(f, "document"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

/// Lifecycle status of a swarm task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmTaskStatus {
    Pending,
    Ready,
    Dispatched,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl SwarmTaskStatus {
    /// Terminal statuses unblock dependents (`completed`/`skipped`) or
    /// end the task (`failed`).
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Statuses that satisfy a dependent's dependency.
    pub const fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for SwarmTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Feedback carried into a retry attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryContext {
    /// Judge feedback, or the hard-failure error text when `previous_score` is 0.
    pub previous_feedback: String,
    /// Quality score of the previous attempt in `[0, 5]`; 0 for hard failures.
    pub previous_score: f64,
    /// The attempt number that produced this context (0-based).
    pub attempt: u32,
}

/// One node in the sealed task DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmTask {
    pub id: Uuid,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: SwarmTaskType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Uuid>,
    pub status: SwarmTaskStatus,
    /// Estimated complexity in `[1, 10]`.
    pub complexity: u8,
    /// Longest dependency path length; wave-N tasks dispatch after all
    /// wave-<N tasks are terminal.
    pub wave: u32,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_context: Option<RetryContext>,
    /// Failover model override for the dispatched worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relevant_files: Vec<String>,
    /// Earlier tasks whose writes overlap this task's files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl SwarmTask {
    pub fn new(description: impl Into<String>, task_type: SwarmTaskType) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            task_type,
            dependencies: Vec::new(),
            status: SwarmTaskStatus::Pending,
            complexity: 5,
            wave: 0,
            attempts: 0,
            retry_context: None,
            assigned_model: None,
            relevant_files: Vec::new(),
            conflicts_with: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity.clamp(1, 10);
        self
    }
}

/// A worker's structured end-of-task summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClosureReport {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions_taken: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remaining_work: Vec<String>,
}

/// What a worker hands back for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub task_id: Uuid,
    pub success: bool,
    pub output: String,
    pub token_usage: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closure_report: Option<ClosureReport>,
}

/// Worker capability, covered by a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Research,
    Code,
    Write,
    Document,
    Analyze,
    Review,
}

/// A flat worker-role record. Roles compose via builders, not inheritance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRole {
    pub name: String,
    pub description: String,
    pub capabilities: HashSet<Capability>,
    pub system_prompt: String,
    /// Tool allow-list when the pool runs in whitelist mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    /// Tie-breaker when several roles cover a capability; higher wins.
    pub authority: u8,
    pub max_concurrent_tasks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl WorkerRole {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            capabilities: HashSet::new(),
            system_prompt: String::new(),
            tools: Vec::new(),
            authority: 1,
            max_concurrent_tasks: 1,
            default_model: None,
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_authority(mut self, authority: u8) -> Self {
        self.authority = authority;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn covers(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Aggregate outcome of a swarm run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmResult {
    pub root_description: String,
    pub tasks: Vec<SwarmTask>,
    pub results: Vec<WorkerResult>,
    /// Output of the merge-type synthesis task, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl SwarmResult {
    pub fn completed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status == SwarmTaskStatus::Completed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status == SwarmTaskStatus::Failed).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status == SwarmTaskStatus::Skipped).count()
    }
}
