//! Worker pool: match a ready task to a worker role, build its tiered
//! prompt, and run it through an executor.
//!
//! Role selection prefers idle roles whose capabilities cover the
//! task's mapped capability, breaking ties by authority. Tool access is
//! governed by `tool_access_mode`; a task's `assigned_model` overrides
//! the role's default model.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::error::RuntimeError;
use crate::domain::models::config::ToolAccessMode;
use crate::domain::models::swarm::{Capability, ClosureReport, SwarmTask, WorkerResult, WorkerRole};
use crate::services::cancellation::CancellationToken;
use crate::services::worker_prompts::WorkerPromptBuilder;

/// Everything an executor needs to run one worker attempt.
#[derive(Debug, Clone)]
pub struct WorkerRunRequest {
    pub agent_id: String,
    pub system_prompt: String,
    pub task_description: String,
    pub model: String,
    /// `None` means the host's full tool set.
    pub allowed_tools: Option<Vec<String>>,
    pub max_tokens: u64,
}

/// What one worker attempt produced.
#[derive(Debug, Clone)]
pub struct WorkerRunOutcome {
    pub output: String,
    pub token_usage: u64,
    pub cost_usd: f64,
}

/// Runs a worker attempt. The production implementation drives a full
/// agent loop; tests substitute scripted executors.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn run(
        &self,
        request: WorkerRunRequest,
        token: &CancellationToken,
    ) -> Result<WorkerRunOutcome, RuntimeError>;
}

/// Pool options.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub tool_access_mode: ToolAccessMode,
    pub tool_whitelist: Vec<String>,
    pub default_model: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            tool_access_mode: ToolAccessMode::All,
            tool_whitelist: Vec::new(),
            default_model: "claude-sonnet-4-20250514".to_string(),
        }
    }
}

/// The pool.
pub struct WorkerPool {
    roles: Vec<WorkerRole>,
    prompt_builder: WorkerPromptBuilder,
    executor: Arc<dyn WorkerExecutor>,
    config: WorkerPoolConfig,
    /// Active dispatch count per role name.
    busy: RwLock<HashMap<String, usize>>,
}

impl WorkerPool {
    pub fn new(
        roles: Vec<WorkerRole>,
        prompt_builder: WorkerPromptBuilder,
        executor: Arc<dyn WorkerExecutor>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self { roles, prompt_builder, executor, config, busy: RwLock::new(HashMap::new()) }
    }

    /// Dispatch one task attempt; `max_tokens` is the pool grant backing
    /// this worker.
    pub async fn dispatch(
        &self,
        task: &SwarmTask,
        max_tokens: u64,
        token: &CancellationToken,
    ) -> WorkerResult {
        let started = Instant::now();
        let required = task.task_type.required_capability();

        let Some(role) = self.select_role(required).await else {
            warn!(task_id = %task.id, capability = ?required, "no role covers capability");
            return WorkerResult {
                task_id: task.id,
                success: false,
                output: format!("no worker role covers capability {required:?}"),
                token_usage: 0,
                cost_usd: 0.0,
                duration_ms: started.elapsed().as_millis() as u64,
                quality_score: None,
                quality_feedback: None,
                closure_report: None,
            };
        };

        let system_prompt = self.prompt_builder.build(&role, task);
        let model = task
            .assigned_model
            .clone()
            .or_else(|| role.default_model.clone())
            .unwrap_or_else(|| self.config.default_model.clone());
        let allowed_tools = self.allowed_tools(&role);
        let agent_id = format!("worker-{}-{}", role.name, &task.id.to_string()[..8]);

        let request = WorkerRunRequest {
            agent_id: agent_id.clone(),
            system_prompt,
            task_description: task.description.clone(),
            model,
            allowed_tools,
            max_tokens,
        };

        {
            let mut busy = self.busy.write().await;
            *busy.entry(role.name.clone()).or_insert(0) += 1;
        }
        debug!(task_id = %task.id, role = %role.name, attempt = task.attempts, "dispatching worker");

        let outcome = self.executor.run(request, token).await;

        {
            let mut busy = self.busy.write().await;
            if let Some(count) = busy.get_mut(&role.name) {
                *count = count.saturating_sub(1);
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(run) => {
                let closure_report = parse_closure_report(&run.output);
                WorkerResult {
                    task_id: task.id,
                    success: true,
                    output: run.output,
                    token_usage: run.token_usage,
                    cost_usd: run.cost_usd,
                    duration_ms,
                    quality_score: None,
                    quality_feedback: None,
                    closure_report,
                }
            }
            Err(error) => WorkerResult {
                task_id: task.id,
                success: false,
                output: error.to_string(),
                token_usage: 0,
                cost_usd: 0.0,
                duration_ms,
                quality_score: None,
                quality_feedback: None,
                closure_report: None,
            },
        }
    }

    /// Covering roles sorted idle-first, then by authority.
    async fn select_role(&self, required: Capability) -> Option<WorkerRole> {
        let busy = self.busy.read().await;
        let mut covering: Vec<&WorkerRole> =
            self.roles.iter().filter(|r| r.covers(required)).collect();
        if covering.is_empty() {
            return None;
        }
        covering.sort_by(|a, b| {
            let a_idle = busy.get(&a.name).copied().unwrap_or(0) < a.max_concurrent_tasks;
            let b_idle = busy.get(&b.name).copied().unwrap_or(0) < b.max_concurrent_tasks;
            b_idle
                .cmp(&a_idle)
                .then(b.authority.cmp(&a.authority))
                .then(a.name.cmp(&b.name))
        });
        covering.first().map(|r| (*r).clone())
    }

    fn allowed_tools(&self, role: &WorkerRole) -> Option<Vec<String>> {
        match self.config.tool_access_mode {
            ToolAccessMode::Whitelist => Some(self.config.tool_whitelist.clone()),
            ToolAccessMode::All => {
                if role.tools.is_empty() {
                    None
                } else {
                    Some(role.tools.clone())
                }
            }
        }
    }
}

/// Pull a trailing `CLOSURE REPORT` JSON object out of worker output.
pub fn parse_closure_report(output: &str) -> Option<ClosureReport> {
    let search_from = output.rfind("CLOSURE REPORT").unwrap_or(0);
    let tail = &output[search_from..];
    let start = tail.find('{')?;
    let end = tail.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&tail[start..=end]).ok()
}

/// The built-in role set covering every task-type capability.
pub fn default_roles() -> Vec<WorkerRole> {
    vec![
        WorkerRole::new("researcher", "reads code and gathers findings")
            .with_capability(Capability::Research)
            .with_capability(Capability::Analyze)
            .with_authority(2)
            .with_max_concurrent(3),
        WorkerRole::new("coder", "implements and refactors code")
            .with_capability(Capability::Code)
            .with_authority(3)
            .with_max_concurrent(2),
        WorkerRole::new("scribe", "writes documentation and syntheses")
            .with_capability(Capability::Document)
            .with_capability(Capability::Write)
            .with_authority(1)
            .with_max_concurrent(2),
        WorkerRole::new("reviewer", "reviews and verifies work")
            .with_capability(Capability::Review)
            .with_capability(Capability::Analyze)
            .with_authority(2)
            .with_max_concurrent(2),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::swarm::{RetryContext, SwarmTaskType};
    use crate::services::cancellation::CancellationSource;
    use std::sync::Mutex;

    struct RecordingExecutor {
        requests: Mutex<Vec<WorkerRunRequest>>,
        output: String,
    }

    impl RecordingExecutor {
        fn new(output: &str) -> Self {
            Self { requests: Mutex::new(Vec::new()), output: output.to_string() }
        }
    }

    #[async_trait]
    impl WorkerExecutor for RecordingExecutor {
        async fn run(
            &self,
            request: WorkerRunRequest,
            _token: &CancellationToken,
        ) -> Result<WorkerRunOutcome, RuntimeError> {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request);
            }
            Ok(WorkerRunOutcome { output: self.output.clone(), token_usage: 500, cost_usd: 0.01 })
        }
    }

    fn make_pool(executor: Arc<RecordingExecutor>) -> WorkerPool {
        WorkerPool::new(
            default_roles(),
            WorkerPromptBuilder::default(),
            executor,
            WorkerPoolConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_selects_covering_role() {
        let executor = Arc::new(RecordingExecutor::new("done"));
        let pool = make_pool(executor.clone());
        let task = SwarmTask::new("implement parser", SwarmTaskType::Implement);
        let source = CancellationSource::new();

        let result = pool.dispatch(&task, 100_000, &source.token()).await;
        assert!(result.success);

        let requests = executor.requests.lock().unwrap();
        assert!(requests[0].agent_id.starts_with("worker-coder-"));
    }

    #[tokio::test]
    async fn test_no_covering_role_fails_fast() {
        let executor = Arc::new(RecordingExecutor::new("done"));
        let roles = vec![WorkerRole::new("scribe", "docs only").with_capability(Capability::Document)];
        let pool = WorkerPool::new(
            roles,
            WorkerPromptBuilder::default(),
            executor,
            WorkerPoolConfig::default(),
        );
        let task = SwarmTask::new("implement parser", SwarmTaskType::Implement);
        let source = CancellationSource::new();

        let result = pool.dispatch(&task, 100_000, &source.token()).await;
        assert!(!result.success);
        assert!(result.output.contains("no worker role"));
    }

    #[tokio::test]
    async fn test_retry_context_reaches_prompt() {
        let executor = Arc::new(RecordingExecutor::new("done"));
        let pool = make_pool(executor.clone());
        let mut task = SwarmTask::new("implement parser", SwarmTaskType::Implement);
        task.attempts = 1;
        task.retry_context = Some(RetryContext {
            previous_feedback: "handle empty input".into(),
            previous_score: 2.0,
            attempt: 0,
        });
        let source = CancellationSource::new();

        pool.dispatch(&task, 100_000, &source.token()).await;
        let requests = executor.requests.lock().unwrap();
        assert!(requests[0].system_prompt.contains("RETRY CONTEXT"));
        assert!(requests[0].system_prompt.contains("handle empty input"));
    }

    #[tokio::test]
    async fn test_assigned_model_overrides_default() {
        let executor = Arc::new(RecordingExecutor::new("done"));
        let pool = make_pool(executor.clone());
        let mut task = SwarmTask::new("implement parser", SwarmTaskType::Implement);
        task.assigned_model = Some("claude-haiku-4".to_string());
        let source = CancellationSource::new();

        pool.dispatch(&task, 100_000, &source.token()).await;
        let requests = executor.requests.lock().unwrap();
        assert_eq!(requests[0].model, "claude-haiku-4");
    }

    #[tokio::test]
    async fn test_whitelist_mode_restricts_tools() {
        let executor = Arc::new(RecordingExecutor::new("done"));
        let config = WorkerPoolConfig {
            tool_access_mode: ToolAccessMode::Whitelist,
            tool_whitelist: vec!["read_file".to_string(), "grep".to_string()],
            ..Default::default()
        };
        let pool =
            WorkerPool::new(default_roles(), WorkerPromptBuilder::default(), executor.clone(), config);
        let task = SwarmTask::new("research crates", SwarmTaskType::Research);
        let source = CancellationSource::new();

        pool.dispatch(&task, 100_000, &source.token()).await;
        let requests = executor.requests.lock().unwrap();
        assert_eq!(
            requests[0].allowed_tools,
            Some(vec!["read_file".to_string(), "grep".to_string()])
        );
    }

    #[tokio::test]
    async fn test_closure_report_parsed_from_output() {
        let output = r#"All done.

CLOSURE REPORT
{"findings": ["the parser handles unicode"], "actions_taken": ["wrote src/parser.rs"],
 "failures": [], "remaining_work": ["fuzzing"]}"#;
        let executor = Arc::new(RecordingExecutor::new(output));
        let pool = make_pool(executor);
        let task = SwarmTask::new("implement parser", SwarmTaskType::Implement);
        let source = CancellationSource::new();

        let result = pool.dispatch(&task, 100_000, &source.token()).await;
        let report = result.closure_report.expect("closure report parsed");
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.remaining_work, vec!["fuzzing".to_string()]);
    }

    #[test]
    fn test_parse_closure_report_absent() {
        assert!(parse_closure_report("no report here").is_none());
    }
}
