//! Swarm orchestrator: wave scheduling over the sealed task DAG.
//!
//! Repeatedly marks tasks ready when their dependencies are satisfied,
//! dispatches up to the concurrency bound (staggered to avoid
//! thundering-herd rate limits), runs the quality gate on every
//! attempt, retries with feedback, and finishes with the merge-type
//! synthesis task. Cancellation fails every non-terminal task and
//! releases all outstanding budget reservations; completed work is
//! returned as partial results.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::agent_loop::{AgentLoop, AgentLoopConfig, LoopOutcome};
use crate::domain::error::{ProviderError, RuntimeError};
use crate::domain::models::budget::{Budget, EnforcementMode};
use crate::domain::models::config::SwarmConfig;
use crate::domain::models::finding::{Finding, FindingType};
use crate::domain::models::message::{Message, Role};
use crate::domain::models::swarm::{
    RetryContext, SwarmResult, SwarmTask, SwarmTaskStatus, SwarmTaskType, WorkerResult,
};
use crate::domain::ports::host::HostGateway;
use crate::domain::ports::provider::ModelProvider;
use crate::domain::ports::tool::Tool;
use crate::services::blackboard::Blackboard;
use crate::services::budget_pool::{PoolGrant, SwarmBudgetPool};
use crate::services::budget_tracker::BudgetTracker;
use crate::services::cancellation::{CancellationSource, CancellationToken};
use crate::services::decomposer::SmartDecomposer;
use crate::services::doom_loop::GlobalLoopDetector;
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity, SwarmTaskBrief};
use crate::services::phase_machine::{PhaseMachine, PhaseMachineConfig};
use crate::services::policy_engine::PolicyEngine;
use crate::services::quality_gate::QualityGate;
use crate::services::worker_pool::{WorkerExecutor, WorkerPool, WorkerRunOutcome, WorkerRunRequest};

/// Orchestrator options, usually derived from `SwarmConfig`.
#[derive(Debug, Clone)]
pub struct SwarmOrchestratorConfig {
    pub max_concurrency: usize,
    pub dispatch_stagger_ms: u64,
    pub quality_gate_enabled: bool,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub fixup_tasks_enabled: bool,
    pub dependency_context_max_length: usize,
    /// Token reservation requested per worker dispatch.
    pub tokens_per_worker: u64,
    pub swarm_timeout_secs: Option<u64>,
}

impl SwarmOrchestratorConfig {
    pub fn from_swarm_config(config: &SwarmConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            dispatch_stagger_ms: config.dispatch_stagger_ms,
            quality_gate_enabled: config.quality_gate_enabled,
            max_retries: config.worker_retries,
            fixup_tasks_enabled: config.fixup_tasks_enabled,
            dependency_context_max_length: config.dependency_context_max_length,
            tokens_per_worker: config.max_tokens_per_worker,
            swarm_timeout_secs: None,
        }
    }
}

impl Default for SwarmOrchestratorConfig {
    fn default() -> Self {
        Self::from_swarm_config(&SwarmConfig::default())
    }
}

/// The orchestrator. Owns the task DAG once sealed.
pub struct SwarmOrchestrator {
    config: SwarmOrchestratorConfig,
    decomposer: SmartDecomposer,
    worker_pool: Arc<WorkerPool>,
    budget_pool: Arc<SwarmBudgetPool>,
    quality_gate: Option<QualityGate>,
    blackboard: Arc<Blackboard>,
    event_bus: Arc<EventBus>,
}

impl SwarmOrchestrator {
    pub fn new(
        config: SwarmOrchestratorConfig,
        decomposer: SmartDecomposer,
        worker_pool: Arc<WorkerPool>,
        budget_pool: Arc<SwarmBudgetPool>,
        quality_gate: Option<QualityGate>,
        blackboard: Arc<Blackboard>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            decomposer,
            worker_pool,
            budget_pool,
            quality_gate,
            blackboard,
            event_bus,
        }
    }

    /// Run a root task to completion (or cancellation) and return the
    /// aggregate result.
    pub async fn execute(
        &self,
        root_task: &str,
        context: &str,
        caller_token: &CancellationToken,
    ) -> Result<SwarmResult, RuntimeError> {
        let started = Instant::now();
        let source = CancellationSource::linked(&[caller_token.clone()]);
        if let Some(secs) = self.config.swarm_timeout_secs {
            source.cancel_after(Duration::from_secs(secs));
        }
        let token = source.token();

        // 1. Decompose into a sealed DAG.
        let decomposition = self.decomposer.decompose(root_task, context, &token).await?;
        self.budget_pool.record_orchestrator_usage(decomposition.token_usage);
        let mut tasks = decomposition.subtasks;
        info!(tasks = tasks.len(), strategy = %decomposition.strategy, "swarm starting");
        self.emit_tasks_loaded(&tasks);

        let mut outputs: HashMap<Uuid, String> = HashMap::new();
        let mut results: Vec<WorkerResult> = Vec::new();
        let mut grants: HashMap<Uuid, PoolGrant> = HashMap::new();
        let mut fixups_created: HashSet<Uuid> = HashSet::new();
        let mut in_flight: JoinSet<(Uuid, WorkerResult)> = JoinSet::new();
        let mut cancelled = false;

        // 2. Wave loop.
        loop {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }

            self.mark_ready(&mut tasks);
            self.dispatch_ready(&mut tasks, &outputs, &mut grants, &mut in_flight, &token).await;

            if in_flight.is_empty() {
                if tasks.iter().all(|t| t.status.is_terminal()) {
                    break;
                }
                // Nothing running and nothing dispatchable: the rest are
                // unschedulable (budget or dependency dead-ends).
                for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                    task.status = SwarmTaskStatus::Skipped;
                    self.event_bus.publish(
                        EventSeverity::Warning,
                        EventCategory::Swarm,
                        EventPayload::SwarmTaskSkipped {
                            task_id: task.id,
                            reason: "unschedulable".to_string(),
                        },
                    );
                }
                break;
            }

            let joined = tokio::select! {
                joined = in_flight.join_next() => joined,
                () = token.cancelled() => {
                    cancelled = true;
                    break;
                }
            };
            match joined {
                Some(Ok((task_id, result))) => {
                    if let Some(grant) = grants.remove(&task_id) {
                        self.budget_pool.release(&grant, result.token_usage);
                    }
                    self.budget_pool.record_cost(result.cost_usd);
                    self.handle_completion(
                        &mut tasks,
                        task_id,
                        result,
                        &mut outputs,
                        &mut results,
                        &mut fixups_created,
                        &token,
                    )
                    .await;
                }
                Some(Err(join_error)) => {
                    warn!(%join_error, "worker task aborted");
                }
                None => {}
            }
        }

        // 3. Cancellation cleanup: fail every non-terminal task and
        // return outstanding reservations.
        if cancelled {
            in_flight.abort_all();
            for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                task.status = SwarmTaskStatus::Failed;
                self.event_bus.publish(
                    EventSeverity::Warning,
                    EventCategory::Swarm,
                    EventPayload::SwarmTaskFailed {
                        task_id: task.id,
                        reason: "cancelled".to_string(),
                        attempts: task.attempts,
                    },
                );
            }
            self.budget_pool.release_all_outstanding();
        }

        // 4. Synthesis output is the last completed merge task's.
        let synthesis = tasks
            .iter()
            .filter(|t| t.task_type == SwarmTaskType::Merge && t.status == SwarmTaskStatus::Completed)
            .last()
            .and_then(|t| outputs.get(&t.id).cloned());

        let result = SwarmResult {
            root_description: root_task.to_string(),
            cancelled,
            synthesis,
            total_tokens: self.budget_pool.spent_tokens(),
            total_cost_usd: self.budget_pool.spent_cost_usd(),
            duration_ms: started.elapsed().as_millis() as u64,
            tasks,
            results,
        };
        self.event_bus.publish(
            EventSeverity::Info,
            EventCategory::Swarm,
            EventPayload::SwarmCompleted {
                completed: result.completed_count(),
                failed: result.failed_count(),
                skipped: result.skipped_count(),
                total_tokens: result.total_tokens,
                cancelled,
            },
        );
        info!(
            completed = result.completed_count(),
            failed = result.failed_count(),
            skipped = result.skipped_count(),
            cancelled,
            "swarm finished"
        );
        Ok(result)
    }

    /// Pending → ready when every dependency is satisfied; pending with
    /// a failed dependency is skipped. Merge tasks additionally wait
    /// for every non-merge task to become terminal so synthesis runs
    /// last.
    fn mark_ready(&self, tasks: &mut [SwarmTask]) {
        let statuses: HashMap<Uuid, SwarmTaskStatus> =
            tasks.iter().map(|t| (t.id, t.status)).collect();
        let all_non_merge_terminal = tasks
            .iter()
            .filter(|t| t.task_type != SwarmTaskType::Merge)
            .all(|t| t.status.is_terminal());

        for task in tasks.iter_mut().filter(|t| t.status == SwarmTaskStatus::Pending) {
            let dep_failed = task
                .dependencies
                .iter()
                .any(|d| statuses.get(d) == Some(&SwarmTaskStatus::Failed));
            if dep_failed {
                task.status = SwarmTaskStatus::Skipped;
                self.event_bus.publish(
                    EventSeverity::Warning,
                    EventCategory::Swarm,
                    EventPayload::SwarmTaskSkipped {
                        task_id: task.id,
                        reason: "dependency failed".to_string(),
                    },
                );
                continue;
            }
            let deps_satisfied = task.dependencies.iter().all(|d| {
                statuses.get(d).copied().is_some_and(SwarmTaskStatus::satisfies_dependency)
            });
            let merge_gate = task.task_type != SwarmTaskType::Merge || all_non_merge_terminal;
            if deps_satisfied && merge_gate {
                task.status = SwarmTaskStatus::Ready;
            }
        }
    }

    async fn dispatch_ready(
        &self,
        tasks: &mut [SwarmTask],
        outputs: &HashMap<Uuid, String>,
        grants: &mut HashMap<Uuid, PoolGrant>,
        in_flight: &mut JoinSet<(Uuid, WorkerResult)>,
        token: &CancellationToken,
    ) {
        let ready_ids: Vec<Uuid> = tasks
            .iter()
            .filter(|t| t.status == SwarmTaskStatus::Ready)
            .map(|t| t.id)
            .collect();

        let mut dispatched_any = false;
        for task_id in ready_ids {
            if in_flight.len() >= self.config.max_concurrency || token.is_cancelled() {
                break;
            }
            let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) else {
                continue;
            };

            // Budget check before every dispatch.
            if !self.budget_pool.has_capacity() {
                task.status = SwarmTaskStatus::Skipped;
                self.event_bus.publish(
                    EventSeverity::Warning,
                    EventCategory::Swarm,
                    EventPayload::SwarmTaskSkipped {
                        task_id,
                        reason: "budget exhausted".to_string(),
                    },
                );
                continue;
            }
            let Some(grant) =
                self.budget_pool.reserve(&task_id.to_string(), self.config.tokens_per_worker)
            else {
                task.status = SwarmTaskStatus::Skipped;
                self.event_bus.publish(
                    EventSeverity::Warning,
                    EventCategory::Swarm,
                    EventPayload::SwarmTaskSkipped {
                        task_id,
                        reason: "budget exhausted".to_string(),
                    },
                );
                continue;
            };

            // Stagger dispatches to avoid a thundering herd on the
            // provider's rate limits.
            if dispatched_any && self.config.dispatch_stagger_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.dispatch_stagger_ms)).await;
            }
            dispatched_any = true;

            task.status = SwarmTaskStatus::Dispatched;
            self.event_bus.publish(
                EventSeverity::Info,
                EventCategory::Swarm,
                EventPayload::SwarmTaskDispatched {
                    task_id,
                    worker: task_id.to_string(),
                    wave: task.wave,
                    attempt: task.attempts,
                },
            );

            let mut dispatch_task = task.clone();
            if dispatch_task.task_type == SwarmTaskType::Merge {
                dispatch_task.description = self.with_dependency_context(&dispatch_task, outputs);
            }
            task.status = SwarmTaskStatus::InProgress;

            let granted = grant.granted;
            grants.insert(task_id, grant);
            let pool = Arc::clone(&self.worker_pool);
            let worker_token = token.clone();
            debug!(%task_id, wave = dispatch_task.wave, attempt = dispatch_task.attempts, "worker spawned");
            in_flight.spawn(async move {
                let result = pool.dispatch(&dispatch_task, granted, &worker_token).await;
                (task_id, result)
            });
        }
    }

    /// Aggregate dependency outputs for a synthesis task, bounded by
    /// `dependency_context_max_length`.
    fn with_dependency_context(&self, task: &SwarmTask, outputs: &HashMap<Uuid, String>) -> String {
        let sources: Vec<&Uuid> = if task.dependencies.is_empty() {
            outputs.keys().collect()
        } else {
            task.dependencies.iter().collect()
        };

        let mut context = String::new();
        for id in sources {
            let Some(output) = outputs.get(id) else { continue };
            if context.len() >= self.config.dependency_context_max_length {
                break;
            }
            let remaining = self.config.dependency_context_max_length - context.len();
            let mut slice: String = output.chars().take(remaining).collect();
            if slice.len() < output.len() {
                slice.push_str("\n[dependency output truncated]");
            }
            context.push_str(&format!("\n--- output of {id} ---\n{slice}\n"));
        }
        format!("{}\n\nDEPENDENCY OUTPUTS:{context}", task.description)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_completion(
        &self,
        tasks: &mut Vec<SwarmTask>,
        task_id: Uuid,
        mut result: WorkerResult,
        outputs: &mut HashMap<Uuid, String>,
        results: &mut Vec<WorkerResult>,
        fixups_created: &mut HashSet<Uuid>,
        token: &CancellationToken,
    ) {
        let Some(index) = tasks.iter().position(|t| t.id == task_id) else {
            return;
        };
        tasks[index].attempts += 1;

        if result.success {
            // Quality gate runs on every attempt, not just the first.
            if self.config.quality_gate_enabled {
                if let Some(gate) = &self.quality_gate {
                    match gate.review(&tasks[index], &result.output, token).await {
                        Ok(verdict) => {
                            self.budget_pool.record_orchestrator_usage(verdict.token_usage);
                            result.quality_score = Some(verdict.score);
                            result.quality_feedback = Some(verdict.feedback.clone());
                            if !verdict.passed {
                                self.reject_or_fail(
                                    tasks,
                                    index,
                                    result,
                                    verdict.score,
                                    verdict.feedback,
                                    results,
                                    fixups_created,
                                );
                                return;
                            }
                        }
                        Err(error) => {
                            // A broken judge must not sink good work.
                            warn!(%task_id, %error, "quality gate unavailable; accepting output");
                        }
                    }
                }
            }
            self.complete(tasks, index, result, outputs, results).await;
        } else {
            // Hard failures carry the error text so the next prompt
            // explains what went wrong.
            let feedback = result.output.clone();
            self.reject_or_fail(tasks, index, result, 0.0, feedback, results, fixups_created);
        }
    }

    async fn complete(
        &self,
        tasks: &mut [SwarmTask],
        index: usize,
        result: WorkerResult,
        outputs: &mut HashMap<Uuid, String>,
        results: &mut Vec<WorkerResult>,
    ) {
        let task = &mut tasks[index];
        task.status = SwarmTaskStatus::Completed;
        outputs.insert(task.id, result.output.clone());

        self.blackboard
            .post(
                Finding::new(
                    FindingType::Handoff,
                    task.id.to_string(),
                    json!({
                        "task": task.description,
                        "output_excerpt": result.output.chars().take(500).collect::<String>(),
                    }),
                )
                .with_tags(vec![task.task_type.to_string()]),
            )
            .await;

        self.event_bus.publish(
            EventSeverity::Info,
            EventCategory::Swarm,
            EventPayload::SwarmTaskCompleted {
                task_id: task.id,
                output: result.output.clone(),
                quality_score: result.quality_score,
                quality_feedback: result.quality_feedback.clone(),
                closure_report: result.closure_report.clone(),
            },
        );
        results.push(result);
    }

    #[allow(clippy::too_many_arguments)]
    fn reject_or_fail(
        &self,
        tasks: &mut Vec<SwarmTask>,
        index: usize,
        result: WorkerResult,
        score: f64,
        feedback: String,
        results: &mut Vec<WorkerResult>,
        fixups_created: &mut HashSet<Uuid>,
    ) {
        let max_attempts = self.config.max_retries + 1;
        let (task_id, attempts) = (tasks[index].id, tasks[index].attempts);

        if attempts < max_attempts {
            let task = &mut tasks[index];
            task.retry_context = Some(RetryContext {
                previous_feedback: feedback,
                previous_score: score,
                attempt: attempts - 1,
            });
            task.status = SwarmTaskStatus::Ready;
            self.event_bus.publish(
                EventSeverity::Warning,
                EventCategory::Swarm,
                EventPayload::SwarmTaskRetry { task_id, attempt: attempts, previous_score: score },
            );
            self.emit_tasks_loaded(tasks);
        } else {
            tasks[index].status = SwarmTaskStatus::Failed;
            self.event_bus.publish(
                EventSeverity::Error,
                EventCategory::Swarm,
                EventPayload::SwarmTaskFailed {
                    task_id,
                    reason: format!("scored {score:.1}/5 after {attempts} attempts: {feedback}"),
                    attempts,
                },
            );
            if self.config.fixup_tasks_enabled && fixups_created.insert(task_id) {
                let failed = &tasks[index];
                let bounded_output: String = result
                    .output
                    .chars()
                    .take(self.config.dependency_context_max_length)
                    .collect();
                let mut fixup = SwarmTask::new(
                    format!(
                        "Fix up the failed task: {}\n\nLast failed attempt output (context):\n{}",
                        failed.description, bounded_output
                    ),
                    failed.task_type,
                )
                .with_dependencies(failed.dependencies.clone())
                .with_complexity(failed.complexity);
                fixup.wave = failed.wave;
                fixup.relevant_files = failed.relevant_files.clone();
                debug!(original = %task_id, fixup = %fixup.id, "fixup task added");
                tasks.push(fixup);
                self.emit_tasks_loaded(tasks);
            }
        }
        results.push(result);
    }

    fn emit_tasks_loaded(&self, tasks: &[SwarmTask]) {
        self.event_bus.publish(
            EventSeverity::Info,
            EventCategory::Swarm,
            EventPayload::SwarmTasksLoaded { tasks: tasks.iter().map(SwarmTaskBrief::from).collect() },
        );
    }
}

/// The production worker executor: each dispatch runs a full agent loop
/// with its own budget, phase machine, and the shared global doom-loop
/// history.
pub struct LoopWorkerExecutor {
    provider: Arc<dyn ModelProvider>,
    tools: Vec<Arc<dyn Tool>>,
    policy: Arc<PolicyEngine>,
    host: Arc<dyn HostGateway>,
    event_bus: Arc<EventBus>,
    global_detector: Arc<GlobalLoopDetector>,
    phase_config: PhaseMachineConfig,
    worker_max_iterations: u32,
}

impl LoopWorkerExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Vec<Arc<dyn Tool>>,
        policy: Arc<PolicyEngine>,
        host: Arc<dyn HostGateway>,
        event_bus: Arc<EventBus>,
        global_detector: Arc<GlobalLoopDetector>,
        phase_config: PhaseMachineConfig,
        worker_max_iterations: u32,
    ) -> Self {
        Self {
            provider,
            tools,
            policy,
            host,
            event_bus,
            global_detector,
            phase_config,
            worker_max_iterations,
        }
    }
}

#[async_trait]
impl WorkerExecutor for LoopWorkerExecutor {
    async fn run(
        &self,
        request: WorkerRunRequest,
        token: &CancellationToken,
    ) -> Result<WorkerRunOutcome, RuntimeError> {
        let budget = Budget {
            target_iterations: self.worker_max_iterations / 2,
            max_iterations: self.worker_max_iterations,
            max_tokens: Some(request.max_tokens),
            max_cost: None,
            enforcement_mode: EnforcementMode::Soft,
            soft_threshold: 0.8,
        };
        let tracker = BudgetTracker::new(&request.agent_id, budget, Arc::clone(&self.event_bus))
            .with_global_detector(Arc::clone(&self.global_detector));
        let phase = PhaseMachine::new(
            &request.agent_id,
            self.phase_config.clone(),
            Arc::clone(&self.event_bus),
        );

        let config = AgentLoopConfig {
            agent_id: request.agent_id.clone(),
            model: request.model.clone(),
            system_prompt: Some(request.system_prompt.clone()),
            allowed_tools: request.allowed_tools.clone(),
            interactive: false,
            ..Default::default()
        };
        let mut agent_loop = AgentLoop::new(
            config,
            Arc::clone(&self.provider),
            self.tools.clone(),
            Arc::clone(&self.policy),
            Arc::clone(&self.host),
            Arc::clone(&self.event_bus),
            tracker,
            phase,
        );

        let result = agent_loop
            .run(vec![Message::user(request.task_description.clone())], token.clone())
            .await;

        match result.outcome {
            LoopOutcome::Completed { final_text } => Ok(WorkerRunOutcome {
                output: final_text,
                token_usage: result.usage.tokens,
                cost_usd: result.usage.cost_usd,
            }),
            LoopOutcome::BudgetExhausted { .. } => {
                // Hand back whatever the worker had; the gate judges it.
                let output = result
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::Assistant)
                    .map(|m| m.content.as_text())
                    .unwrap_or_else(|| "worker budget exhausted before producing output".to_string());
                Ok(WorkerRunOutcome {
                    output,
                    token_usage: result.usage.tokens,
                    cost_usd: result.usage.cost_usd,
                })
            }
            LoopOutcome::Cancelled { reason } => Err(RuntimeError::Cancelled(reason)),
            LoopOutcome::Failed { error } => {
                Err(RuntimeError::Provider(ProviderError::RequestFailed(error)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::provider::mock::MockProvider;
    use crate::services::decomposer::DecomposerConfig;
    use crate::services::quality_gate::QualityGateConfig;
    use crate::services::worker_pool::{default_roles, WorkerPoolConfig};
    use crate::services::worker_prompts::WorkerPromptBuilder;
    use std::sync::Mutex;

    /// Scripted executor recording every request.
    struct ScriptedExecutor {
        requests: Mutex<Vec<WorkerRunRequest>>,
        outputs: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(outputs: Vec<&str>) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                outputs: Mutex::new(outputs.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl WorkerExecutor for ScriptedExecutor {
        async fn run(
            &self,
            request: WorkerRunRequest,
            _token: &CancellationToken,
        ) -> Result<WorkerRunOutcome, RuntimeError> {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request);
            }
            let output = self
                .outputs
                .lock()
                .ok()
                .and_then(|mut o| if o.is_empty() { None } else { Some(o.remove(0)) })
                .unwrap_or_else(|| "worker output".to_string());
            Ok(WorkerRunOutcome { output, token_usage: 1_000, cost_usd: 0.01 })
        }
    }

    const SINGLE_TASK_PLAN: &str = r#"{"strategy": "direct", "subtasks": [
        {"title": "implement parser", "description": "write the parser", "type": "implement",
         "complexity": 6, "dependencies": [], "relevant_files": ["src/parser.rs"]}
    ]}"#;

    const CHAIN_PLAN: &str = r#"{"strategy": "pipeline", "subtasks": [
        {"title": "design", "description": "sketch the API", "type": "design",
         "complexity": 3, "dependencies": [], "relevant_files": []},
        {"title": "implement", "description": "build it", "type": "implement",
         "complexity": 6, "dependencies": [0], "relevant_files": []},
        {"title": "merge", "description": "combine everything", "type": "merge",
         "complexity": 2, "dependencies": [1], "relevant_files": []}
    ]}"#;

    fn judge(score: f64, feedback: &str) -> String {
        format!(r#"{{"score": {score}, "feedback": "{feedback}"}}"#)
    }

    struct Harness {
        orchestrator: SwarmOrchestrator,
        executor: Arc<ScriptedExecutor>,
    }

    /// Decomposer and judge share one scripted provider: the first
    /// response is the plan, the rest are judge verdicts in completion
    /// order.
    fn make_harness(provider_script: Vec<String>, executor_outputs: Vec<&str>, gate: bool) -> Harness {
        let provider = Arc::new(MockProvider::with_text_responses(provider_script));
        let executor = Arc::new(ScriptedExecutor::new(executor_outputs));
        let pool = Arc::new(WorkerPool::new(
            default_roles(),
            WorkerPromptBuilder::default(),
            executor.clone() as Arc<dyn WorkerExecutor>,
            WorkerPoolConfig::default(),
        ));
        let budget_pool = Arc::new(SwarmBudgetPool::new(10_000_000, 100_000, 500_000, None));
        let quality_gate = gate.then(|| {
            QualityGate::new(provider.clone() as Arc<dyn ModelProvider>, QualityGateConfig::default())
        });
        let config = SwarmOrchestratorConfig {
            dispatch_stagger_ms: 0,
            max_retries: 2,
            ..Default::default()
        };
        let orchestrator = SwarmOrchestrator::new(
            config,
            SmartDecomposer::new(provider as Arc<dyn ModelProvider>, DecomposerConfig::default()),
            pool,
            budget_pool,
            quality_gate,
            Arc::new(Blackboard::new()),
            Arc::new(EventBus::default()),
        );
        Harness { orchestrator, executor }
    }

    #[tokio::test]
    async fn test_single_task_completes_through_gate() {
        let harness = make_harness(
            vec![SINGLE_TASK_PLAN.to_string(), judge(4.5, "solid")],
            vec!["parser implemented"],
            true,
        );
        let source = CancellationSource::new();

        let result = harness
            .orchestrator
            .execute("Implement parser", "", &source.token())
            .await
            .unwrap();

        assert_eq!(result.completed_count(), 1);
        assert_eq!(result.failed_count(), 0);
        assert!(!result.cancelled);
        assert_eq!(result.results[0].quality_score, Some(4.5));
    }

    #[tokio::test]
    async fn test_low_score_retries_with_feedback_then_completes() {
        let harness = make_harness(
            vec![
                SINGLE_TASK_PLAN.to_string(),
                judge(2.0, "no error handling"),
                judge(4.0, "fixed"),
            ],
            vec!["first attempt", "second attempt"],
            true,
        );
        let source = CancellationSource::new();

        let result = harness
            .orchestrator
            .execute("Implement parser and add tests", "", &source.token())
            .await
            .unwrap();

        assert_eq!(result.completed_count(), 1);
        assert_eq!(result.tasks[0].attempts, 2);

        let requests = harness.executor.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        // Second dispatch carries the reduced-tier retry prompt.
        assert!(requests[1].system_prompt.contains("RETRY CONTEXT"));
        assert!(requests[1].system_prompt.contains("scored 2.0/5"));
        assert!(requests[1].system_prompt.contains("no error handling"));
        assert!(requests[1].system_prompt.len() < requests[0].system_prompt.len());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_and_spawn_fixup() {
        let harness = make_harness(
            vec![
                SINGLE_TASK_PLAN.to_string(),
                judge(1.0, "wrong"),
                judge(1.0, "still wrong"),
                judge(1.0, "no"),
                judge(4.0, "fixup looks good"),
            ],
            vec!["a1", "a2", "a3", "fixup output"],
            true,
        );
        let source = CancellationSource::new();

        let result = harness
            .orchestrator
            .execute("Implement parser", "", &source.token())
            .await
            .unwrap();

        // Original failed after 3 attempts; the fixup task completed.
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.completed_count(), 1);
        let fixup = result
            .tasks
            .iter()
            .find(|t| t.description.starts_with("Fix up"))
            .expect("fixup task present");
        assert_eq!(fixup.status, SwarmTaskStatus::Completed);
        assert!(fixup.description.contains("a3"));
    }

    #[tokio::test]
    async fn test_chain_respects_wave_order_and_merge_runs_last() {
        let harness = make_harness(
            vec![
                CHAIN_PLAN.to_string(),
                judge(5.0, "ok"),
                judge(5.0, "ok"),
                judge(5.0, "ok"),
            ],
            vec!["design notes", "implementation", "merged summary"],
            true,
        );
        let source = CancellationSource::new();

        let result = harness
            .orchestrator
            .execute("Build the feature", "", &source.token())
            .await
            .unwrap();

        assert_eq!(result.completed_count(), 3);
        assert_eq!(result.synthesis.as_deref(), Some("merged summary"));

        let requests = harness.executor.requests.lock().unwrap();
        // Chain dispatch order follows the DAG.
        assert!(requests[0].system_prompt.contains("design"));
        assert!(requests[1].system_prompt.contains("build it"));
        // The merge worker receives aggregated dependency outputs.
        assert!(requests[2].task_description.contains("DEPENDENCY OUTPUTS"));
        assert!(requests[2].task_description.contains("implementation"));
    }

    #[tokio::test]
    async fn test_no_capacity_skips_tasks() {
        let provider = Arc::new(MockProvider::with_text_responses(vec![SINGLE_TASK_PLAN.to_string()]));
        let executor = Arc::new(ScriptedExecutor::new(vec!["unused"]));
        let pool = Arc::new(WorkerPool::new(
            default_roles(),
            WorkerPromptBuilder::default(),
            executor.clone() as Arc<dyn WorkerExecutor>,
            WorkerPoolConfig::default(),
        ));
        // Pool too small for any worker reservation.
        let budget_pool = Arc::new(SwarmBudgetPool::new(1_000, 1_000, 500_000, None));
        let orchestrator = SwarmOrchestrator::new(
            SwarmOrchestratorConfig { dispatch_stagger_ms: 0, ..Default::default() },
            SmartDecomposer::new(provider as Arc<dyn ModelProvider>, DecomposerConfig::default()),
            pool,
            budget_pool,
            None,
            Arc::new(Blackboard::new()),
            Arc::new(EventBus::default()),
        );
        let source = CancellationSource::new();

        let result = orchestrator.execute("Implement parser", "", &source.token()).await.unwrap();
        assert_eq!(result.skipped_count(), 1);
        assert!(executor.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_fails_all_tasks() {
        let harness = make_harness(
            vec![SINGLE_TASK_PLAN.to_string()],
            vec!["unused"],
            false,
        );
        let source = CancellationSource::new();
        let token = source.token();
        source.cancel(Some("operator abort".into()));

        let result = harness.orchestrator.execute("Implement parser", "", &token).await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.completed_count(), 0);
    }
}
