//! `overlord swarm`: decompose a task and run the worker swarm.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::application::swarm_orchestrator::{
    LoopWorkerExecutor, SwarmOrchestrator, SwarmOrchestratorConfig,
};
use crate::cli::output::render_swarm_result;
use crate::domain::models::config::RuntimeConfig;
use crate::domain::ports::host::NullHostGateway;
use crate::domain::ports::provider::ModelProvider;
use crate::domain::ports::tool::Tool;
use crate::infrastructure::provider::http::AnthropicProvider;
use crate::infrastructure::telemetry::TelemetryWriter;
use crate::services::audit_log::{AuditLog, AuditLogConfig};
use crate::services::blackboard::Blackboard;
use crate::services::budget_pool::SwarmBudgetPool;
use crate::services::cancellation::CancellationSource;
use crate::services::decomposer::{DecomposerConfig, SmartDecomposer};
use crate::services::doom_loop::GlobalLoopDetector;
use crate::services::event_bus::{EventBus, EventBusConfig, EventPayload, RuntimeEvent};
use crate::services::intent_classifier::IntentClassifier;
use crate::services::phase_machine::PhaseMachineConfig;
use crate::services::policy_engine::{PolicyEngine, PolicyEngineConfig};
use crate::services::quality_gate::{QualityGate, QualityGateConfig};
use crate::services::worker_pool::{default_roles, WorkerPool, WorkerPoolConfig};
use crate::services::worker_prompts::WorkerPromptBuilder;

/// Run a swarm over the given root task.
pub async fn handle_swarm(
    config: &RuntimeConfig,
    tools: Vec<Arc<dyn Tool>>,
    task: String,
    context: String,
) -> Result<()> {
    let event_bus = Arc::new(EventBus::new(EventBusConfig::default()));

    // Live telemetry mirrors the bus into the live directory.
    let telemetry_handle = if config.telemetry.enabled {
        let writer = TelemetryWriter::create(config.telemetry.live_dir.clone())
            .await
            .context("telemetry setup failed")?;
        Some(writer.spawn(&event_bus))
    } else {
        None
    };

    let audit = Arc::new(AuditLog::new(AuditLogConfig {
        max_entries: config.policy.audit_max_entries,
        enabled: config.policy.audit_log,
    }));
    let policy = Arc::new(PolicyEngine::with_default_rules(
        PolicyEngineConfig {
            default_policy: config.policy.default_policy,
            intent_aware: config.policy.intent_aware,
            intent_threshold: config.policy.intent_threshold,
            ..Default::default()
        },
        IntentClassifier::default(),
        audit,
        Arc::clone(&event_bus),
    ));

    let provider: Arc<dyn ModelProvider> =
        Arc::new(AnthropicProvider::new(&config.provider).context("provider setup failed")?);
    let global_detector = Arc::new(GlobalLoopDetector::new(config.swarm.global_doom_loop_threshold));

    let executor = Arc::new(LoopWorkerExecutor::new(
        Arc::clone(&provider),
        tools,
        policy,
        Arc::new(NullHostGateway),
        Arc::clone(&event_bus),
        global_detector,
        PhaseMachineConfig {
            exploration_file_threshold: config.exploration.file_threshold,
            exploration_iter_threshold: config.exploration.iter_threshold,
        },
        config.budget.max_iterations,
    ));
    let worker_pool = Arc::new(WorkerPool::new(
        default_roles(),
        WorkerPromptBuilder::default(),
        executor,
        WorkerPoolConfig {
            tool_access_mode: config.swarm.tool_access_mode,
            tool_whitelist: config.swarm.tool_whitelist.clone(),
            default_model: config.provider.model.clone(),
        },
    ));

    let budget_pool = Arc::new(SwarmBudgetPool::new(
        config.swarm.total_token_budget,
        config.swarm.orchestrator_reserve_tokens,
        config.swarm.max_tokens_per_worker,
        config.swarm.max_cost,
    ));
    let quality_gate = config.swarm.quality_gate_enabled.then(|| {
        QualityGate::new(
            Arc::clone(&provider),
            QualityGateConfig {
                threshold: config.swarm.quality_threshold,
                judge_model: config.provider.model.clone(),
                ..Default::default()
            },
        )
    });

    let orchestrator = SwarmOrchestrator::new(
        SwarmOrchestratorConfig::from_swarm_config(&config.swarm),
        SmartDecomposer::new(
            Arc::clone(&provider),
            DecomposerConfig { model: config.provider.model.clone(), ..Default::default() },
        ),
        worker_pool,
        budget_pool,
        quality_gate,
        Arc::new(Blackboard::new()),
        Arc::clone(&event_bus),
    );

    // Progress bar fed by the event stream.
    let progress = ProgressBar::new_spinner().with_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    let progress_handle = spawn_progress(event_bus.subscribe(), progress.clone());

    let source = CancellationSource::new();
    let result = orchestrator
        .execute(&task, &context, &source.token())
        .await
        .context("swarm execution failed")?;

    progress.finish_and_clear();
    progress_handle.abort();
    println!("{}", render_swarm_result(&result));
    if let Some(synthesis) = &result.synthesis {
        println!("\n{synthesis}");
    }

    drop(orchestrator);
    drop(event_bus);
    if let Some(handle) = telemetry_handle {
        let _ = handle.await;
    }
    Ok(())
}

fn spawn_progress(
    mut rx: broadcast::Receiver<RuntimeEvent>,
    progress: ProgressBar,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event.payload {
                EventPayload::SwarmTasksLoaded { tasks } => {
                    progress.set_message(format!("{} tasks queued", tasks.len()));
                }
                EventPayload::SwarmTaskDispatched { wave, attempt, .. } => {
                    progress.set_message(format!("wave {wave}, dispatching (attempt {attempt})"));
                    progress.tick();
                }
                EventPayload::SwarmTaskCompleted { task_id, quality_score, .. } => {
                    let score = quality_score.map_or_else(String::new, |s| format!(" ({s:.1}/5)"));
                    progress.set_message(format!("task {task_id} completed{score}"));
                    progress.tick();
                }
                EventPayload::SwarmCompleted { .. } => break,
                _ => {}
            }
        }
    })
}
