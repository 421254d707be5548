//! `overlord run`: a single-agent session on one prompt.

use anyhow::{Context, Result};
use console::style;
use std::sync::Arc;

use crate::application::agent_loop::{AgentLoop, AgentLoopConfig, LoopOutcome};
use crate::domain::models::budget::Budget;
use crate::domain::models::config::RuntimeConfig;
use crate::domain::models::message::Message;
use crate::domain::ports::host::NullHostGateway;
use crate::domain::ports::provider::ModelProvider;
use crate::domain::ports::tool::Tool;
use crate::domain::ports::session_store::{SessionEntry, SessionEntryKind, SessionStore, UsageRecord};
use crate::infrastructure::provider::http::AnthropicProvider;
use crate::infrastructure::session::sqlite_store::SqliteSessionStore;
use crate::services::audit_log::{AuditLog, AuditLogConfig};
use crate::services::budget_tracker::BudgetTracker;
use crate::services::cancellation::CancellationSource;
use crate::services::event_bus::{EventBus, EventBusConfig};
use crate::services::intent_classifier::IntentClassifier;
use crate::services::phase_machine::{PhaseMachine, PhaseMachineConfig};
use crate::services::policy_engine::{PolicyEngine, PolicyEngineConfig};

/// Run one agent session. Concrete tools are registered by embedders;
/// the CLI itself runs with whatever `tools` are supplied (possibly
/// none, for pure-chat sessions).
pub async fn handle_run(
    config: &RuntimeConfig,
    tools: Vec<Arc<dyn Tool>>,
    prompt: String,
    max_iterations: Option<u32>,
    model: Option<String>,
) -> Result<()> {
    let event_bus = Arc::new(EventBus::new(EventBusConfig::default()));
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

    let budget = Budget {
        target_iterations: config.budget.target_iterations,
        max_iterations: max_iterations.unwrap_or(config.budget.max_iterations),
        max_tokens: config.budget.max_tokens,
        max_cost: config.budget.max_cost,
        enforcement_mode: config.budget.enforcement_mode,
        soft_threshold: config.budget.soft_threshold,
    };
    let tracker = BudgetTracker::new("main", budget, Arc::clone(&event_bus));
    let phase = PhaseMachine::new(
        "main",
        PhaseMachineConfig {
            exploration_file_threshold: config.exploration.file_threshold,
            exploration_iter_threshold: config.exploration.iter_threshold,
        },
        Arc::clone(&event_bus),
    );

    let model_name = model.unwrap_or_else(|| config.provider.model.clone());
    let loop_config = AgentLoopConfig {
        agent_id: "main".to_string(),
        model: model_name.clone(),
        max_tokens_per_request: config.provider.max_tokens_per_request,
        interactive: false,
        ..Default::default()
    };
    let mut agent_loop = AgentLoop::new(
        loop_config,
        provider,
        tools,
        policy,
        Arc::new(NullHostGateway),
        event_bus,
        tracker,
        phase,
    );

    // Persist this run as a session with its usage accounting. Session
    // persistence is best-effort; a broken store never sinks the run.
    let store = match SqliteSessionStore::open(&config.session.db_path).await {
        Ok(store) => Some(store),
        Err(error) => {
            tracing::warn!(%error, "session store unavailable");
            None
        }
    };
    let session_id = match &store {
        Some(store) => store.create_session(None).await.ok(),
        None => None,
    };

    let source = CancellationSource::new();
    let result = agent_loop.run(vec![Message::user(prompt.clone())], source.token()).await;

    if let (Some(store), Some(session_id)) = (&store, session_id) {
        let _ = store
            .append_entry(
                session_id,
                SessionEntry::new(SessionEntryKind::Message, serde_json::json!({ "prompt": prompt })),
            )
            .await;
        let _ = store
            .record_usage(
                session_id,
                UsageRecord {
                    model: model_name,
                    input_tokens: 0,
                    output_tokens: result.usage.tokens,
                    cost_usd: result.usage.cost_usd,
                },
            )
            .await;
    }

    match result.outcome {
        LoopOutcome::Completed { final_text } => {
            println!("{final_text}");
            println!(
                "\n{} {} iterations, {} tokens, ${:.4}",
                style("done:").green().bold(),
                result.usage.iterations,
                result.usage.tokens,
                result.usage.cost_usd,
            );
            Ok(())
        }
        LoopOutcome::BudgetExhausted { reason } => {
            println!("{} {reason}", style("budget exhausted:").yellow().bold());
            Ok(())
        }
        LoopOutcome::Cancelled { reason } => {
            println!("{} {reason}", style("cancelled:").yellow().bold());
            Ok(())
        }
        LoopOutcome::Failed { error } => Err(anyhow::anyhow!("run failed: {error}")),
    }
}
