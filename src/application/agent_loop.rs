//! The single-agent execution loop.
//!
//! Drives the model turn by turn: budget check, tool-output compaction,
//! provider call, policy-gated tool execution, phase tracking, and the
//! terminal checks (incomplete-action nudge, missing-artifact
//! reminder). Single-threaded cooperative: each turn runs to completion
//! and the only suspension points are the provider call, tool
//! execution, and host approval prompts.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::application::compaction::{
    apply_recovery, compact_tool_outputs, estimate_messages_tokens, CompactionConfig,
};
use crate::domain::error::ProviderError;
use crate::domain::models::budget::UsageTotals;
use crate::domain::models::message::{Message, Role, ToolCall};
use crate::domain::models::policy::{EvaluationContext, ToolHistoryEntry};
use crate::domain::ports::host::{CompactStrategy, HostEvent, HostGateway};
use crate::domain::ports::provider::{ChatOptions, ModelProvider, TokenUsage};
use crate::domain::ports::tool::{coerce_arguments, normalize_bash_timeout, Tool, ToolSpec};
use crate::services::budget_tracker::BudgetTracker;
use crate::services::cancellation::CancellationToken;
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};
use crate::services::phase_machine::PhaseMachine;
use crate::services::policy_engine::PolicyEngine;

/// USD per million input tokens, used for coarse cost accounting.
const INPUT_COST_PER_MTOK: f64 = 3.0;
/// USD per million output tokens.
const OUTPUT_COST_PER_MTOK: f64 = 15.0;

/// Loop options.
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub agent_id: String,
    pub model: String,
    pub max_tokens_per_request: u32,
    /// Prepended as a system message when the seed has none.
    pub system_prompt: Option<String>,
    /// Restrict the visible tool catalog; `None` means all registered.
    pub allowed_tools: Option<Vec<String>>,
    /// Whether a human can answer approval prompts.
    pub interactive: bool,
    /// Messages of recent conversation handed to the policy engine.
    pub recent_context_window: usize,
    pub compaction: CompactionConfig,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            agent_id: "main".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens_per_request: 8192,
            system_prompt: None,
            allowed_tools: None,
            interactive: true,
            recent_context_window: 10,
            compaction: CompactionConfig::default(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Terminal model message with the artifact check passed.
    Completed { final_text: String },
    /// A budget axis was exhausted (after any one-shot recovery).
    BudgetExhausted { reason: String },
    /// Cooperative cancellation observed.
    Cancelled { reason: String },
    /// A non-recoverable runtime fault (permanent provider error).
    Failed { error: String },
}

/// The loop's result: outcome plus the conversation it owns.
#[derive(Debug)]
pub struct FinalResult {
    pub outcome: LoopOutcome,
    pub messages: Vec<Message>,
    pub usage: UsageTotals,
}

impl FinalResult {
    pub fn final_text(&self) -> &str {
        match &self.outcome {
            LoopOutcome::Completed { final_text } => final_text,
            _ => "",
        }
    }
}

/// The single-agent execution loop. Exclusively owns the mutable
/// message sequence while a turn is in flight.
pub struct AgentLoop {
    config: AgentLoopConfig,
    provider: Arc<dyn ModelProvider>,
    tools: HashMap<String, Arc<dyn Tool>>,
    policy: Arc<PolicyEngine>,
    host: Arc<dyn HostGateway>,
    event_bus: Arc<EventBus>,
    budget: BudgetTracker,
    phase: PhaseMachine,
    history: Vec<ToolHistoryEntry>,
    write_tool_executed: bool,
    artifact_reminder_sent: bool,
    saturation_nudged: bool,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentLoopConfig,
        provider: Arc<dyn ModelProvider>,
        tools: Vec<Arc<dyn Tool>>,
        policy: Arc<PolicyEngine>,
        host: Arc<dyn HostGateway>,
        event_bus: Arc<EventBus>,
        budget: BudgetTracker,
        phase: PhaseMachine,
    ) -> Self {
        let tools = tools.into_iter().map(|t| (t.spec().name, t)).collect();
        Self {
            config,
            provider,
            tools,
            policy,
            host,
            event_bus,
            budget,
            phase,
            history: Vec::new(),
            write_tool_executed: false,
            artifact_reminder_sent: false,
            saturation_nudged: false,
        }
    }

    /// Drive the conversation to a terminal outcome.
    pub async fn run(&mut self, initial_messages: Vec<Message>, token: CancellationToken) -> FinalResult {
        let mut messages = initial_messages;
        if let Some(system) = &self.config.system_prompt {
            if !messages.iter().any(|m| m.role == Role::System) {
                messages.insert(0, Message::system(system.clone()));
            }
        }
        let requested_artifact = detect_requested_artifact(&messages);
        info!(agent = %self.config.agent_id, ?requested_artifact, "loop starting");

        loop {
            if token.is_cancelled() {
                return self.finish(messages, LoopOutcome::Cancelled {
                    reason: token.reason().unwrap_or_else(|| "cancelled".to_string()),
                });
            }

            self.budget.begin_iteration();
            let mut force_text_only = false;

            // 1. Budget verdict, possibly with a one-shot recovery plan.
            let check = self.budget.check_budget(estimate_messages_tokens(&messages));
            if !check.can_continue {
                if let Some(plan) = check.recovery {
                    match self.attempt_recovery(&mut messages, &plan, &token).await {
                        RecoveryResult::Recovered => continue,
                        RecoveryResult::Failed => {
                            return self.finish(messages, LoopOutcome::BudgetExhausted {
                                reason: "budget_limit".to_string(),
                            });
                        }
                    }
                }
                let reason = check.reason.unwrap_or_else(|| "budget_limit".to_string());
                return self.finish(messages, LoopOutcome::BudgetExhausted { reason });
            }
            if check.is_soft_limit {
                if let Some(prompt) = check.injected_prompt {
                    messages.push(Message::system(prompt));
                }
                force_text_only = check.force_text_only;
            }

            if !self.saturation_nudged && self.phase.saturation_recommended() {
                self.saturation_nudged = true;
                messages.push(Message::system(
                    "You have explored enough of the codebase. Move on to making the change.",
                ));
            }

            // 2. Routine tool-output compaction.
            compact_tool_outputs(&mut messages, &self.config.compaction);

            // 3. Provider call, with the catalog filtered by mode.
            let tool_catalog = if force_text_only { Vec::new() } else { self.visible_tool_specs() };
            let options = ChatOptions {
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens_per_request,
                temperature: None,
                system: None,
                tools: tool_catalog,
            };
            let response = match self.provider.chat(&messages, &options, &token).await {
                Ok(response) => response,
                Err(ProviderError::Cancelled) => {
                    return self.finish(messages, LoopOutcome::Cancelled {
                        reason: token.reason().unwrap_or_else(|| "cancelled".to_string()),
                    });
                }
                Err(error) => {
                    warn!(agent = %self.config.agent_id, %error, "provider failure");
                    self.host.notify(HostEvent::Error { message: error.to_string() });
                    return self.finish(messages, LoopOutcome::Failed { error: error.to_string() });
                }
            };
            self.budget.record_model_usage(&response.usage, estimate_cost(&response.usage));

            if !response.content.is_empty() {
                self.host.notify(HostEvent::AgentMessage { content: response.content.clone() });
                self.event_bus.publish(
                    EventSeverity::Info,
                    EventCategory::Agent,
                    EventPayload::AgentMessage {
                        agent: self.config.agent_id.clone(),
                        content: response.content.clone(),
                    },
                );
            }

            // 4. Tool calls, each gated by the policy engine.
            if !response.tool_calls.is_empty() {
                messages.push(Message::assistant_with_tools(
                    response.content.clone(),
                    response.tool_calls.clone(),
                ));
                for raw_call in &response.tool_calls {
                    if token.is_cancelled() {
                        return self.finish(messages, LoopOutcome::Cancelled {
                            reason: token.reason().unwrap_or_else(|| "cancelled".to_string()),
                        });
                    }
                    let call = normalize_call(raw_call);
                    if self.handle_tool_call(&mut messages, &call, &token).await.is_err() {
                        return self.finish(messages, LoopOutcome::Cancelled {
                            reason: token.reason().unwrap_or_else(|| "cancelled".to_string()),
                        });
                    }
                }
                self.phase.end_iteration();
                continue;
            }

            messages.push(Message::assistant(response.content.clone()));
            self.phase.end_iteration();

            // 5. Incomplete action: future intent, no completion signal,
            // no tool calls this iteration.
            let text = response.content.to_lowercase();
            if has_future_intent(&text) && !has_completion_signal(&text) {
                debug!(agent = %self.config.agent_id, "nudging incomplete action");
                messages.push(Message::system(
                    "You described an action without performing it. Execute the action now \
                     with the appropriate tool instead of narrating it.",
                ));
                continue;
            }

            // 6. Missing requested artifact check before declaring done.
            if let Some(artifact) = &requested_artifact {
                if !self.write_tool_executed && !self.artifact_reminder_sent {
                    self.artifact_reminder_sent = true;
                    messages.push(Message::system(format!(
                        "Reminder: the user asked for '{artifact}' to be written, and no \
                         file-writing tool has run. Create the file before finishing.",
                    )));
                    continue;
                }
            }

            self.host.notify(HostEvent::TaskComplete { summary: response.content.clone() });
            return self.finish(messages, LoopOutcome::Completed { final_text: response.content });
        }
    }

    async fn attempt_recovery(
        &mut self,
        messages: &mut Vec<Message>,
        plan: &crate::domain::models::budget::RecoveryPlan,
        token: &CancellationToken,
    ) -> RecoveryResult {
        let request = HostEvent::CompactApprovalRequest {
            current_tokens: estimate_messages_tokens(messages),
            requested_strategy: Some(CompactStrategy::Hybrid),
        };
        let approved = match self.host.request_compact_approval(request, token).await {
            Ok(approval) => approval.approved,
            Err(_) => false,
        };
        if !approved {
            return RecoveryResult::Failed;
        }

        let work_log = self.build_work_log();
        let new_estimate = apply_recovery(messages, plan, Some(work_log), &self.config.compaction);
        if self.budget.report_recovery(new_estimate) {
            info!(agent = %self.config.agent_id, new_estimate, "context recovery succeeded");
            RecoveryResult::Recovered
        } else {
            RecoveryResult::Failed
        }
    }

    /// Evaluate and (maybe) execute one call. `Err` means cancellation
    /// was observed mid-flight and the result was discarded.
    async fn handle_tool_call(
        &mut self,
        messages: &mut Vec<Message>,
        call: &ToolCall,
        token: &CancellationToken,
    ) -> Result<(), ()> {
        let ctx = self.evaluation_context(messages);
        let decision = self.policy.evaluate(&self.config.agent_id, call, &ctx).await;
        self.history.push(ToolHistoryEntry {
            tool: call.name.clone(),
            risk_level: decision.risk_level,
            allowed: decision.allowed,
        });

        if decision.allowed {
            return self.execute_tool(messages, call, token).await;
        }

        if decision.prompt_required {
            let request = HostEvent::ExecApprovalRequest {
                tool_call_id: call.id.clone(),
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
                decision: decision.clone(),
            };
            match self.host.request_exec_approval(request, token).await {
                Ok(approval) if approval.approved => {
                    if approval.persistent {
                        self.policy
                            .add_grant(crate::domain::models::policy::PermissionGrant::for_tool(
                                call.name.clone(),
                                "persistent host approval",
                            ))
                            .await;
                    }
                    return self.execute_tool(messages, call, token).await;
                }
                _ => {
                    messages.push(block_result(call, "the host declined this action", &[]));
                    return Ok(());
                }
            }
        }

        // Blocked: synthetic tool result so the model can adapt.
        messages.push(block_result(call, &decision.reason, &decision.suggestions));
        Ok(())
    }

    async fn execute_tool(
        &mut self,
        messages: &mut Vec<Message>,
        call: &ToolCall,
        token: &CancellationToken,
    ) -> Result<(), ()> {
        let Some(tool) = self.tools.get(&call.name).cloned() else {
            messages.push(block_result(
                call,
                &format!("unknown tool '{}'", call.name),
                &["check the tool catalog for available tools".to_string()],
            ));
            return Ok(());
        };

        let started = Instant::now();
        let outcome = tokio::select! {
            outcome = tool.execute(call.arguments.clone(), token) => outcome,
            () = token.cancelled() => {
                // In-flight result is discarded; conversation stays
                // intact up to the last fully-applied message.
                return Err(());
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                let mut message = Message::tool_result(call.id.clone(), result.output.clone());
                for (key, value) in &result.metadata {
                    message.metadata.insert(key.clone(), value.clone());
                }
                messages.push(message);

                self.phase.record_tool_call(call, Some(result.success));
                self.budget.record_tool_call(call, self.phase.phase());
                if result.success && is_write_capable(&call.name) {
                    self.write_tool_executed = true;
                }

                self.host.notify(HostEvent::ToolResult {
                    tool_call_id: call.id.clone(),
                    tool: call.name.clone(),
                    success: result.success,
                    output: result.output.clone(),
                });
                self.event_bus.publish(
                    EventSeverity::Info,
                    EventCategory::Tool,
                    EventPayload::ToolExecuted {
                        agent: self.config.agent_id.clone(),
                        tool: call.name.clone(),
                        success: result.success,
                        duration_ms,
                    },
                );
            }
            Err(error) => {
                // Per-iteration failures become tool results the model
                // can react to.
                messages.push(Message::tool_result(
                    call.id.clone(),
                    format!("tool error: {error}"),
                ));
                self.phase.record_tool_call(call, Some(false));
                self.budget.record_tool_call(call, self.phase.phase());
                self.event_bus.publish(
                    EventSeverity::Warning,
                    EventCategory::Tool,
                    EventPayload::ToolExecuted {
                        agent: self.config.agent_id.clone(),
                        tool: call.name.clone(),
                        success: false,
                        duration_ms,
                    },
                );
            }
        }
        Ok(())
    }

    fn evaluation_context(&self, messages: &[Message]) -> EvaluationContext {
        let skip = messages.len().saturating_sub(self.config.recent_context_window);
        EvaluationContext {
            recent_messages: messages[skip..].to_vec(),
            interactive: self.config.interactive,
            user_role: None,
            recent_tool_calls: self.history.iter().rev().take(20).rev().cloned().collect(),
        }
    }

    fn visible_tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| t.spec())
            .filter(|spec| {
                self.config
                    .allowed_tools
                    .as_ref()
                    .is_none_or(|allowed| allowed.contains(&spec.name))
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    fn build_work_log(&self) -> String {
        let state = self.phase.state();
        format!(
            "phase: {}; files read: {}; files modified: {}; searches: {}; \
             test state: {:?}",
            state.phase,
            state.unique_files_read.len(),
            state
                .files_modified
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            state.unique_searches.len(),
            state.last_test_passed,
        )
    }

    fn finish(&self, messages: Vec<Message>, outcome: LoopOutcome) -> FinalResult {
        let usage = self.budget.usage();
        let outcome_label = match &outcome {
            LoopOutcome::Completed { .. } => "completed",
            LoopOutcome::BudgetExhausted { .. } => "budget_exhausted",
            LoopOutcome::Cancelled { .. } => "cancelled",
            LoopOutcome::Failed { .. } => "failed",
        };
        self.event_bus.publish(
            EventSeverity::Info,
            EventCategory::Agent,
            EventPayload::LoopCompleted {
                agent: self.config.agent_id.clone(),
                outcome: outcome_label.to_string(),
                iterations: usage.iterations,
            },
        );
        info!(agent = %self.config.agent_id, outcome = outcome_label, iterations = usage.iterations, "loop finished");
        FinalResult { outcome, messages, usage }
    }
}

enum RecoveryResult {
    Recovered,
    Failed,
}

/// Coerce arguments and apply the bash timeout heuristic.
fn normalize_call(call: &ToolCall) -> ToolCall {
    let mut arguments = coerce_arguments(&call.arguments);
    if call.name == "bash" {
        if let Some(timeout) = arguments.get("timeout").and_then(Value::as_i64) {
            if let Some(map) = arguments.as_object_mut() {
                map.insert("timeout".to_string(), Value::from(normalize_bash_timeout(timeout)));
            }
        }
    }
    ToolCall::new(call.id.clone(), call.name.clone(), arguments)
}

fn block_result(call: &ToolCall, reason: &str, suggestions: &[String]) -> Message {
    let mut text = format!("BLOCKED: {reason}");
    if !suggestions.is_empty() {
        text.push_str(&format!("\nSuggestions: {}", suggestions.join("; ")));
    }
    Message::tool_result(call.id.clone(), text)
}

fn is_write_capable(tool: &str) -> bool {
    matches!(tool, "write_file" | "edit_file" | "patch_file") || tool.contains("write")
}

const FUTURE_INTENT_PHRASES: &[&str] = &[
    "i will create",
    "i'll create",
    "i will write",
    "i'll write",
    "i will save",
    "i'll save",
    "let me write",
    "let me create",
    "let me save",
];

const COMPLETION_SIGNALS: &[&str] = &["done", "created", "wrote", "saved", "finished", "completed"];

fn has_future_intent(text: &str) -> bool {
    FUTURE_INTENT_PHRASES.iter().any(|p| text.contains(p))
}

fn has_completion_signal(text: &str) -> bool {
    COMPLETION_SIGNALS.iter().any(|p| text.contains(p))
}

/// `write … X.md` / `save … X.md` / `create … X.md` in the first user
/// turn names a requested artifact.
fn detect_requested_artifact(messages: &[Message]) -> Option<String> {
    let first_user = messages.iter().find(|m| m.role == Role::User)?;
    let text = first_user.content.as_text();
    let re = regex::Regex::new(r"(?i)\b(?:write|save|create)\b[^\n]*?([A-Za-z0-9_./-]+\.md)").ok()?;
    re.captures(&text).map(|caps| caps[1].to_string())
}

/// Coarse cost model for budget accounting.
fn estimate_cost(usage: &TokenUsage) -> f64 {
    usage.input_tokens as f64 * INPUT_COST_PER_MTOK / 1_000_000.0
        + usage.output_tokens as f64 * OUTPUT_COST_PER_MTOK / 1_000_000.0
}
