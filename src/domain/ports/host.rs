//! Host callback port.
//!
//! The loop surfaces an event stream to its host and blocks on approval
//! requests. Non-interactive runs plug in [`NullHostGateway`], which
//! denies exec approvals and accepts compaction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::models::policy::PolicyDecision;
use crate::services::cancellation::CancellationToken;

/// Events the host receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostEvent {
    AgentMessage {
        content: String,
    },
    ToolResult {
        tool_call_id: String,
        tool: String,
        success: bool,
        output: String,
    },
    ExecApprovalRequest {
        tool_call_id: String,
        tool: String,
        arguments: Value,
        decision: PolicyDecision,
    },
    CompactApprovalRequest {
        current_tokens: u64,
        /// Strategy the model asked for, if it requested one.
        requested_strategy: Option<CompactStrategy>,
    },
    TaskComplete {
        summary: String,
    },
    Error {
        message: String,
    },
}

/// Compaction strategy chosen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactStrategy {
    Summarize,
    Truncate,
    Hybrid,
}

/// Host's answer to an exec approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecApproval {
    pub tool_call_id: String,
    pub approved: bool,
    /// Mint a persistent grant covering future matching calls.
    pub persistent: bool,
}

/// Host's answer to a compact approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactApproval {
    pub approved: bool,
    pub strategy: CompactStrategy,
}

/// The callback surface the loop exposes to its host.
#[async_trait]
pub trait HostGateway: Send + Sync {
    /// Fire-and-forget notification.
    fn notify(&self, event: HostEvent);

    /// Block until the host answers an exec approval request.
    async fn request_exec_approval(
        &self,
        request: HostEvent,
        token: &CancellationToken,
    ) -> anyhow::Result<ExecApproval>;

    /// Block until the host answers a compact approval request.
    async fn request_compact_approval(
        &self,
        request: HostEvent,
        token: &CancellationToken,
    ) -> anyhow::Result<CompactApproval>;
}

/// Gateway for batch runs: no human is present, so exec approvals are
/// denied and compaction is accepted with the requested (or hybrid)
/// strategy.
#[derive(Debug, Default)]
pub struct NullHostGateway;

#[async_trait]
impl HostGateway for NullHostGateway {
    fn notify(&self, _event: HostEvent) {}

    async fn request_exec_approval(
        &self,
        request: HostEvent,
        _token: &CancellationToken,
    ) -> anyhow::Result<ExecApproval> {
        let tool_call_id = match request {
            HostEvent::ExecApprovalRequest { tool_call_id, .. } => tool_call_id,
            _ => String::new(),
        };
        Ok(ExecApproval { tool_call_id, approved: false, persistent: false })
    }

    async fn request_compact_approval(
        &self,
        request: HostEvent,
        _token: &CancellationToken,
    ) -> anyhow::Result<CompactApproval> {
        let strategy = match request {
            HostEvent::CompactApprovalRequest { requested_strategy, .. } => {
                requested_strategy.unwrap_or(CompactStrategy::Hybrid)
            }
            _ => CompactStrategy::Hybrid,
        };
        Ok(CompactApproval { approved: true, strategy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cancellation::CancellationSource;

    #[tokio::test]
    async fn test_null_gateway_denies_exec() {
        let gateway = NullHostGateway;
        let source = CancellationSource::new();
        let approval = gateway
            .request_exec_approval(
                HostEvent::ExecApprovalRequest {
                    tool_call_id: "call_1".into(),
                    tool: "bash".into(),
                    arguments: serde_json::json!({}),
                    decision: crate::domain::models::PolicyDecision {
                        allowed: false,
                        policy: crate::domain::models::PolicyAction::Prompt,
                        reason: "prompt required".into(),
                        risk_level: crate::domain::models::RiskLevel::Medium,
                        prompt_required: true,
                        intent: None,
                        used_grant: None,
                        matched_condition: None,
                        suggestions: vec![],
                    },
                },
                &source.token(),
            )
            .await
            .unwrap();
        assert!(!approval.approved);
        assert_eq!(approval.tool_call_id, "call_1");
    }

    #[tokio::test]
    async fn test_null_gateway_accepts_compaction_with_requested_strategy() {
        let gateway = NullHostGateway;
        let source = CancellationSource::new();
        let approval = gateway
            .request_compact_approval(
                HostEvent::CompactApprovalRequest {
                    current_tokens: 120_000,
                    requested_strategy: Some(CompactStrategy::Truncate),
                },
                &source.token(),
            )
            .await
            .unwrap();
        assert!(approval.approved);
        assert_eq!(approval.strategy, CompactStrategy::Truncate);
    }
}
