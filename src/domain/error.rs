//! Domain error types for the agent runtime.
//!
//! Error enums use thiserror for structured handling. Each enum carries
//! `is_transient` / `is_permanent` predicates so callers can decide on
//! retry without string matching. Cancellation is a distinguished kind
//! that callers recognize without catching all errors.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the model provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Request failed due to network or HTTP transport error.
    #[error("Provider request failed: {0}")]
    RequestFailed(String),

    /// Rate limit has been exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Authentication failed (invalid or missing API key).
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Response was malformed or could not be parsed.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Request timed out after the given number of seconds.
    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    /// Provider returned an error status code.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The request was cancelled before completion.
    #[error("Provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::RateLimitExceeded | Self::Timeout(_) | Self::RequestFailed(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if this error is permanent and retrying is pointless.
    pub const fn is_permanent(&self) -> bool {
        match self {
            Self::AuthenticationFailed(_) | Self::InvalidResponse(_) => true,
            Self::Api { status, .. } => *status >= 400 && *status < 500 && *status != 429,
            _ => false,
        }
    }
}

/// Errors raised by tool execution.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The named tool is not registered.
    #[error("Unknown tool: {0}")]
    Unknown(String),

    /// Arguments failed schema validation.
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The tool ran but reported a failure.
    #[error("Tool {tool} failed: {reason}")]
    ExecutionFailed { tool: String, reason: String },

    /// The tool exceeded its time budget.
    #[error("Tool {0} timed out")]
    Timeout(String),

    /// The tool was cancelled mid-flight.
    #[error("Tool {0} cancelled")]
    Cancelled(String),
}

/// Errors raised by the runtime core.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Cooperative cancellation was observed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A budget axis is exhausted and cannot be recovered.
    #[error("Budget exhausted ({budget_type}): {reason}")]
    BudgetExhausted { budget_type: String, reason: String },

    /// The policy engine blocked a tool call.
    #[error("Policy blocked {tool}: {reason}")]
    PolicyBlocked { tool: String, reason: String },

    /// A tracked resource limit was hit while admitting new work.
    #[error("Resource limit: {0}")]
    ResourceLimit(String),

    /// The quality gate rejected a worker's output on its final attempt.
    #[error("Quality rejection for task {task_id}: scored {score:.1}/5")]
    QualityRejection { task_id: Uuid, score: f64 },

    /// An invalid phase transition was requested.
    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    /// The decomposed task graph contains a cycle.
    #[error("Task graph contains a cycle involving {0}")]
    CyclicDependency(Uuid),

    /// Checkpoint with the given ID was not found.
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    /// Wrapped provider error.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Wrapped tool error.
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl RuntimeError {
    /// Returns true if the loop can absorb this error into the conversation
    /// (as a synthetic tool result) rather than unwinding.
    pub const fn is_recoverable_in_loop(&self) -> bool {
        matches!(self, Self::PolicyBlocked { .. } | Self::Tool(_))
    }

    /// Returns true if this error represents cooperative cancellation.
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(_) | Self::Provider(ProviderError::Cancelled) | Self::Tool(ToolError::Cancelled(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_transience() {
        assert!(ProviderError::RateLimitExceeded.is_transient());
        assert!(ProviderError::Timeout(30).is_transient());
        assert!(ProviderError::Api { status: 503, message: "overloaded".into() }.is_transient());
        assert!(ProviderError::Api { status: 429, message: "slow down".into() }.is_transient());
        assert!(!ProviderError::AuthenticationFailed("bad key".into()).is_transient());
    }

    #[test]
    fn test_provider_error_permanence() {
        assert!(ProviderError::AuthenticationFailed("bad key".into()).is_permanent());
        assert!(ProviderError::Api { status: 400, message: "bad request".into() }.is_permanent());
        assert!(!ProviderError::Api { status: 429, message: "rate".into() }.is_permanent());
        assert!(!ProviderError::RequestFailed("conn reset".into()).is_permanent());
    }

    #[test]
    fn test_runtime_error_recoverable() {
        let blocked = RuntimeError::PolicyBlocked { tool: "bash".into(), reason: "forbidden".into() };
        assert!(blocked.is_recoverable_in_loop());

        let exhausted = RuntimeError::BudgetExhausted {
            budget_type: "iterations".into(),
            reason: "max_iterations".into(),
        };
        assert!(!exhausted.is_recoverable_in_loop());
    }

    #[test]
    fn test_cancellation_is_distinguished() {
        assert!(RuntimeError::Cancelled("user interrupt".into()).is_cancelled());
        assert!(RuntimeError::Provider(ProviderError::Cancelled).is_cancelled());
        assert!(RuntimeError::Tool(ToolError::Cancelled("bash".into())).is_cancelled());
        assert!(!RuntimeError::ResourceLimit("memory".into()).is_cancelled());
    }

    #[test]
    fn test_display_messages() {
        let err = RuntimeError::PolicyBlocked { tool: "delete_file".into(), reason: "forbidden by rule".into() };
        assert_eq!(err.to_string(), "Policy blocked delete_file: forbidden by rule");

        let err = RuntimeError::InvalidPhaseTransition { from: "verifying".into(), to: "planning".into() };
        assert_eq!(err.to_string(), "Invalid phase transition from verifying to planning");
    }
}
