//! Session persistence port.
//!
//! An opaque store: typed append-log entries per session, checkpoint
//! blobs, remembered permissions, and usage logs. Sessions form a tree
//! via `parent_session_id`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Type tag of an append-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEntryKind {
    Message,
    ToolCall,
    ToolResult,
    Compaction,
}

impl SessionEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Compaction => "compaction",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "tool_call" => Some(Self::ToolCall),
            "tool_result" => Some(Self::ToolResult),
            "compaction" => Some(Self::Compaction),
            _ => None,
        }
    }
}

/// One ordered entry in a session's append log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: Uuid,
    pub kind: SessionEntryKind,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(kind: SessionEntryKind, content: Value) -> Self {
        Self { id: Uuid::new_v4(), kind, content, created_at: Utc::now() }
    }
}

/// A persisted prompt answer (`always` allow / `never` allow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RememberedDecision {
    Always,
    Never,
}

/// A remembered permission for a tool + argument pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RememberedPermission {
    pub tool: String,
    pub pattern: String,
    pub decision: RememberedDecision,
}

/// Per-model usage accounting row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// The persistence port the runtime consumes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session, optionally as a child of an existing one.
    async fn create_session(&self, parent_session_id: Option<Uuid>) -> Result<Uuid>;

    async fn append_entry(&self, session_id: Uuid, entry: SessionEntry) -> Result<()>;

    /// Load a session's entries in append order.
    async fn load_entries(&self, session_id: Uuid) -> Result<Vec<SessionEntry>>;

    /// Save a named state blob (`None` names the default slot).
    async fn save_state_blob(&self, session_id: Uuid, name: Option<&str>, blob: Value) -> Result<()>;

    /// Load the latest blob for the named slot.
    async fn load_state_blob(&self, session_id: Uuid, name: Option<&str>) -> Result<Option<Value>>;

    async fn remember_permission(&self, session_id: Uuid, permission: RememberedPermission) -> Result<()>;

    async fn remembered_permissions(&self, session_id: Uuid) -> Result<Vec<RememberedPermission>>;

    async fn record_usage(&self, session_id: Uuid, usage: UsageRecord) -> Result<()>;

    /// Usage aggregated per model for the session.
    async fn usage_summary(&self, session_id: Uuid) -> Result<Vec<UsageRecord>>;
}
