//! Conversation data model: messages, tool calls, and threads.
//!
//! Messages are an ordered sequence; insertion order matters. Every
//! tool-result message references a `tool_call_id` that appears in an
//! earlier assistant message's `tool_calls`. Threads form a forest via
//! `parent_id`; forking preserves lineage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata key marking a tool result as exempt from output compaction.
pub const PRESERVE_FROM_COMPACTION: &str = "preserveFromCompaction";

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// A single structured content block.
///
/// `cache_control` markers are passed through to the provider verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self { kind: "text".to_string(), text: text.into(), cache_control: None }
    }

    pub fn with_cache_control(mut self, marker: Value) -> Self {
        self.cache_control = Some(marker);
        self
    }
}

/// Message content: a plain string or structured content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text across all blocks (or the plain string).
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Blocks(blocks) => blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join("\n"),
        }
    }

    /// Character length of the textual content.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Blocks(blocks) => blocks.iter().map(|b| b.text.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Opaque to the loop; typed per tool.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self { id: id.into(), name: name.into(), arguments }
    }

    /// `tool_name:canonical_json(args)`; identical calls collide regardless
    /// of argument-map key order.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.name, canonical_json(&self.arguments))
    }
}

/// Serialize a JSON value with object keys sorted recursively.
///
/// Used for tool-call fingerprints so semantically identical argument
/// maps produce identical strings.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), canonicalize(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn base(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::base(Role::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::base(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::base(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<MessageContent>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::base(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// A tool-result message referencing the originating call.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<MessageContent>) -> Self {
        let mut msg = Self::base(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True if compaction must leave this message's content intact.
    pub fn preserve_from_compaction(&self) -> bool {
        self.metadata
            .get(PRESERVE_FROM_COMPACTION)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn mark_preserved(&mut self) {
        self.metadata.insert(PRESERVE_FROM_COMPACTION.to_string(), Value::Bool(true));
    }

    pub fn clear_preserved(&mut self) {
        self.metadata.remove(PRESERVE_FROM_COMPACTION);
    }
}

/// A message sequence with identity and lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Thread {
    pub fn new() -> Self {
        let now = Utc::now();
        Self { id: Uuid::new_v4(), parent_id: None, created_at: now, updated_at: now, messages: Vec::new() }
    }

    /// A child thread seeded with the given messages; lineage recorded.
    pub fn child_of(parent_id: Uuid, messages: Vec<Message>) -> Self {
        let now = Utc::now();
        Self { id: Uuid::new_v4(), parent_id: Some(parent_id), created_at: now, updated_at: now, messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Verify that every tool-result message references a tool call that
    /// appears in an earlier assistant message.
    pub fn tool_linkage_is_valid(&self) -> bool {
        let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for msg in &self.messages {
            if msg.role == Role::Tool {
                match msg.tool_call_id.as_deref() {
                    Some(id) if seen.contains(id) => {}
                    _ => return false,
                }
            }
            for call in &msg.tool_calls {
                seen.insert(call.id.as_str());
            }
        }
        true
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}
