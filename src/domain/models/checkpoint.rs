//! Checkpoint data model: immutable snapshots of conversation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::message::Message;

/// The materialized state captured by a checkpoint: messages up to the
/// pinned index plus optional opaque memory/plan/tool blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedState {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_state: Option<Value>,
}

impl SerializedState {
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages, memory: None, plan: None, tool_state: None }
    }
}

/// A named, time-ordered snapshot pinning a `(thread_id, message_index)`.
///
/// Materially immutable: restoring never mutates the stored checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub thread_id: Uuid,
    /// Number of messages captured (the snapshot covers `messages[..index]`).
    pub message_index: usize,
    pub state: SerializedState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::message::Message;

    #[test]
    fn test_checkpoint_serde_round_trip() {
        let cp = Checkpoint {
            id: Uuid::new_v4(),
            label: Some("before-refactor".to_string()),
            thread_id: Uuid::new_v4(),
            message_index: 2,
            state: SerializedState::from_messages(vec![Message::user("hi"), Message::assistant("hello")]),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        };

        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, cp.id);
        assert_eq!(back.label, cp.label);
        assert_eq!(back.message_index, 2);
        assert_eq!(back.state.messages.len(), 2);
        assert_eq!(back.created_at, cp.created_at);
    }
}
