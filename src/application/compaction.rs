//! Context compaction: tool-output placeholders and token-recovery
//! surgery on the message array.
//!
//! Uses a 4 chars/token heuristic throughout. Oversized tool results
//! are replaced with summary placeholders unless marked preserved; at
//! most K preserved results are kept, oldest compacted first.

use crate::domain::models::budget::RecoveryPlan;
use crate::domain::models::message::{Message, MessageContent, Role};

/// Approximate characters per token (conservative heuristic).
const CHARS_PER_TOKEN: usize = 4;

/// Compaction options.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Tool results beyond this many characters are compacted.
    pub tool_output_threshold_chars: usize,
    /// Maximum preserved expensive results kept intact (FIFO beyond it).
    pub max_preserved: usize,
    /// Characters of the original kept in the placeholder.
    pub placeholder_excerpt_chars: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            tool_output_threshold_chars: 2_000,
            max_preserved: 6,
            placeholder_excerpt_chars: 200,
        }
    }
}

/// Estimate tokens in a string.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Estimate the token footprint of a message sequence.
pub fn estimate_messages_tokens(messages: &[Message]) -> u64 {
    messages
        .iter()
        .map(|m| estimate_tokens(&m.content.as_text()) as u64 + 8)
        .sum()
}

/// Replace oversized tool outputs with placeholders.
///
/// Results marked `preserveFromCompaction` are exempt, but only the
/// newest `max_preserved` exemptions hold; older preserved results are
/// compacted first. Returns how many messages were compacted.
pub fn compact_tool_outputs(messages: &mut [Message], config: &CompactionConfig) -> usize {
    // Enforce the preserved cap FIFO: oldest lose their exemption.
    let preserved_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Tool && m.preserve_from_compaction())
        .map(|(i, _)| i)
        .collect();
    if preserved_indices.len() > config.max_preserved {
        let excess = preserved_indices.len() - config.max_preserved;
        for &index in preserved_indices.iter().take(excess) {
            messages[index].clear_preserved();
        }
    }

    let mut compacted = 0;
    for message in messages.iter_mut() {
        if message.role != Role::Tool || message.preserve_from_compaction() {
            continue;
        }
        let len = message.content.len();
        if len <= config.tool_output_threshold_chars {
            continue;
        }
        message.content = MessageContent::Text(placeholder(&message.content.as_text(), config));
        compacted += 1;
    }
    compacted
}

fn placeholder(original: &str, config: &CompactionConfig) -> String {
    let excerpt: String = original.chars().take(config.placeholder_excerpt_chars).collect();
    format!(
        "[tool output compacted: ~{}K tokens]\n{}…",
        estimate_tokens(original) / 1000,
        excerpt.trim_end()
    )
}

/// Apply a token-recovery plan: aggressive tool-output compaction, then
/// drop oldest non-system messages until the estimate is under target,
/// then inject the work-log summary. Returns the new token estimate.
pub fn apply_recovery(
    messages: &mut Vec<Message>,
    plan: &RecoveryPlan,
    work_log: Option<String>,
    config: &CompactionConfig,
) -> u64 {
    if plan.compact_tool_outputs {
        let aggressive = CompactionConfig {
            tool_output_threshold_chars: config.tool_output_threshold_chars / 4,
            max_preserved: 0,
            ..config.clone()
        };
        compact_tool_outputs(messages, &aggressive);
    }

    if plan.drop_oldest_non_system {
        // Keep the tail of the conversation intact; drop from the front.
        const KEEP_TAIL: usize = 4;
        while estimate_messages_tokens(messages) > plan.target_tokens {
            let Some(index) = messages
                .iter()
                .enumerate()
                .take(messages.len().saturating_sub(KEEP_TAIL))
                .find(|(_, m)| m.role != Role::System)
                .map(|(i, _)| i)
            else {
                break;
            };
            messages.remove(index);
        }
    }

    if plan.inject_work_log {
        if let Some(summary) = work_log {
            let insert_at = messages.iter().position(|m| m.role != Role::System).unwrap_or(0);
            messages.insert(
                insert_at,
                Message::system(format!("WORK LOG (recovered context):\n{summary}")),
            );
        }
    }

    estimate_messages_tokens(messages)
}
