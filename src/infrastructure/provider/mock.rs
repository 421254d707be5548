//! Scripted model provider for tests.
//!
//! Responses are handed out in order; an exhausted script is an
//! `InvalidResponse` error so a test that over-calls fails loudly. The
//! mock deliberately ignores cancellation so orchestration layers can
//! be tested for their own cancellation handling.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::domain::error::ProviderError;
use crate::domain::models::message::{Message, ToolCall};
use crate::domain::ports::provider::{ChatOptions, ChatResponse, ModelProvider, StopReason, TokenUsage};
use crate::services::cancellation::CancellationToken;

/// A recorded chat request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub message_count: usize,
    pub last_message: String,
    pub tool_names: Vec<String>,
    pub model: String,
}

/// The scripted provider.
pub struct MockProvider {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Script of plain text turns.
    pub fn with_text_responses(texts: Vec<String>) -> Self {
        Self::new(texts.into_iter().map(|t| Self::text_response(&t)).collect())
    }

    pub fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: text.to_string(),
            stop_reason: StopReason::EndTurn,
            tool_calls: Vec::new(),
            usage: TokenUsage { input_tokens: 100, output_tokens: 50, ..Default::default() },
            message_id: None,
        }
    }

    pub fn tool_call_response(content: &str, tool_calls: Vec<ToolCall>) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            stop_reason: StopReason::ToolUse,
            tool_calls,
            usage: TokenUsage { input_tokens: 120, output_tokens: 40, ..Default::default() },
            message_id: None,
        }
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        _token: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                message_count: messages.len(),
                last_message: messages.last().map(|m| m.content.as_text()).unwrap_or_default(),
                tool_names: options.tools.iter().map(|t| t.name.clone()).collect(),
                model: options.model.clone(),
            });
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front())
            .ok_or_else(|| ProviderError::InvalidResponse("mock script exhausted".to_string()))
    }
}
