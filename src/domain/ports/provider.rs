//! Model-provider port.
//!
//! The core drives any chat-completions style backend through this
//! trait. Structured system blocks with cache-control markers must be
//! passed through verbatim by adapters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::error::ProviderError;
use crate::domain::models::message::{ContentBlock, Message, ToolCall};
use crate::domain::ports::tool::ToolSpec;
use crate::services::cancellation::CancellationToken;

/// Per-call options.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Structured system content; cache-control markers pass through.
    pub system: Option<Vec<ContentBlock>>,
    /// Tool catalog offered to the model; empty suppresses tool use.
    pub tools: Vec<ToolSpec>,
}

impl ChatOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 8192,
            temperature: None,
            system: None,
            tools: Vec::new(),
        }
    }

    pub fn with_system_text(mut self, text: impl Into<String>) -> Self {
        self.system = Some(vec![ContentBlock::text(text)]);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

/// Token accounting for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

/// One completed provider response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub stop_reason: StopReason,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub message_id: Option<String>,
}

/// Incremental streaming chunk; the terminal `Done` carries the message id.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Done { message_id: String },
}

/// The port every model backend implements.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Run one chat turn to completion.
    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        token: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError>;

    /// Whether `chat_stream` yields incremental chunks.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Stream a chat turn as incremental text chunks.
    ///
    /// The default implementation surfaces the non-streaming response as
    /// a single text chunk followed by `Done`.
    async fn chat_stream(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        token: &CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ProviderError> {
        let response = self.chat(messages, options, token).await?;
        let (tx, rx) = mpsc::channel(2);
        let message_id = response.message_id.unwrap_or_default();
        let _ = tx.send(StreamChunk::Text(response.content)).await;
        let _ = tx.send(StreamChunk::Done { message_id }).await;
        Ok(rx)
    }
}
