//! HTTP adapter for an Anthropic-shaped messages API.
//!
//! Maps the domain conversation onto the wire format (system blocks
//! with cache-control markers pass through verbatim, tool results
//! reference their originating call id), rate-limits requests, and
//! retries transient failures with backoff.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

use crate::domain::error::ProviderError;
use crate::domain::models::config::ProviderConfig;
use crate::domain::models::message::{ContentBlock, Message, MessageContent, Role, ToolCall};
use crate::domain::ports::provider::{ChatOptions, ChatResponse, ModelProvider, StopReason, TokenUsage};
use crate::services::cancellation::CancellationToken;

use super::retry::RetryPolicy;

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<ContentBlock>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Deserialize)]
struct WireResponse {
    id: String,
    content: Vec<WireBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorBody,
}

#[derive(Deserialize)]
struct WireErrorBody {
    message: String,
}

// ============================================================================
// Adapter
// ============================================================================

/// The production provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: DefaultDirectRateLimiter,
    retry: RetryPolicy,
}

impl AnthropicProvider {
    /// Build from config; the API key is read from the configured
    /// environment variable.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ProviderError::AuthenticationFailed(format!("{} is not set", config.api_key_env))
        })?;
        Ok(Self::with_api_key(config, api_key))
    }

    /// Build with an explicit key (used by tests).
    pub fn with_api_key(config: &ProviderConfig, api_key: String) -> Self {
        let per_minute =
            NonZeroU32::new(config.requests_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            retry: RetryPolicy { max_retries: config.max_retries, ..Default::default() },
        }
    }

    async fn send_once(
        &self,
        body: &WireRequest,
        token: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        self.limiter.until_ready().await;
        token.ensure_not_cancelled().map_err(|_| ProviderError::Cancelled)?;

        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);

        let response = tokio::select! {
            response = request.send() => response,
            () = token.cancelled() => return Err(ProviderError::Cancelled),
        }
        .map_err(|error| {
            if error.is_timeout() {
                ProviderError::Timeout(0)
            } else {
                ProviderError::RequestFailed(error.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|error| ProviderError::RequestFailed(error.to_string()))?;

        if status == 401 || status == 403 {
            let message = parse_error_message(&text);
            return Err(ProviderError::AuthenticationFailed(message));
        }
        if status == 429 {
            return Err(ProviderError::RateLimitExceeded);
        }
        if status >= 400 {
            return Err(ProviderError::Api { status, message: parse_error_message(&text) });
        }

        let wire: WireResponse = serde_json::from_str(&text)
            .map_err(|error| ProviderError::InvalidResponse(error.to_string()))?;
        Ok(from_wire(wire))
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        token: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let body = to_wire(messages, options);
        debug!(model = %options.model, messages = body.messages.len(), "provider request");
        self.retry.execute(token, || self.send_once(&body, token)).await
    }
}

fn parse_error_message(text: &str) -> String {
    serde_json::from_str::<WireError>(text)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| text.chars().take(200).collect())
}

/// Map the domain conversation to the wire shape. System-role messages
/// join the request-level system blocks, markers intact.
fn to_wire(messages: &[Message], options: &ChatOptions) -> WireRequest {
    let mut system: Vec<ContentBlock> = options.system.clone().unwrap_or_default();
    let mut wire_messages = Vec::new();

    for message in messages {
        match message.role {
            Role::System => match &message.content {
                MessageContent::Text(text) => system.push(ContentBlock::text(text.clone())),
                MessageContent::Blocks(blocks) => system.extend(blocks.iter().cloned()),
            },
            Role::User => wire_messages.push(WireMessage {
                role: "user",
                content: vec![WireBlock::Text { text: message.content.as_text() }],
            }),
            Role::Assistant => {
                let mut content = Vec::new();
                let text = message.content.as_text();
                if !text.is_empty() {
                    content.push(WireBlock::Text { text });
                }
                for call in &message.tool_calls {
                    content.push(WireBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                    });
                }
                if !content.is_empty() {
                    wire_messages.push(WireMessage { role: "assistant", content });
                }
            }
            Role::Tool => wire_messages.push(WireMessage {
                role: "user",
                content: vec![WireBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: message.content.as_text(),
                }],
            }),
        }
    }

    WireRequest {
        model: options.model.clone(),
        max_tokens: options.max_tokens,
        temperature: options.temperature,
        system,
        messages: wire_messages,
        tools: options
            .tools
            .iter()
            .map(|spec| WireTool {
                name: spec.name.clone(),
                description: spec.description.clone(),
                input_schema: spec.parameters.clone(),
            })
            .collect(),
    }
}

fn from_wire(wire: WireResponse) -> ChatResponse {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in wire.content {
        match block {
            WireBlock::Text { text } => {
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str(&text);
            }
            WireBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::new(id, name, input));
            }
            WireBlock::ToolResult { .. } => {}
        }
    }

    let stop_reason = match wire.stop_reason.as_deref() {
        Some("end_turn") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) => StopReason::Other(other.to_string()),
    };

    ChatResponse {
        content,
        stop_reason,
        tool_calls,
        usage: TokenUsage {
            input_tokens: wire.usage.input_tokens,
            output_tokens: wire.usage.output_tokens,
            cache_write_tokens: wire.usage.cache_creation_input_tokens,
            cache_read_tokens: wire.usage.cache_read_input_tokens,
        },
        message_id: Some(wire.id),
    }
}
