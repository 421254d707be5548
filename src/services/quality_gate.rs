//! Quality gate: an LLM judge scoring worker output against its task.
//!
//! The gate runs on every attempt, not just the first. Scores are in
//! `[0, 5]`; output at or above the acceptance threshold completes the
//! task, anything below feeds retry context.

use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::domain::error::ProviderError;
use crate::domain::models::message::Message;
use crate::domain::models::swarm::SwarmTask;
use crate::domain::ports::provider::{ChatOptions, ModelProvider};
use crate::services::cancellation::CancellationToken;

/// Gate options.
#[derive(Debug, Clone)]
pub struct QualityGateConfig {
    /// Minimum score to accept.
    pub threshold: f64,
    /// Model used for judging.
    pub judge_model: String,
    /// Worker output beyond this many characters is truncated before
    /// judging.
    pub max_output_chars: usize,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            judge_model: "claude-sonnet-4-20250514".to_string(),
            max_output_chars: 24_000,
        }
    }
}

/// The judge's verdict for one attempt.
#[derive(Debug, Clone)]
pub struct QualityVerdict {
    pub score: f64,
    pub feedback: String,
    pub passed: bool,
    pub token_usage: u64,
}

#[derive(Deserialize)]
struct JudgeResponse {
    score: f64,
    feedback: String,
}

/// LLM-backed quality gate.
pub struct QualityGate {
    provider: Arc<dyn ModelProvider>,
    config: QualityGateConfig,
}

impl QualityGate {
    pub fn new(provider: Arc<dyn ModelProvider>, config: QualityGateConfig) -> Self {
        Self { provider, config }
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    /// Judge one worker attempt.
    pub async fn review(
        &self,
        task: &SwarmTask,
        output: &str,
        token: &CancellationToken,
    ) -> Result<QualityVerdict, ProviderError> {
        let bounded_output: String = output.chars().take(self.config.max_output_chars).collect();
        let prompt = format!(
            "You are a strict reviewer. Score the following work against its task.\n\n\
             TASK ({}): {}\n\nWORK:\n{}\n\n\
             Respond with exactly one JSON object: \
             {{\"score\": <0-5>, \"feedback\": \"<one short paragraph>\"}}. \
             Score 5 means the task is fully done; 0 means nothing usable.",
            task.task_type, task.description, bounded_output
        );

        let options = ChatOptions::new(self.config.judge_model.clone())
            .with_system_text("You judge work quality. Output only the JSON object.");
        let messages = vec![Message::user(prompt)];
        let response = self.provider.chat(&messages, &options, token).await?;

        let (score, feedback) = parse_judge_response(&response.content).ok_or_else(|| {
            ProviderError::InvalidResponse(format!(
                "judge returned unparseable verdict: {}",
                response.content.chars().take(200).collect::<String>()
            ))
        })?;

        let score = score.clamp(0.0, 5.0);
        let passed = score >= self.config.threshold;
        debug!(task_id = %task.id, score, passed, "quality verdict");
        Ok(QualityVerdict { score, feedback, passed, token_usage: response.usage.total() })
    }
}

/// Pull `{score, feedback}` out of the judge's text, tolerating code
/// fences and prose around the JSON object.
fn parse_judge_response(text: &str) -> Option<(f64, String)> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let parsed: JudgeResponse = serde_json::from_str(&text[start..=end]).ok()?;
    Some((parsed.score, parsed.feedback))
}
