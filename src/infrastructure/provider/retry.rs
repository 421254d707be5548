//! Exponential-backoff retry for provider calls, honouring
//! cancellation between attempts.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::domain::error::{ProviderError, RuntimeError};
use crate::services::cancellation::{sleep, CancellationToken};

/// Retry options.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, initial_interval_ms: 1_000, max_interval_ms: 60_000 }
    }
}

impl RetryPolicy {
    /// Run `operation`, retrying transient provider errors with
    /// exponential backoff. Cancellation during a backoff wait surfaces
    /// as `ProviderError::Cancelled`.
    pub async fn execute<F, Fut, T>(
        &self,
        token: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0;
        loop {
            if token.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let retryable = error.is_transient() && attempt < self.max_retries;
                    if !retryable {
                        return Err(error);
                    }
                    let wait = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.max_interval_ms));
                    warn!(attempt = attempt + 1, max = self.max_retries, ?wait, %error, "retrying provider call");
                    match sleep(wait, token).await {
                        Ok(()) => {}
                        Err(RuntimeError::Cancelled(_)) => return Err(ProviderError::Cancelled),
                        Err(_) => return Err(ProviderError::Cancelled),
                    }
                    attempt += 1;
                }
            }
        }
    }
}
