//! Retry with exponential backoff for API calls.

use std::future::Future;
use std::time::Duration;

use eventsub_shared::ApiError;

/// Which retry rules apply to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Reads: retry everything except 4xx, with 408 and 429 still retried.
    Query,
    /// Writes: retry only 5xx.
    Mutation,
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub class: RetryClass,
    /// Retries after the first attempt (0 = never retry)
    pub max_retries: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn query() -> Self {
        Self {
            class: RetryClass::Query,
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }

    pub fn mutation() -> Self {
        Self {
            class: RetryClass::Mutation,
            max_retries: 2,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Single attempt, no retries.
    pub fn none(class: RetryClass) -> Self {
        Self {
            max_retries: 0,
            ..match class {
                RetryClass::Query => Self::query(),
                RetryClass::Mutation => Self::mutation(),
            }
        }
    }

    /// Calculate delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }

    /// Whether the error class is worth another attempt at all.
    pub fn is_retryable(&self, err: &ApiError) -> bool {
        match self.class {
            RetryClass::Query => match err.status() {
                Some(408) | Some(429) => true,
                Some(400..=499) => false,
                _ => true,
            },
            RetryClass::Mutation => err.is_server_error(),
        }
    }

    /// `retries` is the number of retries already performed.
    pub fn should_retry(&self, retries: u32, err: &ApiError) -> bool {
        retries < self.max_retries && self.is_retryable(err)
    }

    /// Run `op` until it succeeds, the error is not retryable, or retries run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(retries, &err) => {
                    let delay = self.delay_for_attempt(retries);
                    tracing::debug!(
                        error = %err,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
