use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Bounded-attempt retry settings for one class of remote operation.
///
/// `max_attempts` counts every invocation, so a policy of N performs at most
/// N - 1 retries. Delays grow by `multiplier` from `initial_delay_ms` up to
/// `max_delay_ms`, with jitter applied on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Budget for paginated query calls.
    pub fn for_queries() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }

    /// Budget for period-token lookups.
    pub fn for_periods() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }

    /// Budget for the forwarding gateway's outbound calls.
    pub fn for_forwarding() -> Self {
        Self {
            max_attempts: 6,
            initial_delay_ms: 1_000,
            max_delay_ms: 2_000,
            multiplier: 2.0,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry max_attempts must be at least 1".into()));
        }
        if self.multiplier <= 1.0 {
            return Err(Error::Config(format!(
                "retry multiplier must be greater than 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::Config(
                "retry max_delay_ms must be at least initial_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Uncapped nominal delay before the retry following attempt number
    /// `attempt` (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let nominal = (self.initial_delay_ms as f64 * factor) as u64;
        Duration::from_millis(nominal.min(self.max_delay_ms))
    }
}

pub fn create_backoff(policy: &RetryPolicy) -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: policy.initial_delay(),
        initial_interval: policy.initial_delay(),
        randomization_factor: 0.5, // Add jitter
        multiplier: policy.multiplier,
        max_interval: policy.max_delay(),
        // Attempts are the only budget; never give up on elapsed time.
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempt budget is spent.
///
/// Attempt state lives entirely inside this call: concurrent retries of
/// unrelated operations never share a budget. Attempts are strictly
/// sequential. Exhaustion yields [`Error::RetryExhausted`] carrying `target`,
/// the total attempt count, and the last underlying error.
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, target: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(policy);
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(target, attempts, "operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => {
                warn!(target, attempts, error = %e, "non-retryable error, giving up");
                return Err(e);
            }
            Err(e) => {
                if attempts >= policy.max_attempts {
                    warn!(target, attempts, error = %e, "retries exhausted");
                    return Err(Error::RetryExhausted {
                        target: target.to_string(),
                        attempts,
                        cause: Box::new(e),
                    });
                }

                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| policy.max_delay());
                warn!(
                    target,
                    attempt = attempts,
                    retry_after_ms = delay.as_millis(),
                    error = %e,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
