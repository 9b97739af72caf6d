//! Bounded retry with exponential backoff and rate-limit rescheduling.
//!
//! [`execute_with_retry`] runs an operation up to `max_retries + 1` times and
//! classifies each failure:
//!
//! | Outcome | Action |
//! |---------|--------|
//! | success | `RateLimiter::on_success`, return |
//! | 429 | penalize the limiter, sleep `Retry-After` (or `base * 2^attempt`), retry |
//! | 5xx | sleep `base * 2^attempt` and retry while attempts remain, else propagate |
//! | other | propagate immediately |
//!
//! A request that is rate limited on every attempt ends with
//! [`EppError::Execution`].

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::clock::Clock;
use crate::error::{EppError, Result};
use crate::rate_limit::RateLimiter;

/// Penalty hint fed to the limiter when a 429 carries no `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Retry budget and backoff base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay; attempt `n` backs off `base_delay * 2^n`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given budget and base delay.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
        }
    }

    /// Backoff for the given zero-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Total attempts this policy allows.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_secs(1))
    }
}

/// `[retry]` config section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff base in milliseconds.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(config.max_retries, Duration::from_millis(config.base_delay_ms))
    }
}

/// Runs `operation` under `policy`, feeding outcomes back into `limiter`.
///
/// `operation` receives the zero-based attempt number.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    limiter: &RateLimiter,
    clock: &dyn Clock,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts();
    for attempt in 0..attempts {
        match operation(attempt).await {
            Ok(value) => {
                limiter.on_success();
                return Ok(value);
            }
            Err(EppError::RateLimited { retry_after, .. }) => {
                limiter.on_rate_limited(retry_after.unwrap_or(DEFAULT_RETRY_AFTER));
                if attempt + 1 == attempts {
                    break;
                }
                let delay = retry_after.unwrap_or_else(|| policy.backoff(attempt));
                warn!(attempt, delay_ms = delay.as_millis() as u64, "rate limited; rescheduling");
                clock.sleep(delay).await;
            }
            Err(err) if err.is_server_error() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                let delay_ms = delay.as_millis() as u64;
                warn!(attempt, delay_ms, error = %err, "server error; retrying");
                clock.sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(EppError::Execution { attempts })
}
