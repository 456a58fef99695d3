//! Per-resource retry policies with fixed or exponential backoff.
//!
//! A policy bounds the total number of attempts: `max_attempts = 3` means
//! at most three calls to the target system, with a backoff sleep between
//! consecutive attempts. Only transient errors are retried.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{ConnectorError, ConnectorResult};

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay between attempts.
    Fixed,
    /// Delay grows by a multiplier after each attempt, up to a cap.
    #[default]
    Exponential,
}

impl BackoffStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Exponential => "exponential",
        }
    }
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Retry/backoff configuration for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Backoff strategy.
    pub strategy: BackoffStrategy,
    /// Maximum number of calls to the target system (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt; the fixed period for `Fixed`.
    pub initial_delay_ms: u64,
    /// Upper bound on the delay for `Exponential`.
    pub max_delay_ms: u64,
    /// Growth factor for `Exponential`.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// A fixed-delay policy.
    #[must_use]
    pub fn fixed(period_ms: u64, max_attempts: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            max_attempts,
            initial_delay_ms: period_ms,
            max_delay_ms: period_ms,
            multiplier: 1.0,
        }
    }

    /// An exponential policy with the given base delay and attempt bound.
    #[must_use]
    pub fn exponential(initial_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            multiplier: 2.0,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::fixed(0, 1)
    }

    /// Effective attempt bound; a zero configuration still performs one call.
    #[must_use]
    pub fn attempt_bound(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to sleep after the given failed attempt (1-indexed).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1).min(63);
                let grown =
                    self.initial_delay_ms as f64 * self.multiplier.powi(exp as i32);
                grown.min(self.max_delay_ms as f64) as u64
            }
        };
        Duration::from_millis(delay_ms)
    }
}

/// Outcome of a retried operation, carrying how many calls were made.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result: the first success, or the last error.
    pub result: ConnectorResult<T>,
    /// Number of calls actually performed.
    pub attempts: u32,
}

/// Executes an operation under a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct RetryRunner {
    policy: BackoffPolicy,
}

impl RetryRunner {
    /// Create a runner for the given policy.
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    /// Get the policy this runner applies.
    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run the operation, retrying transient failures up to the policy's
    /// attempt bound.
    ///
    /// Permanent errors are returned immediately. The outcome reports how
    /// many calls were performed, for attempt accounting in reports.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ConnectorResult<T>>,
    {
        let bound = self.policy.attempt_bound();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    if !err.is_transient() || attempt >= bound {
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                        };
                    }

                    let delay = self.policy.delay_after(attempt);
                    debug!(
                        attempt,
                        bound,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
