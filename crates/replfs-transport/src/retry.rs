//! Retry with back-off for remote and local I/O operations.
//!
//! The executor is generic over the error type; an error opts into being
//! retried by implementing [`Transient`]. Non-transient errors end the loop on
//! the attempt that produced them.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::TransportError;

/// Classifies an error as worth another attempt.
pub trait Transient {
    /// True when a later attempt may succeed.
    fn is_transient(&self) -> bool;
}

impl Transient for TransportError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionTimeout { .. }
                | TransportError::ConnectionClosed
                | TransportError::Timeout { .. }
                | TransportError::Io(_)
        )
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `step * attempt` after each failed attempt.
    Linear {
        /// Delay added per attempt.
        step: Duration,
    },
    /// `initial * multiplier^(attempt-1)`, capped at `max`.
    Exponential {
        /// Delay after the first failure.
        initial: Duration,
        /// Upper bound on any single delay.
        max: Duration,
        /// Growth factor.
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Linear { step } => step.saturating_mul(attempt.max(1)),
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exp = attempt.saturating_sub(1) as i32;
                let ms = initial.as_millis() as f64 * multiplier.powi(exp);
                Duration::from_millis(ms.min(max.as_millis() as f64) as u64)
            }
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one (default: 3).
    pub max_attempts: u32,
    /// Delay schedule (default: linear, 1 second per attempt).
    pub backoff: Backoff,
    /// Add up to 25% random jitter to each delay (default: false).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_secs(1),
            },
            jitter: false,
        }
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// Operation succeeded.
    Success(T),
    /// Every attempt failed, or a non-transient error stopped the loop.
    Exhausted {
        /// The last error that occurred.
        last_error: E,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Converts into a plain `Result`, dropping the attempt count.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Runs an operation until it succeeds, fails permanently, or runs out of attempts.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new executor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Configured attempt bound.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Execute `operation`, sleeping between attempts per the back-off schedule.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let max = self.max_attempts();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => {
                    if !e.is_transient() || attempt >= max {
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(attempt, max, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.backoff.delay(attempt);
        if self.config.jitter && !base.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
            base + Duration::from_millis(extra)
        } else {
            base
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
