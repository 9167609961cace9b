//! Bounded retry policy.
//!
//! Used for dialing the edge (exponential backoff) and by tests that poll
//! the connector's local endpoints while it starts up (fixed wait).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base * 2^attempt`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

/// Error of the last attempt once retrying stopped.
#[derive(Debug)]
pub struct GaveUp<E> {
    /// Attempts made, including the first one.
    pub attempts: u32,
    pub error: E,
}

/// Retry policy with an attempt budget.
///
/// Attempts are numbered from 0. `max_attempts` counts every attempt,
/// including the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(6, Duration::from_secs(1), Duration::from_secs(32))
    }
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(wait),
        }
    }

    pub const fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Delay to wait after attempt `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(wait) => wait,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(max).min(max)
            }
        }
    }

    /// Whether another attempt is allowed after attempt `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    /// Runs `op` until it succeeds or the budget is spent.
    ///
    /// The closure receives the attempt number. The last error is returned
    /// when every attempt failed.
    pub async fn retry<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.retry_if(op, |_| true).await.map_err(|gave_up| gave_up.error)
    }

    /// Like [`retry`](Self::retry), but stops early when `retryable`
    /// returns false for an error, and reports how many attempts ran.
    pub async fn retry_if<T, E, F, Fut, P>(
        &self,
        mut op: F,
        retryable: P,
    ) -> Result<T, GaveUp<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !retryable(&e) || !self.should_retry(attempt) {
                        return Err(GaveUp {
                            attempts: attempt + 1,
                            error: e,
                        });
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
