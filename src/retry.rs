//! Retry policy for stages that talk to external services.
//!
//! Summarization, QR rendering, remote conversion and SMTP delivery all fail
//! transiently (429, 5xx, timeouts). Each of those stages gets its own
//! [`RetryPolicy`] value, injected when the [`crate::Pipeline`] is built, so the
//! schedule is explicit and testable instead of being buried in every call site.
//!
//! Only errors whose [`Retryable::is_retryable`] returns `true` are retried.
//! A validation failure (bad API key, malformed document) is returned after the
//! first attempt.
//!
//! ## Backoff
//!
//! `initial_backoff * 2^(retry-1)`, capped at `max_backoff`. With the defaults
//! (3 attempts, 500 ms) the waits are 500 ms → 1 s.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Classifies an error as transient (worth another attempt) or permanent.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Bounded exponential-backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always ≥ 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    /// How many times the operation was invoked.
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Self::default()
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `on_retry` is called with `(next_attempt, delay, error)` before each
    /// sleep, which lets the orchestrator forward retry events to progress
    /// callbacks.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        label: &str,
        mut op: F,
        mut on_retry: R,
    ) -> Attempted<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
        R: FnMut(u32, Duration, &E),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    debug!("{}: succeeded on attempt {}", label, attempt);
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        "{}: attempt {}/{} failed: {}; retrying in {}ms",
                        label,
                        attempt,
                        max_attempts,
                        e,
                        delay.as_millis()
                    );
                    on_retry(attempt + 1, delay, &e);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("{}: attempt {}/{} failed: {}", label, attempt, max_attempts, e);
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}
