//! Jittered exponential backoff for transactions that lose a lock race.

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

/// Errors that can tell whether running the operation again may succeed.
pub trait Retryable: Sized {
    /// Whether the failure came from contention rather than the request.
    fn is_transient(&self) -> bool;

    /// Error to report once every attempt failed transiently.
    #[must_use]
    fn exhausted(self, attempts: u32) -> Self;
}

/// Backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. At least one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for any delay before jitter.
    pub max_delay: Duration,

    /// Jitter spread as a percentage of the delay, at most 100.
    pub jitter_pct: u32,
}

impl RetryPolicy {
    /// Build a policy, clamping every parameter into range.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter_pct: u32) -> Self {
        let base_delay = base_delay.max(Duration::from_millis(1));

        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_pct: jitter_pct.min(100),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn once() -> Self {
        Self::new(1, Duration::from_millis(1), Duration::from_millis(1), 0)
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay);

        if self.jitter_pct == 0 {
            return delay;
        }

        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let spread = millis.saturating_mul(u64::from(self.jitter_pct)) / 100;
        let jittered = rand::thread_rng()
            .gen_range(millis.saturating_sub(spread)..=millis.saturating_add(spread));

        Duration::from_millis(jittered)
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error unchanged, or the last transient
    /// one passed through [`Retryable::exhausted`].
    pub async fn retry<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: Retryable + Display + Send,
    {
        let mut attempt = 0;

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() => error,
                Err(error) => return Err(error),
            };

            attempt += 1;

            if attempt >= self.max_attempts {
                return Err(error.exhausted(attempt));
            }

            let delay = self.next_delay(attempt - 1);

            warn!(attempt, delay_ms = delay.as_millis(), %error, "retrying after contention");

            sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(10), Duration::from_millis(200), 20)
    }
}
