//! Bounded retry with exponential backoff.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::{info, warn};

/// Exponential backoff parameters for retrying transient failures.
///
/// The shape follows the usual `BackoffConfig`: `initial_backoff` and `max_backoff` play the
/// roles of `init_backoff` and `max_backoff`, the growth `base` is fixed at 2, and the retry
/// budget is a number of attempts rather than a `deadline`, so a failing transaction is given up
/// after a bounded amount of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,

    /// Backoff before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound of any backoff, before jitter.
    pub max_backoff: Duration,
}

impl RetryConfig {
    /// Default value for [`max_attempts`](Self::max_attempts).
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    /// Default value for [`initial_backoff`](Self::initial_backoff).
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

    /// Default value for [`max_backoff`](Self::max_backoff).
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1);

    /// Backoff before the given retry (1-based), with jitter in `[delay / 2, delay]`.
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        let delay = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(jitter)
    }

    /// Run `f` until it succeeds, fails with an error `is_retryable` rejects, or the attempts are
    /// used up. The last error is returned in the latter two cases.
    ///
    /// Retry `n` (1-based) sleeps `min(initial_backoff * 2^(n-1), max_backoff)`, scaled by a
    /// random factor in `[0.5, 1.0]` so that concurrent writers conflicting on the same rows do
    /// not retry in lockstep.
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: &'static str,
        is_retryable: impl Fn(&E) -> bool + Send,
        mut f: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: std::fmt::Display + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => {
                    if attempt > 1 {
                        info!(operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) if attempt < self.max_attempts && is_retryable(&e) => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Self::DEFAULT_INITIAL_BACKOFF,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
        }
    }
}
