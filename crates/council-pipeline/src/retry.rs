//! Retry logic with linear backoff for action execution.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use council_types::{CouncilError, Result};

/// Linear backoff: the delay after failed attempt `n` (0-indexed) is
/// `step * (n + 1)`, so 1x, 2x, 3x, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub step: Duration,
}

impl BackoffPolicy {
    pub fn linear(step: Duration) -> Self {
        Self { step }
    }

    /// Compute the delay after a failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.step.saturating_mul(attempt as u32 + 1)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::linear(Duration::from_millis(1000))
    }
}

/// Execute `f` with retry logic.
///
/// The closure is called with the 0-based attempt number, up to
/// `max_retries + 1` times. Errors that are not
/// [`CouncilError::is_retryable`] (abort above all) return immediately.
/// `on_retry` runs before each backoff sleep with the failed attempt, the
/// delay and the error. The sleep is raced against `cancel`.
pub async fn execute_with_retry<T, F, Fut, R>(
    f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut on_retry: R,
) -> Result<T>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(usize, Duration, &CouncilError),
{
    let mut attempt = 0;
    loop {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    action = %label,
                    attempt = attempt + 1,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Retryable error, retrying"
                );
                on_retry(attempt, delay, &e);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(CouncilError::Aborted),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
