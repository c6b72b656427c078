//! Bounded retry with exponential backoff
//!
//! Wraps every remote write: transient failures are retried up to three
//! times with exponential backoff (1s, 2s, 4s). After the final failure the
//! caller logs and drops; delivery is best-effort for non-terminal events.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::TelemetryError;

/// Retry parameters for remote writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the initial attempt, each preceded by a backoff sleep.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after the given 1-based failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds or attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number. Failures between attempts
    /// are logged at warn level; the terminal failure is returned as
    /// [`TelemetryError::RetriesExhausted`].
    pub async fn execute<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, TelemetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TelemetryError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt <= self.max_retries => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        error = %err,
                        label,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "Remote write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(error = %err, label, attempt, "Remote write failed, giving up");
                    return Err(TelemetryError::RetriesExhausted { attempts: attempt });
                }
            }
        }
    }
}
