//! Retry envelope for upstream calls: exponential backoff with full
//! jitter, aborted immediately on terminal failures.

use super::error::UpstreamError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy for one upstream.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Transcription calls: base 1 s, cap 15 s, 5 retries.
    pub fn transcription() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            max_retries: 5,
        }
    }

    /// Per-chunk correction calls: base 1 s, cap 5 s, 3 retries.
    pub fn correction() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    /// Full-jitter delay for the given attempt (0-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1 << attempt.min(16));
        let ceiling = exp.min(self.max_delay.as_millis() as u64);
        let jittered = rand::thread_rng().gen_range(0..=ceiling);
        Duration::from_millis(jittered)
    }
}

/// Runs `op` until it succeeds, fails terminally, or exhausts the retry
/// budget. The last error is returned unchanged.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => {
                warn!(
                    target: "upstream::retry",
                    op = op_name,
                    attempt,
                    error = %err,
                    "Terminal upstream failure"
                );
                return Err(err);
            }
            Err(err) => {
                if attempt >= policy.max_retries {
                    warn!(
                        target: "upstream::retry",
                        op = op_name,
                        attempt,
                        error = %err,
                        "Retry budget exhausted"
                    );
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                debug!(
                    target: "upstream::retry",
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying upstream call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
