use crate::error::RemoteError;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff: the delay before retry `n` (0-based) is
/// `min(base * 2^n, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Backoff {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    // Retries after the first attempt.
    pub retry_count: u32,
    #[serde(flatten)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            backoff: Backoff {
                base_ms: 1_000,
                cap_ms: 30_000,
            },
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retry_count: 0,
            ..Self::default()
        }
    }

    // Client errors are final; everything else retries until the budget is spent.
    pub fn should_retry(&self, retries_done: u32, error: &RemoteError) -> bool {
        error.is_retryable() && retries_done < self.retry_count
    }

    /// Runs `op` until it succeeds, fails with a client error, or the retry budget
    /// is spent. On failure returns the last error and the number of attempts made.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, (RemoteError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(retries, &e) => {
                    let delay = self.backoff.delay(retries);
                    debug!(attempt = retries + 1, ?delay, error = %e, "retrying remote call");
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => return Err((e, retries + 1)),
            }
        }
    }
}
