//! Exponential-backoff retry for idempotent unary upstream calls (§4.1
//! "Failure policy", §7 "RateLimit, ServerError, and NetworkError ... are
//! retried with capped exponential backoff").

use std::future::Future;
use std::time::Duration;

use shared::error::CommonError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 30_000,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self
            .base_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        Duration::from_millis(ms.min(self.max_ms))
    }
}

/// Retries `f` while it fails with a retryable [`CommonError`] kind, sleeping
/// between attempts per [`RetryPolicy::delay_for`]. At most `max_retries`
/// extra attempts are made beyond the first.
pub async fn retry_idempotent<T, F, Fut>(
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T, CommonError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CommonError>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && err.kind().is_retryable() => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "retrying after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn retries_retryable_errors_up_to_max() {
        let policy = RetryPolicy {
            base_ms: 1,
            max_ms: 2,
            max_retries: 3,
        };
        let attempts = AtomicU32::new(0);
        let result: Result<(), CommonError> = retry_idempotent(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(CommonError::server_error("boom")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let result: Result<(), CommonError> = retry_idempotent(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(CommonError::invalid_request("bad")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
