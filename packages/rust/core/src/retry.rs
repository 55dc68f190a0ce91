//! Bounded fixed-wait retry for capability calls.
//!
//! Only transient failures (rate limit, timeout, unavailable) are retried. The
//! wait between attempts is constant; there is no backoff growth or jitter.

use std::future::Future;

use bbqscan_shared::{BbqScanError, Result, RetryPolicy};
use tracing::warn;

/// Run `call` until it succeeds, fails permanently, or runs out of attempts.
///
/// Exhausting the attempts on a transient failure yields
/// [`BbqScanError::RetriesExhausted`] wrapping the last error.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    wait_secs = policy.wait.as_secs(),
                    error = %e,
                    "transient failure, retrying after fixed wait"
                );
                tokio::time::sleep(policy.wait).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(BbqScanError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::immediate(5), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(BbqScanError::RateLimited("429".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::immediate(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BbqScanError::Timeout("slow".into()))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            BbqScanError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, BbqScanError::Timeout(_)));
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::immediate(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BbqScanError::contract("expected 5 results, got 4"))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result.unwrap_err(), BbqScanError::Contract { .. }));
    }
}
