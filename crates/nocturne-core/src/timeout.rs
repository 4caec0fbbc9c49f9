//! Operation deadlines and bounded retries for store writes.

use std::future::Future;
use std::time::Duration;

use nocturne_state::StorageResult;
use tracing::warn;

use crate::domain::error::{NocturneError, Result};

/// Base delay between retries; doubles per attempt.
const RETRY_BACKOFF_BASE_MS: u64 = 10;
/// Ceiling on any single backoff sleep.
const RETRY_BACKOFF_MAX_MS: u64 = 2_000;

/// Sleep before retry number `attempt` (1-based).
fn backoff(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(
        RETRY_BACKOFF_BASE_MS
            .saturating_mul(factor)
            .min(RETRY_BACKOFF_MAX_MS),
    )
}

/// Run `fut`, failing with `Timeout` if it does not finish within `limit`.
pub async fn with_timeout<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_elapsed) => {
            let after_ms = limit.as_millis() as u64;
            warn!(event = "op.timeout", op, after_ms, "operation timed out");
            Err(NocturneError::Timeout { op, after_ms })
        }
    }
}

/// Retry a storage write while it fails with a transient error, at most
/// `retries` extra attempts with exponential backoff.
pub async fn retry_transient<T, F, Fut>(op: &'static str, retries: u32, mut write: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match write().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(
                    event = "store.write_retry",
                    op,
                    attempt,
                    error = %err,
                    "transient write failure, retrying"
                );
                tokio::time::sleep(backoff(attempt)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nocturne_state::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_then_saturates() {
        assert_eq!(backoff(1), Duration::from_millis(10));
        assert_eq!(backoff(2), Duration::from_millis(20));
        assert_eq!(backoff(4), Duration::from_millis(80));
        assert_eq!(backoff(30), Duration::from_millis(RETRY_BACKOFF_MAX_MS));
        assert_eq!(backoff(61), Duration::from_millis(RETRY_BACKOFF_MAX_MS));
        assert_eq!(backoff(u32::MAX), Duration::from_millis(RETRY_BACKOFF_MAX_MS));
    }

    #[tokio::test]
    async fn test_with_timeout_surfaces_timeout() {
        let err = with_timeout("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, NocturneError::Timeout { op: "slow", .. }));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through_errors() {
        let err = with_timeout("get", Duration::from_secs(1), async {
            Err::<(), _>(NocturneError::not_found("x"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, NocturneError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_retry_transient_recovers() {
        let calls = AtomicU32::new(0);
        let value = retry_transient("put", 3, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "interrupted",
                )))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_is_bounded() {
        let calls = AtomicU32::new(0);
        let err = retry_transient("put", 2, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "slow disk",
            )))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::domain::error::ErrorKind::Storage);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let _ = retry_transient("put", 5, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::Immutable { key: "t".into() })
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
