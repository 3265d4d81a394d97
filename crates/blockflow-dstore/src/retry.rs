//! Bounded retry with exponential backoff for object-store I/O.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::StoreError;

/// Default attempt count for object-store operations.
pub const DEFAULT_ATTEMPTS: usize = 3;

/// Default initial backoff between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

/// Run `op` up to `attempts` times, sleeping `initial_backoff * 2^n` between
/// attempts. Non-retryable errors (missing objects) surface immediately.
pub async fn with_retries<T, F, Fut>(
    attempts: usize,
    initial_backoff: Duration,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = initial_backoff;
    let mut attempt = 1usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() || attempt >= attempts.max(1) => return Err(err),
            Err(err) => {
                warn!(attempt, error = %err, "retrying store operation");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = with_retries(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Io("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retries(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Io("down".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retries(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::NotFound("x".to_string())) }
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
