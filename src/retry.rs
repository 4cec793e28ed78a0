use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Attempt budget and optional per-attempt timeout. Failed attempts are
/// retried immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub attempt_timeout: Option<Duration>,
}

impl RetryConfig {
    pub fn immediate(max_attempts: u32, attempt_timeout: Option<Duration>) -> Self {
        Self {
            max_attempts,
            attempt_timeout,
        }
    }

    fn total_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Marker error produced when an attempt overruns `attempt_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTimedOut(pub Duration);

impl std::fmt::Display for AttemptTimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "attempt timed out after {}ms", self.0.as_millis())
    }
}

impl std::error::Error for AttemptTimedOut {}

/// Terminal failure of a retried operation.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub error: E,
}

/// Retry an async operation until it succeeds, the classifier aborts, or
/// the attempt budget runs out.
///
/// Each attempt receives its own [`CancellationToken`]. When the attempt
/// overruns `attempt_timeout` the token is cancelled, the in-flight future
/// is dropped, and the attempt counts as failed with [`AttemptTimedOut`].
pub async fn retry_with_timeout<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display + From<AttemptTimedOut>,
{
    let total_attempts = config.total_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let token = CancellationToken::new();
        let fut = operation(token.clone());
        let result = match config.attempt_timeout {
            Some(limit) => {
                tokio::select! {
                    r = fut => r,
                    _ = tokio::time::sleep(limit) => {
                        token.cancel();
                        Err(E::from(AttemptTimedOut(limit)))
                    }
                }
            }
            None => fut.await,
        };

        let e = match result {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };
        if classifier(&e) == RetryAction::Abort || attempt >= total_attempts {
            return Err(RetryFailure { attempts: attempt, error: e });
        }

        tracing::warn!(
            "Attempt {}/{} failed, retrying: {}",
            attempt,
            total_attempts,
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed(&'static str),
        TimedOut,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl From<AttemptTimedOut> for TestError {
        fn from(_: AttemptTimedOut) -> Self {
            TestError::TimedOut
        }
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(RetryConfig::immediate(0, None).total_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let config = RetryConfig::immediate(3, None);
        let result: Result<i32, RetryFailure<TestError>> =
            retry_with_timeout(&config, |_| RetryAction::Retry, |_| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_abort_on_non_retryable() {
        let config = RetryConfig::immediate(3, None);
        let calls = Arc::new(AtomicU32::new(0));
        let cc = calls.clone();
        let result: Result<i32, _> = retry_with_timeout(
            &config,
            |_| RetryAction::Abort,
            |_| {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Failed("fatal"))
                }
            },
        )
        .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.error, TestError::Failed("fatal"));
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let config = RetryConfig::immediate(5, None);
        let calls = Arc::new(AtomicU32::new(0));
        let cc = calls.clone();
        let result: Result<i32, RetryFailure<TestError>> = retry_with_timeout(
            &config,
            |_| RetryAction::Retry,
            |_| {
                let cc = cc.clone();
                async move {
                    let n = cc.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(TestError::Failed("transient"))
                    } else {
                        Ok(99)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_after_max_attempts() {
        let config = RetryConfig::immediate(4, None);
        let calls = Arc::new(AtomicU32::new(0));
        let cc = calls.clone();
        let result: Result<i32, _> = retry_with_timeout(
            &config,
            |_| RetryAction::Retry,
            |_| {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Failed("still failing"))
                }
            },
        )
        .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_attempt_timeout_cancels_and_counts() {
        let config = RetryConfig::immediate(2, Some(Duration::from_millis(20)));
        let cancelled = Arc::new(AtomicU32::new(0));
        let seen = cancelled.clone();
        let result: Result<i32, _> = retry_with_timeout(
            &config,
            |_| RetryAction::Retry,
            |token| {
                let seen = seen.clone();
                async move {
                    let watcher = token.clone();
                    tokio::spawn(async move {
                        watcher.cancelled().await;
                        seen.fetch_add(1, Ordering::SeqCst);
                    });
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, TestError>(1)
                }
            },
        )
        .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.error, TestError::TimedOut);
        assert_eq!(failure.attempts, 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
    }
}
