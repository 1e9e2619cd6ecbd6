//! Retry with exponential backoff for Tidemark remote uploads
//!
//! Adapters classify each failed attempt as [`RetryError::Transient`] or
//! [`RetryError::Permanent`]; [`retry`] keeps re-running transient failures
//! until the [`RetryPolicy`] runs out of attempts or elapsed time.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Error type carried by failed attempts
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("'{operation}' gave up after {attempts} attempt(s): {source}")]
    Exhausted {
        operation: &'static str,
        attempts: usize,
        source: BoxError,
    },
    #[error("'{operation}' failed, retryable: {source}")]
    Transient {
        operation: &'static str,
        source: BoxError,
    },
    #[error("'{operation}' failed: {source}")]
    Permanent {
        operation: &'static str,
        source: BoxError,
    },
}

impl RetryError {
    pub fn transient<E>(operation: &'static str, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Transient {
            operation,
            source: error.into(),
        }
    }

    pub fn permanent<E>(operation: &'static str, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Permanent {
            operation,
            source: error.into(),
        }
    }

    /// Wrap `error` according to its own classification
    pub fn classify<E>(operation: &'static str, error: E) -> Self
    where
        E: RetryableError + std::error::Error + Send + Sync + 'static,
    {
        if error.is_transient() {
            Self::transient(operation, error)
        } else {
            Self::permanent(operation, error)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Attempts made before giving up, when the policy ran out
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    fn into_source(self) -> BoxError {
        match self {
            Self::Exhausted { source, .. }
            | Self::Transient { source, .. }
            | Self::Permanent { source, .. } => source,
        }
    }
}

pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// One boxed attempt
pub type AttemptFuture<T> = Pin<Box<dyn Future<Output = RetryResult<T>> + Send>>;

/// Errors that know whether retrying them can help
pub trait RetryableError {
    fn is_transient(&self) -> bool;

    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Backoff schedule plus a hard cap on attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: ExponentialBackoff,
    max_attempts: usize,
}

impl RetryPolicy {
    pub fn new(backoff: ExponentialBackoff, max_attempts: usize) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    /// 100ms doubling to 5s, 5 attempts, 30s budget
    pub fn standard() -> Self {
        Self::new(
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(100))
                .with_max_interval(Duration::from_secs(5))
                .with_multiplier(2.0)
                .with_max_elapsed_time(Some(Duration::from_secs(30)))
                .build(),
            5,
        )
    }

    /// Slower schedule for archive uploads: 500ms growing 1.5x to 10s, 6 attempts, 2min budget
    pub fn remote_upload() -> Self {
        Self::new(
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(500))
                .with_max_interval(Duration::from_secs(10))
                .with_multiplier(1.5)
                .with_max_elapsed_time(Some(Duration::from_secs(120)))
                .build(),
            6,
        )
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Run `attempt` until it succeeds, fails permanently, or `policy` runs out
///
/// `attempt` receives the 1-based attempt number. A permanent failure is
/// returned as is; running out of attempts or time yields
/// [`RetryError::Exhausted`] wrapping the last transient cause.
pub async fn retry<F, T>(operation: &'static str, policy: RetryPolicy, mut attempt: F) -> RetryResult<T>
where
    F: FnMut(usize) -> AttemptFuture<T>,
{
    let RetryPolicy {
        mut backoff,
        max_attempts,
    } = policy;
    backoff.reset();
    let mut number = 0;

    loop {
        number += 1;
        let error = match attempt(number).await {
            Ok(value) => {
                if number > 1 {
                    debug!(operation, attempts = number, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(error) if !error.is_transient() => {
                warn!(operation, attempt = number, error = %error, "Not retrying");
                return Err(error);
            }
            Err(error) => error,
        };

        let delay = match backoff.next_backoff() {
            Some(delay) if number < max_attempts => delay,
            _ => {
                warn!(operation, attempts = number, error = %error, "Retries exhausted");
                return Err(RetryError::Exhausted {
                    operation,
                    attempts: number,
                    source: error.into_source(),
                });
            }
        };

        warn!(
            operation,
            attempt = number,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after transient failure"
        );

        #[cfg(feature = "async-rt")]
        tokio::time::sleep(delay).await;

        #[cfg(not(feature = "async-rt"))]
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn slow_down() -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, "SlowDown")
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let value = retry("put_object", RetryPolicy::standard(), |number| {
            Box::pin(async move { Ok(number) })
        })
        .await
        .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let uploaded = retry("put_object", RetryPolicy::remote_upload(), move |number| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if number < 3 {
                    Err(RetryError::transient("put_object", slow_down()))
                } else {
                    Ok(4096u64)
                }
            })
        })
        .await
        .unwrap();

        assert_eq!(uploaded, 4096);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: RetryResult<()> = retry("put_object", RetryPolicy::standard(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(RetryError::permanent(
                    "put_object",
                    io::Error::new(io::ErrorKind::PermissionDenied, "AccessDenied"),
                ))
            })
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts_and_cause() {
        let policy = RetryPolicy::standard().with_max_attempts(3);
        let result: RetryResult<()> = retry("put_object", policy, |_| {
            Box::pin(async { Err(RetryError::transient("put_object", slow_down())) })
        })
        .await;

        let error = result.unwrap_err();
        assert_eq!(error.attempts(), Some(3));
        assert!(error.to_string().contains("SlowDown"));
    }

    #[derive(Debug, Error)]
    #[error("http status {0}")]
    struct Status(u16);

    impl RetryableError for Status {
        fn is_transient(&self) -> bool {
            self.0 == 429 || self.0 >= 500
        }
    }

    #[test]
    fn test_classify_uses_error_kind() {
        assert!(RetryError::classify("upload", Status(503)).is_transient());
        assert!(RetryError::classify("upload", Status(429)).is_transient());
        assert!(!RetryError::classify("upload", Status(403)).is_transient());
        assert!(Status(404).is_permanent());
    }

    #[test]
    fn test_policy_never_allows_zero_attempts() {
        assert_eq!(RetryPolicy::standard().with_max_attempts(0).max_attempts(), 1);
        assert_eq!(RetryPolicy::default().max_attempts(), 5);
    }
}
