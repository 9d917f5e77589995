use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::DmeError;

/// Delay to wait before the given retry (1 = first retry).
pub trait Backoff: Send + Sync + fmt::Debug {
    fn delay(&self, retry: u32) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _retry: u32) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Arc<dyn Backoff>,
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; zero is treated as one.
    pub fn new(max_attempts: u32, backoff: Arc<dyn Backoff>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Arc::new(FixedBackoff(delay)))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff.delay(retry)
    }
}

/// The last error once an operation stops being retried.
#[derive(Debug)]
pub struct Exhausted {
    pub attempts: u32,
    pub error: DmeError,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. `op` receives the 1-based attempt number.
pub fn retry_with_backoff<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, Exhausted>
where
    F: FnMut(u32) -> Result<T, DmeError>,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after transient failure"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(error) => {
                return Err(Exhausted {
                    attempts: attempt,
                    error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn transient() -> DmeError {
        DmeError::StorageStatus {
            status: 503,
            message: "slow down".to_string(),
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let mut calls = 0;
        let result = retry_with_backoff(&policy, |attempt| {
            calls += 1;
            if attempt < 3 { Err(transient()) } else { Ok(attempt) }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::fixed(2, Duration::ZERO);
        let result: Result<(), _> = retry_with_backoff(&policy, |_| Err(transient()));
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 2);
        assert_matches!(exhausted.error, DmeError::StorageStatus { status: 503, .. });
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), _> = retry_with_backoff(&policy, |_| {
            calls += 1;
            Err(DmeError::StorageStatus {
                status: 403,
                message: "expired".to_string(),
            })
        });
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls, 1);
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts(), 1);
    }
}
