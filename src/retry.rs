//! ARCHIVIST - Bounded Exponential Backoff
//! Retries transient per-range failures before escalating them.

use std::thread;
use std::time::Duration;

use crate::error::Result;

/// Retry policy for per-range I/O.
///
/// Attempt `n` (0-based) that fails transiently sleeps
/// `min(initial_backoff * 2^n, max_backoff)` before attempt `n + 1`.
/// Non-transient errors are returned immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Backoff slept after the given failed attempt.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// `on_retry` is called once for every retry that is scheduled.
    pub fn run<T, F, R>(&self, label: &str, mut op: F, mut on_retry: R) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
        R: FnMut(),
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let backoff = self.backoff_duration(attempt);
                    log::warn!(
                        "{}: attempt {} failed ({}), retrying in {:?}",
                        label,
                        attempt + 1,
                        err,
                        backoff
                    );
                    on_retry();
                    if backoff > Duration::ZERO {
                        thread::sleep(backoff);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArchivistError;
    use crate::types::RangeId;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn transient() -> ArchivistError {
        ArchivistError::TransientIo {
            range: RangeId(1),
            message: "relocating".into(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = fast_policy(10);
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(1));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(2));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(4));
        assert_eq!(policy.backoff_duration(3), Duration::from_millis(4));
        assert_eq!(policy.backoff_duration(40), Duration::from_millis(4));
    }

    #[test]
    fn test_retries_until_success() {
        let mut retries = 0;
        let result = fast_policy(5).run(
            "test",
            |attempt| {
                if attempt < 2 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            },
            || retries += 1,
        );
        assert_eq!(result.unwrap(), 2);
        assert_eq!(retries, 2);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<()> = fast_policy(3).run(
            "test",
            |_| {
                calls += 1;
                Err(transient())
            },
            || {},
        );
        assert!(matches!(result, Err(ArchivistError::TransientIo { .. })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let mut calls = 0;
        let result: Result<()> = fast_policy(5).run(
            "test",
            |_| {
                calls += 1;
                Err(ArchivistError::Corruption("bad crc".into()))
            },
            || {},
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
