//! Bounded, fixed-interval polling.

use std::future::Future;
use std::time::Duration;

use tracing::trace;

use crate::config::{DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_RETRY_COUNT};
use crate::error::NvmfError;

/// Poll an operation up to `attempts` times, sleeping `interval` between
/// attempts (never after the last one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Build a policy from connector settings.  Negative values are rejected;
    /// zero falls back to the defaults.
    pub fn from_settings(retry_count: i32, interval_secs: i32) -> Result<Self, NvmfError> {
        if retry_count < 0 || interval_secs < 0 {
            return Err(NvmfError::InvalidConfiguration(format!(
                "retry count {retry_count} and check interval {interval_secs} must not be negative"
            )));
        }
        let attempts = if retry_count == 0 {
            DEFAULT_RETRY_COUNT
        } else {
            retry_count
        };
        let interval = if interval_secs == 0 {
            DEFAULT_CHECK_INTERVAL_SECS
        } else {
            interval_secs
        };
        Ok(Self::new(
            attempts.unsigned_abs(),
            Duration::from_secs(u64::from(interval.unsigned_abs())),
        ))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `probe` until it yields a value or the attempts are used up.
    /// The probe receives the zero-based attempt number.
    pub async fn poll<T, F, Fut>(&self, mut probe: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in 0..self.attempts {
            if let Some(value) = probe(attempt).await {
                return Some(value);
            }
            if attempt + 1 < self.attempts {
                trace!(attempt, interval = ?self.interval, "not ready, sleeping");
                tokio::time::sleep(self.interval).await;
            }
        }
        None
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_RETRY_COUNT.unsigned_abs(),
            Duration::from_secs(u64::from(DEFAULT_CHECK_INTERVAL_SECS.unsigned_abs())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_and_validate() {
        let policy = RetryPolicy::from_settings(0, 0).unwrap();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.attempts(), 10);
        assert_eq!(policy.interval(), Duration::from_secs(1));

        let policy = RetryPolicy::from_settings(3, 2).unwrap();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.interval(), Duration::from_secs(2));

        assert!(matches!(
            RetryPolicy::from_settings(-1, 1),
            Err(NvmfError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            RetryPolicy::from_settings(1, -1),
            Err(NvmfError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_stops_at_first_value() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let start = tokio::time::Instant::now();
        let mut calls = 0;
        let found = policy
            .poll(|attempt| {
                calls += 1;
                async move { (attempt == 2).then_some(attempt) }
            })
            .await;
        assert_eq!(found, Some(2));
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_gives_up_without_trailing_sleep() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let start = tokio::time::Instant::now();
        let found: Option<()> = policy.poll(|_| async { None }).await;
        assert!(found.is_none());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
