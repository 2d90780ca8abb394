//! Retry policy with constant or capped-exponential backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default ceiling on the exponential backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Configuration for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry (and every retry in constant mode).
    pub base_delay: Duration,
    /// Ceiling on the backoff delay in exponential mode.
    pub max_delay: Duration,
    /// Double the delay on each retry when true, constant delay otherwise.
    pub exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            exponential_backoff: true,
        }
    }
}

/// Re-attempts a fallible async operation per its [`RetryConfig`].
///
/// The operation is supplied as a factory so each attempt gets a fresh
/// future. The last failing error is returned unchanged after the final
/// attempt; no delay follows the last attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `attempt` up to `max_retries + 1` times.
    pub async fn execute<T, E, F, Fut>(&self, context: &str, mut attempt: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt_index: u32 = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt_index >= self.config.max_retries {
                        return Err(error);
                    }
                    let delay = self.delay_for(attempt_index);
                    debug!(
                        context,
                        attempt = attempt_index + 1,
                        max_attempts = self.config.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying after failure"
                    );
                    sleep(delay).await;
                    attempt_index += 1;
                }
            }
        }
    }

    /// Delay before retry `i` (0-indexed).
    fn delay_for(&self, retry_index: u32) -> Duration {
        if !self.config.exponential_backoff {
            return self.config.base_delay;
        }
        let factor = 1u32.checked_shl(retry_index).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn policy(max_retries: u32, base_ms: u64, max_ms: u64, exponential: bool) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            exponential_backoff: exponential,
        })
    }

    #[test]
    fn test_exponential_delay_schedule_is_capped() {
        let policy = policy(4, 100, 300, true);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_constant_delay_schedule() {
        let policy = policy(4, 100, 300, false);
        for i in 0..4 {
            assert_eq!(policy.delay_for(i), Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_persistent_failure_attempts_and_rethrows_last_error() {
        let policy = policy(2, 5, 20, true);
        let attempts = AtomicU32::new(0);

        let result: Result<(), String> = policy
            .execute("test", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(format!("failure {n}")) }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3, "maxRetries=2 means 3 attempts");
        assert_eq!(result.unwrap_err(), "failure 3", "last error returned unchanged");
    }

    #[tokio::test]
    async fn test_success_on_first_attempt_skips_delays() {
        let policy = policy(5, 200, 1000, true);
        let started = Instant::now();

        let result: Result<u32, &str> = policy.execute("test", || async { Ok(7) }).await;

        assert_eq!(result.unwrap(), 7);
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "no backoff should occur on immediate success"
        );
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let policy = policy(3, 1, 10, false);
        let attempts = AtomicU32::new(0);

        let result: Result<&str, &str> = policy
            .execute("test", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exponential_backoff_elapsed_time() {
        // maxRetries=2, base=100ms, cap=300ms → delays of ~100ms then ~200ms.
        let policy = policy(2, 100, 300, true);
        let started = Instant::now();

        let result: Result<(), &str> = policy.execute("test", || async { Err("boom") }).await;

        assert!(result.is_err());
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(300),
            "expected at least 100ms + 200ms of backoff, got {elapsed:?}"
        );
        assert!(
            elapsed < Duration::from_millis(600),
            "no delay should follow the final attempt, got {elapsed:?}"
        );
    }
}
