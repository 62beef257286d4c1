//! Publish Retry Pipeline
//!
//! Exponential backoff around a unit of work, filtered by error kind.
//! Attempts are sequential and the delay after failure `n` (1-based) is
//! `2^n` seconds, without jitter. Errors the filter rejects propagate
//! immediately; on exhaustion the last error is returned.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay applied after the given 1-based failed attempt.
    fn backoff(attempt: u32) -> Duration {
        Duration::from_secs(2u64.saturating_pow(attempt))
    }

    /// Run `op`, retrying while `is_transient` accepts the error and
    /// attempts remain.
    pub async fn run<T, E, F, Fut, P>(&self, is_transient: P, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts && is_transient(&error) => {
                    let delay = Self::backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_secs = delay.as_secs(),
                        error = %error,
                        "transient failure, backing off before retry"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itintern_events_domain::EventBusError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn unreachable_error() -> EventBusError {
        EventBusError::BrokerUnreachable("connection refused".into())
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_schedule_is_exponential() {
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result = RetryPolicy::new(10)
            .run(EventBusError::is_transient, || async {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= 2 {
                    Err(unreachable_error())
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        // Two failures: 2^1 + 2^2 seconds of virtual time.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_are_attempted_exactly_once() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), EventBusError> = RetryPolicy::new(10)
            .run(EventBusError::is_transient, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(EventBusError::Serialization(
                    serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
                ))
            })
            .await;

        assert!(matches!(result, Err(EventBusError::Serialization(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_the_last_error() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), EventBusError> = RetryPolicy::new(3)
            .run(EventBusError::is_transient, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(unreachable_error())
            })
            .await;

        assert!(matches!(result, Err(EventBusError::BrokerUnreachable(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn eventual_success_after_transient_failures() {
        let attempts = AtomicU32::new(0);

        let result = RetryPolicy::default()
            .run(EventBusError::is_transient, || async {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 5 {
                    Err(unreachable_error())
                } else {
                    Ok("published")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "published");
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }
}
