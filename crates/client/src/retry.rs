//! Bounded retry with exponential backoff for REST calls.

use std::future::Future;
use std::time::Duration;

use codeclass_shared::ApiError;

/// How often and how patiently a failed request is retried
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the `retry`-th failure (0-based): 1s, 2s, 4s, ...
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(retry as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

/// The last error seen and how many attempts were spent on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub error: ApiError,
    pub attempts: u32,
}

/// Run `call` until it succeeds, fails terminally, or runs out of attempts.
///
/// Only transient errors (network, 5xx) are retried. A 4xx comes back after
/// the attempt that produced it.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut call: F) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let error = match call().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_transient() {
            crate::log_warn!("{} rejected: {}", label, error);
            return Err(RetryFailure { error, attempts: attempt });
        }

        if attempt >= max_attempts {
            crate::log_error!("{} failed after {} attempts: {}", label, attempt, error);
            return Err(RetryFailure { error, attempts: attempt });
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        crate::log_warn!(
            "{} failed (attempt {}/{}): {}. Retrying in {}ms",
            label,
            attempt,
            max_attempts,
            error,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn deserialize_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), "load", || {
            calls += 1;
            async { Err(ApiError::Deserialize("bad json".into())) }
        })
        .await;

        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_then_success() {
        let mut calls = 0;
        let result = with_retry(&RetryPolicy::default(), "load", || {
            calls += 1;
            let current = calls;
            async move {
                if current < 2 {
                    Err(ApiError::Http { status: 502, body: String::new() })
                } else {
                    Ok(current)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
    }
}
