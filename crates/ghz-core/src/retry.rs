//! Bounded retry combinator.
//!
//! Calibration steps are retried a fixed number of times. [`retry`] makes the
//! number of attempts a first-class part of the result instead of a loop
//! counter that leaks out of a `while` body.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How many times to attempt an operation and how long to wait in between.
///
/// # Example
///
/// ```rust
/// use ghz_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::attempts(2).with_backoff(Duration::from_millis(10));
/// assert_eq!(policy.max_attempts, 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, delay: Duration) -> Self {
        self.backoff_delay = delay;
        self
    }
}

/// Outcome of a bounded retry: the value or the last error, plus tries used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T, E> {
    Succeeded { value: T, tries: u32 },
    Exhausted { last_error: E, tries: u32 },
}

impl<T, E> Attempt<T, E> {
    pub fn tries(&self) -> u32 {
        match self {
            Attempt::Succeeded { tries, .. } | Attempt::Exhausted { tries, .. } => *tries,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Attempt::Succeeded { .. })
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Attempt::Succeeded { value, .. } => Ok(value),
            Attempt::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Run `attempt` until it succeeds or the policy is exhausted.
///
/// The closure receives the zero-based attempt index, so callers can vary
/// the attempt (for example flip a clock polarity) without keeping their own
/// counter.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Attempt<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max = policy.max_attempts.max(1);
    let mut index = 0;
    loop {
        match attempt(index).await {
            Ok(value) => {
                return Attempt::Succeeded {
                    value,
                    tries: index + 1,
                }
            }
            Err(last_error) if index + 1 >= max => {
                return Attempt::Exhausted {
                    last_error,
                    tries: index + 1,
                }
            }
            Err(_) => {
                tracing::debug!(attempt = index + 1, max, "attempt failed, retrying");
                if !policy.backoff_delay.is_zero() {
                    sleep(policy.backoff_delay).await;
                }
                index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn fail_times(calls: &AtomicU32, failures: u32) -> Result<u32, String> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            Err(format!("failure {}", n))
        } else {
            Ok(n)
        }
    }

    #[tokio::test]
    async fn test_first_try_success() {
        let calls = AtomicU32::new(0);
        let outcome = retry(&RetryPolicy::attempts(3), |_| fail_times(&calls, 0)).await;
        assert_eq!(outcome, Attempt::Succeeded { value: 0, tries: 1 });
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let calls = AtomicU32::new(0);
        let outcome = retry(&RetryPolicy::attempts(3), |_| fail_times(&calls, 2)).await;
        assert_eq!(outcome.tries(), 3);
        assert_eq!(outcome.into_result(), Ok(2));
    }

    #[tokio::test]
    async fn test_exhausted_keeps_last_error() {
        let calls = AtomicU32::new(0);
        let outcome = retry(&RetryPolicy::attempts(2), |_| fail_times(&calls, 10)).await;
        assert_eq!(
            outcome,
            Attempt::Exhausted {
                last_error: "failure 1".to_string(),
                tries: 2
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let outcome = retry(&RetryPolicy::attempts(0), |_| fail_times(&calls, 10)).await;
        assert_eq!(outcome.tries(), 1);
    }

    #[tokio::test]
    async fn test_attempt_index_is_passed() {
        let mut seen = Vec::new();
        let outcome: Attempt<(), ()> = retry(&RetryPolicy::attempts(3), |i| {
            seen.push(i);
            async { Err(()) }
        })
        .await;
        assert!(!outcome.is_success());
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
