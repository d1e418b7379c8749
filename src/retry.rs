use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

/// Exponential backoff for remote page fetches: delays grow as
/// `base_delay * 2^(attempt - 1)` between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Runs `operation` up to `max_attempts` times, sleeping between failures.
/// Every error is retryable; the final error is propagated unchanged.
pub fn with_retry<T, E, F>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 1u32;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "network call failed (attempt {attempt}/{}): {err}",
                    policy.max_attempts
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => {
                error!("network call failed after {attempt} attempts: {err}");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0u32);
        let result: Result<u32, String> = with_retry(&fast_policy(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err("transient".to_string())
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn propagates_final_error_after_ceiling() {
        let calls = Cell::new(0u32);
        let result: Result<(), String> = with_retry(&fast_policy(), || {
            calls.set(calls.get() + 1);
            Err(format!("failure {}", calls.get()))
        });
        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn first_success_makes_one_call() {
        let calls = Cell::new(0u32);
        let result: Result<&str, String> = with_retry(&fast_policy(), || {
            calls.set(calls.get() + 1);
            Ok("done")
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }
}
