use anyhow::Error;
use log::warn;
use std::thread;
use std::time::Duration;

use crate::service::is_transient;

/// Exponential backoff for transient service failures.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        self.initial_backoff.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or attempts run out.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < max_attempts && is_transient(&e) => {
                    let wait = self.backoff(attempt);
                    warn!("{} failed (attempt {}/{}): {:#}; retrying in {:?}", what, attempt, max_attempts, e, wait);
                    thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => return Err(e.context(format!("{} failed after {} attempt(s)", what, attempt))),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::service::TransientError;
    use anyhow::format_err;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::ZERO,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_grows() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            multiplier: 3.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(300));
        assert_eq!(policy.backoff(3), Duration::from_millis(900));
    }

    #[test]
    fn test_retries_transient() {
        let mut calls = 0;
        let res = quick(3).run("flaky", || {
            calls += 1;
            if calls < 3 {
                Err(TransientError("timeout".to_string()).into())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(res.unwrap(), 3);
    }

    #[test]
    fn test_gives_up() {
        let mut calls = 0;
        let res: Result<(), _> = quick(2).run("down", || {
            calls += 1;
            Err(TransientError("503".to_string()).into())
        });
        assert!(res.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_permanent_not_retried() {
        let mut calls = 0;
        let res: Result<(), _> = quick(5).run("bad request", || {
            calls += 1;
            Err(format_err!("400"))
        });
        assert!(res.is_err());
        assert_eq!(calls, 1);
    }
}
