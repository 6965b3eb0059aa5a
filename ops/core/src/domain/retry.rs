// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Bounded retry helper shared by health recovery, restore verification and
//! image updates.
//!
//! The loop shape follows the supervisor: attempt, evaluate, wait, repeat until
//! the predicate accepts a result or the attempt budget is spent.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after each failed attempt, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// Result of a retried operation: the last value produced and whether it was accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub succeeded: bool,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { initial, max },
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    /// Run `op` until `accept` returns true or `max_attempts` is reached.
    pub async fn run<T, F, Fut, P>(&self, mut op: F, mut accept: P) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        P: FnMut(&T) -> bool,
    {
        let mut attempt = 1;
        loop {
            let value = op(attempt).await;
            if accept(&value) {
                return RetryOutcome {
                    value,
                    attempts: attempt,
                    succeeded: true,
                };
            }
            if attempt >= self.max_attempts {
                return RetryOutcome {
                    value,
                    attempts: attempt,
                    succeeded: false,
                };
            }
            let delay = self.delay_after(attempt);
            debug!(attempt, max = self.max_attempts, ?delay, "Attempt rejected, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_stops_at_first_accepted_value() {
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let outcome = policy.run(|attempt| async move { attempt }, |v| *v == 3).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.value, 3);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let outcome = policy
            .run(
                |_| {
                    calls.set(calls.get() + 1);
                    async { false }
                },
                |ok| *ok,
            )
            .await;
        assert!(!outcome.succeeded);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts, 1);
    }
}
