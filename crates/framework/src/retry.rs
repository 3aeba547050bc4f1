//! Pluggable retry policies for connection-loss failures.
//!
//! A policy is a pure function of `(attempt, elapsed)`: no I/O, no shared
//! mutable state, safe to consult concurrently from any number of pending
//! operations. `attempt` is the zero-based index of the attempt that just
//! failed; `elapsed` is measured from the operation's *first* attempt, so
//! elapsed-time ceilings are absolute, never renewed by a retry.

use std::time::Duration;

use rand::Rng;

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redispatch the operation after the given pause.
    RetryAfter(Duration),
    /// Stop retrying; surface the last error to the caller.
    GiveUp,
}

/// Decides whether a failed attempt is retried, and with what backoff.
pub trait RetryPolicy: Send + Sync {
    fn allow_retry(&self, attempt: u32, elapsed: Duration) -> RetryDecision;
}

/// Retry a fixed number of times with a fixed pause.
///
/// `RetryNTimes::new(n, sleep)` permits exactly `n` retries: the initial
/// attempt plus `n` redispatches, each preceded by `sleep`.
#[derive(Clone, Copy, Debug)]
pub struct RetryNTimes {
    max_retries: u32,
    sleep: Duration,
}

impl RetryNTimes {
    #[must_use]
    pub const fn new(max_retries: u32, sleep: Duration) -> Self {
        Self { max_retries, sleep }
    }
}

impl RetryPolicy for RetryNTimes {
    fn allow_retry(&self, attempt: u32, _elapsed: Duration) -> RetryDecision {
        if attempt < self.max_retries {
            RetryDecision::RetryAfter(self.sleep)
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Retry exactly once.
#[derive(Clone, Copy, Debug)]
pub struct RetryOneTime {
    inner: RetryNTimes,
}

impl RetryOneTime {
    #[must_use]
    pub const fn new(sleep: Duration) -> Self {
        Self {
            inner: RetryNTimes::new(1, sleep),
        }
    }
}

impl RetryPolicy for RetryOneTime {
    fn allow_retry(&self, attempt: u32, elapsed: Duration) -> RetryDecision {
        self.inner.allow_retry(attempt, elapsed)
    }
}

/// Retry with randomized exponential backoff up to a sleep ceiling.
///
/// The pause before retry `k` is `base_sleep * random(1 ..= 2^(k+1))`,
/// capped at `max_sleep`.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoffRetry {
    base_sleep: Duration,
    max_retries: u32,
    max_sleep: Duration,
}

impl ExponentialBackoffRetry {
    #[must_use]
    pub const fn new(base_sleep: Duration, max_retries: u32, max_sleep: Duration) -> Self {
        Self {
            base_sleep,
            max_retries,
            max_sleep,
        }
    }
}

impl RetryPolicy for ExponentialBackoffRetry {
    fn allow_retry(&self, attempt: u32, _elapsed: Duration) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let exponent = attempt.saturating_add(1).min(30);
        let spread = 1_u64 << exponent;
        let factor = rand::thread_rng().gen_range(1..=spread);
        let sleep = self
            .base_sleep
            .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
            .min(self.max_sleep);
        RetryDecision::RetryAfter(sleep)
    }
}

/// Retry with a fixed pause until a total elapsed-time ceiling is reached.
#[derive(Clone, Copy, Debug)]
pub struct RetryUntilElapsed {
    max_elapsed: Duration,
    sleep: Duration,
}

impl RetryUntilElapsed {
    #[must_use]
    pub const fn new(max_elapsed: Duration, sleep: Duration) -> Self {
        Self { max_elapsed, sleep }
    }
}

impl RetryPolicy for RetryUntilElapsed {
    fn allow_retry(&self, _attempt: u32, elapsed: Duration) -> RetryDecision {
        if elapsed < self.max_elapsed {
            RetryDecision::RetryAfter(self.sleep)
        } else {
            RetryDecision::GiveUp
        }
    }
}
