//! Retry policies.
//!
//! A policy is a pure decision: given how many retries have already happened and how
//! long the caller has been trying, return the delay before the next attempt or `None`
//! to give up. Policies never sleep themselves; the retry loop and the background
//! scheduler apply the delay (see [`allow_retry`]).
//!
//! Attempt semantics: `retry_count` is `0` when the first failure is being judged, so a
//! policy that returns `Some` for counts `0..n` permits `n` retries (`n + 1` attempts).
//!
//! ```rust
//! use std::time::Duration;
//! use sessionkeeper::retry_policy::{RetryOneTime, RetryPolicy};
//!
//! let policy = RetryOneTime::new(Duration::from_millis(10));
//! assert!(policy.retry_delay(0, Duration::ZERO).is_some());
//! assert!(policy.retry_delay(1, Duration::ZERO).is_none());
//! ```

use crate::sleeper::Sleeper;
use rand::{rng, Rng};
use std::fmt;
use std::time::Duration;

/// Highest retry count an exponential policy may be configured with; beyond it the
/// shift in the sleep computation would overflow.
pub const MAX_RETRIES_LIMIT: u32 = 29;

/// Decides whether (and after how long) a failed operation may be retried.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Delay before the next attempt, or `None` when no further retries are allowed.
    fn retry_delay(&self, retry_count: u32, elapsed: Duration) -> Option<Duration>;
}

/// Consult `policy` and, when it allows a retry, sleep through `sleeper`.
pub async fn allow_retry(
    policy: &dyn RetryPolicy,
    retry_count: u32,
    elapsed: Duration,
    sleeper: &dyn Sleeper,
) -> bool {
    match policy.retry_delay(retry_count, elapsed) {
        Some(delay) => {
            sleeper.sleep(delay).await;
            true
        }
        None => false,
    }
}

/// Retry up to `n` times with a fixed sleep between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNTimes {
    n: u32,
    sleep_between: Duration,
}

impl RetryNTimes {
    pub fn new(n: u32, sleep_between: Duration) -> Self {
        Self { n, sleep_between }
    }
}

impl RetryPolicy for RetryNTimes {
    fn retry_delay(&self, retry_count: u32, _elapsed: Duration) -> Option<Duration> {
        (retry_count < self.n).then_some(self.sleep_between)
    }
}

/// Retry exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOneTime(RetryNTimes);

impl RetryOneTime {
    pub fn new(sleep_between: Duration) -> Self {
        Self(RetryNTimes::new(1, sleep_between))
    }
}

impl RetryPolicy for RetryOneTime {
    fn retry_delay(&self, retry_count: u32, elapsed: Duration) -> Option<Duration> {
        self.0.retry_delay(retry_count, elapsed)
    }
}

/// Retry indefinitely with a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryForever {
    interval: Duration,
}

impl RetryForever {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl RetryPolicy for RetryForever {
    fn retry_delay(&self, _retry_count: u32, _elapsed: Duration) -> Option<Duration> {
        Some(self.interval)
    }
}

/// Retry until a total elapsed time has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryUntilElapsed {
    max_elapsed: Duration,
    sleep_between: Duration,
}

impl RetryUntilElapsed {
    pub fn new(max_elapsed: Duration, sleep_between: Duration) -> Self {
        Self { max_elapsed, sleep_between }
    }
}

impl RetryPolicy for RetryUntilElapsed {
    fn retry_delay(&self, _retry_count: u32, elapsed: Duration) -> Option<Duration> {
        (elapsed < self.max_elapsed).then_some(self.sleep_between)
    }
}

/// Randomised exponential backoff: the n-th retry sleeps
/// `base * random(1 ..= 2^(n+1) - 1)`, optionally capped at `max_sleep`.
///
/// `max_retries` above [`MAX_RETRIES_LIMIT`] is pinned to the limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoffRetry {
    base_sleep: Duration,
    max_retries: u32,
    max_sleep: Option<Duration>,
}

impl ExponentialBackoffRetry {
    /// Unbounded sleep, at most `max_retries` retries.
    pub fn new(base_sleep: Duration, max_retries: u32) -> Self {
        Self { base_sleep, max_retries: validate_max_retries(max_retries), max_sleep: None }
    }

    /// Like [`ExponentialBackoffRetry::new`] but never sleeps longer than `max_sleep`.
    pub fn bounded(base_sleep: Duration, max_sleep: Duration, max_retries: u32) -> Self {
        Self {
            base_sleep,
            max_retries: validate_max_retries(max_retries),
            max_sleep: Some(max_sleep),
        }
    }

    pub fn base_sleep(&self) -> Duration {
        self.base_sleep
    }

    /// Effective retry ceiling after pinning.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_sleep(&self) -> Option<Duration> {
        self.max_sleep
    }

    fn sleep_for(&self, retry_count: u32) -> Duration {
        let shift = retry_count.min(MAX_RETRIES_LIMIT - 1) + 1;
        let upper = 1u32 << shift;
        let factor = rng().random_range(0..upper).max(1);
        let sleep = self.base_sleep.saturating_mul(factor);
        match self.max_sleep {
            Some(max) if sleep > max => {
                tracing::warn!(
                    sleep = ?sleep,
                    max_sleep = ?max,
                    "sleep extension too large, using max sleep"
                );
                max
            }
            _ => sleep,
        }
    }
}

impl RetryPolicy for ExponentialBackoffRetry {
    fn retry_delay(&self, retry_count: u32, _elapsed: Duration) -> Option<Duration> {
        (retry_count < self.max_retries).then(|| self.sleep_for(retry_count))
    }
}

fn validate_max_retries(max_retries: u32) -> u32 {
    if max_retries > MAX_RETRIES_LIMIT {
        tracing::warn!(
            requested = max_retries,
            limit = MAX_RETRIES_LIMIT,
            "max_retries too large, pinning to limit"
        );
        MAX_RETRIES_LIMIT
    } else {
        max_retries
    }
}
