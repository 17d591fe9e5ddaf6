//! Linear backoff schedule for retried calls.

use std::time::Duration;

/// Wait schedule between attempts of one operation.
///
/// `next(n)` is `initial + increment * n`, clamped to `cap` when one is set.
/// The policy holds no state, so a single value can be shared by any number
/// of concurrent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    increment: Duration,
    cap: Option<Duration>,
}

impl BackoffPolicy {
    pub const fn new(initial: Duration, increment: Duration) -> Self {
        Self {
            initial,
            increment,
            cap: None,
        }
    }

    /// Same delay before every retry.
    pub const fn constant(delay: Duration) -> Self {
        Self::new(delay, Duration::ZERO)
    }

    pub const fn with_cap(self, cap: Duration) -> Self {
        Self {
            cap: Some(cap),
            ..self
        }
    }

    /// Schedule for describe/list calls: 3s, then +5s per retry, capped at 30s.
    pub const fn read() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(5)).with_cap(Duration::from_secs(30))
    }

    /// Schedule for create/update/delete calls: 3s, then +3s per retry, capped at 30s.
    pub const fn mutate() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(3)).with_cap(Duration::from_secs(30))
    }

    /// Schedule for tag/untag calls: 2s, then +1s per retry, capped at 10s.
    pub const fn tagging() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(1)).with_cap(Duration::from_secs(10))
    }

    /// Delay to wait before retry number `attempt` (0 is the first retry).
    ///
    /// Attempt indices are unsigned, so there is no negative index to reject.
    /// Arithmetic saturates at `Duration::MAX` rather than overflowing.
    pub fn next(&self, attempt: u32) -> Duration {
        let delay = self
            .initial
            .saturating_add(self.increment.saturating_mul(attempt));
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn increment(&self) -> Duration {
        self.increment
    }

    pub fn cap(&self) -> Option<Duration> {
        self.cap
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::read()
    }
}
