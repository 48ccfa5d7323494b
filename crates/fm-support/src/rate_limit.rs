//! Once-per-interval gating for exhaustion diagnostics.
//!
//! Running out of heap or pool entries is expected under load. Logging every
//! failure would flood the log exactly when the system is busiest, so each
//! allocator instance owns an [`ExhaustionLog`] that lets at most one message
//! through per interval.

use alloc::sync::Arc;
use core::fmt;

use crate::clock::Clock;

/// Remembers when a message was last let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiter {
    interval_secs: u64,
    last: Option<u64>,
}

impl RateLimiter {
    /// Ten minutes, the historic limit for heap allocation failures.
    pub const DEFAULT_INTERVAL_SECS: u64 = 10 * 60;

    #[must_use]
    pub const fn new(interval_secs: u64) -> Self {
        Self {
            interval_secs,
            last: None,
        }
    }

    #[must_use]
    pub const fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    /// Returns `true` if a message may be emitted at `now`, and records `now`
    /// as the last emission if so.
    ///
    /// The first call always passes. Afterwards a call passes only once
    /// strictly more than the interval has elapsed.
    pub fn check(&mut self, now: u64) -> bool {
        match self.last {
            Some(last) if now.saturating_sub(last) <= self.interval_secs => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL_SECS)
    }
}

/// A [`RateLimiter`] bound to a clock, emitting through `log::warn!`.
#[derive(Clone)]
pub struct ExhaustionLog {
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    suppressed: u64,
}

impl ExhaustionLog {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_interval(clock, RateLimiter::DEFAULT_INTERVAL_SECS)
    }

    #[must_use]
    pub fn with_interval(clock: Arc<dyn Clock>, interval_secs: u64) -> Self {
        Self {
            clock,
            limiter: RateLimiter::new(interval_secs),
            suppressed: 0,
        }
    }

    /// Decides whether a message may go out now.
    ///
    /// Returns the number of messages suppressed since the previous one when
    /// the caller should emit, or `None` when it should stay quiet. Useful
    /// when the message has to be logged after dropping a lock.
    pub fn admit(&mut self) -> Option<u64> {
        if self.limiter.check(self.clock.now_secs()) {
            Some(core::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }

    /// Logs `args` at warn level unless a message went out within the
    /// interval. Returns whether the message was emitted.
    pub fn report(&mut self, args: fmt::Arguments<'_>) -> bool {
        match self.admit() {
            Some(0) => {
                log::warn!("{args}");
                true
            }
            Some(suppressed) => {
                log::warn!("{args} ({suppressed} similar messages suppressed)");
                true
            }
            None => false,
        }
    }

    /// Number of messages dropped since the last one that went out.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

impl fmt::Debug for ExhaustionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExhaustionLog")
            .field("now", &self.clock.now_secs())
            .field("limiter", &self.limiter)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}
