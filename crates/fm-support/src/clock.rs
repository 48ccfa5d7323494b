//! Seconds clocks used to gate diagnostics.
//!
//! The allocators only ever ask "how many seconds have passed", so the trait
//! is a single method returning a monotonic second counter. Production code
//! uses [`SystemClock`] (with the `std` feature); tests use [`ManualClock`]
//! and move time forward explicitly.

use core::sync::atomic::{AtomicU64, Ordering};

/// A monotonic source of whole seconds.
pub trait Clock: Send + Sync {
    /// Returns the current timestamp in seconds.
    ///
    /// Only differences between two readings are meaningful.
    fn now_secs(&self) -> u64;
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start_secs: u64) -> Self {
        Self {
            secs: AtomicU64::new(start_secs),
        }
    }

    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::Relaxed);
    }

    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(Ordering::Relaxed)
    }
}

/// Wall-clock backed [`Clock`], counting seconds since construction.
#[cfg(any(test, feature = "std"))]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: std::time::Instant,
}

#[cfg(any(test, feature = "std"))]
impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "std"))]
impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(5);
        assert_eq!(clock.now_secs(), 5);
        clock.advance(10);
        assert_eq!(clock.now_secs(), 15);
        clock.set(1);
        assert_eq!(clock.now_secs(), 1);
    }

    #[test]
    fn test_manual_clock_as_trait_object() {
        let clock: alloc::sync::Arc<dyn Clock> = alloc::sync::Arc::new(ManualClock::default());
        assert_eq!(clock.now_secs(), 0);
    }

    #[test]
    fn test_system_clock_counts_from_construction() {
        let clock = SystemClock::new();
        let first = clock.now_secs();
        assert!(first <= 1);
        assert!(clock.now_secs() >= first);

        let clock: alloc::sync::Arc<dyn Clock> = alloc::sync::Arc::new(SystemClock::default());
        assert!(clock.now_secs() <= 1);
    }
}
