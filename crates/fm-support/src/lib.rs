//! Shared plumbing for the fabric resource allocators.
//!
//! Nothing in here allocates resources by itself. The crate collects the
//! ambient pieces that `heap-manager` and `res-pool` both lean on:
//!
//! - [`Location`]: implicit call-site data attached to every `snafu` error.
//! - [`clock`]: an injectable seconds clock, so that rate limiting can be
//!   driven deterministically from tests.
//! - [`rate_limit`]: the once-per-interval gate used for exhaustion
//!   diagnostics, and [`ExhaustionLog`] which pairs it with a clock and the
//!   `log` facade.
//! - [`context`]: the explicit [`AllocationContext`] every allocator and pool
//!   is constructed with.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use fm_support::{ExhaustionLog, clock::ManualClock};
//!
//! let clock = Arc::new(ManualClock::new(100));
//! let mut log = ExhaustionLog::with_interval(clock.clone(), 60);
//!
//! assert!(log.report(format_args!("pool empty")));
//! assert!(!log.report(format_args!("pool empty")));
//!
//! clock.advance(61);
//! assert!(log.report(format_args!("pool empty")));
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod clock;
pub mod context;
mod location;
pub mod rate_limit;

pub use self::{
    context::{AllocFlags, AllocationContext, MemTag},
    location::Location,
    rate_limit::{ExhaustionLog, RateLimiter},
};
