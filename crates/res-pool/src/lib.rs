//! Fixed-identity resource pools with FIFO admission control.
//!
//! Scarce resources (queue entries, buffers, address handles) come from a
//! closed set. When a caller cannot get what it needs right away it may
//! queue a [`Request`]; queued requests are then served strictly in arrival
//! order as resources come back, optionally a few items at a time.
//!
//! - [`FreePool`]: a stack of free items plus the request queue.
//! - [`ResMgr`]: a [`FreePool`] that also owns the items, handing out
//!   generational [`ItemHandle`]s instead of the items themselves.
//! - [`ReqMgr`]: the same admission protocol for resources tracked
//!   elsewhere; availability comes from a caller-supplied counter.
//! - [`GrowPool`]: a pool that builds items on demand through an
//!   [`ItemLifecycle`]. [`ReqMgr`] keeps its request records in one.
//!
//! None of these lock internally. Wrap an instance in a mutex and hold it
//! across a `check` + `queue_request` pair, otherwise a resource freed in
//! between can be missed by the queued request.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use fm_support::{AllocationContext, clock::ManualClock};
//! use res_pool::{Request, ResMgr};
//!
//! let mut mgr: ResMgr<[u8; 32], &str> = ResMgr::new(
//!     2,
//!     AllocationContext::tagged(*b"ires"),
//!     Arc::new(ManualClock::default()),
//! )
//! .unwrap();
//!
//! let a = mgr.get().unwrap();
//! let b = mgr.get().unwrap();
//! assert_eq!(mgr.check(1, false), 0);
//! mgr.queue_request(Request::new(1, "rx", "ring 0")).unwrap();
//!
//! mgr.put(a).unwrap();
//! let request = mgr.dequeue_request().unwrap();
//! assert_eq!(*request.context1(), "rx");
//! let granted = mgr.get().unwrap();
//!
//! mgr.put(granted).unwrap();
//! mgr.put(b).unwrap();
//! assert_eq!(mgr.free_count(), 2);
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::collections::TryReserveError;

use fm_support::Location;
use snafu::Snafu;

pub use self::{
    arena::ItemHandle,
    free_pool::FreePool,
    grow_pool::{GrowPool, GrowPoolConfig},
    lifecycle::{DefaultLifecycle, InitError, ItemLifecycle},
    req_mgr::{GetMode, GetOutcome, ReqMgr, ResumeOutcome},
    request::{Rejected, Request, RequestCallback},
    res_mgr::ResMgr,
};

mod arena;
mod free_pool;
mod grow_pool;
mod lifecycle;
mod req_mgr;
mod request;
mod res_mgr;

/// Errors returned by [`FreePool`] and [`ResMgr`].
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum PoolError {
    #[snafu(display("no memory for {what}"))]
    OutOfMemory {
        what: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to initialize pool items"))]
    Init {
        source: InitError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("handle does not name a handed-out item"))]
    StaleHandle {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pool has been destroyed"))]
    Destroyed {
        #[snafu(implicit)]
        location: Location,
    },
}

/// Errors returned by [`GrowPool`].
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum GrowPoolError {
    #[snafu(display("no memory for {count} more items"))]
    OutOfMemory {
        count: usize,
        source: TryReserveError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to initialize a new item"))]
    Init {
        source: InitError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Errors returned by [`ReqMgr`].
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ReqMgrError {
    #[snafu(display("{requested} resources requested, {available} available"))]
    Insufficient {
        requested: u32,
        available: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no memory for {what}"))]
    OutOfMemory {
        what: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to set up request records"))]
    Records {
        source: GrowPoolError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("request manager has been destroyed"))]
    Destroyed {
        #[snafu(implicit)]
        location: Location,
    },
}

impl ReqMgrError {
    /// Whether the request failed only because resources are short.
    #[must_use]
    pub fn is_insufficient(&self) -> bool {
        matches!(self, Self::Insufficient { .. })
    }
}
