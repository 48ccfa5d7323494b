//! Power-of-two heap over a fixed, pre-reserved arena.
//!
//! [`HeapManager`] hands out blocks of a byte range it does not own, such as
//! adapter-local memory. It only tracks offsets: the arena is described by a
//! base address and a capacity, and every allocation comes back as a
//! [`BlockHandle`] carrying the effective address `base + offset`.
//!
//! # Algorithm
//!
//! Blocks are always `1 << k` bytes for a size class `k` in `0..32`, and
//! never smaller than the configured minimum block size. There is one free
//! list per size class. An allocation of class `k` is served by, in order:
//!
//! 1. **Reuse**: pop the head of free list `k`.
//! 2. **Grow**: carve one new block from the untouched tail of the arena.
//! 3. **Split**: take a block from the class `>= k` with the most free
//!    blocks, carve it into `2^(j - k)` blocks of class `k`, and put them all
//!    on free list `k`.
//!
//! Freed blocks go back on their free list. When the freed block is the last
//! one in address order, trailing blocks that are neither in use nor
//! preallocated are handed back to the untouched tail (shrink). Freed halves
//! of a split are never merged with their siblings; fragmentation from
//! adversarial patterns accumulates until the blocks become trailing.
//!
//! Running out is an ordinary outcome: [`AllocError::Exhausted`] is returned
//! and a warning is logged at most once per interval per heap.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use fm_support::{AllocationContext, clock::ManualClock};
//! use heap_manager::{HeapConfig, HeapManager};
//!
//! let config = HeapConfig::new(64 * 1024, 64)
//!     .with_base_addr(0x8000_0000)
//!     .with_prealloc(12, 4)
//!     .with_name("sdma");
//! let heap = HeapManager::new(
//!     config,
//!     AllocationContext::tagged(*b"ihep"),
//!     Arc::new(ManualClock::default()),
//! )
//! .unwrap();
//!
//! let block = heap.allocate(100).unwrap();
//! assert_eq!(block.size(), 128);
//! assert!(block.addr() >= 0x8000_0000);
//!
//! heap.inc_ref(&block);
//! assert!(heap.deallocate(&block).is_err()); // still shared
//! heap.dec_ref(&block).unwrap();
//! heap.deallocate(&block).unwrap();
//!
//! assert_eq!(heap.available(), heap.max_memory());
//! ```
//!
//! # Locking
//!
//! All free-list and chain manipulation happens under one internal spin
//! lock, so a `HeapManager` can be shared freely. Reference counts are
//! atomics reachable from the handle and can be adjusted without the lock.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use fm_support::Location;
use snafu::Snafu;

pub use self::{
    block::{BlockFlags, BlockId},
    config::HeapConfig,
    heap::{BlockHandle, HeapManager},
    size_class::{NUM_CLASSES, SizeClass},
    summary::HeapSummary,
};

mod block;
mod config;
mod heap;
pub mod size_class;
mod summary;

/// Errors raised while building a [`HeapManager`].
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum HeapInitError {
    #[snafu(display("minimum block size {block_size:#x} is not a power of two below 2^32"))]
    InvalidBlockSize {
        block_size: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena of {capacity:#x} bytes at {base_addr:#x} runs past the address space"))]
    ArenaOverflow {
        base_addr: u64,
        capacity: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "no metadata for preallocating {count} blocks of {block_size:#x} bytes"
    ))]
    PreallocMetadata {
        block_size: u64,
        count: u32,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Errors returned by [`HeapManager::allocate`].
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum AllocError {
    #[snafu(display("request of {size:#x} bytes is beyond the largest size class"))]
    TooLarge {
        size: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no free block of {size:#x} bytes"))]
    Exhausted {
        size: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap has been destroyed"))]
    Destroyed {
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    /// Whether retrying later might succeed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Errors returned by [`HeapManager::deallocate`], [`HeapManager::release`]
/// and [`HeapManager::dec_ref`].
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum DeallocError {
    #[snafu(display("block is still referenced ({refcount} references)"))]
    Busy {
        refcount: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("dropping the last reference needs a deallocation"))]
    LastReference {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("handle does not name a live allocation"))]
    StaleHandle {
        #[snafu(implicit)]
        location: Location,
    },
}

impl DeallocError {
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    #[must_use]
    pub fn is_last_reference(&self) -> bool {
        matches!(self, Self::LastReference { .. })
    }
}
