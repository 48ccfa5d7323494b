use alloc::string::String;

use fm_support::RateLimiter;

use crate::size_class::NUM_CLASSES;

/// Construction parameters for a [`HeapManager`](crate::HeapManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    pub(crate) name: String,
    pub(crate) base_addr: u64,
    pub(crate) capacity: u64,
    pub(crate) block_size: u64,
    pub(crate) prealloc: [u32; NUM_CLASSES],
    pub(crate) rate_limit_secs: u64,
}

impl HeapConfig {
    /// A heap of `capacity` bytes whose smallest block is `block_size`
    /// bytes. `block_size` must be a power of two.
    #[must_use]
    pub fn new(capacity: u64, block_size: u64) -> Self {
        Self {
            name: String::from("Unknown Heap Manager"),
            base_addr: 0,
            capacity,
            block_size,
            prealloc: [0; NUM_CLASSES],
            rate_limit_secs: RateLimiter::DEFAULT_INTERVAL_SECS,
        }
    }

    /// Address of offset 0 of the arena, added to every block offset to
    /// form the block's effective address.
    #[must_use]
    pub fn with_base_addr(mut self, base_addr: u64) -> Self {
        self.base_addr = base_addr;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds `count` blocks of `1 << log2_size` bytes to the initial sizing.
    ///
    /// Preallocated blocks are carved at construction and are never given
    /// back to the untouched tail of the arena. Classes below the minimum
    /// block size are ignored.
    ///
    /// # Panics
    ///
    /// Panics if `log2_size` is not below [`NUM_CLASSES`].
    #[must_use]
    pub fn with_prealloc(mut self, log2_size: u32, count: u32) -> Self {
        assert!(
            (log2_size as usize) < NUM_CLASSES,
            "size class {log2_size} out of range"
        );
        self.prealloc[log2_size as usize] += count;
        self
    }

    /// Minimum number of seconds between two exhaustion warnings.
    #[must_use]
    pub fn with_rate_limit(mut self, secs: u64) -> Self {
        self.rate_limit_secs = secs;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn prealloc_count(&self, log2_size: u32) -> u32 {
        self.prealloc.get(log2_size as usize).copied().unwrap_or(0)
    }
}
