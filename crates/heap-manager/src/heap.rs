use alloc::{string::String, sync::Arc};
use core::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use fm_support::{AllocationContext, ExhaustionLog, clock::Clock};
use snafu::ensure;
use spin::Mutex;

use crate::{
    AllocError, DeallocError, HeapConfig, HeapInitError,
    alloc_error::{DestroyedSnafu, ExhaustedSnafu, TooLargeSnafu},
    dealloc_error::{BusySnafu, LastReferenceSnafu, StaleHandleSnafu},
    heap_init_error::{ArenaOverflowSnafu, InvalidBlockSizeSnafu, PreallocMetadataSnafu},
    block::{Block, BlockDirectory, BlockFlags, BlockId, NoMetadata},
    size_class::{NUM_CLASSES, SizeClass},
    summary::HeapSummary,
};

/// A live allocation returned by [`HeapManager::allocate`].
///
/// The handle is an index into the heap's block directory, not the memory
/// itself. It stays valid until the allocation is given back; afterwards
/// every operation on it reports [`DeallocError::StaleHandle`] even if the
/// same block is handed out again.
#[derive(Clone)]
pub struct BlockHandle {
    id: BlockId,
    addr: u64,
    size: u64,
    refcount: Arc<AtomicU32>,
}

impl BlockHandle {
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Effective address: heap base address plus the block offset.
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Block size in bytes, a power of two.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Decrements the count unless it is the last reference.
    fn drop_shared_ref(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 1).then(|| count - 1)
            })
            .is_ok()
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle")
            .field("id", &self.id)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &format_args!("{:#x}", self.size))
            .field("refcount", &self.ref_count())
            .finish()
    }
}

/// Why carving a new block from the untouched tail failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrowError {
    Arena,
    Metadata,
}

impl From<NoMetadata> for GrowError {
    fn from(NoMetadata: NoMetadata) -> Self {
        Self::Metadata
    }
}

/// Why no larger block could be split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitError {
    NothingFree,
    Metadata,
}

#[derive(Debug)]
struct HeapState {
    max_memory: u64,
    /// Offset of the first byte never carved into a block.
    cur_offset: u64,
    /// Bytes held by in-use blocks.
    in_use: u64,
    blocks: BlockDirectory,
    exhaustion: ExhaustionLog,
    destroyed: bool,
}

impl HeapState {
    fn untouched(&self) -> u64 {
        self.max_memory - self.cur_offset
    }

    /// Carves `count` blocks of `class` from the untouched tail onto its
    /// free list. Blocks carved before a failure stay carved.
    fn grow(&mut self, class: SizeClass, count: u32, flags: BlockFlags) -> Result<(), GrowError> {
        let fits = self.untouched() / class.size();
        self.blocks.try_reserve(fits.min(u64::from(count)) as usize)?;
        for _ in 0..count {
            if self.untouched() < class.size() {
                return Err(GrowError::Arena);
            }
            let id = self.blocks.insert(Block::new(class, self.cur_offset, flags))?;
            self.cur_offset += class.size();
            self.blocks.push_back(id.index());
            self.blocks.push_free(id.index());
        }
        log::trace!(
            "grew {count} blocks of {:#x} bytes, offset now {:#x}",
            class.size(),
            self.cur_offset
        );
        Ok(())
    }

    /// Breaks one block from the fullest free list at or above `target`
    /// into blocks of class `target`, all placed on the `target` free list.
    fn split(&mut self, target: SizeClass) -> Result<(), SplitError> {
        let mut fullest: Option<(SizeClass, u32)> = None;
        for class in target.and_larger() {
            let count = self.blocks.free_count(class);
            if count > fullest.map_or(0, |(_, max)| max) {
                fullest = Some((class, count));
            }
        }
        let Some((from, _)) = fullest else {
            return Err(SplitError::NothingFree);
        };
        assert!(from > target, "splitting into a class that has free blocks");

        let pieces = 1_usize << (from.log2() - target.log2());
        self.blocks
            .try_reserve(pieces)
            .map_err(|NoMetadata| SplitError::Metadata)?;

        let source = self
            .blocks
            .pop_free(from)
            .expect("free list count and contents disagree");
        let (base, flags) = {
            let block = self.blocks.get(source);
            (block.offset, block.flags)
        };
        debug_assert!(!flags.contains(BlockFlags::IN_USE));

        let mut first = None;
        let mut prev = None;
        for i in 0..pieces as u64 {
            let offset = base + i * target.size();
            let id = self
                .blocks
                .insert(Block::new(target, offset, flags))
                .expect("metadata reserved before splitting");
            let index = id.index();
            match prev {
                Some(prev) => self.blocks.link_pair(prev, index),
                None => first = Some(index),
            }
            prev = Some(index);
            self.blocks.push_free(index);
        }
        let (Some(first), Some(last)) = (first, prev) else {
            unreachable!("a split always yields at least two blocks");
        };
        self.blocks.replace_in_chain(source, first, last);
        self.blocks.remove(source);

        log::trace!(
            "split a {:#x} byte block into {pieces} blocks of {:#x} bytes",
            from.size(),
            target.size()
        );
        Ok(())
    }

    /// Returns trailing blocks that are neither in use nor preallocated to
    /// the untouched tail of the arena.
    fn shrink(&mut self) {
        while let Some(last) = self.blocks.last() {
            let block = self.blocks.get(last);
            if block
                .flags
                .intersects(BlockFlags::PREALLOCATED | BlockFlags::IN_USE)
            {
                break;
            }
            assert!(block.is_free(), "idle block missing from its free list");
            let size = block.size();
            self.blocks.unlink_free(last);
            self.blocks.pop_back();
            self.blocks.remove(last);
            self.cur_offset -= size;
        }
        log::trace!("shrank heap, offset now {:#x}", self.cur_offset);
    }

    /// Pops a free block of `class`, growing or splitting if needed.
    fn take_free(&mut self, class: SizeClass) -> Option<u32> {
        if let Some(index) = self.blocks.pop_free(class) {
            return Some(index);
        }
        if self.grow(class, 1, BlockFlags::empty()).is_ok() {
            return self.blocks.pop_free(class);
        }
        match self.split(class) {
            Ok(()) => self.blocks.pop_free(class),
            Err(SplitError::NothingFree) => None,
            Err(SplitError::Metadata) => {
                log::debug!("no metadata for splitting into {:#x} byte blocks", class.size());
                None
            }
        }
    }
}

/// A segregated-size-class allocator over a fixed arena.
///
/// See the [crate documentation](crate) for the allocation strategy.
pub struct HeapManager {
    name: String,
    ctx: AllocationContext,
    base_addr: u64,
    max_memory: u64,
    min_class: SizeClass,
    state: Mutex<HeapState>,
}

impl HeapManager {
    /// Builds a heap and carves the preallocated blocks of `config`.
    ///
    /// Preallocation runs from the largest class down. A class that no
    /// longer fits in the arena is logged and skipped, keeping whatever part
    /// of it fit; only failing to reserve block metadata is an error.
    pub fn new(
        config: HeapConfig,
        ctx: AllocationContext,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HeapInitError> {
        let HeapConfig {
            name,
            base_addr,
            capacity,
            block_size,
            prealloc,
            rate_limit_secs,
        } = config;

        ensure!(
            block_size.is_power_of_two(),
            InvalidBlockSizeSnafu { block_size }
        );
        let Some(min_class) = SizeClass::fitting(block_size) else {
            return InvalidBlockSizeSnafu { block_size }.fail();
        };
        ensure!(
            base_addr.checked_add(capacity).is_some(),
            ArenaOverflowSnafu {
                base_addr,
                capacity
            }
        );

        let mut state = HeapState {
            max_memory: capacity,
            cur_offset: 0,
            in_use: 0,
            blocks: BlockDirectory::new(),
            exhaustion: ExhaustionLog::with_interval(clock, rate_limit_secs),
            destroyed: false,
        };

        for class in min_class.and_larger().rev() {
            let count = prealloc[class.index()];
            if count == 0 {
                continue;
            }
            match state.grow(class, count, BlockFlags::PREALLOCATED) {
                Ok(()) => {}
                Err(GrowError::Arena) => log::error!(
                    "heap {name} [{ctx}]: initial allocation of {count} blocks of {:#x} bytes does not fit",
                    class.size()
                ),
                Err(GrowError::Metadata) => {
                    return PreallocMetadataSnafu {
                        block_size: class.size(),
                        count,
                    }
                    .fail();
                }
            }
        }

        log::debug!(
            "heap {name} [{ctx}]: {capacity:#x} bytes at {base_addr:#x}, {:#x} preallocated",
            state.cur_offset
        );

        Ok(Self {
            name,
            ctx,
            base_addr,
            max_memory: capacity,
            min_class,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn context(&self) -> AllocationContext {
        self.ctx
    }

    #[must_use]
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// Smallest block size handed out.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.min_class.size()
    }

    /// Total arena size.
    #[must_use]
    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    /// Bytes not held by an in-use block.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.max_memory - self.state.lock().in_use
    }

    /// Bytes held by in-use blocks.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.state.lock().in_use
    }

    /// Bytes at the end of the arena that were never carved, or were given
    /// back by a shrink.
    #[must_use]
    pub fn untouched(&self) -> u64 {
        self.state.lock().untouched()
    }

    /// Offset of the first uncarved byte.
    #[must_use]
    pub fn cur_offset(&self) -> u64 {
        self.state.lock().cur_offset
    }

    /// Number of blocks on the free list of `class`.
    #[must_use]
    pub fn free_count(&self, class: SizeClass) -> u32 {
        self.state.lock().blocks.free_count(class)
    }

    /// Number of carved blocks, free or in use.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.live()
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// The request is rounded up to the minimum block size and then to a
    /// power of two. A zero-sized request gets a minimum-sized block. The
    /// returned handle holds one reference.
    pub fn allocate(&self, size: u64) -> Result<BlockHandle, AllocError> {
        let size = size.max(self.block_size());
        let Some(class) = SizeClass::fitting(size) else {
            return TooLargeSnafu { size }.fail();
        };
        // Allocated before taking the lock so the critical section never
        // touches the global allocator for the counter.
        let refcount = Arc::new(AtomicU32::new(1));

        let mut state = self.state.lock();
        ensure!(!state.destroyed, DestroyedSnafu);

        let Some(index) = state.take_free(class) else {
            let admitted = state.exhaustion.admit();
            drop(state);
            if let Some(suppressed) = admitted {
                log::warn!(
                    "heap {} [{}]: allocation of {:#x} bytes failed ({suppressed} failures suppressed)",
                    self.name,
                    self.ctx,
                    class.size()
                );
            }
            return ExhaustedSnafu {
                size: class.size(),
            }
            .fail();
        };

        let id = state.blocks.renew(index);
        let block = state.blocks.get_mut(index);
        debug_assert_eq!(block.class, class);
        block.flags.insert(BlockFlags::IN_USE);
        block.refcount = Some(Arc::clone(&refcount));
        let offset = block.offset;
        state.in_use += class.size();

        Ok(BlockHandle {
            id,
            addr: self.base_addr + offset,
            size: class.size(),
            refcount,
        })
    }

    /// Adds a reference to `handle`. Does not take the heap lock.
    pub fn inc_ref(&self, handle: &BlockHandle) {
        handle.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference that was added with [`inc_ref`](Self::inc_ref).
    /// Does not take the heap lock.
    ///
    /// The last reference is never dropped here: the call fails with
    /// [`DeallocError::LastReference`] and leaves the count at 1, so the
    /// block can still be given back with [`release`](Self::release) or
    /// [`deallocate`](Self::deallocate).
    pub fn dec_ref(&self, handle: &BlockHandle) -> Result<(), DeallocError> {
        if !handle.drop_shared_ref() {
            log::warn!("heap {}: dec_ref of the last reference to {handle:?}", self.name);
            return LastReferenceSnafu.fail();
        }
        Ok(())
    }

    /// Current reference count of `handle`.
    #[must_use]
    pub fn ref_count(&self, handle: &BlockHandle) -> u32 {
        handle.ref_count()
    }

    /// Gives a block back to the heap.
    ///
    /// Only the last owner may do this: if other references are
    /// outstanding the call fails with [`DeallocError::Busy`] and changes
    /// nothing. On success the block goes back on its free list and, if it
    /// was the last block of the arena, trailing idle blocks are shrunk
    /// away.
    pub fn deallocate(&self, handle: &BlockHandle) -> Result<(), DeallocError> {
        let mut state = self.state.lock();
        let Some(index) = state.blocks.resolve(handle.id) else {
            return StaleHandleSnafu.fail();
        };
        let block = state.blocks.get_mut(index);
        ensure!(block.flags.contains(BlockFlags::IN_USE), StaleHandleSnafu);

        let refcount = block.refcount();
        if refcount != 1 {
            let name = &self.name;
            log::warn!("heap {name}: {handle:?} freed with {refcount} references held");
            return BusySnafu { refcount }.fail();
        }

        block.flags.remove(BlockFlags::IN_USE);
        block.refcount = None;
        let size = block.size();
        let preallocated = block.flags.contains(BlockFlags::PREALLOCATED);
        state.in_use -= size;
        state.blocks.push_free(index);

        if state.blocks.last() == Some(index) && !preallocated {
            state.shrink();
        }
        Ok(())
    }

    /// Drops one reference, deallocating the block if it was the last one.
    pub fn release(&self, handle: &BlockHandle) -> Result<(), DeallocError> {
        if handle.drop_shared_ref() {
            return Ok(());
        }
        self.deallocate(handle)
    }

    /// Snapshot of the heap counters and free lists.
    #[must_use]
    pub fn summary(&self) -> HeapSummary {
        let state = self.state.lock();
        let mut free_counts = [0; NUM_CLASSES];
        for class in SizeClass::MIN.and_larger() {
            free_counts[class.index()] = state.blocks.free_count(class);
        }
        HeapSummary {
            name: self.name.clone(),
            tag: self.ctx.tag(),
            min_class: self.min_class,
            max_memory: self.max_memory,
            used: state.in_use,
            cur_offset: state.cur_offset,
            blocks: state.blocks.live(),
            free_counts,
        }
    }

    /// Drops all block metadata.
    ///
    /// Returns the number of bytes still held by in-use blocks, which are
    /// reported as leaked. Outstanding handles become stale. Calling this
    /// again does nothing and returns 0.
    pub fn destroy(&self) -> u64 {
        let mut state = self.state.lock();
        if state.destroyed {
            return 0;
        }
        state.destroyed = true;
        state.blocks = BlockDirectory::new();
        let leaked = state.in_use;
        drop(state);

        if leaked != 0 {
            log::warn!("heap {} [{}] leaked: {leaked:#x} bytes", self.name, self.ctx);
        }
        leaked
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}

impl Drop for HeapManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for HeapManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HeapManager")
            .field("name", &self.name)
            .field("ctx", &self.ctx)
            .field("max_memory", &self.max_memory)
            .field("in_use", &state.in_use)
            .field("cur_offset", &state.cur_offset)
            .field("blocks", &state.blocks.live())
            .finish_non_exhaustive()
    }
}
