//! Block directory.
//!
//! Every carved block of the arena has one [`Block`] record here. None of
//! the bookkeeping lives in the managed memory itself, so the arena may sit
//! somewhere slow to touch (device memory across a bus, for instance)
//! without slowing down the allocator.
//!
//! Records live in a slab of generational slots and are addressed by
//! [`BlockId`]. Each record sits on two intrusive lists threaded through
//! slot indices:
//!
//! - the address chain, doubly linked in arena offset order, whose tail is
//!   the block closest to the untouched end of the arena;
//! - the free list of its size class while it is not in use. A block is on
//!   exactly one free list, or on none while it is in use.

use alloc::{collections::TryReserveError, sync::Arc, vec::Vec};
use core::{
    array,
    sync::atomic::{AtomicU32, Ordering},
};

use bitflags::bitflags;

use crate::size_class::{NUM_CLASSES, SizeClass};

bitflags! {
    /// State bits of a [`Block`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        /// Carved during initial sizing; never returned to the untouched
        /// tail of the arena.
        const PREALLOCATED = 1 << 0;

        /// Handed out to a caller.
        const IN_USE = 1 << 1;
    }
}

/// Generational reference to a [`Block`] record.
///
/// The generation changes every time a slot is recycled, so an id kept
/// around after its block was shrunk away or split no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

impl BlockId {
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

/// Metadata for one carved block.
#[derive(Debug)]
pub(crate) struct Block {
    pub(crate) class: SizeClass,
    pub(crate) offset: u64,
    pub(crate) flags: BlockFlags,
    /// Present while the block is in use. Shared with every handle of the
    /// current allocation so that reference counting does not need the heap
    /// lock; a fresh counter is attached on every allocation.
    pub(crate) refcount: Option<Arc<AtomicU32>>,
    prev: Option<u32>,
    next: Option<u32>,
    free_prev: Option<u32>,
    free_next: Option<u32>,
    on_free_list: bool,
}

impl Block {
    pub(crate) fn new(class: SizeClass, offset: u64, flags: BlockFlags) -> Self {
        Self {
            class,
            offset,
            flags,
            refcount: None,
            prev: None,
            next: None,
            free_prev: None,
            free_next: None,
            on_free_list: false,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.class.size()
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount
            .as_ref()
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    pub(crate) fn is_free(&self) -> bool {
        self.on_free_list
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    block: Option<Block>,
}

/// Head, tail and length of one size-class free list.
#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    head: Option<u32>,
    tail: Option<u32>,
    count: u32,
}

/// Slab of block records plus the lists threaded through them.
#[derive(Debug)]
pub(crate) struct BlockDirectory {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    first: Option<u32>,
    last: Option<u32>,
    buckets: [Bucket; NUM_CLASSES],
    live: usize,
}

/// Metadata storage could not be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NoMetadata;

impl From<TryReserveError> for NoMetadata {
    fn from(_: TryReserveError) -> Self {
        Self
    }
}

impl Default for BlockDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDirectory {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            first: None,
            last: None,
            buckets: array::from_fn(|_| Bucket::default()),
            live: 0,
        }
    }

    /// Makes sure the next `additional` inserts cannot fail.
    pub(crate) fn try_reserve(&mut self, additional: usize) -> Result<(), NoMetadata> {
        let fresh = additional.saturating_sub(self.vacant.len());
        self.slots.try_reserve(fresh)?;
        // Removal pushes onto `vacant`; keep room for every slot so that
        // releasing metadata never allocates.
        let want = (self.slots.len() + fresh).saturating_sub(self.vacant.len());
        self.vacant.try_reserve(want)?;
        Ok(())
    }

    /// Stores a record and returns its id. The record is not linked into
    /// any list yet.
    pub(crate) fn insert(&mut self, block: Block) -> Result<BlockId, NoMetadata> {
        self.try_reserve(1)?;
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.block.is_none());
            slot.block = Some(block);
            self.live += 1;
            return Ok(BlockId {
                index,
                generation: slot.generation,
            });
        }
        let Ok(index) = u32::try_from(self.slots.len()) else {
            return Err(NoMetadata);
        };
        self.slots.push(Slot {
            generation: 0,
            block: Some(block),
        });
        self.live += 1;
        Ok(BlockId {
            index,
            generation: 0,
        })
    }

    /// Drops the record at `index`, which must already be unlinked from
    /// both lists.
    pub(crate) fn remove(&mut self, index: u32) -> Block {
        let slot = &mut self.slots[index as usize];
        let block = slot.block.take().expect("removing a vacant block slot");
        assert!(!block.on_free_list, "removing a block still on a free list");
        assert!(
            block.prev.is_none() && block.next.is_none() && self.first != Some(index),
            "removing a block still on the address chain"
        );
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(index);
        self.live -= 1;
        block
    }

    /// Resolves `id` to a slot index if it still names a live record.
    pub(crate) fn resolve(&self, id: BlockId) -> Option<u32> {
        let slot = self.slots.get(id.index as usize)?;
        (slot.generation == id.generation && slot.block.is_some()).then_some(id.index)
    }

    /// Moves the slot at `index` to a new generation, invalidating every id
    /// handed out for it so far.
    pub(crate) fn renew(&mut self, index: u32) -> BlockId {
        let slot = &mut self.slots[index as usize];
        assert!(slot.block.is_some(), "renewing a vacant block slot");
        slot.generation = slot.generation.wrapping_add(1);
        BlockId {
            index,
            generation: slot.generation,
        }
    }

    #[track_caller]
    pub(crate) fn get(&self, index: u32) -> &Block {
        self.slots[index as usize]
            .block
            .as_ref()
            .expect("dangling block index")
    }

    #[track_caller]
    pub(crate) fn get_mut(&mut self, index: u32) -> &mut Block {
        self.slots[index as usize]
            .block
            .as_mut()
            .expect("dangling block index")
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn last(&self) -> Option<u32> {
        self.last
    }

    /// Iterates over block indices in address order.
    pub(crate) fn chain(&self) -> impl Iterator<Item = u32> + '_ {
        core::iter::successors(self.first, |&index| self.get(index).next)
    }

    pub(crate) fn push_back(&mut self, index: u32) {
        let old_last = self.last;
        {
            let block = self.get_mut(index);
            block.prev = old_last;
            block.next = None;
        }
        match old_last {
            Some(last) => self.get_mut(last).next = Some(index),
            None => self.first = Some(index),
        }
        self.last = Some(index);
    }

    /// Puts the run `first..=last` (already linked among itself) where
    /// `old` used to be, and unlinks `old`.
    pub(crate) fn replace_in_chain(&mut self, old: u32, first: u32, last: u32) {
        let (prev, next) = {
            let block = self.get_mut(old);
            (block.prev.take(), block.next.take())
        };
        self.get_mut(first).prev = prev;
        self.get_mut(last).next = next;
        match prev {
            Some(prev) => self.get_mut(prev).next = Some(first),
            None => self.first = Some(first),
        }
        match next {
            Some(next) => self.get_mut(next).prev = Some(last),
            None => self.last = Some(last),
        }
    }

    /// Links `second` right after `first` on the address chain, assuming
    /// both are being built up and not yet attached.
    pub(crate) fn link_pair(&mut self, first: u32, second: u32) {
        self.get_mut(first).next = Some(second);
        self.get_mut(second).prev = Some(first);
    }

    /// Unlinks the tail of the address chain.
    pub(crate) fn pop_back(&mut self) -> Option<u32> {
        let index = self.last?;
        let prev = self.get_mut(index).prev.take();
        match prev {
            Some(prev) => self.get_mut(prev).next = None,
            None => self.first = None,
        }
        self.last = prev;
        Some(index)
    }

    pub(crate) fn free_count(&self, class: SizeClass) -> u32 {
        self.buckets[class.index()].count
    }

    pub(crate) fn push_free(&mut self, index: u32) {
        let class = self.get(index).class;
        let bucket = self.buckets[class.index()];
        {
            let block = self.get_mut(index);
            assert!(!block.on_free_list, "block is already on a free list");
            block.on_free_list = true;
            block.free_prev = bucket.tail;
            block.free_next = None;
        }
        match bucket.tail {
            Some(tail) => self.get_mut(tail).free_next = Some(index),
            None => self.buckets[class.index()].head = Some(index),
        }
        let bucket = &mut self.buckets[class.index()];
        bucket.tail = Some(index);
        bucket.count += 1;
    }

    pub(crate) fn pop_free(&mut self, class: SizeClass) -> Option<u32> {
        let index = self.buckets[class.index()].head?;
        self.unlink_free(index);
        Some(index)
    }

    pub(crate) fn unlink_free(&mut self, index: u32) {
        let (class, prev, next) = {
            let block = self.get_mut(index);
            assert!(block.on_free_list, "block is not on a free list");
            block.on_free_list = false;
            (block.class, block.free_prev.take(), block.free_next.take())
        };
        match prev {
            Some(prev) => self.get_mut(prev).free_next = next,
            None => self.buckets[class.index()].head = next,
        }
        match next {
            Some(next) => self.get_mut(next).free_prev = prev,
            None => self.buckets[class.index()].tail = prev,
        }
        self.buckets[class.index()].count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(log2: u32) -> SizeClass {
        SizeClass::new(log2).unwrap()
    }

    fn add(dir: &mut BlockDirectory, log2: u32, offset: u64) -> u32 {
        let id = dir
            .insert(Block::new(class(log2), offset, BlockFlags::empty()))
            .unwrap();
        dir.push_back(id.index());
        id.index()
    }

    #[test]
    fn test_chain_order() {
        let mut dir = BlockDirectory::new();
        let a = add(&mut dir, 4, 0);
        let b = add(&mut dir, 4, 16);
        let c = add(&mut dir, 5, 32);
        assert_eq!(dir.chain().collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(dir.last(), Some(c));

        assert_eq!(dir.pop_back(), Some(c));
        assert_eq!(dir.chain().collect::<Vec<_>>(), vec![a, b]);
        dir.remove(c);
        assert_eq!(dir.live(), 2);
    }

    #[test]
    fn test_stale_id_does_not_resolve() {
        let mut dir = BlockDirectory::new();
        let id = dir
            .insert(Block::new(class(4), 0, BlockFlags::empty()))
            .unwrap();
        assert_eq!(dir.resolve(id), Some(id.index()));
        dir.remove(id.index());
        assert_eq!(dir.resolve(id), None);

        let reused = dir
            .insert(Block::new(class(4), 0, BlockFlags::empty()))
            .unwrap();
        assert_eq!(reused.index(), id.index());
        assert_ne!(reused.generation(), id.generation());
        assert_eq!(dir.resolve(id), None);
        assert_eq!(dir.resolve(reused), Some(reused.index()));

        let renewed = dir.renew(reused.index());
        assert_eq!(dir.resolve(reused), None);
        assert_eq!(dir.resolve(renewed), Some(reused.index()));
    }

    #[test]
    fn test_free_list_fifo_and_unlink() {
        let mut dir = BlockDirectory::new();
        let a = add(&mut dir, 6, 0);
        let b = add(&mut dir, 6, 64);
        let c = add(&mut dir, 6, 128);
        for index in [a, b, c] {
            dir.push_free(index);
        }
        assert_eq!(dir.free_count(class(6)), 3);

        dir.unlink_free(b);
        assert_eq!(dir.free_count(class(6)), 2);
        assert_eq!(dir.pop_free(class(6)), Some(a));
        assert_eq!(dir.pop_free(class(6)), Some(c));
        assert_eq!(dir.pop_free(class(6)), None);
        assert_eq!(dir.free_count(class(6)), 0);
    }

    #[test]
    fn test_replace_in_chain() {
        let mut dir = BlockDirectory::new();
        let a = add(&mut dir, 4, 0);
        let big = add(&mut dir, 6, 16);
        let z = add(&mut dir, 4, 80);

        let mut halves = Vec::new();
        for i in 0..4 {
            let id = dir
                .insert(Block::new(class(4), 16 + i * 16, BlockFlags::empty()))
                .unwrap();
            halves.push(id.index());
        }
        for pair in halves.windows(2) {
            dir.link_pair(pair[0], pair[1]);
        }
        dir.replace_in_chain(big, halves[0], halves[3]);
        dir.remove(big);

        let offsets: Vec<_> = dir.chain().map(|i| dir.get(i).offset).collect();
        assert_eq!(offsets, vec![0, 16, 32, 48, 64, 80]);
        assert_eq!(dir.chain().next(), Some(a));
        assert_eq!(dir.last(), Some(z));
    }
}
