use alloc::vec::Vec;

/// Generational reference to an item owned by a [`ResMgr`](crate::ResMgr).
///
/// A handle is only good between the `get` that produced it and the `put`
/// that returns it. Returning an item moves its slot to a new generation,
/// so a copy of the handle kept past that point no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemHandle {
    index: u32,
    generation: u32,
}

impl ItemHandle {
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    checked_out: bool,
    item: T,
}

/// Fixed set of items addressed by [`ItemHandle`].
#[derive(Debug)]
pub(crate) struct Arena<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Arena<T> {
    pub(crate) fn new(entries: Vec<T>) -> Self {
        assert!(
            u32::try_from(entries.len()).is_ok(),
            "too many items for 32-bit handles"
        );
        let entries = entries
            .into_iter()
            .map(|item| Entry {
                generation: 0,
                checked_out: false,
                item,
            })
            .collect();
        Self { entries }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Handles for every item, in index order.
    pub(crate) fn handles(&self) -> impl Iterator<Item = ItemHandle> + '_ {
        self.entries.iter().zip(0..).map(|(entry, index)| ItemHandle {
            index,
            generation: entry.generation,
        })
    }

    fn entry(&self, handle: ItemHandle) -> Option<&Entry<T>> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
    }

    fn entry_mut(&mut self, handle: ItemHandle) -> Option<&mut Entry<T>> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
    }

    /// Marks a handle taken from the free pool as handed out.
    ///
    /// # Panics
    ///
    /// Panics if the free pool held a handle that is stale or already out.
    pub(crate) fn check_out(&mut self, handle: ItemHandle) {
        let entry = self
            .entry_mut(handle)
            .expect("free pool held a stale item handle");
        assert!(!entry.checked_out, "free pool held an item already in use");
        entry.checked_out = true;
    }

    /// Takes back a handed-out item, returning the handle to put back into
    /// the free pool, or `None` if `handle` is stale.
    pub(crate) fn check_in(&mut self, handle: ItemHandle) -> Option<ItemHandle> {
        let entry = self.entry_mut(handle).filter(|entry| entry.checked_out)?;
        entry.checked_out = false;
        entry.generation = entry.generation.wrapping_add(1);
        Some(ItemHandle {
            index: handle.index,
            generation: entry.generation,
        })
    }

    pub(crate) fn get(&self, handle: ItemHandle) -> Option<&T> {
        self.entry(handle)
            .filter(|entry| entry.checked_out)
            .map(|entry| &entry.item)
    }

    pub(crate) fn get_mut(&mut self, handle: ItemHandle) -> Option<&mut T> {
        self.entry_mut(handle)
            .filter(|entry| entry.checked_out)
            .map(|entry| &mut entry.item)
    }

    /// The item behind a handle held by the free pool.
    pub(crate) fn free_item_mut(&mut self, handle: ItemHandle) -> &mut T {
        let entry = self
            .entry_mut(handle)
            .expect("free pool held a stale item handle");
        &mut entry.item
    }

    pub(crate) fn checked_out(&self) -> usize {
        self.entries.iter().filter(|entry| entry.checked_out).count()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain(..).map(|entry| entry.item)
    }
}
