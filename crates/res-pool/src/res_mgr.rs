use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use fm_support::{AllocationContext, clock::Clock};
use snafu::{ResultExt as _, ensure};

use crate::{
    PoolError,
    arena::{Arena, ItemHandle},
    free_pool::FreePool,
    lifecycle::{DefaultLifecycle, ItemLifecycle},
    pool_error::{DestroyedSnafu, InitSnafu, OutOfMemorySnafu, StaleHandleSnafu},
    request::{Rejected, Request},
};

/// A [`FreePool`] over a fixed set of items it owns.
///
/// Items never move. Callers get an [`ItemHandle`] and reach the item
/// through [`item`](Self::item) / [`item_mut`](Self::item_mut) until they
/// [`put`](Self::put) the handle back.
pub struct ResMgr<T, C, L = DefaultLifecycle>
where
    L: ItemLifecycle<T>,
{
    items: Arena<T>,
    pool: FreePool<ItemHandle, C>,
    lifecycle: L,
    destroyed: bool,
}

impl<T: Default, C> ResMgr<T, C> {
    /// A manager over `count` default-constructed items.
    pub fn new(
        count: usize,
        ctx: AllocationContext,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PoolError> {
        Self::with_lifecycle(count, DefaultLifecycle, ctx, clock)
    }
}

impl<T, C, L> ResMgr<T, C, L>
where
    L: ItemLifecycle<T>,
{
    /// A manager over `count` items built by `lifecycle`.
    ///
    /// If an item fails to initialize, it and every item built before it
    /// are destructed and the error is returned.
    pub fn with_lifecycle(
        count: usize,
        mut lifecycle: L,
        ctx: AllocationContext,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PoolError> {
        ensure!(
            u32::try_from(count).is_ok(),
            OutOfMemorySnafu {
                what: "item handles"
            }
        );
        let mut pool = FreePool::new(count, ctx, clock)?;

        let mut items = Vec::new();
        if items.try_reserve_exact(count).is_err() {
            return OutOfMemorySnafu { what: "items" }.fail();
        }
        for _ in 0..count {
            let mut item = lifecycle.construct();
            if let Err(err) = lifecycle.init(&mut item) {
                lifecycle.destruct(item);
                items.into_iter().for_each(|item| lifecycle.destruct(item));
                return Err(err).context(InitSnafu);
            }
            items.push(item);
        }

        let items = Arena::new(items);
        pool.put_array(items.handles());
        log::debug!("resource manager [{ctx}] holds {count} items");

        Ok(Self {
            items,
            pool,
            lifecycle,
            destroyed: false,
        })
    }

    /// See [`FreePool::check`].
    #[must_use]
    pub fn check(&self, count: u32, partial_ok: bool) -> u32 {
        self.pool.check(count, partial_ok)
    }

    /// Hands out a free item.
    pub fn get(&mut self) -> Option<ItemHandle> {
        if self.destroyed {
            return None;
        }
        let handle = self.pool.get()?;
        self.items.check_out(handle);
        Some(handle)
    }

    /// Takes back an item handed out by [`get`](Self::get).
    ///
    /// Fails with [`PoolError::StaleHandle`] if the item was already
    /// returned, which also rejects any copy of the handle from then on.
    pub fn put(&mut self, handle: ItemHandle) -> Result<(), PoolError> {
        ensure!(!self.destroyed, DestroyedSnafu);
        let Some(fresh) = self.items.check_in(handle) else {
            return StaleHandleSnafu.fail();
        };
        self.pool.put(fresh);
        Ok(())
    }

    /// Returns several items at once. Stops at the first stale handle.
    pub fn put_array<I>(&mut self, handles: I) -> Result<(), PoolError>
    where
        I: IntoIterator<Item = ItemHandle>,
    {
        handles.into_iter().try_for_each(|handle| self.put(handle))
    }

    #[must_use]
    pub fn item(&self, handle: ItemHandle) -> Option<&T> {
        self.items.get(handle)
    }

    #[must_use]
    pub fn item_mut(&mut self, handle: ItemHandle) -> Option<&mut T> {
        self.items.get_mut(handle)
    }

    /// See [`FreePool::queue_request`].
    pub fn queue_request(&mut self, request: Request<C>) -> Result<(), Rejected<C, PoolError>> {
        self.pool.queue_request(request)
    }

    /// See [`FreePool::dequeue_request`].
    pub fn dequeue_request(&mut self) -> Option<Request<C>>
    where
        C: Clone,
    {
        self.pool.dequeue_request()
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.pool.free_count()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pool.pending_count()
    }

    /// Number of items owned, free or handed out.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Calls `f` on every free item.
    pub fn apply<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut T),
    {
        let items = &mut self.items;
        self.pool.apply(|handle| f(items.free_item_mut(*handle)));
    }

    /// Discards queued requests and destructs every item.
    ///
    /// Items still handed out are reported and destructed as well; their
    /// handles go stale. Calling this again does nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let ctx = self.pool.context();
        self.pool.destroy(drop);
        let outstanding = self.items.checked_out();
        if outstanding != 0 {
            log::warn!(
                "resource manager [{ctx}] destroyed with {outstanding} of {} items in use",
                self.items.len()
            );
        }
        let lifecycle = &mut self.lifecycle;
        self.items.drain().for_each(|item| lifecycle.destruct(item));
    }
}

impl<T, C, L> Drop for ResMgr<T, C, L>
where
    L: ItemLifecycle<T>,
{
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<T, C, L> fmt::Debug for ResMgr<T, C, L>
where
    L: ItemLifecycle<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResMgr")
            .field("items", &self.items.len())
            .field("pool", &self.pool)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}
