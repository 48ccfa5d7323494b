use alloc::vec::Vec;
use core::fmt;

use fm_support::AllocationContext;
use snafu::ResultExt as _;

use crate::{
    GrowPoolError,
    grow_pool_error::{InitSnafu, OutOfMemorySnafu},
    lifecycle::{DefaultLifecycle, ItemLifecycle},
};

/// Sizing of a [`GrowPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowPoolConfig {
    pub min_count: usize,
    /// Items added when the pool runs dry. Zero disables growth.
    pub grow_size: usize,
}

impl GrowPoolConfig {
    #[must_use]
    pub const fn new(min_count: usize, grow_size: usize) -> Self {
        Self {
            min_count,
            grow_size,
        }
    }
}

/// A pool of reusable items that builds more on demand.
///
/// Items are built through an [`ItemLifecycle`]. Storage for every item the
/// pool has built is kept reserved, so [`put`](Self::put) never allocates.
pub struct GrowPool<T, L = DefaultLifecycle>
where
    L: ItemLifecycle<T>,
{
    free: Vec<T>,
    total: usize,
    config: GrowPoolConfig,
    lifecycle: L,
    ctx: AllocationContext,
    destroyed: bool,
}

impl<T: Default> GrowPool<T> {
    /// A pool of default-constructed items.
    pub fn new(config: GrowPoolConfig, ctx: AllocationContext) -> Result<Self, GrowPoolError> {
        Self::with_lifecycle(config, DefaultLifecycle, ctx)
    }
}

impl<T, L> GrowPool<T, L>
where
    L: ItemLifecycle<T>,
{
    /// Builds a pool holding `config.min_count` items.
    ///
    /// If any of the initial items cannot be built, the ones that were are
    /// destructed and the error is returned.
    pub fn with_lifecycle(
        config: GrowPoolConfig,
        lifecycle: L,
        ctx: AllocationContext,
    ) -> Result<Self, GrowPoolError> {
        let mut pool = Self {
            free: Vec::new(),
            total: 0,
            config,
            lifecycle,
            ctx,
            destroyed: false,
        };
        if config.min_count > 0 {
            // On failure the partially built pool is torn down by `Drop`.
            pool.grow(config.min_count)?;
        }
        Ok(pool)
    }

    /// Builds `count` more items onto the free list.
    ///
    /// Items built before a failure stay in the pool.
    pub fn grow(&mut self, count: usize) -> Result<(), GrowPoolError> {
        let wanted = self.total + count;
        self.free
            .try_reserve(wanted - self.free.len())
            .context(OutOfMemorySnafu { count })?;

        for _ in 0..count {
            let mut item = self.lifecycle.construct();
            if let Err(err) = self.lifecycle.init(&mut item) {
                self.lifecycle.destruct(item);
                return Err(err).context(InitSnafu);
            }
            self.free.push(item);
            self.total += 1;
        }
        log::trace!("pool [{}] grew to {} items", self.ctx, self.total);
        Ok(())
    }

    /// Takes a free item, growing the pool by `grow_size` if it is empty.
    pub fn get(&mut self) -> Option<T> {
        if self.destroyed {
            return None;
        }
        if self.free.is_empty() {
            if self.config.grow_size == 0 {
                return None;
            }
            if let Err(err) = self.grow(self.config.grow_size) {
                log::debug!("pool [{}] could not grow: {err}", self.ctx);
            }
        }
        self.free.pop()
    }

    /// Returns an item taken with [`get`](Self::get).
    pub fn put(&mut self, item: T) {
        if self.destroyed {
            log::warn!("pool [{}] returned an item after teardown", self.ctx);
            self.lifecycle.destruct(item);
            return;
        }
        debug_assert!(
            self.free.len() < self.total,
            "pool [{}] got back more items than it built",
            self.ctx
        );
        self.free.push(item);
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of items the pool has built and not destructed.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn config(&self) -> GrowPoolConfig {
        self.config
    }

    /// Destructs every free item.
    ///
    /// Returns the number of items that were never given back; those are
    /// reported and left to their holders. Calling this again does nothing.
    pub fn destroy(&mut self) -> usize {
        if self.destroyed {
            return 0;
        }
        self.destroyed = true;
        let outstanding = self.total - self.free.len();
        if outstanding != 0 {
            log::warn!(
                "pool [{}] destroyed with {outstanding} of {} items outstanding",
                self.ctx,
                self.total
            );
        }
        for item in self.free.drain(..) {
            self.lifecycle.destruct(item);
        }
        self.total = 0;
        outstanding
    }
}

impl<T, L> Drop for GrowPool<T, L>
where
    L: ItemLifecycle<T>,
{
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<T, L> fmt::Debug for GrowPool<T, L>
where
    L: ItemLifecycle<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowPool")
            .field("ctx", &self.ctx)
            .field("free", &self.free.len())
            .field("total", &self.total)
            .field("config", &self.config)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::lifecycle::InitError;

    /// Numbers items, fails init on chosen serials, and logs every phase.
    struct Tracing {
        next: u32,
        fail_on: Option<u32>,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Tracing {
        fn new(fail_on: Option<u32>) -> (Self, Rc<RefCell<Vec<String>>>) {
            let log = Rc::new(RefCell::new(Vec::new()));
            let lifecycle = Self {
                next: 0,
                fail_on,
                log: Rc::clone(&log),
            };
            (lifecycle, log)
        }
    }

    impl ItemLifecycle<u32> for Tracing {
        fn construct(&mut self) -> u32 {
            self.next += 1;
            self.log.borrow_mut().push(format!("construct {}", self.next));
            self.next
        }

        fn init(&mut self, item: &mut u32) -> Result<(), InitError> {
            self.log.borrow_mut().push(format!("init {item}"));
            if self.fail_on == Some(*item) {
                return Err(InitError::new("refused"));
            }
            Ok(())
        }

        fn destruct(&mut self, item: u32) {
            self.log.borrow_mut().push(format!("destruct {item}"));
        }
    }

    fn ctx() -> AllocationContext {
        AllocationContext::tagged(*b"grow")
    }

    #[test]
    fn test_initial_items() {
        let pool: GrowPool<u64> = GrowPool::new(GrowPoolConfig::new(10, 10), ctx()).unwrap();
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.total_count(), 10);
    }

    #[test]
    fn test_grows_when_empty() {
        let mut pool: GrowPool<u64> = GrowPool::new(GrowPoolConfig::new(1, 3), ctx()).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(pool.total_count(), 4);
        assert_eq!(pool.free_count(), 2);
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_fixed_size_pool_runs_dry() {
        let mut pool: GrowPool<u64> = GrowPool::new(GrowPoolConfig::new(2, 0), ctx()).unwrap();
        let a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        assert!(pool.get().is_none());
        pool.put(a);
        assert!(pool.get().is_some());
    }

    #[test]
    fn test_init_failure_destructs_and_stops() {
        let (lifecycle, log) = Tracing::new(Some(3));
        let err = GrowPool::with_lifecycle(GrowPoolConfig::new(5, 0), lifecycle, ctx())
            .unwrap_err();
        assert!(matches!(err, GrowPoolError::Init { .. }));
        assert_eq!(
            *log.borrow(),
            [
                "construct 1",
                "init 1",
                "construct 2",
                "init 2",
                "construct 3",
                "init 3",
                "destruct 3",
                "destruct 1",
                "destruct 2",
            ]
        );
    }

    #[test]
    fn test_growth_failure_keeps_built_items() {
        let (lifecycle, _log) = Tracing::new(Some(4));
        let mut pool = GrowPool::with_lifecycle(GrowPoolConfig::new(1, 5), lifecycle, ctx()).unwrap();
        let first = pool.get().unwrap();
        assert_eq!(first, 1);
        // Grows 2 and 3, then fails on 4.
        assert_eq!(pool.get(), Some(3));
        assert_eq!(pool.total_count(), 3);
        pool.put(first);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (lifecycle, log) = Tracing::new(None);
        let mut pool = GrowPool::with_lifecycle(GrowPoolConfig::new(3, 0), lifecycle, ctx()).unwrap();
        let held = pool.get().unwrap();
        assert_eq!(pool.destroy(), 1);
        assert_eq!(pool.destroy(), 0);
        assert!(pool.get().is_none());
        log.borrow_mut().clear();

        pool.put(held);
        assert_eq!(*log.borrow(), [format!("destruct {held}")]);
        drop(pool);
        assert_eq!(log.borrow().len(), 1);
    }
}
