use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use fm_support::{AllocationContext, ExhaustionLog, clock::Clock};
use crate::{
    PoolError,
    pool_error::{DestroyedSnafu, OutOfMemorySnafu},
    request::{QueueFull, Rejected, Request, RequestQueue, RequestSlot, Service},
};

/// A stack of free items plus a FIFO of requests waiting for them.
///
/// Items move in and out of the stack with [`get`](Self::get) and
/// [`put`](Self::put). A caller that finds too few items with
/// [`check`](Self::check) queues a [`Request`]; whoever returns items later
/// calls [`dequeue_request`](Self::dequeue_request) to learn which request
/// may proceed and then takes the items for it with `get`.
///
/// While a request is queued, items must only leave the stack on behalf of
/// the request at the head of the queue.
pub struct FreePool<T, C> {
    ctx: AllocationContext,
    stack: Vec<T>,
    queue: RequestQueue<C>,
    spare: Vec<RequestSlot<C>>,
    exhaustion: ExhaustionLog,
    destroyed: bool,
}

impl<T, C> FreePool<T, C> {
    /// Creates an empty pool sized for `min_items` items.
    ///
    /// A quarter as many request records (at least one) are set aside up
    /// front so that queueing usually does not allocate.
    pub fn new(
        min_items: usize,
        ctx: AllocationContext,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PoolError> {
        let mut stack = Vec::new();
        if stack.try_reserve(min_items).is_err() {
            return OutOfMemorySnafu { what: "free items" }.fail();
        }

        let spare_count = (min_items / 4).max(1);
        let mut spare = Vec::new();
        if spare.try_reserve(spare_count).is_err() {
            return OutOfMemorySnafu {
                what: "request records",
            }
            .fail();
        }
        spare.extend((0..spare_count).map(|_| RequestSlot::default()));

        Ok(Self {
            ctx,
            stack,
            queue: RequestQueue::default(),
            spare,
            exhaustion: ExhaustionLog::new(clock),
            destroyed: false,
        })
    }

    #[must_use]
    pub fn context(&self) -> AllocationContext {
        self.ctx
    }

    /// How many of `count` items could be handed out right now.
    ///
    /// Always 0 while any request is queued, so that no caller overtakes
    /// the queue. Otherwise `count` if that many are free, the number of
    /// free items if `partial_ok`, or 0.
    #[must_use]
    pub fn check(&self, count: u32, partial_ok: bool) -> u32 {
        if self.destroyed || !self.queue.is_empty() {
            return 0;
        }
        self.available_count(count, partial_ok)
    }

    fn available_count(&self, count: u32, partial_ok: bool) -> u32 {
        let free = self.free_count();
        if free >= count {
            count
        } else if partial_ok {
            free
        } else {
            0
        }
    }

    /// Pops a free item.
    pub fn get(&mut self) -> Option<T> {
        let item = self.stack.pop();
        if item.is_none() && !self.destroyed {
            self.exhaustion
                .report(format_args!("free pool [{}] is empty", self.ctx));
        }
        item
    }

    /// Pushes an item back. After [`destroy`](Self::destroy) the item is
    /// dropped instead.
    pub fn put(&mut self, item: T) {
        if self.destroyed {
            log::warn!("free pool [{}] got an item back after teardown", self.ctx);
            return;
        }
        self.stack.push(item);
    }

    /// Pushes every item of `items`.
    pub fn put_array<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        if self.destroyed {
            log::warn!("free pool [{}] got items back after teardown", self.ctx);
            return;
        }
        self.stack.extend(items);
    }

    /// Number of free items.
    #[must_use]
    pub fn free_count(&self) -> u32 {
        u32::try_from(self.stack.len()).unwrap_or(u32::MAX)
    }

    /// Number of queued requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// The request that will be served next.
    #[must_use]
    pub fn head_request(&self) -> Option<&Request<C>> {
        self.queue.head()
    }

    /// Queues `request` behind every request already waiting.
    ///
    /// Availability is not checked here; the caller is expected to have
    /// seen [`check`](Self::check) come up short under the same lock. A
    /// request that cannot be queued is handed back in the error.
    pub fn queue_request(&mut self, request: Request<C>) -> Result<(), Rejected<C, PoolError>> {
        if self.destroyed {
            return Err(Rejected::new(request, DestroyedSnafu.build()));
        }
        let slot = self.spare.pop().unwrap_or_default();
        if let Err(QueueFull { slot, request }) = self.queue.push(slot, request) {
            self.recycle(slot);
            self.exhaustion.report(format_args!(
                "free pool [{}] cannot queue another request",
                self.ctx
            ));
            let error = OutOfMemorySnafu {
                what: "queued request",
            }
            .build();
            return Err(Rejected::new(request, error));
        }
        Ok(())
    }

    fn recycle(&mut self, slot: RequestSlot<C>) {
        if self.spare.try_reserve(1).is_ok() {
            self.spare.push(slot);
        }
    }

    /// Serves the request at the head of the queue from the free items.
    ///
    /// Returns the request if it can proceed: either in full, in which case
    /// it leaves the queue, or, for a partial request, with the number of
    /// items that can be granted now; the rest stays queued at the head.
    /// Returns `None` if the queue is empty or the head must keep waiting.
    ///
    /// No items are taken; the caller takes `count()` of them with
    /// [`get`](Self::get).
    pub fn dequeue_request(&mut self) -> Option<Request<C>>
    where
        C: Clone,
    {
        match self.queue.service(self.free_count()) {
            Service::Completed(request, slot) => {
                self.recycle(slot);
                Some(request)
            }
            Service::Partial(granted) => Some(granted),
            Service::Blocked | Service::Empty => None,
        }
    }

    /// Calls `f` on every free item.
    pub fn apply<F>(&mut self, f: F)
    where
        F: FnMut(&mut T),
    {
        self.stack.iter_mut().for_each(f);
    }

    /// Discards every queued request and hands every free item to
    /// `cleanup`.
    ///
    /// Returns the number of discarded requests. Calling this again does
    /// nothing.
    pub fn destroy<F>(&mut self, cleanup: F) -> usize
    where
        F: FnMut(T),
    {
        if self.destroyed {
            return 0;
        }
        self.destroyed = true;
        let discarded = self.queue.drain().count();
        if discarded != 0 {
            log::debug!(
                "free pool [{}] discarded {discarded} queued requests",
                self.ctx
            );
        }
        self.stack.drain(..).for_each(cleanup);
        self.spare = Vec::new();
        discarded
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl<T, C> Drop for FreePool<T, C> {
    fn drop(&mut self) {
        self.destroy(drop);
    }
}

impl<T, C> fmt::Debug for FreePool<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreePool")
            .field("ctx", &self.ctx)
            .field("free", &self.stack.len())
            .field("pending", &self.queue.len())
            .field("spare", &self.spare.len())
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use fm_support::clock::ManualClock;

    use super::*;

    fn pool(items: u32) -> FreePool<u32, &'static str> {
        let mut pool = FreePool::new(
            items as usize,
            AllocationContext::tagged(*b"fpol"),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        pool.put_array(0..items);
        pool
    }

    #[test]
    fn test_spare_records() {
        assert_eq!(pool(0).spare.len(), 1);
        assert_eq!(pool(3).spare.len(), 1);
        assert_eq!(pool(40).spare.len(), 10);
    }

    #[test]
    fn test_check() {
        let pool = pool(5);
        assert_eq!(pool.check(3, false), 3);
        assert_eq!(pool.check(5, false), 5);
        assert_eq!(pool.check(6, false), 0);
        assert_eq!(pool.check(6, true), 5);
        assert_eq!(pool.check(0, false), 0);
    }

    #[test]
    fn test_check_refuses_while_queued() {
        let mut pool = pool(5);
        pool.queue_request(Request::new(10, "q1", "")).unwrap();
        assert_eq!(pool.check(1, false), 0);
        assert_eq!(pool.check(1, true), 0);
    }

    #[test]
    fn test_get_put_lifo() {
        let mut pool = pool(3);
        assert_eq!(pool.get(), Some(2));
        pool.put(7);
        assert_eq!(pool.get(), Some(7));
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.get(), Some(1));
        assert_eq!(pool.get(), Some(0));
        assert_eq!(pool.get(), None);
    }

    #[test]
    fn test_head_blocks_later_requests() {
        let mut pool = pool(5);
        pool.queue_request(Request::new(10, "q1", "")).unwrap();
        pool.queue_request(Request::new(1, "q2", "").partial_ok(true)).unwrap();

        // Five free items would satisfy q2, but q1 is first.
        assert!(pool.dequeue_request().is_none());
        assert_eq!(pool.pending_count(), 2);

        pool.put_array(100..104);
        assert!(pool.dequeue_request().is_none());
        pool.put(104);

        let q1 = pool.dequeue_request().unwrap();
        assert_eq!(*q1.context1(), "q1");
        assert_eq!(q1.count(), 10);
        for _ in 0..q1.count() {
            pool.get().unwrap();
        }

        assert!(pool.dequeue_request().is_none());
        pool.put(0);
        let q2 = pool.dequeue_request().unwrap();
        assert_eq!(*q2.context1(), "q2");
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_partial_fulfillment() {
        let mut pool = pool(4);
        assert_eq!(pool.check(10, true), 4);
        pool.queue_request(Request::new(10, "big", "").partial_ok(true)).unwrap();

        let first = pool.dequeue_request().unwrap();
        assert_eq!(first.count(), 4);
        for _ in 0..4 {
            pool.get().unwrap();
        }
        assert_eq!(pool.head_request().map(Request::count), Some(6));

        assert!(pool.dequeue_request().is_none());
        pool.put_array(0..2);
        let second = pool.dequeue_request().unwrap();
        assert_eq!(second.count(), 2);
        pool.get();
        pool.get();

        pool.put_array(0..10);
        let last = pool.dequeue_request().unwrap();
        assert_eq!(last.count(), 4);
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_records_are_recycled() {
        let mut pool = pool(0);
        for round in 0..3 {
            pool.queue_request(Request::new(1, "r", "")).unwrap();
            assert!(pool.spare.is_empty(), "round {round}");
            pool.put(round);
            assert!(pool.dequeue_request().is_some());
            assert_eq!(pool.spare.len(), 1);
            pool.get();
        }
    }

    #[test]
    fn test_apply() {
        let mut pool = pool(3);
        pool.apply(|item| *item *= 10);
        let mut items: Vec<_> = core::iter::from_fn(|| pool.get()).collect();
        items.sort_unstable();
        assert_eq!(items, vec![0, 10, 20]);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut pool = pool(3);
        pool.queue_request(Request::new(5, "a", "")).unwrap();
        pool.queue_request(Request::new(5, "b", "")).unwrap();

        let mut cleaned = Vec::new();
        assert_eq!(pool.destroy(|item| cleaned.push(item)), 2);
        assert_eq!(cleaned, vec![0, 1, 2]);
        assert_eq!(pool.destroy(|_| panic!("cleanup ran twice")), 0);

        assert!(pool.is_destroyed());
        assert_eq!(pool.check(1, true), 0);
        assert!(pool.get().is_none());
        let rejected = pool.queue_request(Request::new(1, "c", "d")).unwrap_err();
        assert!(matches!(rejected.error(), PoolError::Destroyed { .. }));
        assert_eq!(rejected.into_request().into_contexts(), ("c", "d"));
        pool.put(9);
        assert_eq!(pool.free_count(), 0);
    }
}
