use alloc::sync::Arc;
use core::fmt;

use derive_more::IsVariant;
use fm_support::{AllocationContext, ExhaustionLog, clock::Clock};
use snafu::ResultExt as _;

use crate::{
    ReqMgrError,
    grow_pool::{GrowPool, GrowPoolConfig},
    req_mgr_error::{DestroyedSnafu, InsufficientSnafu, OutOfMemorySnafu, RecordsSnafu},
    request::{QueueFull, Rejected, Request, RequestQueue, RequestSlot, Service},
};

/// Request records kept ready up front, and added each time they run out.
const RECORDS: GrowPoolConfig = GrowPoolConfig::new(10, 10);

/// How [`ReqMgr::get`] may treat a request it cannot meet right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum GetMode {
    /// Never queue; fail instead.
    SyncOnly,
    /// Queue the whole request until it can be met in full.
    AsyncExact,
    /// Grant what is available now and queue the remainder, which may in
    /// turn be granted a few at a time. Behind other queued requests this
    /// behaves like `AsyncExact`.
    AsyncPartialOk,
}

/// Successful outcome of [`ReqMgr::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum GetOutcome {
    /// All `count` resources may be taken now.
    Ready { count: u32 },
    /// The request (or its remainder) is queued. `granted` resources may be
    /// taken now; the rest will be reported through
    /// [`ReqMgr::resume`].
    Pending { granted: u32 },
}

/// Outcome of [`ReqMgr::resume`].
#[derive(Debug, IsVariant)]
pub enum ResumeOutcome<C> {
    /// The head request was met in full and left the queue. Its count is
    /// what may be taken now.
    Completed { request: Request<C> },
    /// Part of the head request was met. `granted` carries the callback,
    /// the contexts, and the count that may be taken now; the remainder
    /// stays queued.
    Pending { granted: Request<C> },
    /// The head request cannot make progress yet and stays queued.
    Insufficient { remaining: u32 },
    /// Nothing is queued.
    Idle,
}

/// Admission control for resources counted outside this crate.
///
/// Works like [`FreePool`](crate::FreePool) but never holds the resources
/// itself. Each decision asks `available` how many there are, and the
/// caller acquires them on its own once told it may.
pub struct ReqMgr<C, F> {
    available: F,
    queue: RequestQueue<C>,
    records: GrowPool<RequestSlot<C>>,
    ctx: AllocationContext,
    exhaustion: ExhaustionLog,
    destroyed: bool,
}

impl<C, F> ReqMgr<C, F>
where
    F: FnMut() -> u32,
{
    pub fn new(
        available: F,
        ctx: AllocationContext,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ReqMgrError> {
        let records = GrowPool::new(RECORDS, ctx).context(RecordsSnafu)?;
        Ok(Self {
            available,
            queue: RequestQueue::default(),
            records,
            ctx,
            exhaustion: ExhaustionLog::new(clock),
            destroyed: false,
        })
    }

    /// Asks for `request.count()` resources.
    ///
    /// If nothing is queued and enough are available the answer is
    /// [`GetOutcome::Ready`]. Otherwise `SyncOnly` fails with
    /// [`ReqMgrError::Insufficient`] and the async modes queue the request.
    ///
    /// With `AsyncPartialOk` and an empty queue, whatever is available now
    /// is granted and only the remainder is queued, to be granted a few at
    /// a time. Behind other requests nothing is granted up front, and the
    /// request is queued without the partial flag and waits for its full
    /// count. A request that is not queued comes back in the error.
    pub fn get(
        &mut self,
        mode: GetMode,
        request: Request<C>,
    ) -> Result<GetOutcome, Rejected<C, ReqMgrError>> {
        if self.destroyed {
            return Err(Rejected::new(request, DestroyedSnafu.build()));
        }
        let available = (self.available)();
        let count = request.count();
        if self.queue.is_empty() && count <= available {
            return Ok(GetOutcome::Ready { count });
        }

        if mode.is_sync_only() {
            self.exhaustion.report(format_args!(
                "request manager [{}]: {count} requested, {available} available",
                self.ctx
            ));
            let error = InsufficientSnafu {
                requested: count,
                available,
            }
            .build();
            return Err(Rejected::new(request, error));
        }

        let Some(slot) = self.records.get() else {
            let error = OutOfMemorySnafu {
                what: "request record",
            }
            .build();
            return Err(Rejected::new(request, error));
        };

        let was_partial_ok = request.is_partial_ok();
        let partial_ok = mode.is_async_partial_ok() && self.queue.is_empty();
        let granted = if partial_ok { available } else { 0 };
        let mut request = request.partial_ok(partial_ok);
        request.set_count(count - granted);

        if let Err(QueueFull { slot, request }) = self.queue.push(slot, request) {
            self.records.put(slot);
            let mut request = request.partial_ok(was_partial_ok);
            request.set_count(count);
            let error = OutOfMemorySnafu {
                what: "queued request",
            }
            .build();
            return Err(Rejected::new(request, error));
        }
        log::trace!(
            "request manager [{}]: queued {} of {count}, {} waiting",
            self.ctx,
            count - granted,
            self.queue.len()
        );
        Ok(GetOutcome::Pending { granted })
    }

    /// Tries to move the head request forward.
    ///
    /// A request without the partial flag is only ever completed in full.
    /// A partial request is granted whatever is available, as long as that
    /// is at least one.
    pub fn resume(&mut self) -> ResumeOutcome<C>
    where
        C: Clone,
    {
        if self.queue.is_empty() {
            return ResumeOutcome::Idle;
        }
        match self.queue.service((self.available)()) {
            Service::Completed(request, slot) => {
                self.records.put(slot);
                ResumeOutcome::Completed { request }
            }
            Service::Partial(granted) => ResumeOutcome::Pending { granted },
            Service::Blocked => ResumeOutcome::Insufficient {
                remaining: self.queue.head().map_or(0, Request::count),
            },
            Service::Empty => ResumeOutcome::Idle,
        }
    }
}

impl<C, F> ReqMgr<C, F> {
    /// Number of queued requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// The request that [`resume`](Self::resume) will look at next.
    #[must_use]
    pub fn head_request(&self) -> Option<&Request<C>> {
        self.queue.head()
    }

    /// Discards every queued request and releases the request records.
    ///
    /// Returns the number of discarded requests. Calling this again does
    /// nothing.
    pub fn destroy(&mut self) -> usize {
        if self.destroyed {
            return 0;
        }
        self.destroyed = true;
        let mut discarded = 0;
        for (_, slot) in self.queue.drain() {
            self.records.put(slot);
            discarded += 1;
        }
        if discarded != 0 {
            log::debug!(
                "request manager [{}] discarded {discarded} queued requests",
                self.ctx
            );
        }
        self.records.destroy();
        discarded
    }
}

impl<C, F> Drop for ReqMgr<C, F> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<C, F> fmt::Debug for ReqMgr<C, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqMgr")
            .field("ctx", &self.ctx)
            .field("pending", &self.queue.len())
            .field("records", &self.records)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use fm_support::clock::ManualClock;

    use super::*;

    type Counter = Rc<Cell<u32>>;

    fn req_mgr(free: &Counter) -> ReqMgr<&'static str, impl FnMut() -> u32> {
        let free = Rc::clone(free);
        ReqMgr::new(
            move || free.get(),
            AllocationContext::tagged(*b"ireq"),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    #[test]
    fn test_ready_when_available() {
        let free = Rc::new(Cell::new(5));
        let mut mgr = req_mgr(&free);
        for mode in [GetMode::SyncOnly, GetMode::AsyncExact, GetMode::AsyncPartialOk] {
            let outcome = mgr.get(mode, Request::new(5, "a", "")).unwrap();
            assert_eq!(outcome, GetOutcome::Ready { count: 5 });
        }
        assert_eq!(mgr.pending_count(), 0);
    }

    #[test]
    fn test_sync_only_never_queues() {
        let free = Rc::new(Cell::new(2));
        let mut mgr = req_mgr(&free);
        let rejected = mgr.get(GetMode::SyncOnly, Request::new(3, "a", "")).unwrap_err();
        assert!(rejected.error().is_insufficient());
        assert!(matches!(
            rejected.error(),
            ReqMgrError::Insufficient {
                requested: 3,
                available: 2,
                ..
            }
        ));
        assert_eq!(rejected.into_request().count(), 3);
        assert_eq!(mgr.pending_count(), 0);
        assert!(mgr.resume().is_idle());
    }

    #[test]
    fn test_sync_only_respects_queue() {
        let free = Rc::new(Cell::new(0));
        let mut mgr = req_mgr(&free);
        let outcome = mgr.get(GetMode::AsyncExact, Request::new(4, "a", "")).unwrap();
        assert_eq!(outcome, GetOutcome::Pending { granted: 0 });

        free.set(2);
        assert!(
            mgr.get(GetMode::SyncOnly, Request::new(1, "b", ""))
                .unwrap_err()
                .error()
                .is_insufficient()
        );
    }

    #[test]
    fn test_exact_request_waits_for_full_count() {
        let free = Rc::new(Cell::new(3));
        let mut mgr = req_mgr(&free);
        let outcome = mgr.get(GetMode::AsyncExact, Request::new(5, "a", "")).unwrap();
        assert_eq!(outcome, GetOutcome::Pending { granted: 0 });
        assert_eq!(mgr.head_request().map(Request::count), Some(5));

        assert!(matches!(
            mgr.resume(),
            ResumeOutcome::Insufficient { remaining: 5 }
        ));
        free.set(5);
        let ResumeOutcome::Completed { request } = mgr.resume() else {
            panic!("request should complete");
        };
        assert_eq!(request.count(), 5);
        assert!(mgr.resume().is_idle());
    }

    #[test]
    fn test_partial_grants_now_and_queues_remainder() {
        let free = Rc::new(Cell::new(4));
        let mut mgr = req_mgr(&free);
        let outcome = mgr
            .get(GetMode::AsyncPartialOk, Request::new(10, "a", "b"))
            .unwrap();
        assert_eq!(outcome, GetOutcome::Pending { granted: 4 });
        assert_eq!(mgr.head_request().map(Request::count), Some(6));

        // The caller took the 4.
        free.set(0);
        assert!(matches!(
            mgr.resume(),
            ResumeOutcome::Insufficient { remaining: 6 }
        ));

        free.set(2);
        let ResumeOutcome::Pending { granted } = mgr.resume() else {
            panic!("partial progress expected");
        };
        assert_eq!(granted.count(), 2);
        assert_eq!(granted.into_contexts(), ("a", "b"));

        free.set(4);
        let ResumeOutcome::Completed { request } = mgr.resume() else {
            panic!("remainder should complete");
        };
        assert_eq!(request.count(), 4);
        assert_eq!(mgr.pending_count(), 0);
    }

    #[test]
    fn test_partial_behind_queue_grants_nothing_up_front() {
        let free = Rc::new(Cell::new(0));
        let mut mgr = req_mgr(&free);
        mgr.get(GetMode::AsyncExact, Request::new(10, "q1", "")).unwrap();

        free.set(5);
        let outcome = mgr
            .get(GetMode::AsyncPartialOk, Request::new(1, "q2", "").partial_ok(true))
            .unwrap();
        assert_eq!(outcome, GetOutcome::Pending { granted: 0 });

        // q2 alone could be met, but q1 is at the head.
        assert!(matches!(
            mgr.resume(),
            ResumeOutcome::Insufficient { remaining: 10 }
        ));
        free.set(10);
        let ResumeOutcome::Completed { request } = mgr.resume() else {
            panic!("q1 should complete first");
        };
        assert_eq!(*request.context1(), "q1");

        let ResumeOutcome::Completed { request } = mgr.resume() else {
            panic!("q2 should complete next");
        };
        assert_eq!(*request.context1(), "q2");
        assert!(!request.is_partial_ok());
    }

    #[test]
    fn test_partial_behind_queue_waits_for_full_count() {
        let free = Rc::new(Cell::new(0));
        let mut mgr = req_mgr(&free);
        mgr.get(GetMode::AsyncExact, Request::new(2, "q1", "")).unwrap();
        mgr.get(GetMode::AsyncPartialOk, Request::new(10, "q2", "")).unwrap();
        assert_eq!(mgr.pending_count(), 2);

        free.set(2);
        let ResumeOutcome::Completed { request } = mgr.resume() else {
            panic!("q1 should complete");
        };
        assert_eq!(*request.context1(), "q1");

        // q2 lost its partial grant by queueing behind q1.
        free.set(3);
        assert!(matches!(
            mgr.resume(),
            ResumeOutcome::Insufficient { remaining: 10 }
        ));
        assert_eq!(mgr.head_request().map(Request::count), Some(10));

        free.set(10);
        let ResumeOutcome::Completed { request } = mgr.resume() else {
            panic!("q2 should complete in full");
        };
        assert_eq!(request.count(), 10);
        assert!(mgr.resume().is_idle());
    }

    #[test]
    fn test_records_grow_past_initial_batch() {
        let free = Rc::new(Cell::new(0));
        let mut mgr = req_mgr(&free);
        for i in 0..25 {
            let outcome = mgr.get(GetMode::AsyncExact, Request::new(1, "x", "")).unwrap();
            assert!(outcome.is_pending(), "request {i}");
        }
        assert_eq!(mgr.records.total_count(), 30);

        free.set(100);
        let mut completed = 0;
        while mgr.resume().is_completed() {
            completed += 1;
        }
        assert_eq!(completed, 25);
        assert_eq!(mgr.records.free_count(), 30);
    }

    #[test]
    fn test_callback_and_contexts_come_back() {
        use std::sync::atomic::{AtomicU32, Ordering};

        static GRANTED: AtomicU32 = AtomicU32::new(0);
        fn done(_: &&'static str, _: &&'static str, count: u32) {
            GRANTED.fetch_add(count, Ordering::SeqCst);
        }

        let free = Rc::new(Cell::new(0));
        let mut mgr = req_mgr(&free);
        mgr.get(
            GetMode::AsyncExact,
            Request::new(3, "ctx1", "ctx2").with_callback(done),
        )
        .unwrap();
        free.set(3);
        let ResumeOutcome::Completed { request } = mgr.resume() else {
            panic!("request should complete");
        };
        request.notify();
        assert_eq!(GRANTED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let free = Rc::new(Cell::new(0));
        let mut mgr = req_mgr(&free);
        mgr.get(GetMode::AsyncExact, Request::new(1, "a", "")).unwrap();
        mgr.get(GetMode::AsyncExact, Request::new(1, "b", "")).unwrap();
        assert_eq!(mgr.destroy(), 2);
        assert_eq!(mgr.destroy(), 0);
        assert!(mgr.resume().is_idle());
        let rejected = mgr.get(GetMode::AsyncExact, Request::new(1, "c", "d")).unwrap_err();
        assert!(matches!(rejected.error(), ReqMgrError::Destroyed { .. }));
        assert_eq!(rejected.into_request().into_contexts(), ("c", "d"));
    }
}
