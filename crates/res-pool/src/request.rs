//! Deferred requests and the FIFO they wait in.

use alloc::{boxed::Box, collections::VecDeque};
use core::fmt;

/// Completion notification for a deferred request.
///
/// Receives both caller contexts and the number of items granted.
pub type RequestCallback<C> = fn(&C, &C, u32);

/// A request for `count` items that could not be met when it was made.
#[derive(Clone)]
pub struct Request<C> {
    count: u32,
    partial_ok: bool,
    callback: Option<RequestCallback<C>>,
    context1: C,
    context2: C,
}

impl<C> Request<C> {
    /// A request for exactly `count` items.
    #[must_use]
    pub fn new(count: u32, context1: C, context2: C) -> Self {
        Self {
            count,
            partial_ok: false,
            callback: None,
            context1,
            context2,
        }
    }

    /// Allows the request to be satisfied a few items at a time.
    #[must_use]
    pub fn partial_ok(mut self, partial_ok: bool) -> Self {
        self.partial_ok = partial_ok;
        self
    }

    #[must_use]
    pub fn with_callback(mut self, callback: RequestCallback<C>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Items still owed to the requester, or, on a request handed back by
    /// a dequeue, the items granted by that dequeue.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    #[must_use]
    pub fn is_partial_ok(&self) -> bool {
        self.partial_ok
    }

    #[must_use]
    pub fn callback(&self) -> Option<RequestCallback<C>> {
        self.callback
    }

    #[must_use]
    pub fn context1(&self) -> &C {
        &self.context1
    }

    #[must_use]
    pub fn context2(&self) -> &C {
        &self.context2
    }

    #[must_use]
    pub fn into_contexts(self) -> (C, C) {
        (self.context1, self.context2)
    }

    /// Invokes the callback, if any, with the contexts and `count`.
    pub fn notify(&self) {
        if let Some(callback) = self.callback {
            callback(&self.context1, &self.context2, self.count);
        }
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        self.count = count;
    }

    /// Splits `granted` items off the head of a partial request.
    pub(crate) fn split_off(&mut self, granted: u32) -> Self
    where
        C: Clone,
    {
        assert!(
            granted < self.count,
            "granting {granted} of {} is not a partial grant",
            self.count
        );
        self.count -= granted;
        Self {
            count: granted,
            partial_ok: self.partial_ok,
            callback: self.callback,
            context1: self.context1.clone(),
            context2: self.context2.clone(),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for Request<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("count", &self.count)
            .field("partial_ok", &self.partial_ok)
            .field("callback", &self.callback.is_some())
            .field("context1", &self.context1)
            .field("context2", &self.context2)
            .finish()
    }
}

/// Heap storage for one queued request, recycled between requests.
pub struct RequestSlot<C>(Box<Option<Request<C>>>);

impl<C> Default for RequestSlot<C> {
    fn default() -> Self {
        Self(Box::new(None))
    }
}

impl<C> RequestSlot<C> {
    fn fill(&mut self, request: Request<C>) {
        assert!(self.0.is_none(), "request slot already holds a request");
        *self.0 = Some(request);
    }

    pub(crate) fn take(&mut self) -> Option<Request<C>> {
        self.0.take()
    }

    fn request(&self) -> &Request<C> {
        Option::as_ref(&self.0).expect("queue corruption: empty slot queued")
    }

    fn request_mut(&mut self) -> &mut Request<C> {
        Option::as_mut(&mut self.0).expect("queue corruption: empty slot queued")
    }
}

impl<C> fmt::Debug for RequestSlot<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestSlot")
            .field(&Option::as_ref(&self.0).map(Request::count))
            .finish()
    }
}

/// Storage for a new queue entry could not be reserved. Carries the empty
/// slot and the request back to the caller.
#[derive(Debug)]
pub(crate) struct QueueFull<C> {
    pub(crate) slot: RequestSlot<C>,
    pub(crate) request: Request<C>,
}

/// A request that was not queued, handed back with the reason.
///
/// Nothing of the request is lost: the caller can retry it later or take
/// its contexts back with [`into_request`](Self::into_request).
pub struct Rejected<C, E> {
    request: Request<C>,
    error: E,
}

impl<C, E> Rejected<C, E> {
    pub(crate) fn new(request: Request<C>, error: E) -> Self {
        Self { request, error }
    }

    #[must_use]
    pub fn request(&self) -> &Request<C> {
        &self.request
    }

    #[must_use]
    pub fn error(&self) -> &E {
        &self.error
    }

    #[must_use]
    pub fn into_request(self) -> Request<C> {
        self.request
    }

    #[must_use]
    pub fn into_parts(self) -> (Request<C>, E) {
        (self.request, self.error)
    }
}

impl<C: fmt::Debug, E: fmt::Debug> fmt::Debug for Rejected<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("request", &self.request)
            .field("error", &self.error)
            .finish()
    }
}

impl<C, E> fmt::Display for Rejected<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request for {} items was not queued", self.request.count)
    }
}

impl<C, E> core::error::Error for Rejected<C, E>
where
    C: fmt::Debug,
    E: core::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Pending requests in arrival order. Only the head is ever serviced.
#[derive(Debug)]
pub(crate) struct RequestQueue<C> {
    slots: VecDeque<RequestSlot<C>>,
}

impl<C> Default for RequestQueue<C> {
    fn default() -> Self {
        Self {
            slots: VecDeque::new(),
        }
    }
}

impl<C> RequestQueue<C> {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Appends `request` stored in `slot`, handing both back if the queue
    /// cannot grow.
    pub(crate) fn push(
        &mut self,
        mut slot: RequestSlot<C>,
        request: Request<C>,
    ) -> Result<(), QueueFull<C>> {
        if self.slots.try_reserve(1).is_err() {
            return Err(QueueFull { slot, request });
        }
        slot.fill(request);
        self.slots.push_back(slot);
        Ok(())
    }

    pub(crate) fn head(&self) -> Option<&Request<C>> {
        self.slots.front().map(RequestSlot::request)
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut Request<C>> {
        self.slots.front_mut().map(RequestSlot::request_mut)
    }

    /// Removes the head, returning its request and the emptied slot.
    pub(crate) fn pop(&mut self) -> Option<(Request<C>, RequestSlot<C>)> {
        let mut slot = self.slots.pop_front()?;
        let request = slot.take().expect("queue corruption: empty slot queued");
        Some((request, slot))
    }

    /// Empties the queue, yielding each discarded request with its slot.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (Request<C>, RequestSlot<C>)> + '_ {
        self.slots.drain(..).map(|mut slot| {
            let request = slot.take().expect("queue corruption: empty slot queued");
            (request, slot)
        })
    }
}

/// Outcome of servicing the head of a [`RequestQueue`] against `available`
/// items.
#[derive(Debug)]
pub(crate) enum Service<C> {
    /// Head satisfied in full and removed; the slot can be recycled.
    Completed(Request<C>, RequestSlot<C>),
    /// Head partially satisfied; the returned request carries the grant.
    Partial(Request<C>),
    /// Head cannot make progress.
    Blocked,
    Empty,
}

impl<C: Clone> RequestQueue<C> {
    /// Services the head request with `available` items.
    ///
    /// A partial request makes progress whenever at least one item is
    /// available; the head record keeps the remainder in place.
    pub(crate) fn service(&mut self, available: u32) -> Service<C> {
        let Some(head) = self.head_mut() else {
            return Service::Empty;
        };
        if head.count() <= available {
            let Some((request, slot)) = self.pop() else {
                unreachable!("queue head vanished");
            };
            return Service::Completed(request, slot);
        }
        if head.is_partial_ok() && available > 0 {
            return Service::Partial(head.split_off(available));
        }
        Service::Blocked
    }
}
