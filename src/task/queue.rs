use crate::task::fiber::TaskFiber;
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;

/// An intrusive doubly-linked FIFO of fibers.
///
/// The queue does not own its members: it only threads the `prev`/`next`
/// links embedded in each [`TaskFiber`], so membership says nothing about
/// fiber lifetime and reordering (e.g. for a priority boost) is O(1).
///
/// Every operation enforces the membership invariant: a fiber's `queue`
/// pointer is set iff the fiber is linked into exactly that queue. Violations
/// are programming errors and panic.
///
/// Not `Send`/`Sync`. A queue and all fibers linked into it belong to a
/// single thread.
pub(crate) struct FiberQueue {
    first: Cell<Option<NonNull<TaskFiber>>>,
    last: Cell<Option<NonNull<TaskFiber>>>,
    len: Cell<usize>,
}

impl FiberQueue {
    pub(crate) const fn new() -> Self {
        Self {
            first: Cell::new(None),
            last: Cell::new(None),
            len: Cell::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.get()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len.get() == 0
    }

    /// Whether `fiber` is currently linked into this queue.
    pub(crate) fn contains(&self, fiber: NonNull<TaskFiber>) -> bool {
        // Safety: fibers are arena-allocated and never freed.
        unsafe { fiber.as_ref() }.queue.get() == Some(NonNull::from(self))
    }

    /// Links `fiber` at the tail.
    #[track_caller]
    pub(crate) fn insert_back(&self, fiber: NonNull<TaskFiber>) {
        let f = self.check_detached(fiber);

        f.queue.set(Some(NonNull::from(self)));
        f.prev.set(self.last.get());
        match self.last.get() {
            Some(last) => unsafe { last.as_ref() }.next.set(Some(fiber)),
            None => self.first.set(Some(fiber)),
        }
        self.last.set(Some(fiber));
        self.len.set(self.len.get() + 1);
    }

    /// Links `fiber` at the head, ahead of everything already queued.
    #[track_caller]
    pub(crate) fn insert_front(&self, fiber: NonNull<TaskFiber>) {
        let f = self.check_detached(fiber);

        f.queue.set(Some(NonNull::from(self)));
        f.next.set(self.first.get());
        match self.first.get() {
            Some(first) => unsafe { first.as_ref() }.prev.set(Some(fiber)),
            None => self.last.set(Some(fiber)),
        }
        self.first.set(Some(fiber));
        self.len.set(self.len.get() + 1);
    }

    /// Unlinks and returns the head.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty.
    #[track_caller]
    pub(crate) fn pop_front(&self) -> NonNull<TaskFiber> {
        let fiber = self
            .first
            .get()
            .expect("pop_front called on an empty fiber queue");
        let f = unsafe { fiber.as_ref() };
        debug_assert_eq!(f.queue.get(), Some(NonNull::from(self)));

        self.first.set(f.next.get());
        match f.next.get() {
            Some(next) => unsafe { next.as_ref() }.prev.set(None),
            None => self.last.set(None),
        }
        Self::clear_links(f);
        self.len.set(self.len.get() - 1);
        fiber
    }

    /// Unlinks `fiber` from an arbitrary position.
    ///
    /// # Panics
    ///
    /// Panics if `fiber` is not a member of this queue.
    #[track_caller]
    pub(crate) fn remove(&self, fiber: NonNull<TaskFiber>) {
        let f = unsafe { fiber.as_ref() };
        assert_eq!(
            f.queue.get(),
            Some(NonNull::from(self)),
            "removed fiber is not a member of this queue"
        );

        match f.prev.get() {
            Some(prev) => unsafe { prev.as_ref() }.next.set(f.next.get()),
            None => self.first.set(f.next.get()),
        }
        match f.next.get() {
            Some(next) => unsafe { next.as_ref() }.prev.set(f.prev.get()),
            None => self.last.set(f.prev.get()),
        }
        Self::clear_links(f);
        self.len.set(self.len.get() - 1);
    }

    #[track_caller]
    fn check_detached(&self, fiber: NonNull<TaskFiber>) -> &TaskFiber {
        // Safety: fibers are arena-allocated and never freed, and all queue
        // members belong to the current thread.
        let f = unsafe { fiber.as_ref() };
        assert!(
            f.queue.get().is_none(),
            "inserted fiber is already in a queue"
        );
        debug_assert!(f.prev.get().is_none() && f.next.get().is_none());
        f
    }

    fn clear_links(f: &TaskFiber) {
        f.prev.set(None);
        f.next.set(None);
        f.queue.set(None);
    }
}

impl fmt::Debug for FiberQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberQueue")
            .field("len", &self.len.get())
            .finish_non_exhaustive()
    }
}
