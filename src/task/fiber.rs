use crate::context;
use crate::sync::ManualEvent;
use crate::task::error::{InterruptedError, panic_payload_as_str};
use crate::task::func::TaskFuncInfo;
use crate::task::handle::Task;
use crate::task::local::{self, FlsStorage};
use crate::task::queue::FiberQueue;
use crate::task::{TaskEvent, emit_task_event};
use crate::utils::BitSet;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::{Cell, OnceCell, UnsafeCell};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;

pub(crate) type FiberCoroutine = Coroutine<(), (), ()>;
pub(crate) type FiberYielder = Yielder<(), ()>;

/// A reusable execution context: one native stack that runs a sequence of
/// task invocations.
///
/// Fibers are allocated once and never freed; the spawn layer pools them
/// through a free list. Reuse is what makes handles cheap: a [`Task`] is just
/// the fiber pointer plus the generation the task was spawned at, and the
/// generation bump at task end turns every outstanding handle into a silent
/// no-op.
///
/// All fields except `generation` and `running` (readable for cross-thread
/// handle inspection) are only touched from the fiber's owning thread.
pub(crate) struct TaskFiber {
    /// The stack. `None` for stackless sentinels: the scheduler's round
    /// marker and the per-thread dummy fiber that anchors fiber-local
    /// storage outside of tasks.
    coroutine: UnsafeCell<Option<FiberCoroutine>>,

    /// Suspension point handle, valid while the coroutine is alive.
    yielder: Cell<Option<NonNull<FiberYielder>>>,

    owner: ThreadId,

    /// Distinguishes successive task instances sharing this fiber.
    /// Strictly increasing; bumped when a task ends.
    generation: AtomicUsize,

    /// True between task start and task end.
    running: AtomicBool,

    /// Pending cancellation request, consumed at the next interruptible
    /// suspension point.
    interrupt: Cell<bool>,

    /// Broadcast when the current task instance ends; joiners wait on this.
    pub(crate) on_exit: ManualEvent,

    /// The next invocation to run, set by the spawn layer while the fiber
    /// idles between tasks.
    task_func: Cell<Option<TaskFuncInfo>>,

    // Intrusive run-queue links, maintained exclusively by `FiberQueue`.
    pub(crate) prev: Cell<Option<NonNull<TaskFiber>>>,
    pub(crate) next: Cell<Option<NonNull<TaskFiber>>>,
    pub(crate) queue: Cell<Option<NonNull<FiberQueue>>>,

    // Fiber-local storage, maintained by `task::local`.
    pub(crate) fls_storage: UnsafeCell<FlsStorage>,
    pub(crate) fls_initialized: UnsafeCell<BitSet>,
    pub(crate) fls_borrows: Cell<usize>,
}

thread_local! {
    /// The fiber currently executing on this thread, if any. Set by the
    /// scheduler around every resume.
    static CURRENT: Cell<Option<NonNull<TaskFiber>>> = const { Cell::new(None) };

    /// Stackless fiber that makes fiber-local storage addressable outside of
    /// any task. Created lazily, lives for the thread's lifetime.
    static DUMMY: OnceCell<NonNull<TaskFiber>> = const { OnceCell::new() };
}

pub(crate) fn current() -> Option<NonNull<TaskFiber>> {
    CURRENT.with(|c| c.get())
}

pub(crate) fn set_current(fiber: Option<NonNull<TaskFiber>>) -> Option<NonNull<TaskFiber>> {
    CURRENT.with(|c| c.replace(fiber))
}

/// The current fiber, or the thread's dummy fiber outside of any task.
pub(crate) fn current_or_dummy() -> NonNull<TaskFiber> {
    current().unwrap_or_else(|| DUMMY.with(|d| *d.get_or_init(TaskFiber::sentinel)))
}

#[cfg(test)]
pub(crate) fn with_current_override<R>(fiber: NonNull<TaskFiber>, f: impl FnOnce() -> R) -> R {
    let prev = set_current(Some(fiber));
    let _restore = crate::utils::ScopeGuard::new(move || {
        set_current(prev);
    });
    f()
}

/// Consumes a pending interrupt on the current fiber, if any.
///
/// Interruptible suspension points call this on both sides of their suspend;
/// task code that goes a long time between suspension points can poll it as
/// an explicit cancellation checkpoint. Outside of a task this is a no-op.
pub fn handle_interrupt() -> Result<(), InterruptedError> {
    match current() {
        // Safety: fibers are never freed.
        Some(f) if unsafe { f.as_ref() }.take_interrupt() => Err(InterruptedError),
        _ => Ok(()),
    }
}

/// Like [`handle_interrupt`], but runs `cleanup` instead of surfacing an
/// error. For guard layers that need to observe cancellation without
/// propagating it.
pub fn handle_interrupt_with(cleanup: impl FnOnce()) {
    if let Some(f) = current()
        && unsafe { f.as_ref() }.take_interrupt()
    {
        cleanup();
    }
}

impl TaskFiber {
    /// Allocates a fiber with a stack of `stack_size` bytes and parks it in
    /// its idle loop. The allocation is leaked: fibers live for the process
    /// lifetime and are recycled, never freed.
    pub(crate) fn new(stack_size: usize) -> io::Result<NonNull<TaskFiber>> {
        let stack = DefaultStack::new(stack_size)?;
        let fiber = NonNull::from(Box::leak(Box::new(Self::raw())));
        let coroutine = Coroutine::with_stack(stack, move |yielder, ()| {
            fiber_main(fiber, yielder);
        });
        // Safety: the fiber is not shared yet.
        unsafe { *fiber.as_ref().coroutine.get() = Some(coroutine) };
        Ok(fiber)
    }

    /// A stackless fiber: usable as a queue member and as an FLS anchor, but
    /// never resumable.
    pub(crate) fn sentinel() -> NonNull<TaskFiber> {
        NonNull::from(Box::leak(Box::new(Self::raw())))
    }

    fn raw() -> Self {
        Self {
            coroutine: UnsafeCell::new(None),
            yielder: Cell::new(None),
            owner: std::thread::current().id(),
            generation: AtomicUsize::new(1),
            running: AtomicBool::new(false),
            interrupt: Cell::new(false),
            on_exit: ManualEvent::new(),
            task_func: Cell::new(None),
            prev: Cell::new(None),
            next: Cell::new(None),
            queue: Cell::new(None),
            fls_storage: UnsafeCell::new(FlsStorage::new()),
            fls_initialized: UnsafeCell::new(BitSet::new()),
            fls_borrows: Cell::new(0),
        }
    }

    /// A handle to the task instance currently associated with this fiber.
    pub(crate) fn task(&self) -> Task {
        Task::new(NonNull::from(self), self.generation())
    }

    pub(crate) fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn is_enqueued(&self) -> bool {
        self.queue.get().is_some()
    }

    pub(crate) fn has_task_func(&self) -> bool {
        // Cell<Option<_>> has no non-consuming peek; bounce the value.
        let func = self.task_func.take();
        let some = func.is_some();
        self.task_func.set(func);
        some
    }

    pub(crate) fn set_task_func(&self, func: TaskFuncInfo) {
        debug_assert!(!self.is_running());
        let prev = self.task_func.replace(Some(func));
        debug_assert!(prev.is_none(), "fiber already has a pending task");
    }

    pub(crate) fn set_interrupt(&self) {
        self.interrupt.set(true);
    }

    fn take_interrupt(&self) -> bool {
        self.interrupt.replace(false)
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    #[track_caller]
    pub(crate) fn assert_owner_thread(&self, operation: &str) {
        assert_eq!(
            self.owner(),
            std::thread::current().id(),
            "{operation} must be called from the fiber's owning thread"
        );
    }

    pub(crate) fn coroutine_cell(&self) -> *mut Option<FiberCoroutine> {
        self.coroutine.get()
    }

    /// Suspends the calling fiber, returning control to whoever resumed it.
    ///
    /// Must be called on the fiber's own stack.
    pub(crate) fn suspend(&self) {
        let yielder = self
            .yielder
            .get()
            .expect("suspend called on a fiber that never started");
        // Safety: the yielder outlives every suspension, because the
        // coroutine body that owns it never returns.
        unsafe { yielder.as_ref().suspend(()) };
    }
}

impl fmt::Debug for TaskFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFiber")
            .field("generation", &self.generation())
            .field("running", &self.is_running())
            .field("enqueued", &self.is_enqueued())
            .field("pending_task", &self.has_task_func())
            .finish_non_exhaustive()
    }
}

/// The fiber's outer loop: runs on the coroutine stack forever, executing one
/// task invocation per wakeup-with-work and recycling itself in between.
fn fiber_main(fiber: NonNull<TaskFiber>, yielder: &FiberYielder) {
    // Safety: fibers are never freed; this reference is good for the life of
    // the coroutine.
    let me = unsafe { fiber.as_ref() };
    me.yielder.set(Some(NonNull::from(yielder)));

    loop {
        while !me.has_task_func() {
            yielder.suspend(());
            if !me.has_task_func() {
                // Resumed without work, e.g. a wakeup that raced a recycle.
                // A stray interrupt aimed at a finished task dies here.
                if me.interrupt.replace(false) {
                    tracing::debug!("idle fiber dropped a stale interrupt");
                } else {
                    tracing::trace!("idle fiber resumed without work");
                }
            }
        }
        let func = me.task_func.take().expect("checked above");

        me.running.store(true, Ordering::Release);
        emit_task_event(TaskEvent::Start, me.task());

        // Started before the event loop: park until a drive cycle begins so
        // the task only ever observes a live loop.
        while !context::event_loop_running() {
            context::with_scheduler(|s| s.yield_uninterruptible());
        }

        match panic::catch_unwind(AssertUnwindSafe(|| func.invoke())) {
            Ok(()) => {
                emit_task_event(TaskEvent::End, me.task());
                tracing::trace!(task = %me.task().debug_id(), "task finished");
            }
            Err(payload) => {
                emit_task_event(TaskEvent::Fail, me.task());
                tracing::error!(
                    task = %me.task().debug_id(),
                    panic = panic_payload_as_str(&payload),
                    "task terminated with an unhandled panic"
                );
            }
        }

        // An interrupt that was never observed is consumed with the task.
        me.interrupt.set(false);

        me.on_exit.emit();

        if let Some(queue) = me.queue.get() {
            // A finished task should not be scheduled; unhook just in case.
            tracing::warn!(task = %me.task().debug_id(), "finished task was still enqueued");
            unsafe { queue.as_ref() }.remove(fiber);
        }

        // Safety: on the owning thread, with no task-local borrows live.
        unsafe { local::destroy(me) };

        me.running.store(false, Ordering::Release);
        me.generation.fetch_add(1, Ordering::AcqRel);
        context::recycle_fiber(fiber);
    }
}

pub(crate) fn resume(fiber: NonNull<TaskFiber>) {
    // Safety: fibers are never freed.
    let f = unsafe { fiber.as_ref() };
    f.assert_owner_thread("resume");

    let prev = set_current(Some(fiber));
    debug_assert!(prev.is_none(), "fibers are only resumed from the scheduler");
    let _restore = crate::utils::ScopeGuard::new(move || {
        set_current(prev);
    });

    if f.is_running() {
        emit_task_event(TaskEvent::Resume, f.task());
    }

    // Safety: single-threaded, and a fiber cannot resume itself, so the
    // coroutine cell is not aliased while we hold it.
    let coroutine = unsafe { &mut *f.coroutine_cell() };
    let coroutine = coroutine
        .as_mut()
        .expect("attempted to resume a stackless sentinel fiber");

    match panic::catch_unwind(AssertUnwindSafe(|| coroutine.resume(()))) {
        Ok(CoroutineResult::Yield(())) => {}
        Ok(CoroutineResult::Return(())) => {
            unreachable!("fiber main loop returned");
        }
        Err(payload) => {
            // Task panics are caught inside the fiber; anything that makes it
            // across the stack boundary is scheduler-fatal.
            tracing::error!(
                panic = panic_payload_as_str(&payload),
                "panic escaped a fiber stack; the runtime is unrecoverable"
            );
            panic::resume_unwind(payload);
        }
    }
}
