//! Spawning tasks onto the runtime.
//!
//! Tasks are spawned with the simple [`run_task()`] function, with
//! [`run_task_with()`] when the payload is bigger than a couple of machine
//! words, or through [`task_builder()`] for control over [`TaskOpts`].
//!
//! Spawning is heap-free: the callable and its arguments are packed into a
//! fixed-size inline descriptor and handed to a pooled fiber. Oversized
//! payloads are rejected at compile time.

use crate::context;
use crate::task::fiber::TaskFiber;
use crate::task::{Task, TaskEvent, TaskFuncInfo, emit_task_event};
use anyhow::{Context as _, Result};
use bitflags::bitflags;
use slab::Slab;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;

bitflags! {
    /// Configuration options for a new task.
    ///
    /// Passed to the runtime via [`TaskBuilder::opts`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct TaskOpts: u32 {
        /// Enqueue the task at the back of the run queue instead of starting
        /// it immediately. Its first slice of execution then happens in a
        /// later drive round, after everything already queued.
        const DEFERRED = 1;
    }
}

/// Spawns a task running `f` and returns its handle.
///
/// The task starts immediately: spawned from inside another task it runs now
/// and the spawner resumes right after it suspends; spawned from outside it
/// runs until its first suspension before this returns.
///
/// The closure may capture at most two machine words of state (checked at
/// compile time); route anything bigger through [`run_task_with()`].
///
/// # Panics
///
/// Panics if no runtime is built on this thread or the fiber stack cannot be
/// allocated; see [`try_run_task()`] for the fallible form.
#[track_caller]
pub fn run_task<F>(f: F) -> Task
where
    F: FnOnce() + 'static,
{
    task_builder().spawn(f)
}

/// Fallible form of [`run_task()`].
#[track_caller]
pub fn try_run_task<F>(f: F) -> Result<Task>
where
    F: FnOnce() + 'static,
{
    task_builder().try_spawn(f)
}

/// Spawns a task running `func(args)`.
///
/// The argument payload is stored inline in the spawn descriptor and may be
/// up to [`MAX_TASK_ARGS_SIZE`] bytes (checked at compile time).
///
/// [`MAX_TASK_ARGS_SIZE`]: crate::task::MAX_TASK_ARGS_SIZE
#[track_caller]
pub fn run_task_with<A>(func: fn(A), args: A) -> Task
where
    A: 'static,
{
    task_builder().spawn_with(func, args)
}

/// Creates a new [`TaskBuilder`] for configuring and spawning a task.
pub fn task_builder() -> TaskBuilder {
    TaskBuilder::default()
}

/// Configures and spawns a task.
///
/// ```no_run
/// use fibra::TaskOpts;
///
/// fibra::task_builder()
///     .opts(TaskOpts::DEFERRED)
///     .spawn(|| {
///         // runs in the next drive round
///     });
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskBuilder {
    opts: TaskOpts,
}

impl TaskBuilder {
    pub fn opts(mut self, opts: TaskOpts) -> Self {
        self.opts = opts;
        self
    }

    #[track_caller]
    pub fn spawn<F>(self, f: F) -> Task
    where
        F: FnOnce() + 'static,
    {
        self.try_spawn(f).expect("failed to spawn task")
    }

    #[track_caller]
    pub fn try_spawn<F>(self, f: F) -> Result<Task>
    where
        F: FnOnce() + 'static,
    {
        spawn_info(TaskFuncInfo::from_closure(f), self.opts)
    }

    #[track_caller]
    pub fn spawn_with<A>(self, func: fn(A), args: A) -> Task
    where
        A: 'static,
    {
        spawn_info(TaskFuncInfo::from_fn_args(func, args), self.opts)
            .expect("failed to spawn task")
    }
}

#[track_caller]
fn spawn_info(info: TaskFuncInfo, opts: TaskOpts) -> Result<Task> {
    context::with(|ctx| {
        let fiber_ptr = ctx.pool().acquire(ctx.task_stack_size())?;
        // Safety: fibers are never freed.
        let fiber = unsafe { fiber_ptr.as_ref() };
        debug_assert!(!fiber.is_running());
        fiber.set_task_func(info);

        let task = fiber.task();
        emit_task_event(TaskEvent::PreStart, task);

        if opts.contains(TaskOpts::DEFERRED) {
            ctx.scheduler().reschedule(task);
        } else {
            // Front boost: the new task runs now, the spawner (if any)
            // resumes right behind it.
            ctx.scheduler().switch_to(task);
        }

        emit_task_event(TaskEvent::PostStart, task);
        tracing::trace!(task = %task.debug_id(), deferred = opts.contains(TaskOpts::DEFERRED), "task spawned");
        Ok(task)
    })
}

/// The per-thread fiber pool.
///
/// Fibers are allocated on demand, parked on a free list between tasks, and
/// never freed: the arena records every fiber ever created on this thread so
/// stacks are reused rather than reallocated.
pub(crate) struct FiberPool {
    arena: RefCell<Slab<NonNull<TaskFiber>>>,
    free: RefCell<SmallVec<[NonNull<TaskFiber>; 16]>>,
}

impl FiberPool {
    pub(crate) fn new() -> Self {
        Self {
            arena: RefCell::new(Slab::new()),
            free: RefCell::new(SmallVec::new()),
        }
    }

    /// Pops an idle fiber, or allocates one with `stack_size` bytes of stack.
    pub(crate) fn acquire(&self, stack_size: usize) -> Result<NonNull<TaskFiber>> {
        if let Some(fiber) = self.free.borrow_mut().pop() {
            tracing::trace!("reusing a pooled fiber");
            return Ok(fiber);
        }

        let fiber =
            TaskFiber::new(stack_size).context("failed to allocate a fiber stack")?;
        self.arena.borrow_mut().insert(fiber);
        tracing::trace!(total = self.total(), "created a new fiber");
        Ok(fiber)
    }

    pub(crate) fn recycle(&self, fiber: NonNull<TaskFiber>) {
        debug_assert!(!unsafe { fiber.as_ref() }.is_running());
        self.free.borrow_mut().push(fiber);
    }

    /// Fibers ever created on this thread.
    pub(crate) fn total(&self) -> usize {
        self.arena.borrow().len()
    }

    /// Fibers currently parked between tasks.
    pub(crate) fn idle(&self) -> usize {
        self.free.borrow().len()
    }
}

impl fmt::Debug for FiberPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberPool")
            .field("total", &self.total())
            .field("idle", &self.idle())
            .finish()
    }
}
