//! Thread-local runtime context.
//!
//! Each thread hosting a runtime gets exactly one context bundling its
//! scheduler, fiber pool, event driver and configuration. Installed by
//! [`Builder::try_build`](crate::runtime::Builder::try_build) and reachable
//! from anywhere on the thread, including from fiber stacks.

use crate::runtime::driver::EventDriver;
use crate::runtime::runtime::RuntimeConfig;
use crate::runtime::scheduler::TaskScheduler;
use crate::spawn::FiberPool;
use crate::task::fiber::TaskFiber;
use std::cell::{Cell, OnceCell, RefCell};
use std::ptr::NonNull;

pub(crate) struct ThreadContext {
    // Boxed so the queue address stays put no matter where the context
    // itself is constructed before landing in thread-local storage.
    scheduler: Box<TaskScheduler>,

    pool: FiberPool,

    driver: RefCell<Box<dyn EventDriver>>,

    config: RefCell<RuntimeConfig>,

    /// Drive-cycle nesting depth. Tasks gate their bodies on this so user
    /// code only ever observes a live event loop.
    event_loop_depth: Cell<usize>,
}

impl ThreadContext {
    fn new(config: RuntimeConfig, driver: Box<dyn EventDriver>) -> Self {
        Self {
            scheduler: Box::new(TaskScheduler::new()),
            pool: FiberPool::new(),
            driver: RefCell::new(driver),
            config: RefCell::new(config),
            event_loop_depth: Cell::new(0),
        }
    }

    pub(crate) fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub(crate) fn pool(&self) -> &FiberPool {
        &self.pool
    }

    pub(crate) fn task_stack_size(&self) -> usize {
        self.config.borrow().task_stack_size
    }
}

thread_local! {
    static CONTEXT: OnceCell<ThreadContext> = const { OnceCell::new() };
}

/// Installs the context for this thread, or refreshes the driver and
/// configuration if one already exists (a previous runtime on this thread
/// left its scheduler and fiber pool behind for reuse).
pub(crate) fn install(config: RuntimeConfig, driver: Box<dyn EventDriver>) {
    CONTEXT.with(|cell| match cell.get() {
        Some(ctx) => {
            *ctx.driver.borrow_mut() = driver;
            *ctx.config.borrow_mut() = config;
        }
        None => {
            let _ = cell.set(ThreadContext::new(config, driver));
        }
    });
}

#[track_caller]
pub(crate) fn with<R>(f: impl FnOnce(&ThreadContext) -> R) -> R {
    CONTEXT.with(|cell| {
        let ctx = cell
            .get()
            .expect("no fibra runtime on this thread; build one with runtime::Builder");
        f(ctx)
    })
}

pub(crate) fn try_with<R>(f: impl FnOnce(&ThreadContext) -> R) -> Option<R> {
    CONTEXT.with(|cell| cell.get().map(f))
}

#[track_caller]
pub(crate) fn with_scheduler<R>(f: impl FnOnce(&TaskScheduler) -> R) -> R {
    with(|ctx| f(ctx.scheduler()))
}

#[track_caller]
pub(crate) fn with_driver<R>(f: impl FnOnce(&mut dyn EventDriver) -> R) -> R {
    with(|ctx| f(ctx.driver.borrow_mut().as_mut()))
}

pub(crate) fn event_loop_running() -> bool {
    try_with(|ctx| ctx.event_loop_depth.get() > 0).unwrap_or(false)
}

/// Marks a drive cycle as active for the guard's lifetime.
pub(crate) fn enter_event_loop() -> EventLoopGuard {
    with(|ctx| ctx.event_loop_depth.set(ctx.event_loop_depth.get() + 1));
    EventLoopGuard(())
}

pub(crate) struct EventLoopGuard(());

impl Drop for EventLoopGuard {
    fn drop(&mut self) {
        with(|ctx| ctx.event_loop_depth.set(ctx.event_loop_depth.get() - 1));
    }
}

/// Returns a fiber whose task just ended to the pool free list.
pub(crate) fn recycle_fiber(fiber: NonNull<TaskFiber>) {
    with(|ctx| ctx.pool.recycle(fiber));
}
