use crate::context;
use crate::runtime::driver::{EventDriver, ExitReason, NullDriver};
use crate::task::Task;
use anyhow::{Result, anyhow};
use std::cell::Cell;
use std::convert::TryFrom;
use std::marker::PhantomData;

/// Default stack size for task fibers. Generous on 64-bit targets where
/// address space is free; modest on 32-bit where it is not.
pub(crate) const DEFAULT_TASK_STACK_SIZE: usize = if cfg!(target_pointer_width = "64") {
    16 * 1024 * 1024
} else {
    512 * 1024
};

/// Stacks below this cannot hold the fiber bookkeeping plus reasonable user
/// frames.
const MIN_TASK_STACK_SIZE: usize = 16 * 1024;

/// Configures and builds a [`Runtime`].
pub struct Builder {
    /// Stack size in bytes for every fiber this runtime creates.
    task_stack_size: usize,

    /// The event source to interleave with task rounds. Defaults to
    /// [`NullDriver`].
    driver: Option<Box<dyn EventDriver>>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            task_stack_size: DEFAULT_TASK_STACK_SIZE,
            driver: None,
        }
    }

    /// Sets the stack size (in bytes) for task fibers.
    ///
    /// The actual size may be rounded up to the platform page size. Stacks
    /// are pooled with their fibers, so this is paid once per concurrent-task
    /// high-water mark, not once per spawn.
    pub fn task_stack_size(mut self, val: usize) -> Self {
        self.task_stack_size = val;
        self
    }

    /// Sets the event driver the scheduler coordinates with.
    pub fn driver(mut self, driver: impl EventDriver) -> Self {
        self.driver = Some(Box::new(driver));
        self
    }

    /// Creates the configured `Runtime` and installs it on this thread.
    ///
    /// The returned `Runtime` is ready to spawn tasks. At most one runtime
    /// may be live per thread; fibers pooled by a previous runtime on this
    /// thread are reused.
    pub fn try_build(mut self) -> Result<Runtime> {
        IS_RUNTIME_ACTIVE.with(|is_active| -> Result<()> {
            if is_active.get() {
                Err(anyhow!(
                    "cannot build a runtime: one is already active on this thread"
                ))
            } else {
                is_active.set(true);
                Ok(())
            }
        })?;

        let driver = self
            .driver
            .take()
            .unwrap_or_else(|| Box::new(NullDriver));
        let cfg = match RuntimeConfig::try_from(self) {
            Ok(cfg) => cfg,
            Err(e) => {
                IS_RUNTIME_ACTIVE.with(|is_active| is_active.set(false));
                return Err(e);
            }
        };
        context::install(cfg, driver);

        Ok(Runtime {
            _thread_bound: PhantomData,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// Use a thread_local variable to track if a runtime is already active on this
// thread.
thread_local! {
    static IS_RUNTIME_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// A handle to the runtime installed on the current thread.
///
/// Tasks run cooperatively on this thread only; there is no work stealing and
/// no preemption. Spawning hands work to fibers, the drive cycles
/// ([`process`], [`wait_and_process`], [`run`]) interleave them with the
/// event driver.
///
/// [`process`]: Runtime::process
/// [`wait_and_process`]: Runtime::wait_and_process
/// [`run`]: Runtime::run
#[derive(Debug)]
pub struct Runtime {
    // Schedulers are thread-bound; keep the handle on its thread too.
    _thread_bound: PhantomData<*const ()>,
}

impl Runtime {
    /// Spawns a task; see [`run_task()`](crate::run_task).
    pub fn run_task<F>(&self, f: F) -> Task
    where
        F: FnOnce() + 'static,
    {
        crate::run_task(f)
    }

    /// One non-blocking drive cycle: alternates task rounds and event polls
    /// until the driver exits or nothing is left to run right now.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a task: drive cycles cannot nest. Tasks
    /// wanting to let other work run should yield or hibernate instead.
    pub fn process(&self) -> ExitReason {
        context::with_scheduler(|s| s.process())
    }

    /// One drive cycle that blocks for events when the task queue drains.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a task, like [`process`](Runtime::process).
    pub fn wait_and_process(&self) -> ExitReason {
        context::with_scheduler(|s| s.wait_and_process())
    }

    /// Drives until the driver shuts down or no work remains anywhere.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a task, like [`process`](Runtime::process).
    pub fn run(&self) -> ExitReason {
        loop {
            match self.wait_and_process() {
                reason @ (ExitReason::Exited | ExitReason::OutOfWaiters) => return reason,
                ExitReason::Timeout | ExitReason::Idle => {}
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        IS_RUNTIME_ACTIVE.with(|is_active| is_active.set(false));
    }
}

// Test-only introspection.
#[cfg(test)]
impl Runtime {
    pub(crate) fn total_fibers(&self) -> usize {
        context::with(|ctx| ctx.pool().total())
    }

    pub(crate) fn idle_fibers(&self) -> usize {
        context::with(|ctx| ctx.pool().idle())
    }

    pub(crate) fn queued_tasks(&self) -> usize {
        context::with_scheduler(|s| s.queue_len())
    }
}

/// The builder, snapshotted and validated, as consumed by the thread context.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) task_stack_size: usize,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.task_stack_size < MIN_TASK_STACK_SIZE {
            return Err(anyhow!(
                "task_stack_size must be at least {MIN_TASK_STACK_SIZE} bytes"
            ));
        }
        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = RuntimeConfig {
            task_stack_size: builder.task_stack_size,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
