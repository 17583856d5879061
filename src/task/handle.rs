use crate::context;
use crate::task::error::InterruptedError;
use crate::task::fiber::{self, TaskFiber};
use std::fmt;
use std::ptr::NonNull;

/// A lightweight handle to one task instance: the fiber it runs on plus the
/// generation it was spawned at.
///
/// Handles are plain values and can be freely copied and compared.
/// Because fibers are recycled, a handle can outlive its task;
/// the generation makes that safe: once the fiber moves on, [`running`]
/// reports `false`, [`join`] returns immediately and [`interrupt`] does
/// nothing.
///
/// Handles may be sent across threads for bookkeeping, but [`join`] and
/// [`interrupt`] must be called from the thread the task runs on.
///
/// [`running`]: Task::running
/// [`join`]: Task::join
/// [`interrupt`]: Task::interrupt
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Task {
    fiber: Option<NonNull<TaskFiber>>,
    generation: usize,
}

// Safety: the pointer target is arena-allocated and never freed, and the only
// fields reachable from another thread (`generation`, `running`) are atomics.
// Everything else is guarded by owning-thread assertions.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// The handle of the task currently executing, or the null handle outside
    /// of any task.
    pub fn current() -> Task {
        match fiber::current() {
            // Safety: fibers are never freed.
            Some(f) => unsafe { f.as_ref() }.task(),
            None => Task::null(),
        }
    }

    /// A handle referring to no task. Equal to `Task::default()`.
    pub const fn null() -> Task {
        Task {
            fiber: None,
            generation: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.fiber.is_none()
    }

    pub(crate) fn new(fiber: NonNull<TaskFiber>, generation: usize) -> Task {
        Task {
            fiber: Some(fiber),
            generation,
        }
    }

    pub(crate) fn fiber(&self) -> Option<NonNull<TaskFiber>> {
        self.fiber
    }

    pub(crate) fn generation(&self) -> usize {
        self.generation
    }

    /// Whether the task this handle refers to is still running.
    ///
    /// `false` for the null handle and for handles whose fiber has moved on
    /// to a later task instance. Callable from any thread.
    pub fn running(&self) -> bool {
        let Some(ptr) = self.fiber else { return false };
        // Safety: fibers are never freed; only atomics are read here.
        let f = unsafe { ptr.as_ref() };
        f.generation() == self.generation && f.is_running()
    }

    /// Blocks the caller until this task ends.
    ///
    /// Returns immediately if the task already ended (or the handle is
    /// stale). Inside a task this suspends the calling fiber; outside it
    /// drives the event loop until the task ends. Interruptible.
    ///
    /// # Panics
    ///
    /// Panics if called from another thread or from the task itself.
    #[track_caller]
    pub fn join(&self) -> Result<(), InterruptedError> {
        let Some(ptr) = self.fiber else { return Ok(()) };
        let f = unsafe { ptr.as_ref() };
        f.assert_owner_thread("Task::join");
        assert!(
            fiber::current() != Some(ptr),
            "a task cannot join itself"
        );

        while f.generation() == self.generation && f.is_running() {
            f.on_exit.wait()?;
        }
        Ok(())
    }

    /// Asks this task to stop.
    ///
    /// Sets the task's interrupt flag and immediately switches to it, so the
    /// request is observed at the task's next interruptible suspension point
    /// as an [`InterruptedError`]. Cooperative: a task that never suspends
    /// never observes it. No-op on stale or finished handles.
    ///
    /// # Panics
    ///
    /// Panics if called from another thread or from the task itself.
    #[track_caller]
    pub fn interrupt(&self) {
        let Some(ptr) = self.fiber else { return };
        let f = unsafe { ptr.as_ref() };
        f.assert_owner_thread("Task::interrupt");
        assert!(
            fiber::current() != Some(ptr),
            "a task cannot interrupt itself"
        );

        if f.generation() != self.generation || !f.is_running() {
            return;
        }
        f.set_interrupt();
        tracing::debug!(task = %self.debug_id(), "interrupt requested");
        context::with_scheduler(|s| s.switch_to(*self));
    }

    /// A stable four-character digest of `(fiber, generation)` for log
    /// correlation. Distinct task instances on the same fiber digest
    /// differently.
    pub fn debug_id(&self) -> DebugId {
        let ptr = self.fiber.map_or(0u64, |p| p.as_ptr() as usize as u64);
        let mixed = (ptr ^ (self.generation as u64)).wrapping_mul(0x9E37_79B9_7F4A_7C15);

        const TABLE: &[u8; 64] =
            b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
        let mut id = [0u8; 4];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = TABLE[((mixed >> (58 - 6 * i)) & 0x3F) as usize];
        }
        DebugId(id)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("Task(null)");
        }
        f.debug_struct("Task")
            .field("id", &self.debug_id())
            .field("generation", &self.generation)
            .field("running", &self.running())
            .finish()
    }
}

/// See [`Task::debug_id`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DebugId([u8; 4]);

impl fmt::Display for DebugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The table only emits ASCII.
        f.write_str(std::str::from_utf8(&self.0).expect("base64 digest is ascii"))
    }
}

impl fmt::Debug for DebugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DebugId({self})")
    }
}
