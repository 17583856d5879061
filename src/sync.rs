//! Synchronization primitives for tasks.

use crate::context;
use crate::task::{InterruptedError, Task, handle_interrupt};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::fmt;

/// A broadcast condition for tasks on one thread: [`wait`] suspends the
/// current task, [`emit`] wakes every waiter.
///
/// There is no "reset": each `emit` is a one-shot broadcast observed by the
/// tasks waiting at that moment. The event keeps a monotonic emit counter so
/// a waiter woken for any other reason (an interrupt, a stray wakeup) can
/// tell whether its emit actually happened and go back to sleep otherwise.
///
/// Not `Sync`: an event belongs to the thread whose tasks wait on it.
///
/// [`wait`]: ManualEvent::wait
/// [`emit`]: ManualEvent::emit
#[derive(Default)]
pub struct ManualEvent {
    emits: Cell<usize>,
    waiters: RefCell<SmallVec<[Task; 4]>>,
}

impl ManualEvent {
    pub const fn new() -> Self {
        Self {
            emits: Cell::new(0),
            waiters: RefCell::new(SmallVec::new_const()),
        }
    }

    /// Number of times this event has been emitted.
    pub fn emit_count(&self) -> usize {
        self.emits.get()
    }

    /// Wakes every task currently waiting on this event.
    pub fn emit(&self) {
        self.emits.set(self.emits.get().wrapping_add(1));

        // Drain before waking: a woken waiter may immediately wait again.
        let waiters: SmallVec<[Task; 4]> = self.waiters.borrow_mut().drain(..).collect();
        if waiters.is_empty() {
            return;
        }
        tracing::trace!(waiters = waiters.len(), "manual event emitted");
        context::with_scheduler(|s| {
            for task in waiters {
                s.reschedule(task);
            }
        });
    }

    /// Blocks the caller until the next [`emit`].
    ///
    /// Inside a task this suspends the calling fiber until an emitter
    /// reschedules it; interrupt requests surface here as
    /// [`InterruptedError`]. Outside of any task it drives the event loop
    /// until the emit happens (the bootstrap pattern, e.g. the main thread
    /// joining a task).
    ///
    /// [`emit`]: ManualEvent::emit
    pub fn wait(&self) -> Result<(), InterruptedError> {
        let target = self.emits.get();
        let me = Task::current();

        if me.is_null() {
            while self.emits.get() == target {
                crate::hibernate();
            }
            return Ok(());
        }

        while self.emits.get() == target {
            {
                let mut waiters = self.waiters.borrow_mut();
                if !waiters.contains(&me) {
                    waiters.push(me);
                }
            }
            crate::hibernate();
            if let Err(interrupted) = handle_interrupt() {
                // Deregister: the emit, if it ever comes, is not for us
                // anymore.
                self.waiters.borrow_mut().retain(|t| *t != me);
                return Err(interrupted);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ManualEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualEvent")
            .field("emits", &self.emits.get())
            .field("waiters", &self.waiters.borrow().len())
            .finish()
    }
}
