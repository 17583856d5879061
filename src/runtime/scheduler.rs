use crate::context;
use crate::runtime::driver::ExitReason;
use crate::task::fiber::{self, TaskFiber};
use crate::task::{FiberQueue, InterruptedError, Task, TaskEvent, emit_task_event};
use crate::utils::ScopeGuard;
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

/// The per-thread run-queue manager.
///
/// Single-threaded and cooperative: tasks run until they yield, hibernate,
/// switch to another task or finish. All state is cell-based so task code
/// re-entering the scheduler from a fiber stack never trips a borrow that an
/// outer stack frame still holds.
pub(crate) struct TaskScheduler {
    /// Runnable fibers, FIFO except for the `switch_to` front boost.
    queue: FiberQueue,

    /// Stackless sentinel inserted at the tail when a drain round starts.
    /// Everything enqueued during the round lands behind it and runs in the
    /// next round, so a re-yielding task cannot starve the loop.
    marker: NonNull<TaskFiber>,

    /// True while a drain round holds the marker in the queue. The marker is
    /// a single shared sentinel, so rounds cannot nest.
    draining: Cell<bool>,
}

impl TaskScheduler {
    pub(crate) fn new() -> Self {
        Self {
            queue: FiberQueue::new(),
            marker: TaskFiber::sentinel(),
            draining: Cell::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Cooperative, interruptible yield.
    ///
    /// Outside a task: no-op. A task that is already scheduled for a wakeup
    /// stays where it is (yield is idempotent with respect to queue state).
    pub(crate) fn yield_now(&self) -> Result<(), InterruptedError> {
        let Some(current) = fiber::current() else {
            return Ok(());
        };
        fiber::handle_interrupt()?;

        // Safety: fibers are never freed.
        let f = unsafe { current.as_ref() };
        if f.is_enqueued() {
            return Ok(());
        }

        self.queue.insert_back(current);
        emit_task_event(TaskEvent::Yield, f.task());
        f.suspend();

        fiber::handle_interrupt()
    }

    /// [`yield_now`](Self::yield_now) without the interrupt checkpoints. An
    /// interrupt arriving here stays pending for the next interruptible
    /// suspension point.
    pub(crate) fn yield_uninterruptible(&self) {
        let Some(current) = fiber::current() else {
            return;
        };
        let f = unsafe { current.as_ref() };
        if f.is_enqueued() {
            return;
        }

        self.queue.insert_back(current);
        emit_task_event(TaskEvent::Yield, f.task());
        f.suspend();
    }

    /// Suspends the current task without re-enqueueing it; the caller is
    /// expected to sit on a wait list that will reschedule or switch to it.
    ///
    /// Outside a task this instead drives one round of tasks plus events,
    /// which is what lets non-task code (the main thread) block on task-side
    /// conditions.
    pub(crate) fn hibernate(&self) {
        match fiber::current() {
            Some(current) => unsafe { current.as_ref() }.suspend(),
            None => {
                let _drive = context::enter_event_loop();
                self.schedule();
                let _ = context::with_driver(|d| d.process_events(None));
            }
        }
    }

    /// Immediately runs `target`, queuing the caller to run right after it.
    ///
    /// The queue ends up as `[target, caller, ...rest]`: both jump ahead of
    /// everything queued, which is the priority boost spawn and interrupt
    /// delivery rely on. Stale handles and self-switches are no-ops. Outside
    /// a task the target is resumed directly, blocking the thread in that
    /// fiber until it suspends.
    #[track_caller]
    pub(crate) fn switch_to(&self, target: Task) {
        let Some(target_ptr) = target.fiber() else {
            return;
        };
        let t = unsafe { target_ptr.as_ref() };
        t.assert_owner_thread("switch_to");

        if t.generation() != target.generation() {
            return;
        }
        let current = fiber::current();
        if current == Some(target_ptr) {
            return;
        }

        // A directly-resumed fiber must not linger in the queue, or its next
        // yield would find itself "already scheduled" and not suspend.
        if self.queue.contains(target_ptr) {
            self.queue.remove(target_ptr);
        }

        match current {
            None => fiber::resume(target_ptr),
            Some(current_ptr) => {
                debug_assert!(!unsafe { current_ptr.as_ref() }.is_enqueued());
                self.queue.insert_front(current_ptr);
                self.queue.insert_front(target_ptr);
                unsafe { current_ptr.as_ref() }.suspend();
            }
        }
    }

    /// Puts a hibernated (or not-yet-started) task back on the run queue.
    /// Stale handles and already-queued fibers are left alone.
    pub(crate) fn reschedule(&self, task: Task) {
        let Some(ptr) = task.fiber() else { return };
        let f = unsafe { ptr.as_ref() };
        if f.generation() != task.generation() {
            return;
        }
        if f.is_enqueued() || fiber::current() == Some(ptr) {
            return;
        }
        self.queue.insert_back(ptr);
    }

    /// Drains one round: resumes every fiber queued at round start exactly
    /// once. Returns whether runnable fibers remain afterwards.
    ///
    /// # Panics
    ///
    /// Panics if re-entered while a round is mid-drain (a task starting a
    /// drive cycle on its own runtime from inside an outer one).
    #[track_caller]
    pub(crate) fn schedule(&self) -> bool {
        assert!(
            !self.draining.replace(true),
            "drive cycles cannot be nested: a scheduler round is already mid-drain on this thread"
        );
        let _round = ScopeGuard::new(|| self.draining.set(false));

        if self.queue.is_empty() {
            return false;
        }

        self.queue.insert_back(self.marker);
        loop {
            if self.queue.is_empty() {
                // The marker bounds the round, so this cannot happen unless
                // the queue was corrupted; tolerate it in release builds.
                tracing::error!("run queue drained past its round marker");
                debug_assert!(false, "run queue drained past its round marker");
                return false;
            }
            let next = self.queue.pop_front();
            if next == self.marker {
                break;
            }
            fiber::resume(next);
        }
        !self.queue.is_empty()
    }

    /// Non-blocking drive cycle: alternate task rounds with event polls until
    /// the driver exits, everything drains, or nothing is left to do.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a task; drive cycles belong to the
    /// thread's outermost (non-fiber) stack.
    #[track_caller]
    pub(crate) fn process(&self) -> ExitReason {
        assert!(
            fiber::current().is_none(),
            "drive cycles cannot be started from inside a task"
        );

        let _drive = context::enter_event_loop();
        let mut any_events = false;

        loop {
            self.schedule();
            match context::with_driver(|d| d.process_events(Some(Duration::ZERO))) {
                ExitReason::Exited => return ExitReason::Exited,
                ExitReason::OutOfWaiters if self.queue.is_empty() => {
                    return ExitReason::OutOfWaiters;
                }
                ExitReason::Timeout if self.queue.is_empty() => {
                    return if any_events {
                        ExitReason::Idle
                    } else {
                        ExitReason::Timeout
                    };
                }
                ExitReason::Idle => {
                    any_events = true;
                    if self.queue.is_empty() {
                        return ExitReason::Idle;
                    }
                }
                // Runnable tasks remain: keep alternating rounds.
                ExitReason::OutOfWaiters | ExitReason::Timeout => {}
            }
        }
    }

    /// Blocking drive cycle: like [`process`](Self::process), but a `Timeout`
    /// blocks once in the driver for the next event instead of returning.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a task, like [`process`](Self::process).
    #[track_caller]
    pub(crate) fn wait_and_process(&self) -> ExitReason {
        assert!(
            fiber::current().is_none(),
            "drive cycles cannot be started from inside a task"
        );

        match self.process() {
            ExitReason::Timeout => {}
            reason => return reason,
        }

        let blocked = {
            let _drive = context::enter_event_loop();
            context::with_driver(|d| d.process_events(None))
        };
        if blocked == ExitReason::Exited {
            return ExitReason::Exited;
        }

        match self.process() {
            // We just slept for events; report idle rather than timeout.
            ExitReason::Timeout => ExitReason::Idle,
            reason => reason,
        }
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Cooperatively yields the current task to the back of the run queue.
///
/// Returns [`InterruptedError`] if another task requested an interrupt. A
/// no-op outside of any task. Repeatedly yielding tasks observe strict FIFO
/// fairness: each drive round runs every task queued at round start exactly
/// once.
pub fn yield_now() -> Result<(), InterruptedError> {
    context::try_with(|ctx| ctx.scheduler().yield_now()).unwrap_or(Ok(()))
}

/// Suspends the current task without rescheduling it.
///
/// The caller must already be registered somewhere (a [`ManualEvent`] wait
/// list, an external wakeup source) that will wake it later, or it sleeps
/// forever. Outside of any task this drives one round of the event loop
/// instead.
///
/// [`ManualEvent`]: crate::sync::ManualEvent
#[track_caller]
pub fn hibernate() {
    context::with(|ctx| ctx.scheduler().hibernate());
}
