//! A cooperative, fiber-based task runtime.
//!
//! One OS thread, many tasks: each task runs on a pooled, stack-switched
//! fiber and suspends cooperatively around an external [`EventDriver`].
//! Handles stay safe across fiber reuse through per-fiber generation
//! counters, cancellation is delivered as [`InterruptedError`] at suspension
//! points, and [`TaskLocal`] gives every task its own lazily-built storage.

pub mod runtime;
pub use runtime::{Builder, EventDriver, ExitReason, NullDriver, Runtime, hibernate, yield_now};

pub mod spawn;
pub use spawn::{TaskBuilder, TaskOpts, run_task, run_task_with, task_builder, try_run_task};

pub mod sync;
pub use sync::ManualEvent;

pub mod task;
pub use task::{
    InterruptedError, Task, TaskEvent, TaskEventHook, TaskLocal, handle_interrupt,
    handle_interrupt_with, set_task_event_hook,
};

mod context;

mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
