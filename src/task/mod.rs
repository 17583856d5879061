use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

// Public API
mod error;
pub use self::error::InterruptedError;
pub(crate) use self::error::panic_payload_as_str;

pub(crate) mod fiber;
pub use self::fiber::{handle_interrupt, handle_interrupt_with};

mod handle;
pub use self::handle::{DebugId, Task};

mod local;
pub use self::local::TaskLocal;

// Crate internals
mod func;
pub use self::func::MAX_TASK_ARGS_SIZE;
pub(crate) use self::func::TaskFuncInfo;

pub(crate) mod queue;
pub(crate) use self::queue::FiberQueue;

/// Lifecycle notifications delivered to the process-global debug hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEvent {
    /// A fiber has been acquired and the invocation assigned, before the task
    /// first runs.
    PreStart,
    /// Spawning finished; the task has had its first slice of execution.
    PostStart,
    /// The task body is about to be invoked on its fiber.
    Start,
    /// The task suspended via a yield.
    Yield,
    /// The scheduler resumed the task.
    Resume,
    /// The task body returned.
    End,
    /// The task body terminated with an unhandled panic.
    Fail,
}

/// Signature of the task event hook. The hook is called from scheduling hot
/// paths and must not panic.
pub type TaskEventHook = fn(TaskEvent, Task);

static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);
static HOOK: RwLock<Option<TaskEventHook>> = RwLock::new(None);

/// Installs (or with `None`, removes) the process-global task event hook.
///
/// Intended for debug instrumentation: schedulers on every thread report
/// through the same hook.
pub fn set_task_event_hook(hook: Option<TaskEventHook>) {
    *HOOK.write() = hook;
    HOOK_INSTALLED.store(hook.is_some(), Ordering::Release);
}

pub(crate) fn emit_task_event(event: TaskEvent, task: Task) {
    // Cheap fast path so uninstrumented runtimes skip the lock entirely.
    if !HOOK_INSTALLED.load(Ordering::Relaxed) {
        return;
    }
    if let Some(hook) = *HOOK.read() {
        hook(event, task);
    }
}
