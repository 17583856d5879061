use crate::runtime::{Builder, ExitReason, Runtime};
use std::cell::RefCell;
use std::rc::Rc;

// Exports
pub(crate) mod driver;
pub(crate) use driver::{MockDriver, MockDriverState};

pub(crate) mod tracker;
pub(crate) use tracker::Tracker;

/// Test stacks stay small: scenario tasks only push a handful of frames.
pub(crate) const TEST_STACK_SIZE: usize = 256 * 1024;

/// A runtime with the default (null) driver: drive cycles run queued tasks
/// to completion and report `OutOfWaiters`.
pub(crate) fn test_runtime() -> Runtime {
    Builder::new()
        .task_stack_size(TEST_STACK_SIZE)
        .try_build()
        .expect("failed to build test runtime")
}

/// A runtime driven by a scripted [`MockDriver`].
pub(crate) fn test_runtime_with_script(
    script: impl IntoIterator<Item = ExitReason>,
    fallback: ExitReason,
) -> (Runtime, Rc<MockDriverState>) {
    let (driver, state) = MockDriver::scripted(script, fallback);
    let runtime = Builder::new()
        .task_stack_size(TEST_STACK_SIZE)
        .driver(driver)
        .try_build()
        .expect("failed to build test runtime");
    (runtime, state)
}

/// Shared execution log for asserting scheduling order. Cheap to capture:
/// one `Rc` fits a task closure's inline payload.
pub(crate) type Log = Rc<RefCell<Vec<&'static str>>>;

pub(crate) fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

pub(crate) fn record(log: &Log, entry: &'static str) {
    log.borrow_mut().push(entry);
}

pub(crate) fn entries(log: &Log) -> Vec<&'static str> {
    log.borrow().clone()
}
