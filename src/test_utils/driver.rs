use crate::runtime::{EventDriver, ExitReason};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// Scripted event driver for scheduler tests.
///
/// Plays back a fixed sequence of [`ExitReason`]s, then repeats a fallback.
/// The shared state records every call so tests can assert how the drive
/// cycles actually talked to the driver.
pub(crate) struct MockDriver {
    state: Rc<MockDriverState>,
}

#[derive(Debug)]
pub(crate) struct MockDriverState {
    script: RefCell<VecDeque<ExitReason>>,
    fallback: ExitReason,
    calls: Cell<usize>,
    timeouts: RefCell<Vec<Option<Duration>>>,
}

impl MockDriver {
    pub(crate) fn scripted(
        script: impl IntoIterator<Item = ExitReason>,
        fallback: ExitReason,
    ) -> (Self, Rc<MockDriverState>) {
        let state = Rc::new(MockDriverState {
            script: RefCell::new(script.into_iter().collect()),
            fallback,
            calls: Cell::new(0),
            timeouts: RefCell::new(Vec::new()),
        });
        (
            Self {
                state: Rc::clone(&state),
            },
            state,
        )
    }

    pub(crate) fn always(reason: ExitReason) -> (Self, Rc<MockDriverState>) {
        Self::scripted([], reason)
    }
}

impl EventDriver for MockDriver {
    fn process_events(&mut self, timeout: Option<Duration>) -> ExitReason {
        self.state.calls.set(self.state.calls.get() + 1);
        self.state.timeouts.borrow_mut().push(timeout);
        self.state
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or(self.state.fallback)
    }
}

impl MockDriverState {
    pub(crate) fn calls(&self) -> usize {
        self.calls.get()
    }

    /// The `timeout` argument of every call, in order.
    pub(crate) fn timeouts(&self) -> Vec<Option<Duration>> {
        self.timeouts.borrow().clone()
    }

    pub(crate) fn blocking_calls(&self) -> usize {
        self.timeouts.borrow().iter().filter(|t| t.is_none()).count()
    }
}
