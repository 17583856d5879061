use std::time::Duration;

/// Outcome of one event-processing round, reported by the [`EventDriver`]
/// and propagated out of the scheduler's drive cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// The driver was shut down explicitly.
    Exited,
    /// No tasks or event sources remain to wait on.
    OutOfWaiters,
    /// The deadline elapsed without any event.
    Timeout,
    /// Events were processed and the call returned.
    Idle,
}

/// The external event source the scheduler interleaves with task rounds.
///
/// The runtime owns nothing about events itself: timers, I/O readiness and
/// wakeup sources all live behind this trait. The scheduler polls with
/// `timeout = Some(Duration::ZERO)` between drain rounds and blocks with
/// `timeout = None` when it runs out of runnable tasks.
pub trait EventDriver: 'static {
    /// Processes pending events, waiting up to `timeout` for one to arrive
    /// (`None` means wait indefinitely).
    fn process_events(&mut self, timeout: Option<Duration>) -> ExitReason;
}

/// A driver with no event sources at all.
///
/// The default when a runtime is built without a driver: drive cycles run
/// queued tasks to completion and report [`ExitReason::OutOfWaiters`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDriver;

impl EventDriver for NullDriver {
    fn process_events(&mut self, _timeout: Option<Duration>) -> ExitReason {
        ExitReason::OutOfWaiters
    }
}
