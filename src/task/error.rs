/// The current task was asked to stop.
///
/// Returned from interruptible suspension points ([`yield_now`],
/// [`ManualEvent::wait`], [`Task::join`]) after another task called
/// [`Task::interrupt`] on this one. The request is one-shot: returning this
/// error consumes it, and the task is free to keep running, clean up, or
/// propagate the error out of its body.
///
/// [`yield_now`]: crate::yield_now
/// [`ManualEvent::wait`]: crate::sync::ManualEvent::wait
/// [`Task::join`]: crate::task::Task::join
/// [`Task::interrupt`]: crate::task::Task::interrupt
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("task interrupted")]
pub struct InterruptedError;

/// Best-effort rendering of a panic payload for logs.
pub(crate) fn panic_payload_as_str(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
