use crate::task::{Task, TaskEvent, set_task_event_hook};
use dashmap::DashMap;
use std::sync::LazyLock;
use std::thread::{self, ThreadId};

// Keyed by thread so concurrently running tests never see each other's
// events: fibers always run on the thread that spawned them.
static EVENTS: LazyLock<DashMap<(ThreadId, TaskEvent), usize>> = LazyLock::new(DashMap::new);

fn record(event: TaskEvent, _task: Task) {
    *EVENTS
        .entry((thread::current().id(), event))
        .or_insert(0) += 1;
}

/// Per-thread view of the global task event hook, for asserting lifecycle
/// emissions in tests.
///
/// The hook is installed once and left in place for the whole test process;
/// isolation comes from the per-thread keying, not from uninstalling.
pub(crate) struct Tracker(());

impl Tracker {
    pub(crate) fn install() -> Tracker {
        set_task_event_hook(Some(record));
        let tracker = Tracker(());
        tracker.reset();
        tracker
    }

    pub(crate) fn count(&self, event: TaskEvent) -> usize {
        EVENTS
            .get(&(thread::current().id(), event))
            .map_or(0, |e| *e)
    }

    pub(crate) fn reset(&self) {
        let me = thread::current().id();
        EVENTS.retain(|(thread, _), _| *thread != me);
    }
}
