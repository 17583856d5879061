use crate::context;
use crate::runtime::ExitReason;
use crate::sync::ManualEvent;
use crate::task::{InterruptedError, Task, TaskEvent, TaskLocal};
use crate::test_utils::*;
use crate::{TaskOpts, run_task, run_task_with, task_builder, yield_now};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test]
fn test_yielding_tasks_observe_fifo_fairness() {
    let runtime = test_runtime();
    let log = log();

    fn body(args: (Log, &'static str)) {
        let (log, name) = args;
        for _ in 0..3 {
            record(&log, name);
            yield_now().unwrap();
        }
    }
    for name in ["A", "B", "C"] {
        run_task_with(body, (Rc::clone(&log), name));
    }

    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);
    assert_eq!(
        entries(&log),
        vec!["A", "B", "C", "A", "B", "C", "A", "B", "C"]
    );
}

#[test]
fn test_switch_to_boosts_target_ahead_of_queue() {
    let runtime = test_runtime();
    let log = log();
    let flag = Rc::new(Cell::new(false));
    let target = Rc::new(Cell::new(Task::null()));

    fn switcher(args: (Log, Rc<Cell<bool>>, Rc<Cell<Task>>)) {
        let (log, flag, target) = args;
        record(&log, "X:switching");
        context::with_scheduler(|s| s.switch_to(target.get()));
        // The boosted task ran before control came back here.
        assert!(flag.get());
        record(&log, "X:resumed");
    }

    fn boosted(args: (Log, Rc<Cell<bool>>)) {
        let (log, flag) = args;
        record(&log, "Y:flagging");
        flag.set(true);
        yield_now().unwrap();
        record(&log, "Y:after-yield");
    }

    run_task_with(switcher, (Rc::clone(&log), Rc::clone(&flag), Rc::clone(&target)));
    let y = task_builder()
        .opts(TaskOpts::DEFERRED)
        .spawn_with(boosted, (Rc::clone(&log), Rc::clone(&flag)));
    target.set(y);

    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);
    assert_eq!(
        entries(&log),
        vec!["X:switching", "Y:flagging", "X:resumed", "Y:after-yield"]
    );
    assert!(!y.running());
}

#[test]
fn test_join_waits_for_completion_and_stale_handles_are_inert() {
    let runtime = test_runtime();
    let log = log();
    let saved = Rc::new(Cell::new(Task::null()));

    let parent_log = Rc::clone(&log);
    let parent_saved = Rc::clone(&saved);
    run_task(move || {
        let child_log = Rc::clone(&parent_log);
        let child = run_task(move || {
            record(&child_log, "Q:first");
            yield_now().unwrap();
            record(&child_log, "Q:second");
        });

        assert!(child.running());
        record(&parent_log, "P:joining");
        child.join().unwrap();
        record(&parent_log, "P:joined");

        assert!(!child.running());
        // Joining an already-finished task returns immediately.
        assert_eq!(child.join(), Ok(()));
        parent_saved.set(child);
    });

    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);
    assert_eq!(
        entries(&log),
        vec!["Q:first", "P:joining", "Q:second", "P:joined"]
    );
    assert_eq!(runtime.total_fibers(), 2);

    // After the fiber recycled, the saved handle is stale and inert.
    let stale = saved.get();
    assert!(!stale.is_null());
    assert!(!stale.running());
    assert_eq!(stale.join(), Ok(()));
    stale.interrupt();
}

#[test]
fn test_main_thread_join_drives_event_loop() {
    let runtime = test_runtime();
    let log = log();

    fn body(args: (Log,)) {
        let (log,) = args;
        yield_now().unwrap();
        yield_now().unwrap();
        record(&log, "done");
    }
    let task = run_task_with(body, (Rc::clone(&log),));

    // No explicit drive cycle: join bootstraps one round at a time.
    task.join().unwrap();
    assert!(!task.running());
    assert_eq!(entries(&log), vec!["done"]);
    drop(runtime);
}

#[test]
fn test_interrupt_delivered_at_yield_exactly_once() {
    let (runtime, _driver) = test_runtime_with_script([], ExitReason::Exited);
    let log = log();

    let w_log = Rc::clone(&log);
    let w = run_task(move || {
        loop {
            match yield_now() {
                Ok(()) => record(&w_log, "tick"),
                Err(InterruptedError) => {
                    record(&w_log, "interrupted");
                    break;
                }
            }
        }
    });
    assert!(w.running());

    // One round parks W in its yield loop; the driver then exits the cycle
    // with W still queued.
    assert_eq!(runtime.process(), ExitReason::Exited);
    assert!(w.running());

    w.interrupt();
    assert!(!w.running());

    let seen = entries(&log);
    assert_eq!(seen.iter().filter(|e| **e == "interrupted").count(), 1);
    assert_eq!(seen.last(), Some(&"interrupted"));
}

#[test]
fn test_interrupt_rearms_after_being_caught() {
    let (runtime, _driver) = test_runtime_with_script([], ExitReason::Exited);
    let hits = Rc::new(Cell::new(0usize));

    let task_hits = Rc::clone(&hits);
    let w = run_task(move || {
        loop {
            if yield_now().is_err() {
                task_hits.set(task_hits.get() + 1);
                if task_hits.get() == 2 {
                    break;
                }
            }
        }
    });

    assert_eq!(runtime.process(), ExitReason::Exited);

    // First interrupt is caught; the task keeps going.
    w.interrupt();
    assert!(w.running());
    assert_eq!(hits.get(), 1);

    // A fresh interrupt re-arms and is delivered again.
    w.interrupt();
    assert!(!w.running());
    assert_eq!(hits.get(), 2);
}

static TASK_NAME: TaskLocal<RefCell<String>> =
    TaskLocal::with_init(|| RefCell::new(String::from("init")));

#[test]
fn test_task_locals_are_isolated_per_task() {
    let runtime = test_runtime();
    let log = log();

    fn body(args: (Log, &'static str)) {
        let (log, name) = args;
        TASK_NAME.with(|n| {
            assert_eq!(*n.borrow(), "init");
            *n.borrow_mut() = name.to_string();
        });
        for _ in 0..2 {
            yield_now().unwrap();
            TASK_NAME.with(|n| assert_eq!(*n.borrow(), name));
        }
        record(&log, name);
    }
    run_task_with(body, (Rc::clone(&log), "left"));
    run_task_with(body, (Rc::clone(&log), "right"));

    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);
    assert_eq!(entries(&log), vec!["left", "right"]);
}

thread_local! {
    static PROBE_DROPS: Cell<usize> = const { Cell::new(0) };
}

struct DropProbe;

impl Drop for DropProbe {
    fn drop(&mut self) {
        PROBE_DROPS.with(|d| d.set(d.get() + 1));
    }
}

impl Default for DropProbe {
    fn default() -> Self {
        DropProbe
    }
}

static PROBE: TaskLocal<DropProbe> = TaskLocal::new();

#[test]
fn test_task_end_runs_local_destructors() {
    let runtime = test_runtime();

    let task = run_task(|| PROBE.with(|_| {}));
    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);

    assert!(!task.running());
    assert_eq!(PROBE_DROPS.with(|d| d.get()), 1);
}

#[test]
fn test_driver_exit_preempts_nonempty_queue() {
    let (runtime, driver) = test_runtime_with_script(
        [ExitReason::Timeout, ExitReason::Timeout, ExitReason::Exited],
        ExitReason::Exited,
    );

    run_task(|| {
        loop {
            if yield_now().is_err() {
                break;
            }
        }
    });

    assert_eq!(runtime.wait_and_process(), ExitReason::Exited);
    assert_eq!(driver.calls(), 3);
    // The shutdown won even though a task was still runnable.
    assert!(runtime.queued_tasks() > 0);
}

#[test]
fn test_wait_and_process_blocks_once_on_timeout() {
    let (runtime, driver) = test_runtime_with_script(
        [ExitReason::Timeout, ExitReason::Idle, ExitReason::Timeout],
        ExitReason::Timeout,
    );

    assert_eq!(runtime.wait_and_process(), ExitReason::Idle);
    assert_eq!(driver.calls(), 3);
    assert_eq!(driver.blocking_calls(), 1);
    assert_eq!(driver.timeouts()[1], None);
}

#[test]
fn test_process_upgrades_timeout_to_idle_after_events() {
    let (runtime, driver) = test_runtime_with_script(
        [ExitReason::Idle, ExitReason::Timeout],
        ExitReason::Timeout,
    );

    run_task(|| {
        yield_now().unwrap();
    });

    // Round one processed events, round two drained the queue: the final
    // timeout reports as idle.
    assert_eq!(runtime.process(), ExitReason::Idle);
    assert_eq!(driver.calls(), 2);
}

#[test]
fn test_manual_event_wakes_all_waiters() {
    let runtime = test_runtime();
    let log = log();
    let event = Rc::new(ManualEvent::new());

    fn waiter(args: (Rc<ManualEvent>, Log, &'static str)) {
        let (event, log, name) = args;
        record(&log, name);
        event.wait().unwrap();
        record(&log, name);
    }
    fn emitter(args: (Rc<ManualEvent>, Log)) {
        let (event, log) = args;
        record(&log, "emit");
        event.emit();
    }

    run_task_with(waiter, (Rc::clone(&event), Rc::clone(&log), "w1"));
    run_task_with(waiter, (Rc::clone(&event), Rc::clone(&log), "w2"));
    run_task_with(emitter, (Rc::clone(&event), Rc::clone(&log)));

    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);
    assert_eq!(entries(&log), vec!["w1", "w2", "emit", "w1", "w2"]);
    assert_eq!(event.emit_count(), 1);
}

#[test]
fn test_join_is_interruptible() {
    let (runtime, _driver) = test_runtime_with_script([], ExitReason::Exited);
    let log = log();

    let target = run_task(|| {
        loop {
            if yield_now().is_err() {
                break;
            }
        }
    });

    fn joiner_body(args: (Task, Log)) {
        let (target, log) = args;
        match target.join() {
            Ok(()) => record(&log, "joined"),
            Err(InterruptedError) => record(&log, "join-interrupted"),
        }
    }
    let joiner = run_task_with(joiner_body, (target, Rc::clone(&log)));

    // Park both: the target in its yield loop, the joiner in the wait list.
    assert_eq!(runtime.process(), ExitReason::Exited);
    assert!(joiner.running());

    joiner.interrupt();
    assert!(!joiner.running());
    assert_eq!(entries(&log), vec!["join-interrupted"]);

    // The target never noticed; shut it down too.
    assert!(target.running());
    target.interrupt();
    assert!(!target.running());
}

#[test]
fn test_switch_to_self_is_noop() {
    let runtime = test_runtime();
    let log = log();

    let task_log = Rc::clone(&log);
    run_task(move || {
        let me = Task::current();
        context::with_scheduler(|s| s.switch_to(me));
        record(&task_log, "after-self-switch");
    });

    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);
    assert_eq!(entries(&log), vec!["after-self-switch"]);
}

#[test]
fn test_deferred_spawn_does_not_preempt_spawner() {
    let runtime = test_runtime();
    let log = log();

    fn child(args: (Log,)) {
        record(&args.0, "child");
    }
    fn parent(args: (Log,)) {
        let (log,) = args;
        record(&log, "parent:spawning");
        task_builder()
            .opts(TaskOpts::DEFERRED)
            .spawn_with(child, (Rc::clone(&log),));
        record(&log, "parent:after-spawn");
    }
    run_task_with(parent, (Rc::clone(&log),));

    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);
    assert_eq!(
        entries(&log),
        vec!["parent:spawning", "parent:after-spawn", "child"]
    );
}

#[test]
fn test_fibers_are_recycled_across_tasks() {
    let runtime = test_runtime();

    let first = run_task(|| {});
    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);
    assert_eq!(runtime.total_fibers(), 1);
    assert_eq!(runtime.idle_fibers(), 1);

    let second = run_task(|| {});
    assert_eq!(runtime.total_fibers(), 1, "fiber was not reused");
    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);

    // Same fiber, different task instances: the handles never compare equal.
    assert_ne!(first, second);
    assert!(!first.running());
    assert!(!second.running());
}

#[test]
fn test_finished_fiber_state_is_reset() {
    let runtime = test_runtime();

    let task = run_task(|| {
        yield_now().unwrap();
    });
    let fiber = task.fiber().expect("spawned task has a fiber");

    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);

    let f = unsafe { fiber.as_ref() };
    assert!(f.generation() > task.generation());
    assert!(!f.is_running());
    assert!(!f.is_enqueued());
    assert!(!f.has_task_func());
}

#[test]
fn test_task_panic_is_contained_and_fiber_reused() {
    let tracker = Tracker::install();
    let runtime = test_runtime();
    let log = log();

    let failed = run_task(|| panic!("boom"));
    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);

    assert!(!failed.running());
    assert_eq!(tracker.count(TaskEvent::Fail), 1);

    // The scheduler survived and the fiber takes the next task.
    let task_log = Rc::clone(&log);
    run_task(move || record(&task_log, "after-panic"));
    assert_eq!(runtime.total_fibers(), 1);
    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);
    assert_eq!(entries(&log), vec!["after-panic"]);
}

#[test]
fn test_task_event_hook_sees_lifecycle() {
    let tracker = Tracker::install();
    let runtime = test_runtime();

    run_task(|| {
        yield_now().unwrap();
    });
    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);

    assert_eq!(tracker.count(TaskEvent::PreStart), 1);
    assert_eq!(tracker.count(TaskEvent::PostStart), 1);
    assert_eq!(tracker.count(TaskEvent::Start), 1);
    assert_eq!(tracker.count(TaskEvent::End), 1);
    assert_eq!(tracker.count(TaskEvent::Fail), 0);
    // One park while waiting for the loop to start, one explicit yield.
    assert_eq!(tracker.count(TaskEvent::Yield), 2);
    assert_eq!(tracker.count(TaskEvent::Resume), 2);
}

#[test]
fn test_current_task_handle_matches_spawn_handle() {
    let runtime = test_runtime();
    let seen = Rc::new(Cell::new(Task::null()));

    let task_seen = Rc::clone(&seen);
    let spawned = run_task(move || task_seen.set(Task::current()));
    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);

    assert_eq!(seen.get(), spawned);
}

#[test]
fn test_yield_outside_any_runtime_is_noop() {
    assert_eq!(yield_now(), Ok(()));
}

#[test]
fn test_nested_drive_cycle_is_rejected() {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    let runtime = test_runtime();
    let rejected = Rc::new(Cell::new((false, false)));

    let task_rejected = Rc::clone(&rejected);
    run_task(move || {
        // Both the drive-cycle entry point and a raw mid-drain round are
        // refused with a contract panic, not queue corruption.
        let process = catch_unwind(AssertUnwindSafe(|| {
            context::with_scheduler(|s| s.process());
        }));
        let round = catch_unwind(AssertUnwindSafe(|| {
            context::with_scheduler(|s| s.schedule());
        }));
        task_rejected.set((process.is_err(), round.is_err()));
    });

    assert_eq!(runtime.process(), ExitReason::OutOfWaiters);
    assert_eq!(rejected.get(), (true, true));
}
