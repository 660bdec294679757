// Integration tests for the task scheduler.
//
// These exercise the scenarios the scheduler's contract is built around:
// - Past-due and future due times
// - Preemption of an in-progress wait by a newly-scheduled earlier task
// - Parallel execution across multiple workers
// - Cancellation before and during execution, blocking and non-blocking
// - Periodic re-arming, including the "missed interval" case
//
// All of them drive a `MockClock` so due-time comparisons are exact and the
// tests never depend on real wall-clock timing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use task_scheduler::{Clock, MockClock, Options, Scheduler};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn scheduler_with_clock(workers: u16) -> (Scheduler, Arc<MockClock>) {
    init_tracing();
    let clock = Arc::new(MockClock::new());
    let scheduler = Scheduler::new(
        Options::new(workers)
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .start_now(true),
    );
    (scheduler, clock)
}

// ============================================================================
// PAST-DUE AND FUTURE DUE TIMES
// ============================================================================

#[test]
fn past_due_task_fires_immediately() {
    let (scheduler, _clock) = scheduler_with_clock(1);
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = Arc::clone(&ran);
    scheduler.schedule_now(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    });
    scheduler.wait_until_all_workers_asleep().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn future_task_does_not_fire_early() {
    let (scheduler, clock) = scheduler_with_clock(1);
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = Arc::clone(&ran);
    scheduler.schedule_in(
        move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_secs(10),
    );

    scheduler.wait_until_all_workers_asleep().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0, "task must not fire before its due time");

    clock.advance_time(Duration::from_secs(10));
    scheduler.wait_until_all_workers_asleep().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

// ============================================================================
// PREEMPTION
// ============================================================================

#[test]
fn newly_scheduled_earlier_task_preempts_a_waiting_worker() {
    let (scheduler, clock) = scheduler_with_clock(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let order_clone = Arc::clone(&order);
    scheduler.schedule_in(
        move || order_clone.lock().unwrap().push("far"),
        Duration::from_secs(100),
    );

    // Give the single worker a chance to start waiting on the far task's
    // deadline before the near task is scheduled.
    std::thread::sleep(Duration::from_millis(20));

    let order_clone = Arc::clone(&order);
    scheduler.schedule_in(
        move || order_clone.lock().unwrap().push("near"),
        Duration::from_secs(1),
    );

    clock.advance_time(Duration::from_secs(1));
    scheduler.wait_until_all_workers_asleep().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["near"]);

    clock.advance_time(Duration::from_secs(99));
    scheduler.wait_until_all_workers_asleep().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["near", "far"]);
}

// ============================================================================
// PARALLEL EXECUTION
// ============================================================================

#[test]
fn multiple_workers_run_tasks_concurrently() {
    let (scheduler, _clock) = scheduler_with_clock(4);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        let counter_clone = Arc::clone(&counter);
        scheduler.schedule_now(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.wait_until_all_workers_asleep().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 20);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn cancel_before_fire_prevents_execution() {
    let (scheduler, clock) = scheduler_with_clock(1);
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = Arc::clone(&ran);
    let handle = scheduler.schedule_in(
        move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_secs(5),
    );

    assert!(scheduler.cancel(handle));
    clock.advance_time(Duration::from_secs(5));
    scheduler.wait_until_all_workers_asleep().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_during_fire_lets_current_run_finish_but_drops_recurrence() {
    let (scheduler, clock) = scheduler_with_clock(1);
    let started = Arc::new(std::sync::Barrier::new(2));
    let finish = Arc::new(std::sync::Barrier::new(2));
    let count = Arc::new(AtomicUsize::new(0));

    let started_clone = Arc::clone(&started);
    let finish_clone = Arc::clone(&finish);
    let count_clone = Arc::clone(&count);
    let handle = scheduler.schedule_recurring(
        move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
            started_clone.wait();
            finish_clone.wait();
        },
        Duration::from_secs(1),
    );

    started.wait();
    // The task is now in flight; cancel must not panic or remove it out
    // from under the running worker.
    assert!(!scheduler.cancel(handle));
    finish.wait();

    scheduler.wait_until_all_workers_asleep().unwrap();
    clock.advance_time(Duration::from_secs(5));
    scheduler.wait_until_all_workers_asleep().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1, "cancelled task must not re-arm");
}

#[test]
fn blocking_cancel_waits_for_in_flight_execution() {
    let (scheduler, _clock) = scheduler_with_clock(1);
    let started = Arc::new(std::sync::Barrier::new(2));
    let finish_gate = Arc::new(Mutex::new(false));
    let finished = Arc::new(AtomicUsize::new(0));

    let started_clone = Arc::clone(&started);
    let finish_gate_clone = Arc::clone(&finish_gate);
    let finished_clone = Arc::clone(&finished);
    let handle = scheduler.schedule_now(move || {
        started_clone.wait();
        loop {
            if *finish_gate_clone.lock().unwrap() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        finished_clone.fetch_add(1, Ordering::SeqCst);
    });

    started.wait();
    let scheduler = Arc::new(scheduler);
    let scheduler_clone = Arc::clone(&scheduler);
    let canceller = std::thread::spawn(move || scheduler_clone.blocking_cancel(handle));

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        finished.load(Ordering::SeqCst),
        0,
        "blocking_cancel's caller should still be parked"
    );
    *finish_gate.lock().unwrap() = true;

    canceller.join().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

// ============================================================================
// PERIODIC RE-ARMING
// ============================================================================

#[test]
fn periodic_task_skips_missed_intervals_instead_of_bursting() {
    let (scheduler, clock) = scheduler_with_clock(1);
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = Arc::clone(&count);
    scheduler.schedule_recurring(
        move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_secs(1),
    );

    scheduler.wait_until_all_workers_asleep().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // Jump far past several missed periods; the re-arm formula should land
    // on the next period boundary after "now", not fire once per missed tick.
    clock.advance_time(Duration::from_secs(10));
    scheduler.wait_until_all_workers_asleep().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn stop_prevents_further_execution_and_is_idempotent() {
    let (scheduler, _clock) = scheduler_with_clock(2);
    scheduler.stop();
    scheduler.stop();
    assert_eq!(scheduler.state(), task_scheduler::State::Stopped);

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = Arc::clone(&ran);
    scheduler.schedule_now(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    });
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ran.load(Ordering::SeqCst), 0, "stopped scheduler must not run new tasks");
}
