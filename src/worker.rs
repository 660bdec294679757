//! The worker thread loop: pull the next due task (or block until one is
//! due or the scheduler stops), run it, and re-arm it if periodic.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::clock::SimpleCondition;
use crate::error::Aborted;
use crate::scheduler::{recompute_event_due, SchedulerInner, SchedulerState, State};
use crate::task::{Callback, TaskHandle};
use crate::time::{ceil_div_duration, Time};

/// RAII marker for "this worker is currently parked waiting for work".
/// [`crate::scheduler::Scheduler::wait_until_all_workers_asleep`] polls the
/// count this increments/decrements. Kept as a plain `AtomicUsize` on
/// `SchedulerInner`, outside the mutex-guarded `SchedulerState`, because its
/// `Drop` impl must run while the worker is parked inside a call that has
/// already consumed the `MutexGuard` by value.
struct SleepScope<'a> {
    inner: &'a SchedulerInner,
}

impl<'a> SleepScope<'a> {
    fn enter(inner: &'a SchedulerInner) -> Self {
        inner.sleeping_count.fetch_add(1, Ordering::SeqCst);
        inner.cvar.notify_all();
        SleepScope { inner }
    }
}

impl Drop for SleepScope<'_> {
    fn drop(&mut self) {
        self.inner.sleeping_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A far-future deadline used when the queue is empty: there is nothing to
/// time the wait against, so the worker waits until notified (a new task
/// arriving, or the scheduler stopping) rather than on a real timer.
fn no_deadline() -> Time {
    Time::ZERO.checked_add(Duration::MAX)
}

/// Pops the next due task, blocking as needed. Returns `Err(Aborted)` once
/// the scheduler has left the `Started` state and this worker should exit.
///
/// Peeks the head and takes it if due; otherwise parks until either it
/// becomes due or a new, possibly earlier, task arrives and preempts the
/// wait. One `await_with_deadline` call covers one peek/check cycle — the
/// loop itself, not the clock, is what re-derives the deadline on every
/// iteration, so a freshly scheduled earlier task is never missed.
pub(crate) fn fetch_task(inner: &Arc<SchedulerInner>) -> Result<(TaskHandle, Callback), Aborted> {
    let mut guard = inner.state.lock().unwrap();
    loop {
        if guard.lifecycle > State::Started {
            return Err(Aborted);
        }

        let now = inner.clock.now();
        let due_handle = guard.queue.peek().and_then(|(handle, due_time)| {
            let is_due = guard
                .registry
                .get(handle)
                .map(|task| !task.cancelled && due_time <= now)
                .unwrap_or(false);
            is_due.then_some(handle)
        });

        if let Some(handle) = due_handle {
            guard.queue.pop();
            let callback = {
                let task = guard.registry.get_mut(handle).expect("due task is registered");
                task.in_flight = true;
                task.callback.take().expect("queued task always has a callback")
            };
            recompute_event_due(&mut guard, inner.clock.as_ref());
            trace!(%handle, "worker picked up task");
            return Ok((handle, callback));
        }

        let deadline = guard
            .queue
            .peek()
            .map(|(_, due_time)| due_time)
            .unwrap_or_else(no_deadline);

        let sleep = SleepScope::enter(inner);
        let mut condition =
            SimpleCondition(|state: &SchedulerState| state.lifecycle > State::Started);
        guard = inner.clock.await_with_deadline(
            inner,
            guard,
            deadline,
            condition.as_predicate(),
        );
        drop(sleep);
    }
}

/// Runs `callback`, isolating panics: a panicking task must not take its
/// worker thread down with it.
fn run_callback(handle: TaskHandle, callback: Callback) {
    let result = panic::catch_unwind(AssertUnwindSafe(callback));
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        warn!(%handle, panic = %message, "task panicked; worker continuing");
    }
}

/// Called after a task's callback returns (or panics): clears `in_flight`,
/// re-arms a periodic task for its next occurrence, or drops a one-shot
/// task from the registry entirely.
fn finish_task(inner: &Arc<SchedulerInner>, handle: TaskHandle) {
    let mut guard = inner.state.lock().unwrap();
    let Some(task) = guard.registry.get_mut(handle) else {
        return;
    };
    task.in_flight = false;

    if task.cancelled {
        guard.registry.remove(handle);
        recompute_event_due(&mut guard, inner.clock.as_ref());
        drop(guard);
        inner.cvar.notify_all();
        return;
    }

    match task.period {
        Some(period) => {
            let now = inner.clock.now();
            let lateness = now.saturating_duration_since(task.due_time);
            let k = ceil_div_duration(lateness, period).max(1);
            let next_due = task.due_time + period * k;
            task.due_time = next_due;
            guard.queue.push(handle, next_due);
            recompute_event_due(&mut guard, inner.clock.as_ref());
            trace!(%handle, next_due = ?next_due, "re-armed periodic task");
        }
        None => {
            guard.registry.remove(handle);
            recompute_event_due(&mut guard, inner.clock.as_ref());
        }
    }
    drop(guard);
    inner.cvar.notify_all();
}

/// Entry point run on each worker thread.
pub(crate) fn run(inner: Arc<SchedulerInner>, worker_id: u16) {
    trace!(worker_id, "worker started");
    loop {
        match fetch_task(&inner) {
            Ok((handle, callback)) => {
                run_callback(handle, callback);
                finish_task(&inner, handle);
            }
            Err(Aborted) => break,
        }
    }
    trace!(worker_id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::scheduler::{Options, Scheduler};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn panicking_task_does_not_stop_worker() {
        let clock = Arc::new(MockClock::new());
        let scheduler = Scheduler::new(
            Options::new(1)
                .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
                .start_now(true),
        );
        let ran_after = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_now(|| panic!("boom"));
        let ran_after_clone = Arc::clone(&ran_after);
        scheduler.schedule_now(move || {
            ran_after_clone.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.wait_until_all_workers_asleep().unwrap();
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_task_reschedules_itself() {
        let clock = Arc::new(MockClock::new());
        let scheduler = Scheduler::new(
            Options::new(1)
                .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
                .start_now(true),
        );
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

        clock.advance_time(Duration::from_secs(3));
        scheduler.wait_until_all_workers_asleep().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
