//! The pluggable time source: [`RealClock`] for production and [`MockClock`]
//! for deterministic virtual-time tests.
//!
//! Both implement [`Clock`], which besides `now`/`sleep_for`/`sleep_until`
//! exposes `await_with_deadline` — the bounded condition wait the worker
//! loop uses to block until either a predicate becomes true or a due time
//! arrives. That method's signature is tied to this crate's own scheduler
//! state type, which means `Clock` can only be implemented inside this
//! crate; callers outside it can still hold and pass around `Arc<dyn Clock>`
//! values (e.g. to pick `RealClock` vs `MockClock`), they just cannot supply
//! a third implementation. That is an intentional, narrow abstraction: the
//! only two clocks this scheduler needs to support.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::scheduler::{SchedulerInner, SchedulerState};
use crate::time::Time;

/// A source of time for the scheduler to compare due times against and to
/// block on.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current time on this clock's timeline.
    fn now(&self) -> Time;

    /// Blocks the calling thread for `duration`.
    fn sleep_for(&self, duration: Duration);

    /// Blocks the calling thread until `deadline`, or returns immediately if
    /// it has already passed.
    fn sleep_until(&self, deadline: Time);

    /// Atomically releases `guard`, blocks until `predicate` becomes true or
    /// `deadline` passes (whichever first) for at least one wake-up, then
    /// reacquires and returns the guard.
    ///
    /// Callers must re-check both `predicate` and the current time against
    /// `deadline` after this returns — a single call may return due to a
    /// spurious wake, an unrelated notification, or the deadline passing,
    /// and a new, possibly earlier, deadline may apply by the time control
    /// returns — this is what lets a freshly scheduled, earlier task preempt
    /// an in-progress wait.
    fn await_with_deadline<'a>(
        &self,
        inner: &Arc<SchedulerInner>,
        guard: MutexGuard<'a, SchedulerState>,
        deadline: Time,
        predicate: &mut dyn FnMut(&SchedulerState) -> bool,
    ) -> MutexGuard<'a, SchedulerState>;
}

/// A `Clock` backed by the OS wall clock and OS timed waits.
pub struct RealClock {
    epoch: Instant,
}

impl RealClock {
    pub fn new() -> Self {
        RealClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RealClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealClock").finish_non_exhaustive()
    }
}

impl Clock for RealClock {
    fn now(&self) -> Time {
        Time::from_duration(self.epoch.elapsed())
    }

    fn sleep_for(&self, duration: Duration) {
        thread::sleep(duration);
    }

    fn sleep_until(&self, deadline: Time) {
        let remaining = deadline.saturating_duration_since(self.now());
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }
    }

    fn await_with_deadline<'a>(
        &self,
        inner: &Arc<SchedulerInner>,
        guard: MutexGuard<'a, SchedulerState>,
        deadline: Time,
        predicate: &mut dyn FnMut(&SchedulerState) -> bool,
    ) -> MutexGuard<'a, SchedulerState> {
        if predicate(&guard) {
            return guard;
        }
        let remaining = deadline.saturating_duration_since(self.now());
        if remaining.is_zero() {
            return guard;
        }
        let (guard, _timed_out) = inner.cvar.wait_timeout(guard, remaining).unwrap();
        guard
    }
}

type Notifier = Arc<dyn Fn() + Send + Sync>;

struct MockClockState {
    now: Time,
    next_listener_id: u64,
    listeners: std::collections::HashMap<u64, Weak<dyn Fn() + Send + Sync>>,
}

/// A `Clock` whose "now" is a stored virtual time, advanced only by explicit
/// calls to [`MockClock::advance_time`]/[`MockClock::set_time`].
///
/// Each call to `await_with_deadline` registers a listener that, once
/// invoked, locks the *caller's* scheduler mutex before notifying the
/// shared condition variable. That ordering is what makes the mock clock
/// safe against the lost-wakeup race a naive "update time, then notify"
/// implementation would have: a thread in the middle of checking its
/// predicate and entering the wait still holds the scheduler mutex, so the
/// listener blocks on that same mutex until the waiter has either observed
/// the new state directly or has already parked on the condition variable
/// (a naive "update time, then notify" clock would have this race).
pub struct MockClock {
    state: Mutex<MockClockState>,
    /// Self-contained condition variable used only by `sleep_for`/
    /// `sleep_until`, which have no caller-supplied mutex to cooperate with.
    changed: Condvar,
}

impl fmt::Debug for MockClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockClock")
            .field("now", &self.now())
            .finish_non_exhaustive()
    }
}

impl MockClock {
    /// Creates a clock whose virtual time starts at [`Time::ZERO`].
    pub fn new() -> Self {
        MockClock {
            state: Mutex::new(MockClockState {
                now: Time::ZERO,
                next_listener_id: 0,
                listeners: std::collections::HashMap::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Advances virtual time by `delta` and wakes any thread blocked in
    /// `await_with_deadline` or `sleep_until`/`sleep_for`.
    pub fn advance_time(&self, delta: Duration) {
        let notifiers = {
            let mut state = self.state.lock().unwrap();
            state.now = state.now + delta;
            self.live_notifiers(&state)
        };
        self.changed.notify_all();
        for notify in notifiers {
            notify();
        }
    }

    /// Sets virtual time to `t`. Fail-fasts (panics) if `t` is earlier than
    /// the current virtual time — a programmer error, not a recoverable one.
    pub fn set_time(&self, t: Time) {
        let notifiers = {
            let mut state = self.state.lock().unwrap();
            assert!(
                t >= state.now,
                "MockClock::set_time: new time must not precede current virtual time"
            );
            state.now = t;
            self.live_notifiers(&state)
        };
        self.changed.notify_all();
        for notify in notifiers {
            notify();
        }
    }

    fn live_notifiers(&self, state: &MockClockState) -> Vec<Notifier> {
        state.listeners.values().filter_map(Weak::upgrade).collect()
    }

    fn register_listener(&self, notifier: &Notifier) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.insert(id, Arc::downgrade(notifier));
        id
    }

    fn unregister_listener(&self, id: u64) {
        self.state.lock().unwrap().listeners.remove(&id);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Time {
        self.state.lock().unwrap().now
    }

    fn sleep_for(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline);
    }

    fn sleep_until(&self, deadline: Time) {
        let guard = self.state.lock().unwrap();
        let _unused = self
            .changed
            .wait_while(guard, |s| s.now < deadline)
            .unwrap();
    }

    fn await_with_deadline<'a>(
        &self,
        inner: &Arc<SchedulerInner>,
        guard: MutexGuard<'a, SchedulerState>,
        deadline: Time,
        predicate: &mut dyn FnMut(&SchedulerState) -> bool,
    ) -> MutexGuard<'a, SchedulerState> {
        if predicate(&guard) || self.now() >= deadline {
            return guard;
        }
        let inner_for_notifier = Arc::clone(inner);
        let notifier: Notifier = Arc::new(move || {
            let _guard = inner_for_notifier.state.lock().unwrap();
            inner_for_notifier.cvar.notify_all();
        });
        let id = self.register_listener(&notifier);
        let guard = inner.cvar.wait(guard).unwrap();
        self.unregister_listener(id);
        drop(notifier);
        guard
    }
}

/// Adapter turning a plain closure into the predicate form
/// `await_with_deadline` expects.
pub struct SimpleCondition<F>(pub F)
where
    F: FnMut(&SchedulerState) -> bool;

impl<F> SimpleCondition<F>
where
    F: FnMut(&SchedulerState) -> bool,
{
    pub fn as_predicate(&mut self) -> &mut dyn FnMut(&SchedulerState) -> bool {
        &mut self.0
    }
}
