//! The scheduled-task value type and its handle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::time::Time;

/// A movable, single-shot callback. Boxed so it can be stored in the
/// registry and sent to whichever worker thread runs it.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Opaque, unique, nonzero identifier of a task within one [`Scheduler`].
///
/// `0` is reserved as an invalid handle and is never returned by
/// [`SequenceNumber`].
///
/// [`Scheduler`]: crate::scheduler::Scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub(crate) fn new(value: u64) -> Self {
        debug_assert_ne!(value, 0, "0 is reserved as the invalid handle");
        TaskHandle(value)
    }

    /// The reserved invalid handle. Never equal to a handle returned by
    /// `schedule_*`.
    pub const INVALID: TaskHandle = TaskHandle(0);

    /// Returns `true` if this is the reserved invalid handle.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic generator of [`TaskHandle`] values, starting at 1.
///
/// Shared by all tasks scheduled on one [`Scheduler`](crate::scheduler::Scheduler)
/// instance; never reused within that scheduler's lifetime.
#[derive(Debug, Default)]
pub(crate) struct SequenceNumber(AtomicU64);

impl SequenceNumber {
    pub(crate) fn new() -> Self {
        SequenceNumber(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> TaskHandle {
        let value = self.0.fetch_add(1, Ordering::Relaxed);
        TaskHandle::new(value)
    }
}

/// A scheduled unit of work.
///
/// The registry (see [`crate::queue::TaskRegistry`]) exclusively owns `Task`
/// values; the queue references a task only through its `TaskHandle`, looked
/// up via the registry. A handle-indexed side table stands in for a
/// backlink pointer, so there is no `unsafe` and no shared-ownership cell
/// needed to keep the Task-to-queue-slot relationship consistent.
pub(crate) struct Task {
    pub handle: TaskHandle,
    pub callback: Option<Callback>,
    pub due_time: Time,
    pub period: Option<Duration>,
    pub cancelled: bool,
    /// `true` while some worker has popped this task off the queue to run
    /// it but has not yet finished.
    pub in_flight: bool,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("handle", &self.handle)
            .field("due_time", &self.due_time)
            .field("period", &self.period)
            .field("cancelled", &self.cancelled)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl Task {
    pub(crate) fn new(
        handle: TaskHandle,
        callback: Callback,
        due_time: Time,
        period: Option<Duration>,
    ) -> Self {
        Task {
            handle,
            callback: Some(callback),
            due_time,
            period,
            cancelled: false,
            in_flight: false,
        }
    }

    pub(crate) fn is_periodic(&self) -> bool {
        self.period.is_some()
    }
}
