//! Error types returned by the scheduler's public API.
//!
//! Everything else in this crate's public surface reports failure as a
//! plain `bool` because there is nothing more to say beyond
//! "did it happen" — `cancel`/`blocking_cancel` on an unknown or
//! already-completed handle is not an error condition, just a `false`.
//! `wait_until_all_workers_asleep` is the one operation with a genuine,
//! nameable failure the caller may want to log or propagate with `?`, so it
//! gets a real error type, built with `thiserror` the way
//! `labs/37-command-runner` already does for this repository's other small,
//! enumerable error surfaces.

use thiserror::Error;

/// Returned by [`crate::scheduler::Scheduler::wait_until_all_workers_asleep`]
/// when the scheduler transitioned past `Started` before quiescence could be
/// observed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("scheduler left the Started state before quiescence was observed")]
pub struct Cancelled;

/// Internal-only signal returned by `fetch_task` once the scheduler has
/// moved past `Started` and a worker should stop looping. Never leaves this
/// crate's worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Aborted;
