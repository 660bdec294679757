//! A thread-pool-backed task scheduler with a priority queue ordered by due
//! time, a pluggable [`Clock`], and a `MockClock` for deterministic
//! virtual-time tests.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::time::Duration;
//! use task_scheduler::{Options, Scheduler};
//!
//! let scheduler = Scheduler::new(Options::new(2).start_now(true));
//! let ran = Arc::new(AtomicUsize::new(0));
//! let ran2 = Arc::clone(&ran);
//! scheduler.schedule_now(move || {
//!     ran2.fetch_add(1, Ordering::SeqCst);
//! });
//! scheduler.wait_until_all_workers_asleep().unwrap();
//! assert_eq!(ran.load(Ordering::SeqCst), 1);
//! ```

mod clock;
mod error;
mod queue;
mod scheduler;
mod task;
mod time;
mod worker;

pub use clock::{Clock, MockClock, RealClock};
pub use error::Cancelled;
pub use scheduler::{Options, Scheduler, State};
pub use task::{Callback, TaskHandle};
pub use time::Time;
