//! # fiberjobs - Fiber-Based Job Scheduler
//!
//! A fiber-based job system in the style of Naughty Dog's engine. Jobs are
//! closures run on a fixed pool of stackful fibers, multiplexed onto a fixed
//! set of worker threads. A job that must wait for other jobs parks its fiber
//! on a [`Counter`] instead of blocking the thread, and the worker picks up
//! other work until the counter reaches its target.
//!
//! ## Architecture
//!
//! - **Queues**: three bounded lock-free MPMC queues, one per [`JobPriority`]
//! - **Fibers**: reusable execution contexts drawn from a shared pool
//! - **Counters**: atomic values with a small table of parked waiters
//! - **Workers**: OS threads that drain High, then ready fibers, then Normal
//!   and Low work
//!
//! ## Example
//!
//! ```no_run
//! use fiberjobs::{Counter, JobPriority, JobSystem, JobSystemConfig};
//!
//! let mut system = JobSystem::start(JobSystemConfig::with_threads(4)).unwrap();
//!
//! let counter = Counter::new(0);
//! let first = system.create_job(JobPriority::Normal, || 6);
//! let second = first.then(|| 7);
//! first.set_counter(&counter).unwrap();
//! second.set_counter(&counter).unwrap();
//!
//! system.schedule(JobPriority::Normal, &first).unwrap();
//! system.wait_for_counter(&counter, 0).unwrap();
//! assert_eq!(first.result().zip(second.result()).map(|(a, b)| a * b), Some(42));
//!
//! system.shutdown(true).unwrap();
//! ```

pub mod context;
pub mod counter;
pub mod error;
pub mod fiber;
pub mod fiber_pool;
pub mod job;
pub mod job_system;
pub mod metrics;
pub mod queue;
mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

pub use context::{ExecutionContext, Switch};
pub use counter::{Counter, WaitRegistration};
pub use error::{Error, InitError, ScheduleError, ShutdownError, WaitError};
pub use fiber::current_fiber;
pub use job::{Job, JobHandle, JobPriority, JobState};
pub use job_system::{FiberConfig, JobSystem, JobSystemConfig, JobSystemHandle, QueueConfig};
pub use metrics::MetricsSnapshot;
