//! The execution-context seam between the scheduler and the switch primitive.
//!
//! Workers only ever drive a context through [`ExecutionContext`]: start a job
//! on it, or resume it after a wait. What happens in between (how the stack is
//! switched, where the continuation lives) belongs to the implementation, which
//! is [`Fiber`](crate::fiber::Fiber) in this crate.

use crate::job::Job;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// How control came back to the worker after a switch into a context.
#[derive(Debug)]
pub enum Switch {
    /// The job returned (or panicked). The context is idle again and can take
    /// the next job.
    Completed(Arc<Job>),
    /// The job is waiting on a counter. The context is frozen mid-call and
    /// must not be reused until it has been resumed and completed. The flag is
    /// the one the waiter registered on the counter; the worker stores `true`
    /// into it once the switch has fully returned.
    Parked(Arc<AtomicBool>),
}

/// A cooperative execution context that can run one job at a time and be
/// suspended and resumed exactly where it left off.
pub trait ExecutionContext: Send {
    /// Runs `job` from the top until it completes or parks.
    ///
    /// # Panics
    ///
    /// Panics if the context is not idle.
    fn start(&mut self, job: Arc<Job>) -> Switch;

    /// Continues a parked context right after its wait call.
    ///
    /// # Panics
    ///
    /// Panics if the context is not parked.
    fn resume(&mut self) -> Switch;

    fn is_idle(&self) -> bool;

    fn is_parked(&self) -> bool;
}
