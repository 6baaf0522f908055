//! Error types reported by the job system.

use crate::job::JobPriority;
use thiserror::Error;

/// Configuration and startup failures, reported from [`JobSystem::new`] and
/// [`JobSystem::init`].
///
/// [`JobSystem::new`]: crate::JobSystem::new
/// [`JobSystem::init`]: crate::JobSystem::init
#[derive(Debug, Error)]
pub enum InitError {
    #[error("job system is already initialized")]
    AlreadyInitialized,

    #[error("invalid worker thread count: {0}")]
    InvalidNumThreads(usize),

    #[error("invalid fiber pool size {fibers} for {threads} worker thread(s)")]
    InvalidNumFibers { fibers: usize, threads: usize },

    #[error("{queue} queue capacity {capacity} is not a power of two >= 2")]
    InvalidQueueCapacity { queue: &'static str, capacity: usize },

    #[error("thread pinning requested for {threads} thread(s) but only {cores} core(s) are usable")]
    ThreadAffinity { threads: usize, cores: usize },

    #[error("OS error: {0}")]
    Os(#[from] std::io::Error),
}

/// Failures when handing a job to the scheduler.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("{0:?} priority queue is full")]
    QueueFull(JobPriority),

    #[error("job has already been scheduled")]
    AlreadyScheduled,

    #[error("job already has a counter attached")]
    CounterAlreadyAttached,

    #[error("job system is shutting down")]
    ShuttingDown,

    #[error("job has not been scheduled")]
    NotScheduled,
}

/// Failures when waiting on a counter.
#[derive(Debug, Error)]
pub enum WaitError {
    /// Every wait slot of the counter is occupied. This means the counter is
    /// undersized for the number of concurrent waiters.
    #[error("all {slots} wait slot(s) of the counter are in use")]
    WaitSlotsExhausted { slots: usize },
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("{0} worker thread(s) panicked")]
    WorkersPanicked(usize),
}

/// Union of every error the job system can report.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    /// The main job of [`JobSystem::run_main`](crate::JobSystem::run_main)
    /// panicked. The system was still shut down cleanly.
    #[error("main job panicked")]
    MainPanicked,
}
