//! High-level job system interface.
//!
//! The [`JobSystem`] is the primary entry point for scheduling and managing
//! parallel work. It owns the worker threads, the fiber pool and the three
//! priority queues, and hands out [`JobSystemHandle`]s so that jobs can
//! schedule more work and wait on counters from inside a fiber.

use crate::PinningStrategy;
use crate::counter::{Counter, ReadyList, WaitRegistration, WaitingFiber};
use crate::error::{Error, InitError, ScheduleError, ShutdownError, WaitError};
use crate::fiber;
use crate::fiber_pool::FiberPool;
use crate::job::{Job, JobHandle, JobPriority};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::queue::{self, BoundedQueue};
use crate::worker::{self, Worker};
use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on the fiber pool size.
pub const MAX_FIBERS: usize = u16::MAX as usize;

/// Longest sleep between polls when waiting outside of a fiber.
const MAX_POLL_SLEEP_MICROS: u64 = 1000;

/// Configuration for the fiber pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberConfig {
    /// Number of fibers, shared by all workers. Default: 128.
    pub pool_size: usize,
    /// Stack size for each fiber in bytes. Default: 256KB.
    pub stack_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            pool_size: 128,
            stack_size: 256 * 1024,
        }
    }
}

/// Capacities of the job queues. The priority queues must be powers of two.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    /// Capacity of the finished-job queue drained by [`JobSystem::update`].
    /// `0` disables it and finished jobs are dropped on the worker.
    pub finished: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high: 512,
            normal: 2048,
            low: 4096,
            finished: 0,
        }
    }
}

/// Configuration of a [`JobSystem`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSystemConfig {
    /// Worker thread count. Default: hardware concurrency.
    pub num_threads: usize,
    pub pinning: PinningStrategy,
    pub fibers: FiberConfig,
    pub queues: QueueConfig,
    /// Whether [`JobSystem::run_main`] shuts down as soon as the main
    /// callback returns, instead of waiting for [`JobSystemHandle::request_shutdown`].
    pub shutdown_after_main: bool,
    /// How long an idle worker sleeps after its spin phase.
    pub idle_sleep_micros: u64,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            pinning: PinningStrategy::None,
            fibers: FiberConfig::default(),
            queues: QueueConfig::default(),
            shutdown_after_main: true,
            idle_sleep_micros: 1000,
        }
    }
}

impl JobSystemConfig {
    /// Default configuration with `num_threads` workers.
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), InitError> {
        if self.num_threads == 0 {
            return Err(InitError::InvalidNumThreads(self.num_threads));
        }

        let fibers = self.fibers.pool_size;
        if fibers < self.num_threads || fibers > MAX_FIBERS {
            return Err(InitError::InvalidNumFibers {
                fibers,
                threads: self.num_threads,
            });
        }

        let queues = [
            ("high", self.queues.high),
            ("normal", self.queues.normal),
            ("low", self.queues.low),
        ];
        for (queue, capacity) in queues {
            if !queue::is_valid_capacity(capacity) {
                return Err(InitError::InvalidQueueCapacity { queue, capacity });
            }
        }

        let finished = self.queues.finished;
        if finished != 0 && !queue::is_valid_capacity(finished) {
            return Err(InitError::InvalidQueueCapacity {
                queue: "finished",
                capacity: finished,
            });
        }

        Ok(())
    }
}

/// State shared between the system, its handles and its workers.
pub(crate) struct JobSystemInner {
    queues: [BoundedQueue<Arc<Job>>; 3],
    finished: Option<BoundedQueue<Arc<Job>>>,
    pending: Counter,
    shutting_down: AtomicBool,
    metrics: Metrics,
    idle_sleep: Duration,
}

impl JobSystemInner {
    fn new(config: &JobSystemConfig) -> Self {
        let queues = &config.queues;
        JobSystemInner {
            queues: [
                BoundedQueue::with_capacity(queues.high),
                BoundedQueue::with_capacity(queues.normal),
                BoundedQueue::with_capacity(queues.low),
            ],
            finished: (queues.finished > 0).then(|| BoundedQueue::with_capacity(queues.finished)),
            pending: Counter::new(0),
            shutting_down: AtomicBool::new(false),
            metrics: Metrics::new(),
            idle_sleep: Duration::from_micros(config.idle_sleep_micros),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn idle_sleep(&self) -> Duration {
        self.idle_sleep
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn dequeue(&self, priority: JobPriority) -> Option<Arc<Job>> {
        self.queues[priority as usize].dequeue()
    }

    /// Retains the counters of the job's subtree and pushes it. Everything is
    /// rolled back if the queue is full.
    fn enqueue(&self, priority: JobPriority, job: Arc<Job>) -> Result<(), ScheduleError> {
        if !job.mark_scheduled() {
            return Err(ScheduleError::AlreadyScheduled);
        }

        job.set_priority(priority);
        job.retain_counters();
        self.pending.increment(1);

        match self.queues[priority as usize].enqueue(job) {
            Ok(()) => {
                self.metrics.jobs_scheduled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(job) => {
                job.release_subtree();
                job.unmark_scheduled();
                self.pending.decrement(1);
                self.metrics.queue_full.fetch_add(1, Ordering::Relaxed);
                warn!(?priority, "job queue full, job rejected");
                Err(ScheduleError::QueueFull(priority))
            }
        }
    }

    /// Completes a job that came back from a fiber, or a canceled job that was
    /// dequeued: releases its counter, schedules or cancels its children and
    /// retires it.
    pub(crate) fn finish_job(&self, job: Arc<Job>) {
        let finished = job.finish();
        job.release_counter();

        if finished {
            if job.panicked() {
                self.metrics.jobs_panicked.fetch_add(1, Ordering::Relaxed);
            }
            self.metrics.jobs_completed.fetch_add(1, Ordering::Relaxed);

            let priority = job.priority();
            for child in job.take_children() {
                match self.enqueue(priority, child.clone()) {
                    Ok(()) => {}
                    Err(ScheduleError::AlreadyScheduled) => {
                        debug!("chained job was already scheduled directly");
                    }
                    Err(err) => {
                        error!(%err, "failed to schedule chained job; canceling it");
                        child.cancel_subtree();
                    }
                }
            }
        } else {
            self.metrics.jobs_canceled.fetch_add(1, Ordering::Relaxed);
            for child in job.take_children() {
                child.cancel_subtree();
            }
        }

        job.mark_done();

        // Queued for `update` before `pending` drops, so a drain after
        // `wait_for_all` sees every retired job.
        if let Some(finished) = &self.finished {
            if let Err(job) = finished.enqueue(job) {
                self.metrics.finished_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(state = ?job.state(), "finished queue full, dropping retired job");
            }
        }

        self.pending.decrement(1);
    }
}

/// A cloneable reference to a running job system.
///
/// Handles are what jobs capture to schedule more work and wait on counters
/// from inside a fiber.
#[derive(Clone)]
pub struct JobSystemHandle {
    inner: Arc<JobSystemInner>,
}

impl JobSystemHandle {
    /// Creates a queued job. Nothing runs until it is scheduled.
    pub fn create_job<T, F>(&self, priority: JobPriority, work: F) -> JobHandle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        JobHandle::new(priority, work)
    }

    /// Pushes a job onto the queue of `priority`.
    ///
    /// The counters of the job and of everything chained onto it are
    /// incremented before the job becomes visible to workers.
    pub fn schedule<T>(&self, priority: JobPriority, job: &JobHandle<T>) -> Result<(), ScheduleError> {
        if self.inner.is_shutting_down() {
            return Err(ScheduleError::ShuttingDown);
        }
        self.inner.enqueue(priority, job.job().clone())
    }

    /// Blocks the calling job until `counter` holds `target`.
    ///
    /// Inside a job the fiber parks and the worker thread moves on to other
    /// work; it resumes on the same thread once the counter reaches the
    /// target. Outside of a job there is no fiber to park, so the calling
    /// thread polls with backoff.
    pub fn wait_for_counter(&self, counter: &Counter, target: u32) -> Result<(), WaitError> {
        if counter.value() == target {
            return Ok(());
        }

        let (Some(active), Some(ready)) = (fiber::active_fiber(), worker::current_ready_list())
        else {
            poll_until(counter, target);
            return Ok(());
        };

        let stored = Arc::new(AtomicBool::new(false));
        let waiter = WaitingFiber::new(active.index, stored.clone(), ready);
        match counter.add_waiting_fiber(waiter, target)? {
            WaitRegistration::AlreadySatisfied => Ok(()),
            WaitRegistration::Parked => {
                self.inner
                    .metrics
                    .fibers_parked
                    .fetch_add(1, Ordering::Relaxed);
                debug!(fiber = active.index, target, "parking fiber");
                fiber::park(active, stored);
                Ok(())
            }
        }
    }

    /// Schedules `job` and waits for it to finish.
    ///
    /// The job must not have a counter attached yet; a single-waiter counter
    /// is attached here.
    pub fn wait_for_single<T>(&self, priority: JobPriority, job: &JobHandle<T>) -> Result<(), Error> {
        let counter = Counter::single_waiter(0);
        job.set_counter(&counter)?;
        self.schedule(priority, job)?;
        self.wait_for_counter(&counter, 0)?;
        Ok(())
    }

    /// Waits until `job` has been retired, whether it finished or was
    /// canceled.
    ///
    /// Unlike [`wait_for_single`](Self::wait_for_single) this needs no counter
    /// attached in advance, so it also works on a job chained with
    /// [`JobHandle::then`] after its root was scheduled. The job, or one of
    /// its ancestors, must have been scheduled already.
    pub fn wait_for_job<T>(&self, job: &JobHandle<T>) -> Result<(), Error> {
        if !job.job().is_scheduled_in_chain() {
            return Err(ScheduleError::NotScheduled.into());
        }
        self.wait_for_counter(job.job().completion(), 0)?;
        Ok(())
    }

    /// Waits until every scheduled job has finished, chained jobs included.
    ///
    /// Calling this from inside a job never returns, since the calling job
    /// itself is still pending.
    pub fn wait_for_all(&self) -> Result<(), WaitError> {
        self.wait_for_counter(&self.inner.pending, 0)
    }

    /// Asks every worker to stop after its current step.
    pub fn request_shutdown(&self) {
        if !self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            info!("job system shutdown requested");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Number of jobs scheduled but not yet retired.
    pub fn pending_jobs(&self) -> u32 {
        self.inner.pending.value()
    }
}

/// Polls `counter` from a thread that has no fiber to park.
fn poll_until(counter: &Counter, target: u32) {
    let backoff = Backoff::new();
    let mut sleep_micros = 1;

    while counter.value() != target {
        if backoff.is_completed() {
            thread::sleep(Duration::from_micros(sleep_micros));
            sleep_micros = (sleep_micros * 2).min(MAX_POLL_SLEEP_MICROS);
        } else {
            backoff.snooze();
        }
    }
}

/// The main job system managing worker threads and job execution.
///
/// This is the primary interface for the fiber-based job system.
/// It manages a pool of worker threads and fibers and provides methods for
/// submitting jobs and synchronizing on their completion.
pub struct JobSystem {
    handle: JobSystemHandle,
    config: JobSystemConfig,
    fibers: Arc<FiberPool>,
    ready_lists: Vec<Arc<ReadyList>>,
    workers: Vec<Worker>,
    initialized: bool,
}

impl JobSystem {
    /// Validates `config` and allocates queues, fibers and ready lists.
    /// No thread is started until [`init`](Self::init).
    pub fn new(config: JobSystemConfig) -> Result<Self, InitError> {
        config.validate()?;

        let inner = Arc::new(JobSystemInner::new(&config));
        let fibers = Arc::new(FiberPool::new(
            config.fibers.pool_size,
            config.fibers.stack_size,
        )?);
        let ready_lists = (0..config.num_threads)
            .map(|_| Arc::new(ReadyList::new()))
            .collect();

        Ok(JobSystem {
            handle: JobSystemHandle { inner },
            config,
            fibers,
            ready_lists,
            workers: Vec::new(),
            initialized: false,
        })
    }

    /// Spawns and pins the worker threads.
    pub fn init(&mut self) -> Result<(), InitError> {
        if self.initialized {
            return Err(InitError::AlreadyInitialized);
        }

        let threads = self.config.num_threads;
        let cores = match self.config.pinning {
            PinningStrategy::None => Vec::new(),
            _ => core_affinity::get_core_ids().unwrap_or_default(),
        };
        let plan = worker::plan_affinity(self.config.pinning, threads, &cores)?;

        for (id, core) in plan.into_iter().enumerate() {
            let spawned = Worker::spawn(
                id,
                self.handle.inner.clone(),
                self.fibers.clone(),
                self.ready_lists[id].clone(),
                core,
            );
            match spawned {
                Ok(worker) => self.workers.push(worker),
                Err(err) => {
                    error!(worker = id, %err, "failed to spawn worker thread");
                    self.handle.request_shutdown();
                    let _ = self.join_workers();
                    return Err(InitError::Os(err));
                }
            }
        }

        self.initialized = true;
        info!(
            threads,
            fibers = self.fibers.len(),
            pinning = ?self.config.pinning,
            "job system initialized"
        );
        Ok(())
    }

    /// Creates and initializes a job system.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fiberjobs::{JobPriority, JobSystem, JobSystemConfig};
    ///
    /// let mut system = JobSystem::start(JobSystemConfig::with_threads(4)).unwrap();
    /// let job = system.create_job(JobPriority::Normal, || 21 * 2);
    /// system.wait_for_single(JobPriority::Normal, &job).unwrap();
    /// assert_eq!(job.result(), Some(42));
    /// system.shutdown(true).unwrap();
    /// ```
    pub fn start(config: JobSystemConfig) -> Result<Self, InitError> {
        let mut system = Self::new(config)?;
        system.init()?;
        Ok(system)
    }

    /// Runs `main` as a high-priority job on a fresh job system.
    ///
    /// With `shutdown_after_main` set, the system shuts down as soon as `main`
    /// returns. Otherwise the workers keep running until some job calls
    /// [`JobSystemHandle::request_shutdown`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fiberjobs::{JobPriority, JobSystem, JobSystemConfig};
    ///
    /// JobSystem::run_main(JobSystemConfig::default(), |system| {
    ///     let job = system.create_job(JobPriority::Normal, || println!("Hello from a fiber job!"));
    ///     system.wait_for_single(JobPriority::Normal, &job).unwrap();
    /// })
    /// .unwrap();
    /// ```
    pub fn run_main<F>(config: JobSystemConfig, main: F) -> Result<(), Error>
    where
        F: FnOnce(&JobSystemHandle) + Send + 'static,
    {
        let shutdown_after_main = config.shutdown_after_main;
        let mut system = Self::start(config)?;

        let handle = system.handle();
        let main_job = system.create_job(JobPriority::High, move || main(&handle));
        system.wait_for_single(JobPriority::High, &main_job)?;

        if !shutdown_after_main {
            let handle = system.handle();
            let backoff = Backoff::new();
            while !handle.is_shutting_down() {
                if backoff.is_completed() {
                    thread::sleep(Duration::from_micros(MAX_POLL_SLEEP_MICROS));
                } else {
                    backoff.snooze();
                }
            }
        }

        system.shutdown(true)?;

        if main_job.panicked() {
            return Err(Error::MainPanicked);
        }
        Ok(())
    }

    pub fn handle(&self) -> JobSystemHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &JobSystemConfig {
        &self.config
    }

    pub fn num_threads(&self) -> usize {
        self.config.num_threads
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// See [`JobSystemHandle::create_job`].
    pub fn create_job<T, F>(&self, priority: JobPriority, work: F) -> JobHandle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.handle.create_job(priority, work)
    }

    /// See [`JobSystemHandle::schedule`].
    pub fn schedule<T>(&self, priority: JobPriority, job: &JobHandle<T>) -> Result<(), ScheduleError> {
        self.handle.schedule(priority, job)
    }

    /// See [`JobSystemHandle::wait_for_counter`].
    pub fn wait_for_counter(&self, counter: &Counter, target: u32) -> Result<(), WaitError> {
        self.handle.wait_for_counter(counter, target)
    }

    /// See [`JobSystemHandle::wait_for_job`].
    pub fn wait_for_job<T>(&self, job: &JobHandle<T>) -> Result<(), Error> {
        self.handle.wait_for_job(job)
    }

    /// See [`JobSystemHandle::wait_for_single`].
    pub fn wait_for_single<T>(&self, priority: JobPriority, job: &JobHandle<T>) -> Result<(), Error> {
        self.handle.wait_for_single(priority, job)
    }

    /// See [`JobSystemHandle::wait_for_all`].
    pub fn wait_for_all(&self) -> Result<(), WaitError> {
        self.handle.wait_for_all()
    }

    /// Drops up to `max` jobs from the finished queue on the calling thread
    /// and returns how many were freed. Does nothing when the finished queue
    /// is disabled.
    pub fn update(&self, max: usize) -> usize {
        let Some(finished) = &self.handle.inner.finished else {
            return 0;
        };

        let mut freed = 0;
        while freed < max {
            match finished.dequeue() {
                Some(job) => {
                    drop(job);
                    freed += 1;
                }
                None => break,
            }
        }
        freed
    }

    pub fn request_shutdown(&self) {
        self.handle.request_shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.handle.is_shutting_down()
    }

    /// Stops the workers. With `blocking` set, waits for every worker thread
    /// to exit; otherwise they are joined when the system is dropped.
    ///
    /// Jobs still queued are not run.
    pub fn shutdown(&mut self, blocking: bool) -> Result<(), ShutdownError> {
        self.request_shutdown();
        if blocking {
            self.join_workers()
        } else {
            Ok(())
        }
    }

    fn join_workers(&mut self) -> Result<(), ShutdownError> {
        if self.workers.is_empty() {
            return Ok(());
        }

        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            let id = worker.id();
            if worker.join().is_err() {
                panicked += 1;
                error!(worker = id, "worker thread panicked");
            }
        }

        if panicked > 0 {
            return Err(ShutdownError::WorkersPanicked(panicked));
        }
        info!(
            idle_fibers = self.fibers.idle_count(),
            "job system shut down"
        );
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.handle
            .inner
            .metrics
            .snapshot(self.fibers.spin_overflows())
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.request_shutdown();
        let _ = self.join_workers();
    }
}
