//! Job definitions and execution logic.
//!
//! Jobs are units of work that can be executed by the fiber system. A job
//! carries its closure, an optional counter decremented upon completion, and
//! the continuations chained onto it with [`JobHandle::then`].

use crate::counter::Counter;
use crate::error::ScheduleError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::error;

/// Scheduling priority. Workers always drain `High` before anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    pub const ALL: [JobPriority; 3] = [JobPriority::High, JobPriority::Normal, JobPriority::Low];

    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobPriority::High,
            1 => JobPriority::Normal,
            _ => JobPriority::Low,
        }
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Canceled,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobState::Queued,
            1 => JobState::Running,
            2 => JobState::Finished,
            _ => JobState::Canceled,
        }
    }
}

type Work = Box<dyn FnOnce() + Send + 'static>;

/// Wait slots on a job's own completion counter.
const COMPLETION_WAIT_SLOTS: usize = 4;

/// A unit of work to be executed by the job system.
///
/// Jobs are shared through `Arc`: the scheduler, the fiber running the job,
/// and any [`JobHandle`] all point at the same record.
pub struct Job {
    priority: AtomicU8,
    state: AtomicU8,
    scheduled: AtomicBool,
    counter: OnceLock<Counter>,
    counter_retained: AtomicBool,
    /// Starts at 1 and drops to 0 once the job is retired, finished or
    /// canceled.
    completion: Counter,
    retired: AtomicBool,
    work: UnsafeCell<Option<Work>>,
    panicked: AtomicBool,
    parent: Option<Weak<Job>>,
    children: Mutex<Vec<Arc<Job>>>,
}

// SAFETY: `work` is taken only by the thread that wins the Queued -> Running
// transition in `run`, so the cell is never accessed concurrently.
unsafe impl Sync for Job {}

impl Job {
    fn new(priority: JobPriority, parent: Option<Weak<Job>>, work: Work) -> Self {
        Job {
            priority: AtomicU8::new(priority as u8),
            state: AtomicU8::new(JobState::Queued as u8),
            scheduled: AtomicBool::new(false),
            counter: OnceLock::new(),
            counter_retained: AtomicBool::new(false),
            completion: Counter::with_wait_slots(1, COMPLETION_WAIT_SLOTS),
            retired: AtomicBool::new(false),
            work: UnsafeCell::new(Some(work)),
            panicked: AtomicBool::new(false),
            parent,
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn priority(&self) -> JobPriority {
        JobPriority::from_u8(self.priority.load(Ordering::Acquire))
    }

    pub(crate) fn set_priority(&self, priority: JobPriority) {
        self.priority.store(priority as u8, Ordering::Release);
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.state() == JobState::Finished
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == JobState::Canceled
    }

    /// Returns true if the job's closure panicked.
    pub fn panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub fn counter(&self) -> Option<&Counter> {
        self.counter.get()
    }

    /// The job this one was chained onto, while it is still alive.
    pub fn parent(&self) -> Option<Arc<Job>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn num_children(&self) -> usize {
        self.lock_children().len()
    }

    /// Moves a queued job to `Canceled`. Returns false if it already started.
    pub fn cancel(&self) -> bool {
        self.transition(JobState::Queued, JobState::Canceled)
    }

    fn transition(&self, from: JobState, to: JobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Job>>> {
        // Children are plain `Arc`s; a poisoned lock leaves them intact.
        self.children.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn push_child(&self, child: Arc<Job>) {
        self.lock_children().push(child);
    }

    pub(crate) fn take_children(&self) -> Vec<Arc<Job>> {
        std::mem::take(&mut *self.lock_children())
    }

    /// Marks the job as handed to the scheduler. Returns false if it already was.
    pub(crate) fn mark_scheduled(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn unmark_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    /// True if this job or any job it is chained onto has been scheduled.
    pub fn is_scheduled_in_chain(&self) -> bool {
        if self.is_scheduled() {
            return true;
        }
        let mut parent = self.parent();
        while let Some(job) = parent {
            if job.is_scheduled() {
                return true;
            }
            parent = job.parent();
        }
        false
    }

    /// Counter that reaches 0 when the job is retired.
    pub fn completion(&self) -> &Counter {
        &self.completion
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_complete()
    }

    /// Retires the job exactly once.
    pub(crate) fn mark_done(&self) {
        if !self.retired.swap(true, Ordering::AcqRel) {
            self.completion.decrement(1);
        }
    }

    pub(crate) fn attach_counter(&self, counter: &Counter) -> Result<(), ScheduleError> {
        // Counters of a chain are retained when its root is scheduled, so a
        // late attach would never be counted.
        if self.is_scheduled_in_chain() {
            return Err(ScheduleError::AlreadyScheduled);
        }
        self.counter
            .set(counter.clone())
            .map_err(|_| ScheduleError::CounterAlreadyAttached)
    }

    /// Increments the counter of this job and of every chained descendant,
    /// once per job, so that waiters see them as outstanding before any of
    /// them can run.
    pub(crate) fn retain_counters(&self) {
        if let Some(counter) = self.counter.get() {
            if !self.counter_retained.swap(true, Ordering::AcqRel) {
                counter.increment(1);
            }
        }
        for child in self.lock_children().iter() {
            child.retain_counters();
        }
    }

    /// Undoes this job's own retention, if it still holds one.
    pub(crate) fn release_counter(&self) {
        if let Some(counter) = self.counter.get() {
            if self.counter_retained.swap(false, Ordering::AcqRel) {
                counter.decrement(1);
            }
        }
    }

    pub(crate) fn release_subtree(&self) {
        self.release_counter();
        for child in self.lock_children().iter() {
            child.release_subtree();
        }
    }

    /// Cancels every still-queued job of this subtree and releases their
    /// counters.
    pub(crate) fn cancel_subtree(&self) {
        if self.cancel() {
            self.mark_done();
        }
        self.release_counter();
        for child in self.lock_children().iter() {
            child.cancel_subtree();
        }
    }

    /// Runs the closure if the job is still queued. Panics are caught and
    /// recorded on the job.
    pub(crate) fn run(&self) {
        if !self.transition(JobState::Queued, JobState::Running) {
            return;
        }

        // SAFETY: only the winner of the Queued -> Running transition gets here.
        let Some(work) = (unsafe { (*self.work.get()).take() }) else {
            return;
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
            self.panicked.store(true, Ordering::Release);
            error!(panic = %panic_message(payload.as_ref()), "job panicked");
        }
    }

    /// Moves a running job to `Finished`. Returns false for a canceled job.
    pub(crate) fn finish(&self) -> bool {
        self.transition(JobState::Running, JobState::Finished)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("priority", &self.priority())
            .field("state", &self.state())
            .field("scheduled", &self.is_scheduled())
            .field("counter", &self.counter.get())
            .field("panicked", &self.panicked())
            .field("children", &self.num_children())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// A typed handle to a job and the value its closure produces.
pub struct JobHandle<T = ()> {
    job: Arc<Job>,
    result: Arc<OnceLock<T>>,
}

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        JobHandle {
            job: self.job.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> JobHandle<T> {
    /// Creates a queued, unscheduled job.
    pub fn new<F>(priority: JobPriority, work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::build(priority, None, work)
    }

    fn build<F>(priority: JobPriority, parent: Option<Weak<Job>>, work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let result = Arc::new(OnceLock::new());
        let slot = result.clone();
        let job = Job::new(
            priority,
            parent,
            Box::new(move || {
                let _ = slot.set(work());
            }),
        );

        JobHandle {
            job: Arc::new(job),
            result,
        }
    }

    /// Chains a continuation that is scheduled, at this job's priority, when
    /// this job finishes.
    ///
    /// The continuation is owned by this job; scheduling it directly is not
    /// needed. If this job is canceled, so is the continuation.
    pub fn then<U, F>(&self, work: F) -> JobHandle<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce() -> U + Send + 'static,
    {
        let child = JobHandle::build(self.priority(), Some(Arc::downgrade(&self.job)), work);
        self.job.push_child(child.job.clone());
        child
    }
}

impl<T> JobHandle<T> {
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn priority(&self) -> JobPriority {
        self.job.priority()
    }

    pub fn state(&self) -> JobState {
        self.job.state()
    }

    pub fn is_finished(&self) -> bool {
        self.job.is_finished()
    }

    pub fn is_canceled(&self) -> bool {
        self.job.is_canceled()
    }

    pub fn panicked(&self) -> bool {
        self.job.panicked()
    }

    /// Returns true once the closure has produced its value.
    pub fn is_ready(&self) -> bool {
        self.result.get().is_some()
    }

    pub fn result_ref(&self) -> Option<&T> {
        self.result.get()
    }

    /// True once the job has been retired, finished or canceled.
    pub fn is_done(&self) -> bool {
        self.job.is_done()
    }

    /// Attaches a counter that is incremented when the job is scheduled and
    /// decremented when it finishes, is canceled, or is rejected.
    pub fn set_counter(&self, counter: &Counter) -> Result<(), ScheduleError> {
        self.job.attach_counter(counter)
    }

    pub fn counter(&self) -> Option<&Counter> {
        self.job.counter()
    }

    /// See [`Job::cancel`].
    pub fn cancel(&self) -> bool {
        self.job.cancel()
    }
}

impl<T: Clone> JobHandle<T> {
    pub fn result(&self) -> Option<T> {
        self.result.get().cloned()
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("job", &self.job)
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_execution() {
        let job = JobHandle::new(JobPriority::Normal, || 40 + 2);
        assert_eq!(job.state(), JobState::Queued);
        assert!(!job.is_ready());

        job.job().run();
        assert!(job.job().finish());

        assert_eq!(job.state(), JobState::Finished);
        assert_eq!(job.result(), Some(42));
    }

    #[test]
    fn test_job_runs_once() {
        let job = JobHandle::new(JobPriority::Normal, || 1);
        job.job().run();
        job.job().run();
        assert_eq!(job.result(), Some(1));
        assert_eq!(job.state(), JobState::Running);
    }

    #[test]
    fn test_cancel_only_while_queued() {
        let canceled = JobHandle::new(JobPriority::Low, || ());
        assert!(canceled.cancel());
        canceled.job().run();
        assert!(!canceled.is_ready());
        assert!(!canceled.job().finish());
        assert!(canceled.is_canceled());

        let started = JobHandle::new(JobPriority::Low, || ());
        started.job().run();
        assert!(!started.cancel());
    }

    #[test]
    fn test_panic_is_caught() {
        let job: JobHandle<u32> = JobHandle::new(JobPriority::Normal, || panic!("boom"));
        job.job().run();
        assert!(job.panicked());
        assert!(!job.is_ready());
    }

    #[test]
    fn test_then_inherits_priority_and_parent() {
        let parent = JobHandle::new(JobPriority::High, || 1);
        let child = parent.then(|| 2);

        assert_eq!(child.priority(), JobPriority::High);
        assert_eq!(parent.job().num_children(), 1);
        let child_parent = child.job().parent().unwrap();
        assert!(Arc::ptr_eq(&child_parent, parent.job()));
    }

    #[test]
    fn test_counter_retained_once_per_job() {
        let counter = Counter::new(0);
        let parent = JobHandle::new(JobPriority::Normal, || ());
        let child = parent.then(|| ());
        parent.set_counter(&counter).unwrap();
        child.set_counter(&counter).unwrap();

        parent.job().retain_counters();
        parent.job().retain_counters();
        assert_eq!(counter.value(), 2);

        parent.job().release_counter();
        parent.job().release_counter();
        assert_eq!(counter.value(), 1);

        parent.job().release_subtree();
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_set_counter_rules() {
        let counter = Counter::new(0);
        let job = JobHandle::new(JobPriority::Normal, || ());
        job.set_counter(&counter).unwrap();
        assert!(matches!(
            job.set_counter(&counter),
            Err(ScheduleError::CounterAlreadyAttached)
        ));

        let scheduled = JobHandle::new(JobPriority::Normal, || ());
        assert!(scheduled.job().mark_scheduled());
        assert!(!scheduled.job().mark_scheduled());
        assert!(matches!(
            scheduled.set_counter(&counter),
            Err(ScheduleError::AlreadyScheduled)
        ));
    }

    #[test]
    fn test_set_counter_rejected_once_ancestor_is_scheduled() {
        let counter = Counter::new(0);
        let root = JobHandle::new(JobPriority::Normal, || ());
        let child = root.then(|| ());
        let grandchild = child.then(|| 42);
        assert!(!grandchild.job().is_scheduled_in_chain());

        assert!(root.job().mark_scheduled());
        assert!(grandchild.job().is_scheduled_in_chain());
        assert!(matches!(
            grandchild.set_counter(&counter),
            Err(ScheduleError::AlreadyScheduled)
        ));
        assert!(matches!(
            child.set_counter(&counter),
            Err(ScheduleError::AlreadyScheduled)
        ));
        assert!(grandchild.counter().is_none());
    }

    #[test]
    fn test_mark_done_is_exactly_once() {
        let job = JobHandle::new(JobPriority::Normal, || ());
        assert!(!job.is_done());
        assert_eq!(job.job().completion().value(), 1);

        job.job().mark_done();
        job.job().mark_done();
        assert!(job.is_done());
        assert_eq!(job.job().completion().value(), 0);
    }

    #[test]
    fn test_cancel_subtree_releases_counters() {
        let counter = Counter::new(0);
        let root = JobHandle::new(JobPriority::Normal, || ());
        let child = root.then(|| ());
        let grandchild = child.then(|| ());
        for handle in [root.job(), child.job(), grandchild.job()] {
            handle.attach_counter(&counter).unwrap();
        }

        root.job().retain_counters();
        assert_eq!(counter.value(), 3);

        root.job().cancel_subtree();
        assert_eq!(counter.value(), 0);
        assert!(grandchild.is_canceled());
        assert!(root.is_done() && child.is_done() && grandchild.is_done());
    }
}
