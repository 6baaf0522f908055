//! Worker thread implementation.
//!
//! Worker threads pull jobs from the priority queues and run them on fibers.
//! They form the foundation of the M:N threading model, where many fibers are
//! multiplexed onto a fixed number of worker threads. A worker also owns a
//! ready list: fibers it parked come back to it, and only it resumes them.

use crate::PinningStrategy;
use crate::context::{ExecutionContext, Switch};
use crate::counter::{ReadyFiber, ReadyList};
use crate::error::InitError;
use crate::fiber_pool::FiberPool;
use crate::job::{Job, JobPriority};
use crate::job_system::JobSystemInner;
use core_affinity::CoreId;
use crossbeam::utils::Backoff;
use std::cell::RefCell;
use std::io;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

thread_local! {
    static READY_LIST: RefCell<Option<Arc<ReadyList>>> = const { RefCell::new(None) };
}

// Not inlined for the same reason as the active-fiber accessors: a job can
// observe this from whichever thread its fiber runs on.
#[inline(never)]
fn set_current_ready_list(list: Option<Arc<ReadyList>>) {
    READY_LIST.with(|slot| *slot.borrow_mut() = list);
}

/// The ready list of the worker running on this thread.
#[inline(never)]
pub(crate) fn current_ready_list() -> Option<Arc<ReadyList>> {
    READY_LIST.with(|slot| slot.borrow().clone())
}

/// What has to happen to the fiber this thread just left.
#[derive(Debug, Default)]
pub(crate) enum FiberDestination {
    #[default]
    None,
    /// Back to the pool for any thread to claim.
    Pool,
    /// Parked on a counter; the flag marks it as fully switched out.
    Waiting(Arc<AtomicBool>),
}

#[derive(Debug)]
pub(crate) struct PreviousFiber {
    index: usize,
    destination: FiberDestination,
}

impl Default for PreviousFiber {
    fn default() -> Self {
        PreviousFiber {
            index: usize::MAX,
            destination: FiberDestination::None,
        }
    }
}

enum Step {
    Run(Arc<Job>),
    Resume(ReadyFiber),
}

/// Picks the core each worker is pinned to.
///
/// Fails when the strategy needs more usable cores than the machine reports.
pub(crate) fn plan_affinity(
    strategy: PinningStrategy,
    threads: usize,
    cores: &[CoreId],
) -> Result<Vec<Option<CoreId>>, InitError> {
    let usable: Vec<CoreId> = match strategy {
        PinningStrategy::None => return Ok(vec![None; threads]),
        PinningStrategy::Linear => cores.to_vec(),
        PinningStrategy::AvoidSMT => cores.iter().step_by(2).copied().collect(),
    };

    if threads > usable.len() {
        return Err(InitError::ThreadAffinity {
            threads,
            cores: usable.len(),
        });
    }

    Ok(usable.into_iter().take(threads).map(Some).collect())
}

/// A worker thread that executes jobs from the priority queues.
pub(crate) struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns worker `id`. The thread pins itself to `core`, binds a fiber
    /// and runs until shutdown is requested.
    pub(crate) fn spawn(
        id: usize,
        system: Arc<JobSystemInner>,
        fibers: Arc<FiberPool>,
        ready: Arc<ReadyList>,
        core: Option<CoreId>,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("fiberjobs-worker-{id}"))
            .spawn(move || {
                if let Some(core) = core {
                    if !core_affinity::set_for_current(core) {
                        warn!(worker = id, core = core.id, "failed to pin worker thread");
                    }
                }

                WorkerState::new(id, system, fibers, ready).run_loop();
            })?;

        Ok(Worker {
            id,
            handle: Some(handle),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Waits for the worker thread to finish.
    pub(crate) fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

struct WorkerState {
    id: usize,
    system: Arc<JobSystemInner>,
    fibers: Arc<FiberPool>,
    ready: Arc<ReadyList>,
    current_fiber: Option<usize>,
    previous: PreviousFiber,
}

impl WorkerState {
    fn new(
        id: usize,
        system: Arc<JobSystemInner>,
        fibers: Arc<FiberPool>,
        ready: Arc<ReadyList>,
    ) -> Self {
        WorkerState {
            id,
            system,
            fibers,
            ready,
            current_fiber: None,
            previous: PreviousFiber::default(),
        }
    }

    fn run_loop(mut self) {
        set_current_ready_list(Some(self.ready.clone()));
        self.current_fiber = Some(self.fibers.find_free_fiber());
        debug!(worker = self.id, fiber = ?self.current_fiber, "worker started");

        let backoff = Backoff::new();
        while !self.system.is_shutting_down() {
            match self.next_step() {
                Some(Step::Run(job)) => {
                    backoff.reset();
                    self.run_job(job);
                }
                Some(Step::Resume(ready)) => {
                    backoff.reset();
                    self.resume_ready(ready);
                }
                None if backoff.is_completed() => thread::sleep(self.system.idle_sleep()),
                None => backoff.snooze(),
            }
        }

        // Fibers already woken for this thread get to finish their jobs.
        while let Some(ready) = self.take_ready() {
            self.resume_ready(ready);
        }

        if let Some(index) = self.current_fiber.take() {
            self.previous = PreviousFiber {
                index,
                destination: FiberDestination::Pool,
            };
            self.cleanup_previous_fiber();
        }

        set_current_ready_list(None);
        debug!(
            worker = self.id,
            parked_elsewhere = self.ready.len(),
            "worker exiting"
        );
    }

    fn next_step(&mut self) -> Option<Step> {
        if let Some(job) = self.system.dequeue(JobPriority::High) {
            return Some(Step::Run(job));
        }
        if let Some(ready) = self.take_ready() {
            return Some(Step::Resume(ready));
        }
        self.system
            .dequeue(JobPriority::Normal)
            .or_else(|| self.system.dequeue(JobPriority::Low))
            .map(Step::Run)
    }

    /// Pops the first ready fiber that has fully switched out. Entries that
    /// are not stored yet go back to the end of the list.
    fn take_ready(&self) -> Option<ReadyFiber> {
        for _ in 0..self.ready.len() {
            let ready = self.ready.pop()?;
            if ready.is_stored() {
                return Some(ready);
            }
            self.ready.push(ready);
        }
        None
    }

    fn run_job(&mut self, job: Arc<Job>) {
        if job.is_canceled() {
            self.system.finish_job(job);
            return;
        }

        let index = match self.current_fiber.take() {
            Some(index) => index,
            None => self.claim_fiber(),
        };

        // SAFETY: `index` was claimed by this thread and not released.
        let switch = unsafe { self.fibers.fiber_mut(index) }.start(job);
        self.after_switch(index, switch);
    }

    /// Waits for a fiber to run a job on. Fibers woken for this thread are
    /// resumed meanwhile, since only this thread can resume them and they may
    /// be the ones holding the pool.
    fn claim_fiber(&mut self) -> usize {
        let fibers = self.fibers.clone();
        fibers.find_free_fiber_with(|| {
            let ready = self.take_ready()?;
            self.resume_ready(ready);
            self.current_fiber.take()
        })
    }

    fn resume_ready(&mut self, ready: ReadyFiber) {
        if let Some(index) = self.current_fiber.take() {
            self.previous = PreviousFiber {
                index,
                destination: FiberDestination::Pool,
            };
        }
        self.cleanup_previous_fiber();

        self.system
            .metrics()
            .fibers_resumed
            .fetch_add(1, Ordering::Relaxed);
        debug!(worker = self.id, fiber = ready.fiber, "resuming fiber");

        // SAFETY: the fiber parked on this thread and was handed back through
        // this thread's ready list, which only this thread drains.
        let switch = unsafe { self.fibers.fiber_mut(ready.fiber) }.resume();
        self.after_switch(ready.fiber, switch);
    }

    fn after_switch(&mut self, index: usize, switch: Switch) {
        match switch {
            Switch::Completed(job) => {
                self.current_fiber = Some(index);
                self.system.finish_job(job);
            }
            Switch::Parked(stored) => {
                self.previous = PreviousFiber {
                    index,
                    destination: FiberDestination::Waiting(stored),
                };
                self.cleanup_previous_fiber();
            }
        }
    }

    fn cleanup_previous_fiber(&mut self) {
        let previous = mem::take(&mut self.previous);
        match previous.destination {
            FiberDestination::None => {}
            FiberDestination::Pool => self.fibers.release(previous.index),
            FiberDestination::Waiting(stored) => stored.store(true, Ordering::Release),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cores(n: usize) -> Vec<CoreId> {
        (0..n).map(|id| CoreId { id }).collect()
    }

    #[test]
    fn test_no_pinning_ignores_cores() {
        let plan = plan_affinity(PinningStrategy::None, 64, &[]).unwrap();
        assert_eq!(plan.len(), 64);
        assert!(plan.iter().all(Option::is_none));
    }

    #[test]
    fn test_linear_pinning() {
        let plan = plan_affinity(PinningStrategy::Linear, 3, &cores(4)).unwrap();
        let ids: Vec<_> = plan.iter().map(|core| core.unwrap().id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_avoid_smt_uses_even_cores() {
        let plan = plan_affinity(PinningStrategy::AvoidSMT, 3, &cores(8)).unwrap();
        let ids: Vec<_> = plan.iter().map(|core| core.unwrap().id).collect();
        assert_eq!(ids, vec![0, 2, 4]);
    }

    #[test]
    fn test_pinning_more_threads_than_cores_fails() {
        let err = plan_affinity(PinningStrategy::Linear, 5, &cores(4)).unwrap_err();
        assert!(matches!(
            err,
            InitError::ThreadAffinity {
                threads: 5,
                cores: 4
            }
        ));

        let err = plan_affinity(PinningStrategy::AvoidSMT, 3, &cores(4)).unwrap_err();
        assert!(matches!(
            err,
            InitError::ThreadAffinity {
                threads: 3,
                cores: 2
            }
        ));
    }

    #[test]
    fn test_previous_fiber_defaults_to_nothing() {
        let previous = PreviousFiber::default();
        assert_eq!(previous.index, usize::MAX);
        assert!(matches!(previous.destination, FiberDestination::None));
    }
}
