//! Fiber management and execution context.
//!
//! Each [`Fiber`] owns a stackful `corosensei` coroutine that runs the
//! trampoline pattern: the coroutine loops forever, running one job per start
//! and yielding `Complete` in between, so a fiber is created once and reused
//! for the lifetime of the pool.

use crate::context::{ExecutionContext, Switch};
use crate::job::Job;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::Cell;
use std::io;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::warn;

pub(crate) type FiberYielder = Yielder<FiberInput, FiberYield>;

/// Values passed into a fiber when switching to it.
pub enum FiberInput {
    /// Run a job from the top of the trampoline.
    Run(Arc<Job>),
    /// Continue after a wait.
    Resume,
    /// Leave the trampoline so the coroutine finishes.
    Exit,
}

/// Values a fiber hands back when it switches out.
pub enum FiberYield {
    Complete,
    Parked(Arc<AtomicBool>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberStatus {
    Idle,
    Running,
    Parked,
}

/// The fiber currently executing on this thread, if any.
#[derive(Clone, Copy)]
pub(crate) struct ActiveFiber {
    pub(crate) index: usize,
    yielder: *const FiberYielder,
}

thread_local! {
    static ACTIVE_FIBER: Cell<Option<ActiveFiber>> = const { Cell::new(None) };
}

// Kept out of line: an idle fiber can be claimed by another thread, so the
// thread-local address must be recomputed after every switch.
#[inline(never)]
fn set_active_fiber(active: Option<ActiveFiber>) {
    ACTIVE_FIBER.set(active);
}

#[inline(never)]
pub(crate) fn active_fiber() -> Option<ActiveFiber> {
    ACTIVE_FIBER.get()
}

/// Returns the pool index of the fiber running on this thread, or `None` when
/// called from plain thread context.
pub fn current_fiber() -> Option<usize> {
    active_fiber().map(|active| active.index)
}

/// Suspends the running fiber until its worker resumes it.
///
/// `stored` travels to the worker, which sets it once this fiber has fully
/// switched out.
pub(crate) fn park(active: ActiveFiber, stored: Arc<AtomicBool>) {
    set_active_fiber(None);

    // SAFETY: the yielder lives on this fiber's own stack, which is the stack
    // executing this function, so it outlives the call.
    let yielder = unsafe { &*active.yielder };
    let input = yielder.suspend(FiberYield::Parked(stored));
    debug_assert!(matches!(input, FiberInput::Resume));

    set_active_fiber(Some(active));
}

/// Represents a fiber - a lightweight stackful execution context.
pub struct Fiber {
    index: usize,
    coroutine: ManuallyDrop<Coroutine<FiberInput, FiberYield, (), DefaultStack>>,
    job: Option<Arc<Job>>,
    status: FiberStatus,
}

// SAFETY: a fiber is only ever driven by one thread at a time. The pool hands
// out exclusive access through its idle flags, and parked fibers are resumed
// solely by the worker that parked them.
unsafe impl Send for Fiber {}

impl Fiber {
    /// Creates fiber number `index` with a stack of at least `stack_size` bytes.
    pub fn new(index: usize, stack_size: usize) -> io::Result<Self> {
        let stack = DefaultStack::new(stack_size)?;

        let coroutine = Coroutine::with_stack(
            stack,
            move |yielder: &FiberYielder, mut input: FiberInput| loop {
                match input {
                    FiberInput::Run(job) => {
                        set_active_fiber(Some(ActiveFiber {
                            index,
                            yielder: yielder as *const _,
                        }));
                        job.run();
                        set_active_fiber(None);
                    }
                    FiberInput::Resume => {
                        panic!("fiber {index} resumed without a parked job");
                    }
                    FiberInput::Exit => return,
                }

                input = yielder.suspend(FiberYield::Complete);
            },
        );

        Ok(Fiber {
            index,
            coroutine: ManuallyDrop::new(coroutine),
            job: None,
            status: FiberStatus::Idle,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> FiberStatus {
        self.status
    }

    fn switch(&mut self, input: FiberInput) -> Switch {
        self.status = FiberStatus::Running;

        match self.coroutine.resume(input) {
            CoroutineResult::Yield(FiberYield::Complete) => {
                self.status = FiberStatus::Idle;
                match self.job.take() {
                    Some(job) => Switch::Completed(job),
                    None => panic!("fiber {} completed without a job", self.index),
                }
            }
            CoroutineResult::Yield(FiberYield::Parked(stored)) => {
                self.status = FiberStatus::Parked;
                Switch::Parked(stored)
            }
            CoroutineResult::Return(()) => {
                panic!("fiber {} left its trampoline while running a job", self.index)
            }
        }
    }
}

impl ExecutionContext for Fiber {
    fn start(&mut self, job: Arc<Job>) -> Switch {
        assert_eq!(
            self.status,
            FiberStatus::Idle,
            "fiber {} started while not idle",
            self.index
        );
        self.job = Some(job.clone());
        self.switch(FiberInput::Run(job))
    }

    fn resume(&mut self) -> Switch {
        assert_eq!(
            self.status,
            FiberStatus::Parked,
            "fiber {} resumed while not parked",
            self.index
        );
        self.switch(FiberInput::Resume)
    }

    fn is_idle(&self) -> bool {
        self.status == FiberStatus::Idle
    }

    fn is_parked(&self) -> bool {
        self.status == FiberStatus::Parked
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.status != FiberStatus::Idle {
            // Unwinding a job frozen mid-wait would run its cleanup against a
            // scheduler that is going away, so its stack is leaked instead.
            warn!(
                fiber = self.index,
                status = ?self.status,
                "fiber dropped while its job was suspended; leaking its stack"
            );
            return;
        }

        if self.coroutine.started() && !self.coroutine.done() {
            let _ = self.coroutine.resume(FiberInput::Exit);
        }
        // SAFETY: the coroutine is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.coroutine) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{Counter, ReadyList, WaitRegistration, WaitingFiber};
    use crate::job::{JobHandle, JobPriority};
    use std::sync::atomic::Ordering;

    const STACK: usize = 64 * 1024;

    #[test]
    fn test_fiber_runs_jobs_back_to_back() {
        let mut fiber = Fiber::new(0, STACK).unwrap();
        assert!(fiber.is_idle());

        for i in 0..3u32 {
            let job = JobHandle::new(JobPriority::Normal, move || i * 2);
            match fiber.start(job.job().clone()) {
                Switch::Completed(done) => assert!(Arc::ptr_eq(&done, job.job())),
                Switch::Parked(_) => panic!("job should not park"),
            }
            assert_eq!(job.result(), Some(i * 2));
            assert!(fiber.is_idle());
        }
    }

    #[test]
    fn test_current_fiber_only_inside_job() {
        assert_eq!(current_fiber(), None);

        let mut fiber = Fiber::new(5, STACK).unwrap();
        let job = JobHandle::new(JobPriority::Normal, current_fiber);
        let _ = fiber.start(job.job().clone());

        assert_eq!(job.result(), Some(Some(5)));
        assert_eq!(current_fiber(), None);
    }

    #[test]
    fn test_park_and_resume_continues_after_wait() {
        let ready = Arc::new(ReadyList::new());
        let counter = Counter::new(1);

        let job_counter = counter.clone();
        let job_ready = ready.clone();
        let job = JobHandle::new(JobPriority::Normal, move || {
            let active = active_fiber().expect("running inside a fiber");
            let stored = Arc::new(AtomicBool::new(false));
            let waiter = WaitingFiber::new(active.index, stored.clone(), job_ready);
            let registration = job_counter.add_waiting_fiber(waiter, 0).unwrap();
            assert_eq!(registration, WaitRegistration::Parked);
            park(active, stored);
            job_counter.value()
        });

        let mut fiber = Fiber::new(3, STACK).unwrap();
        let stored = match fiber.start(job.job().clone()) {
            Switch::Parked(stored) => stored,
            Switch::Completed(_) => panic!("job should have parked"),
        };
        assert!(fiber.is_parked());
        assert!(!job.is_ready());
        stored.store(true, Ordering::Release);

        counter.decrement(1);
        let woken = ready.pop().expect("fiber should be ready");
        assert_eq!(woken.fiber, 3);
        assert!(woken.is_stored());

        match fiber.resume() {
            Switch::Completed(_) => {}
            Switch::Parked(_) => panic!("job should have completed"),
        }
        assert_eq!(job.result(), Some(0));
    }

    #[test]
    #[should_panic(expected = "resumed while not parked")]
    fn test_resume_idle_fiber_panics() {
        let mut fiber = Fiber::new(0, STACK).unwrap();
        let _ = fiber.resume();
    }
}
