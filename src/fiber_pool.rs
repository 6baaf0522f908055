use crate::context::ExecutionContext;
use crate::fiber::Fiber;
use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Number of fruitless scans of the pool after which a claim attempt is
/// reported as a spin overflow.
pub const FIBER_SPIN_WARN_ROUNDS: u64 = 1024;

struct FiberSlot {
    fiber: UnsafeCell<Fiber>,
    idle: CachePadded<AtomicBool>,
}

/// A fixed pool of reusable fibers shared by all worker threads.
///
/// Every fiber is allocated up front. A fiber is owned by whoever flipped its
/// idle flag from `true` to `false`, and stays owned until [`release`] flips it
/// back.
///
/// [`release`]: FiberPool::release
pub struct FiberPool {
    slots: Box<[FiberSlot]>,
    spin_overflows: AtomicU64,
}

// SAFETY: a fiber is only reached through `fiber_mut`, whose contract requires
// the caller to own the fiber's slot.
unsafe impl Sync for FiberPool {}
unsafe impl Send for FiberPool {}

impl FiberPool {
    /// Creates `count` idle fibers with `stack_size`-byte stacks.
    pub fn new(count: usize, stack_size: usize) -> io::Result<Self> {
        let slots = (0..count)
            .map(|index| {
                Ok(FiberSlot {
                    fiber: UnsafeCell::new(Fiber::new(index, stack_size)?),
                    idle: CachePadded::new(AtomicBool::new(true)),
                })
            })
            .collect::<io::Result<Box<[_]>>>()?;

        debug!(fibers = count, stack_size, "fiber pool allocated");
        Ok(FiberPool {
            slots,
            spin_overflows: AtomicU64::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of fibers not currently owned by anyone.
    pub fn idle_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.idle.load(Ordering::Relaxed))
            .count()
    }

    /// Claims any idle fiber with a single scan of the pool.
    pub fn try_claim(&self) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.idle.load(Ordering::Relaxed)
                && slot
                    .idle
                    .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
        })
    }

    /// Claims an idle fiber, spinning until one is released.
    ///
    /// Spinning forever means the pool is smaller than the number of jobs
    /// that are parked at the same time. Every [`FIBER_SPIN_WARN_ROUNDS`]
    /// scans this is counted as a spin overflow.
    pub fn find_free_fiber(&self) -> usize {
        self.find_free_fiber_with(|| None)
    }

    /// Like [`find_free_fiber`](Self::find_free_fiber), but calls `on_empty`
    /// after every fruitless scan. A fiber index it returns must already be
    /// owned by the caller and ends the search.
    ///
    /// Only overflow counts that are a power of two are logged, so a long
    /// spin does not flood the log.
    pub fn find_free_fiber_with(&self, mut on_empty: impl FnMut() -> Option<usize>) -> usize {
        let backoff = Backoff::new();
        let mut rounds = 0u64;
        let mut overflows = 0u64;

        loop {
            if let Some(index) = self.try_claim().or_else(&mut on_empty) {
                return index;
            }

            rounds += 1;
            if rounds % FIBER_SPIN_WARN_ROUNDS == 0 {
                overflows += 1;
                self.spin_overflows.fetch_add(1, Ordering::Relaxed);
                if overflows.is_power_of_two() {
                    warn!(
                        rounds,
                        overflows,
                        fibers = self.len(),
                        "no idle fiber available; the fiber pool is too small for the parked workload"
                    );
                }
            }
            backoff.snooze();
        }
    }

    /// Hands a claimed fiber back to the pool.
    pub fn release(&self, index: usize) {
        let slot = &self.slots[index];
        debug_assert!(!slot.idle.load(Ordering::Relaxed), "fiber {index} released twice");
        slot.idle.store(true, Ordering::Release);
    }

    pub fn is_idle(&self, index: usize) -> bool {
        self.slots[index].idle.load(Ordering::Acquire)
    }

    /// How many times a claim has spun for [`FIBER_SPIN_WARN_ROUNDS`] scans.
    pub fn spin_overflows(&self) -> u64 {
        self.spin_overflows.load(Ordering::Relaxed)
    }

    /// Number of fibers frozen in the middle of a job.
    ///
    /// Only exact when no worker is running.
    pub fn parked_count(&self) -> usize {
        self.slots
            .iter()
            // SAFETY: read-only peek at the status byte, callers only use this
            // once workers have stopped.
            .filter(|slot| unsafe { (*slot.fiber.get()).is_parked() })
            .count()
    }

    /// Returns the fiber at `index` for switching into it.
    ///
    /// # Safety
    ///
    /// The caller must own the fiber: it either claimed the slot and has not
    /// released it, or it is the worker the parked fiber was handed back to.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn fiber_mut(&self, index: usize) -> &mut Fiber {
        // SAFETY: exclusivity is guaranteed by the caller.
        unsafe { &mut *self.slots[index].fiber.get() }
    }
}

impl Drop for FiberPool {
    fn drop(&mut self) {
        let parked = self.parked_count();
        if parked > 0 {
            warn!(parked, "fiber pool dropped with suspended jobs");
        }
    }
}
