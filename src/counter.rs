//! Counter-based synchronization primitives for job completion tracking.
//!
//! A [`Counter`] is an atomic value plus a small fixed table of wait slots.
//! A fiber that must wait for the counter to reach a target value claims a
//! slot and parks; whichever thread later moves the counter onto that target
//! pushes the fiber onto its owner's [`ReadyList`].

use crate::error::WaitError;
use crossbeam::queue::SegQueue;
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Number of wait slots of a general-purpose counter.
pub const MAX_WAITING: usize = 16;

/// A parked fiber whose wait condition became true.
#[derive(Debug, Clone)]
pub struct ReadyFiber {
    /// Index of the fiber in the fiber pool.
    pub fiber: usize,
    /// Set by the owning thread once the fiber has fully switched out.
    /// The fiber must not be resumed before this is true.
    pub stored: Arc<AtomicBool>,
}

impl ReadyFiber {
    pub fn is_stored(&self) -> bool {
        self.stored.load(Ordering::Acquire)
    }
}

/// Per-thread list of fibers ready to be resumed.
///
/// Any thread may push; only the owning worker pops.
#[derive(Debug, Default)]
pub struct ReadyList {
    fibers: SegQueue<ReadyFiber>,
}

impl ReadyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, fiber: ReadyFiber) {
        self.fibers.push(fiber);
    }

    pub fn pop(&self) -> Option<ReadyFiber> {
        self.fibers.pop()
    }

    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }
}

/// Everything a counter needs to wake one parked fiber.
#[derive(Debug, Clone)]
pub struct WaitingFiber {
    pub fiber: usize,
    pub stored: Arc<AtomicBool>,
    pub resume_on: Arc<ReadyList>,
}

impl WaitingFiber {
    pub fn new(fiber: usize, stored: Arc<AtomicBool>, resume_on: Arc<ReadyList>) -> Self {
        WaitingFiber {
            fiber,
            stored,
            resume_on,
        }
    }

    fn wake(self) {
        self.resume_on.push(ReadyFiber {
            fiber: self.fiber,
            stored: self.stored,
        });
    }
}

/// Outcome of [`Counter::add_waiting_fiber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitRegistration {
    /// The slot is armed; the fiber must suspend and will be pushed to its
    /// ready list exactly once.
    Parked,
    /// The counter already holds the target value. The slot was released and
    /// the caller continues without switching.
    AlreadySatisfied,
}

struct WaitSlot {
    target: AtomicU32,
    /// `false` while armed. Flipping it to `true` by CAS is how exactly one
    /// party takes ownership of the waiter.
    in_use: AtomicBool,
    waiter: UnsafeCell<Option<WaitingFiber>>,
}

impl WaitSlot {
    fn new() -> Self {
        WaitSlot {
            target: AtomicU32::new(0),
            in_use: AtomicBool::new(true),
            waiter: UnsafeCell::new(None),
        }
    }
}

struct InnerCounter {
    value: AtomicU32,
    slots: Box<[WaitSlot]>,
    free_slots: Box<[AtomicBool]>,
}

// SAFETY: `WaitSlot::waiter` is written only by the thread that claimed the
// slot through `free_slots` and before it arms the slot, and taken only by the
// thread that wins the `in_use` CAS. Those accesses never overlap.
unsafe impl Sync for InnerCounter {}
unsafe impl Send for InnerCounter {}

/// An atomic dependency counter that fibers can wait on without blocking
/// their worker thread.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<InnerCounter>,
}

impl Counter {
    /// Creates a counter with [`MAX_WAITING`] wait slots.
    pub fn new(initial: u32) -> Self {
        Self::with_wait_slots(initial, MAX_WAITING)
    }

    /// Creates a counter with exactly one wait slot, for single-job waits.
    pub fn single_waiter(initial: u32) -> Self {
        Self::with_wait_slots(initial, 1)
    }

    /// Creates a counter with `slots` wait slots.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is zero.
    pub fn with_wait_slots(initial: u32, slots: usize) -> Self {
        assert!(slots > 0, "a counter needs at least one wait slot");
        Counter {
            inner: Arc::new(InnerCounter {
                value: AtomicU32::new(initial),
                slots: (0..slots).map(|_| WaitSlot::new()).collect(),
                free_slots: (0..slots).map(|_| AtomicBool::new(true)).collect(),
            }),
        }
    }

    /// Adds `by` to the counter and wakes fibers waiting for the new value.
    /// Returns the previous value.
    pub fn increment(&self, by: u32) -> u32 {
        let prev = self.inner.value.fetch_add(by, Ordering::SeqCst);
        self.check_waiting_fibers(prev.wrapping_add(by));
        prev
    }

    /// Subtracts `by` from the counter and wakes fibers waiting for the new
    /// value. Returns the previous value.
    pub fn decrement(&self, by: u32) -> u32 {
        let prev = self.inner.value.fetch_sub(by, Ordering::SeqCst);
        self.check_waiting_fibers(prev.wrapping_sub(by));
        prev
    }

    pub fn value(&self) -> u32 {
        self.inner.value.load(Ordering::SeqCst)
    }

    /// Checks if the counter has reached zero.
    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }

    pub fn wait_slots(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of wait slots currently free. Only a snapshot.
    pub fn free_wait_slots(&self) -> usize {
        self.inner
            .free_slots
            .iter()
            .filter(|free| free.load(Ordering::Acquire))
            .count()
    }

    /// Registers `waiter` to be woken when the counter becomes `target`.
    ///
    /// After arming the slot the live value is checked again, which closes the
    /// window where the target is reached between the caller's own check and
    /// the registration.
    pub fn add_waiting_fiber(
        &self,
        waiter: WaitingFiber,
        target: u32,
    ) -> Result<WaitRegistration, WaitError> {
        let inner = &*self.inner;

        for (index, free) in inner.free_slots.iter().enumerate() {
            if free
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let slot = &inner.slots[index];
            // SAFETY: the slot was just claimed and is not armed, so no other
            // thread reads or takes `waiter` until `in_use` is cleared below.
            unsafe {
                *slot.waiter.get() = Some(waiter);
            }
            slot.target.store(target, Ordering::Relaxed);
            slot.in_use.store(false, Ordering::SeqCst);

            let current = inner.value.load(Ordering::SeqCst);
            if current != target {
                return Ok(WaitRegistration::Parked);
            }

            if slot
                .in_use
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                // A concurrent mutation already claimed the slot and queued
                // the fiber for resumption.
                return Ok(WaitRegistration::Parked);
            }

            // SAFETY: winning the CAS above makes this thread the only owner.
            unsafe {
                (*slot.waiter.get()).take();
            }
            free.store(true, Ordering::Release);
            return Ok(WaitRegistration::AlreadySatisfied);
        }

        Err(WaitError::WaitSlotsExhausted {
            slots: inner.slots.len(),
        })
    }

    fn check_waiting_fibers(&self, value: u32) {
        let inner = &*self.inner;

        for (index, free) in inner.free_slots.iter().enumerate() {
            if free.load(Ordering::SeqCst) {
                continue;
            }

            let slot = &inner.slots[index];
            if slot.in_use.load(Ordering::SeqCst) {
                continue;
            }
            if slot.target.load(Ordering::Relaxed) != value {
                continue;
            }
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // SAFETY: winning the CAS above makes this thread the only owner.
            let waiter = unsafe { (*slot.waiter.get()).take() };
            if let Some(waiter) = waiter {
                waiter.wake();
            }
            // Freed only after the fiber is queued for resumption.
            free.store(true, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("value", &self.value())
            .field("wait_slots", &self.wait_slots())
            .field("free_wait_slots", &self.free_wait_slots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn waiter(fiber: usize, ready: &Arc<ReadyList>) -> WaitingFiber {
        WaitingFiber::new(fiber, Arc::new(AtomicBool::new(false)), ready.clone())
    }

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new(5);
        assert_eq!(counter.value(), 5);
        assert!(!counter.is_complete());

        assert_eq!(counter.decrement(1), 5);
        assert_eq!(counter.value(), 4);

        assert_eq!(counter.increment(2), 4);
        assert_eq!(counter.value(), 6);
    }

    #[test]
    fn test_counter_completion() {
        let counter = Counter::new(1);
        assert!(!counter.is_complete());
        counter.decrement(1);
        assert!(counter.is_complete());
    }

    #[test]
    fn test_already_satisfied_releases_slot() {
        let ready = Arc::new(ReadyList::new());
        let counter = Counter::new(3);

        let registration = counter.add_waiting_fiber(waiter(1, &ready), 3).unwrap();
        assert_eq!(registration, WaitRegistration::AlreadySatisfied);
        assert_eq!(counter.free_wait_slots(), MAX_WAITING);
        assert!(ready.is_empty());
    }

    #[test]
    fn test_waiter_woken_when_target_reached() {
        let ready = Arc::new(ReadyList::new());
        let counter = Counter::new(2);

        let registration = counter.add_waiting_fiber(waiter(7, &ready), 0).unwrap();
        assert_eq!(registration, WaitRegistration::Parked);
        assert_eq!(counter.free_wait_slots(), MAX_WAITING - 1);

        counter.decrement(1);
        assert!(ready.is_empty());

        counter.decrement(1);
        let woken = ready.pop().expect("waiter should be ready");
        assert_eq!(woken.fiber, 7);
        assert!(ready.is_empty());
        assert_eq!(counter.free_wait_slots(), MAX_WAITING);
    }

    #[test]
    fn test_increment_can_satisfy_waiter() {
        let ready = Arc::new(ReadyList::new());
        let counter = Counter::new(0);

        counter.add_waiting_fiber(waiter(3, &ready), 2).unwrap();
        counter.increment(1);
        assert!(ready.is_empty());
        counter.increment(1);
        assert_eq!(ready.pop().map(|r| r.fiber), Some(3));
    }

    #[test]
    fn test_single_waiter_exhaustion() {
        let ready = Arc::new(ReadyList::new());
        let counter = Counter::single_waiter(1);

        assert_eq!(
            counter.add_waiting_fiber(waiter(0, &ready), 0).unwrap(),
            WaitRegistration::Parked
        );
        let err = counter.add_waiting_fiber(waiter(1, &ready), 0).unwrap_err();
        assert!(matches!(err, WaitError::WaitSlotsExhausted { slots: 1 }));

        // Satisfying the first waiter frees the slot again.
        counter.decrement(1);
        assert_eq!(ready.len(), 1);
        assert_eq!(counter.free_wait_slots(), 1);
    }

    #[test]
    fn test_each_waiter_woken_exactly_once_under_contention() {
        let ready = Arc::new(ReadyList::new());
        let counter = Counter::new(1);
        let threads = 8;
        let ops_per_thread = 500;

        for fiber in 0..4 {
            let registration = counter.add_waiting_fiber(waiter(fiber, &ready), 0).unwrap();
            assert_eq!(registration, WaitRegistration::Parked);
        }

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..ops_per_thread {
                        counter.increment(1);
                        counter.decrement(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(ready.is_empty(), "no waiter may wake while value stays >= 1");

        counter.decrement(1);
        assert_eq!(counter.value(), 0);

        let mut woken: Vec<_> = std::iter::from_fn(|| ready.pop()).map(|r| r.fiber).collect();
        woken.sort_unstable();
        assert_eq!(woken, vec![0, 1, 2, 3]);
        assert_eq!(counter.free_wait_slots(), MAX_WAITING);
    }

    #[test]
    fn test_registration_races_with_decrement() {
        for round in 0..200 {
            let ready = Arc::new(ReadyList::new());
            let counter = Counter::new(1);

            let decrementer = {
                let counter = counter.clone();
                thread::spawn(move || {
                    counter.decrement(1);
                })
            };
            let registration = counter.add_waiting_fiber(waiter(round, &ready), 0).unwrap();
            decrementer.join().unwrap();

            match registration {
                WaitRegistration::AlreadySatisfied => assert!(ready.is_empty()),
                WaitRegistration::Parked => assert_eq!(ready.len(), 1),
            }
        }
    }
}
