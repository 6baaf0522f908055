//! Bounded multi-producer/multi-consumer lock-free queue.
//!
//! This is Dmitry Vyukov's bounded MPMC ring buffer. Every cell carries a
//! sequence number; producers and consumers advance independent positions and
//! claim a cell by compare-and-swap only when its sequence matches the position
//! they expect. Sequence numbers grow monotonically, so a stale claim can never
//! succeed against a recycled cell.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A fixed-capacity MPMC queue.
///
/// The capacity is set at construction and never changes: [`enqueue`] fails
/// and hands the item back instead of growing.
///
/// [`enqueue`]: BoundedQueue::enqueue
pub struct BoundedQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// SAFETY: a cell's value is only touched by the single producer or consumer
// that won the CAS on the matching position, and the hand-off between them is
// ordered by the Release/Acquire pair on the cell's sequence.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// Creates an empty queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two or is smaller than 2.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            is_valid_capacity(capacity),
            "BoundedQueue capacity must be a power of two >= 2, got {capacity}"
        );

        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        BoundedQueue {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Pushes an item, or returns it back if every cell is occupied.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        let slot = loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break slot,
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // The cell one lap behind has not been consumed yet.
                return Err(item);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        };

        // SAFETY: winning the CAS gives this producer exclusive access to the
        // cell until the sequence store below publishes it.
        unsafe {
            (*slot.value.get()).write(item);
        }
        slot.sequence.store(pos + 1, Ordering::Release);
        Ok(())
    }

    /// Pops the oldest fully published item.
    pub fn dequeue(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break slot,
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        };

        // SAFETY: the Acquire load above observed the producer's publish, and
        // winning the CAS makes this consumer the only reader. Moving the value
        // out leaves no reference behind in the cell.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.sequence.store(pos + self.mask + 1, Ordering::Release);
        Some(item)
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Approximate number of queued items. Exact only when no other thread is
    /// operating on the queue.
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Acquire);
        let head = self.dequeue_pos.load(Ordering::Acquire);
        tail.saturating_sub(head).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

/// Returns true if `capacity` is usable for a [`BoundedQueue`].
pub fn is_valid_capacity(capacity: usize) -> bool {
    capacity >= 2 && capacity.is_power_of_two()
}
