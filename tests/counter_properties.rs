use fiberjobs::counter::{Counter, ReadyList, WaitingFiber};
use fiberjobs::{WaitError, WaitRegistration};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

fn waiter(fiber: usize, ready: &Arc<ReadyList>) -> WaitingFiber {
    WaitingFiber::new(fiber, Arc::new(AtomicBool::new(true)), ready.clone())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Net value converges, and a waiter registered up front for that value
    /// is woken exactly once however the operations interleave.
    #[test]
    fn converges_and_wakes_once(
        ops in prop::collection::vec((any::<bool>(), 1u32..4), 1..64),
        threads in 1usize..4,
    ) {
        let start = 1_000u32;
        let net: i64 = ops
            .iter()
            .map(|&(up, by)| if up { i64::from(by) } else { -i64::from(by) })
            .sum();
        let target = (i64::from(start) + net) as u32;

        let counter = Counter::new(start);
        let ready = Arc::new(ReadyList::new());
        let registration = counter.add_waiting_fiber(waiter(7, &ready), target).unwrap();
        if target == start {
            prop_assert_eq!(registration, WaitRegistration::AlreadySatisfied);
        }

        let chunk = ops.len().div_ceil(threads);
        let handles: Vec<_> = ops
            .chunks(chunk)
            .map(|ops| {
                let (counter, ops) = (counter.clone(), ops.to_vec());
                thread::spawn(move || {
                    for (up, by) in ops {
                        if up {
                            counter.increment(by);
                        } else {
                            counter.decrement(by);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        prop_assert_eq!(counter.value(), target);
        // Transient hits on the target may wake the waiter early, but never twice.
        if registration == WaitRegistration::Parked {
            prop_assert_eq!(ready.len(), 1);
            prop_assert_eq!(ready.pop().map(|r| r.fiber), Some(7));
        } else {
            prop_assert!(ready.is_empty());
        }
        prop_assert_eq!(counter.free_wait_slots(), counter.wait_slots());
    }
}

#[test]
fn already_at_target_reports_satisfied() {
    let counter = Counter::new(3);
    let ready = Arc::new(ReadyList::new());

    let registration = counter.add_waiting_fiber(waiter(0, &ready), 3).unwrap();
    assert_eq!(registration, WaitRegistration::AlreadySatisfied);
    assert!(ready.is_empty());
    assert_eq!(counter.free_wait_slots(), counter.wait_slots());
}

#[test]
fn exhausted_slots_are_an_error() {
    let counter = Counter::with_wait_slots(1, 2);
    let ready = Arc::new(ReadyList::new());

    for fiber in 0..2 {
        counter.add_waiting_fiber(waiter(fiber, &ready), 0).unwrap();
    }
    let err = counter.add_waiting_fiber(waiter(2, &ready), 0).unwrap_err();
    assert!(matches!(err, WaitError::WaitSlotsExhausted { slots: 2 }));

    counter.decrement(1);
    assert_eq!(ready.len(), 2);
}
