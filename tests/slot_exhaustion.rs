use std::sync::{Arc, Barrier};
use std::thread;

use matches::assert_matches;

use reclaim_stack::{context, hazard, HazardStack, NoFreeSlotError, ThreadContext};

#[test]
fn registry_exhaustion() {
    let stack = Arc::new(HazardStack::<i32>::new());
    stack.push(1);

    let ready = Arc::new(Barrier::new(hazard::CAPACITY + 1));
    let release = Arc::new(Barrier::new(hazard::CAPACITY + 1));

    let holders: Vec<_> = (0..hazard::CAPACITY)
        .map(|_| {
            let ready = Arc::clone(&ready);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                let context = ThreadContext::enter().unwrap();
                ready.wait();
                release.wait();
                drop(context);
            })
        })
        .collect();

    ready.wait();
    assert_eq!(hazard::CAPACITY, hazard::claimed_slots());

    // surplus threads are refused, the holders are unaffected
    let surplus = {
        let stack = Arc::clone(&stack);
        thread::spawn(move || {
            assert_matches!(ThreadContext::enter(), Err(NoFreeSlotError));
            assert_matches!(hazard::acquire(), Err(NoFreeSlotError));
            assert_matches!(context::scope(|| ()), Err(NoFreeSlotError));
            assert_matches!(stack.try_pop(), Err(NoFreeSlotError));

            // pushing requires no slot
            stack.push(2);
        })
    };
    surplus.join().unwrap();

    let panicking = {
        let stack = Arc::clone(&stack);
        thread::spawn(move || stack.pop())
    };
    assert!(panicking.join().is_err());

    release.wait();
    for holder in holders {
        holder.join().unwrap();
    }

    assert_eq!(0, hazard::claimed_slots());

    // released slots are claimed again
    let popped = thread::spawn(move || {
        let _context = ThreadContext::enter().unwrap();
        (stack.pop(), stack.pop(), stack.pop())
    });
    assert_eq!((Some(2), Some(1), None), popped.join().unwrap());
}
