#![no_main]
use alloc_hater::AllocatorOp;
use buddy_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const CAPACITY: usize = 1 << 20;
const BLOCK_SIZE: usize = 16;

fuzz_target!(|ops: Vec<AllocatorOp>| {
    let subject = match BuddySubject::<CAPACITY, BLOCK_SIZE>::new() {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(subject);
    eval.evaluate(ops).unwrap();

    assert!(eval.subject().allocator().is_idle());
});
