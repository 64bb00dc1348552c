#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use buddy_arena::PageProvider;
use buddy_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const CAPACITY: usize = 1 << 16;
const BLOCK_SIZE: usize = 8;

const MAX_ARENAS: usize = 4;

#[derive(Clone, Debug)]
struct Args {
    num_arenas: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let num_arenas = 1 + usize::arbitrary(un)? % MAX_ARENAS;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { num_arenas, ops })
    }
}

fuzz_target!(|args: Args| {
    let Args { num_arenas, ops } = args;

    // Several arenas mapped side by side must not interfere.
    let mut evals = (0..num_arenas)
        .map(|_| BuddySubject::<CAPACITY, BLOCK_SIZE, _>::new_in(PageProvider::new()))
        .collect::<Result<Vec<_>, _>>()
        .map(|subjects| subjects.into_iter().map(alloc_hater::Evaluator::new).collect::<Vec<_>>())
        .unwrap();

    for eval in &mut evals {
        eval.evaluate(ops.iter().cloned()).unwrap();
        assert!(eval.subject().allocator().is_idle());
    }
});
