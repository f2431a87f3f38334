#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use space_hater::{AllocatorOp, Evaluator, IntervalSubject};

const MAX_PAGES: u32 = 1 << 16;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    start: u32,
    len: u32,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let start = args.start % (u32::MAX - MAX_PAGES);
    let len = args.len % MAX_PAGES;

    let subject = IntervalSubject::new(start..start + len);

    let mut eval = Evaluator::new(subject);
    eval.evaluate(args.ops).unwrap();
});
