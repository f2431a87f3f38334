#![no_main]

use arbitrary::Arbitrary;
use iova_space::CoalescePolicy;
use libfuzzer_sys::fuzz_target;
use space_hater::{AllocatorOp, BuddySubject, Evaluator};

const MAX_CLASS: u8 = 16;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    max_class: u8,
    throttle: bool,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let policy = match args.throttle {
        true => CoalescePolicy::default(),
        false => CoalescePolicy::ALWAYS,
    };

    let subject = BuddySubject::new(args.max_class % (MAX_CLASS + 1), policy);

    let mut eval = Evaluator::new(subject);
    eval.evaluate(args.ops).unwrap();
});
