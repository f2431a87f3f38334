#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use space_hater::{AllocatorOp, Evaluator, SpaceSubject};

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    space_shift: u8,
    buddy_bits: u8,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let space_shift = 9 + args.space_shift % 8;
    let buddy_bits = args.buddy_bits % (space_shift + 1);

    let subject = match SpaceSubject::new(1 << space_shift, buddy_bits) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    eval.evaluate(args.ops).unwrap();
});
