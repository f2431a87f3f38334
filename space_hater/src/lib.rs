//! A small library for ~~hating on~~ evaluating the correctness of index
//! allocators.
//!
//! An [`Evaluator`] replays a sequence of [`AllocatorOp`]s against a
//! [`Subject`] and keeps a shadow map recording which operation owns every
//! index. Any range handed out twice, out of bounds, or misaligned fails the
//! run.

use std::ops::Range;

mod subjects;

pub use crate::subjects::{BuddySubject, IntervalSubject, SpaceSubject};

/// An allocation request.
#[derive(Clone, Debug)]
pub struct ArbRequest {
    /// Length in pages. Never zero.
    pub size: u32,
    /// Alignment in pages. Always a power of two.
    pub align: u32,
}

impl arbitrary::Arbitrary<'_> for ArbRequest {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Bias toward small requests, like real DMA traffic.
        let size_shift = u8::arbitrary(u)? % 13;
        let size = 1 + u32::arbitrary(u)? % (1 << size_shift);

        // Select a random bit index and shift to obtain a power of two.
        let align_shift = u8::arbitrary(u)? % 8;
        let align = 1 << align_shift;

        Ok(ArbRequest { size, align })
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    Alloc(ArbRequest),
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbRequest::arbitrary(u)?),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

/// A range of indices owned by one allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Span {
    pub addr: u32,
    /// Every index the allocator set aside, including any rounding.
    pub len: u32,
}

pub trait Subject {
    /// Whatever the subject needs back to release an allocation.
    type Handle;

    /// The indices the subject can hand out.
    fn range(&self) -> Range<u32>;

    /// Allocates according to `req` on behalf of operation `id`.
    ///
    /// Returns `None` if the subject has no room.
    fn allocate(&mut self, req: &ArbRequest, id: u64) -> Option<(Span, Self::Handle)>;

    /// Releases an allocation.
    fn deallocate(&mut self, handle: Self::Handle);

    /// Checks that the subject's own view of `span` still belongs to `id`.
    fn verify(&self, span: &Span, id: u64) -> bool {
        let _ = (span, id);
        true
    }
}

/// Records the owner of every index.
struct Canvas {
    base: u32,
    owners: Vec<Option<u64>>,
}

impl Canvas {
    fn new(range: Range<u32>) -> Canvas {
        Canvas {
            base: range.start,
            owners: vec![None; range.len()],
        }
    }

    fn cells(&mut self, span: &Span) -> Option<&mut [Option<u64>]> {
        let first = span.addr.checked_sub(self.base)? as usize;
        self.owners.get_mut(first..first + span.len as usize)
    }

    /// Marks `span` as owned by `id`, failing if any of it is taken.
    fn paint(&mut self, span: &Span, id: u64) -> bool {
        match self.cells(span) {
            Some(cells) if cells.iter().all(Option::is_none) => {
                cells.fill(Some(id));
                true
            }
            _ => false,
        }
    }

    /// Clears `span`, failing if any of it is not owned by `id`.
    fn erase(&mut self, span: &Span, id: u64) -> bool {
        match self.cells(span) {
            Some(cells) if cells.iter().all(|&o| o == Some(id)) => {
                cells.fill(None);
                true
            }
            _ => false,
        }
    }
}

/// A live allocation.
struct Block<H> {
    span: Span,
    handle: H,
    // The unique ID of the operation that made this allocation.
    id: u64,
}

/// A list of allocated blocks.
struct Blocks<H> {
    blocks: Vec<Block<H>>,
}

impl<H> Blocks<H> {
    fn new() -> Blocks<H> {
        Blocks { blocks: Vec::new() }
    }

    fn push(&mut self, block: Block<H>) {
        self.blocks.push(block);
    }

    fn remove_modulo(&mut self, idx: usize) -> Option<Block<H>> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: AllocatorOp,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();
        let mut canvas = Canvas::new(self.subject.range());

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();
            match &op {
                AllocatorOp::Alloc(req) => {
                    let (span, handle) = match self.subject.allocate(req, op_id) {
                        Some(a) => a,
                        None => continue,
                    };

                    if span.len < req.size
                        || span.addr % req.align != 0
                        || !canvas.paint(&span, op_id)
                    {
                        return Err(Failed {
                            completed,
                            failed_op: op,
                        });
                    }

                    blocks.push(Block {
                        span,
                        handle,
                        id: op_id,
                    });
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let block = match blocks.remove_modulo(*raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !self.subject.verify(&block.span, block.id)
                        || !canvas.erase(&block.span, block.id)
                    {
                        return Err(Failed {
                            completed,
                            failed_op: op,
                        });
                    }

                    self.subject.deallocate(block.handle);
                }
            }

            completed.push(op);
        }

        for (idx, block) in blocks.blocks.into_iter().enumerate() {
            if !self.subject.verify(&block.span, block.id) || !canvas.erase(&block.span, block.id)
            {
                return Err(Failed {
                    completed,
                    failed_op: AllocatorOp::Dealloc(idx),
                });
            }

            self.subject.deallocate(block.handle);
        }

        Ok(())
    }
}
