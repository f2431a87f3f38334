use std::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use iova_space::{
    entry::BlockEntry,
    wait::SpinWait,
    BuddyAllocator, CoalescePolicy, InitError, InvalidationUnit, IntervalAllocator, IovaSpace,
    MapOptions, MapSpec, Mapping, PhysPages, SpaceConfig, TablePageSource,
};

use crate::{ArbRequest, Span, Subject};

pub struct BuddySubject {
    buddy: BuddyAllocator,
    slots: Vec<BlockEntry>,
}

impl BuddySubject {
    pub fn new(max_class: u8, policy: CoalescePolicy) -> BuddySubject {
        let mut slots = vec![BlockEntry::Empty; 1 << max_class];
        let buddy = BuddyAllocator::new(max_class, policy, &mut slots);
        BuddySubject { buddy, slots }
    }
}

impl Subject for BuddySubject {
    type Handle = (u32, u32);

    fn range(&self) -> Range<u32> {
        0..self.buddy.capacity()
    }

    fn allocate(&mut self, req: &ArbRequest, _id: u64) -> Option<(Span, Self::Handle)> {
        let size = req.size.max(req.align);
        let addr = self.buddy.allocate(&mut self.slots, size)?;
        let len = size.next_power_of_two();
        Some((Span { addr, len }, (addr, size)))
    }

    fn deallocate(&mut self, (addr, size): (u32, u32)) {
        self.buddy.free(&mut self.slots, addr, size);
    }
}

pub struct IntervalSubject(IntervalAllocator);

impl IntervalSubject {
    pub fn new(range: Range<u32>) -> IntervalSubject {
        IntervalSubject(IntervalAllocator::new(range))
    }
}

impl Subject for IntervalSubject {
    type Handle = (u32, u32);

    fn range(&self) -> Range<u32> {
        self.0.range()
    }

    fn allocate(&mut self, req: &ArbRequest, _id: u64) -> Option<(Span, Self::Handle)> {
        let addr = self.0.allocate(req.size, req.align)?;
        Some((
            Span {
                addr,
                len: req.size,
            },
            (addr, req.size),
        ))
    }

    fn deallocate(&mut self, (addr, size): (u32, u32)) {
        self.0.free(addr, size);
    }
}

/// Hands out page numbers without backing memory.
#[derive(Debug, Default)]
pub struct FakePages {
    next: u64,
}

impl TablePageSource for FakePages {
    fn alloc_table_page(&mut self) -> Option<u64> {
        self.next += 1;
        Some(self.next)
    }

    fn free_table_page(&mut self, _page: u64) {}
}

/// Completes every invalidation as soon as it is issued.
#[derive(Debug, Default)]
pub struct InstantUnit {
    completed: AtomicU64,
}

impl InvalidationUnit for InstantUnit {
    fn issue_invalidate(&self, _domain_tag: u16, _addr: u32, _size_hint: u32, stamp: u64) {
        self.completed.fetch_max(stamp, Ordering::SeqCst);
    }

    fn last_completed_stamp(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

/// Physical page mapped at the start of the allocation made by operation
/// `id`.
fn phys_base(id: u64) -> u64 {
    id << 20
}

pub struct SpaceSubject {
    space: IovaSpace<FakePages, SpinWait>,
}

impl SpaceSubject {
    pub fn new(space_pages: u32, buddy_bits: u8) -> Result<SpaceSubject, InitError> {
        let config = SpaceConfig {
            space_pages,
            buddy_bits,
            reclaim_capacity: 64,
            ..SpaceConfig::default()
        };

        let space = IovaSpace::new(
            config,
            FakePages::default(),
            vec![Box::new(InstantUnit::default()) as Box<dyn InvalidationUnit>],
            SpinWait::default(),
        )?;

        Ok(SpaceSubject { space })
    }
}

impl Subject for SpaceSubject {
    type Handle = Mapping;

    fn range(&self) -> Range<u32> {
        0..self.space.space_pages()
    }

    fn allocate(&mut self, req: &ArbRequest, id: u64) -> Option<(Span, Self::Handle)> {
        let pages = PhysPages::Contiguous {
            base: phys_base(id),
            count: req.size,
        };
        let spec = MapSpec {
            address_bits: 64,
            alignment: req.align,
        };

        let m = self
            .space
            .try_map(pages, MapOptions::READ | MapOptions::WRITE, &spec)
            .ok()?;

        let span = Span {
            addr: m.page(),
            len: m.reserved_pages(),
        };
        Some((span, m))
    }

    fn deallocate(&mut self, mapping: Mapping) {
        self.space.unmap(mapping);
        self.space.reclaim();
    }

    fn verify(&self, span: &Span, id: u64) -> bool {
        self.space.translate(span.addr) == Some(phys_base(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocatorOp, Evaluator};

    fn ops() -> Vec<AllocatorOp> {
        let mut ops = Vec::new();
        for i in 0..64u32 {
            ops.push(AllocatorOp::Alloc(ArbRequest {
                size: 1 + (i * 37) % 300,
                align: 1 << (i % 4),
            }));
            if i % 3 == 0 {
                ops.push(AllocatorOp::Dealloc(i as usize * 7));
            }
        }
        ops
    }

    #[test]
    fn buddy_survives() {
        let subject = BuddySubject::new(12, CoalescePolicy::default());
        Evaluator::new(subject).evaluate(ops()).unwrap();
    }

    #[test]
    fn interval_survives() {
        let subject = IntervalSubject::new(100..5000);
        Evaluator::new(subject).evaluate(ops()).unwrap();
    }

    #[test]
    fn space_survives() {
        let subject = SpaceSubject::new(1 << 13, 11).unwrap();
        Evaluator::new(subject).evaluate(ops()).unwrap();
    }
}
