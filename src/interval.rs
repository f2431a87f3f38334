//! An interval allocator for large, arbitrarily sized ranges.
//!
//! Free extents are kept as nodes in one arena, linked into two red-black
//! trees at once: one ordered by start address, one ordered by extent length
//! (largest first). The length-ordered tree serves aligned allocation; the
//! address-ordered tree finds the neighbours of a freed range so it can be
//! merged with them in `O(log n)`.
//!
//! No two free extents are ever adjacent: a freed range always absorbs, or is
//! absorbed by, the extents touching it.

use alloc::vec::Vec;
use core::{cmp::Ordering, ops::Range};

use crate::rbtree::{NodeId, RbLink, RbNode, RbTree, Step, NIL};

const BY_ADDR: usize = 0;
const BY_SIZE: usize = 1;

#[derive(Debug)]
struct Extent {
    start: u32,
    end: u32,
    links: [RbLink; 2],
}

impl Extent {
    #[inline]
    fn len(&self) -> u32 {
        self.end - self.start
    }

    /// Returns the aligned start of an allocation of `size` pages carved from
    /// this extent, if one fits.
    #[inline]
    fn fit(&self, size: u32, align: u32) -> Option<u32> {
        let candidate = align_up(self.start, align)?;
        let end = u64::from(candidate) + u64::from(size);
        (end <= u64::from(self.end)).then_some(candidate)
    }
}

impl RbNode for Extent {
    #[inline]
    fn link(&self, slot: usize) -> &RbLink {
        &self.links[slot]
    }

    #[inline]
    fn link_mut(&mut self, slot: usize) -> &mut RbLink {
        &mut self.links[slot]
    }
}

fn by_addr(a: &Extent, b: &Extent) -> Ordering {
    a.start.cmp(&b.start)
}

// Largest first. Extents never overlap, so ordering ties by start keeps keys
// distinct.
fn by_size(a: &Extent, b: &Extent) -> Ordering {
    b.len().cmp(&a.len()).then(a.start.cmp(&b.start))
}

/// Rounds `x` up to a multiple of `align`.
#[inline]
pub fn align_up(x: u32, align: u32) -> Option<u32> {
    let align = align.max(1);
    u32::try_from(u64::from(x).div_ceil(u64::from(align)) * u64::from(align)).ok()
}

/// Counters kept by an [`IntervalAllocator`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IntervalStats {
    /// Successful allocations.
    pub allocs: u64,
    /// Ranges freed.
    pub frees: u64,
    /// Freed ranges joined to a neighbouring extent.
    pub merges: u64,
    /// Allocations satisfied by the fallback scan rather than the tree
    /// descent.
    pub fallback_scans: u64,
}

/// An interval allocator over `[range.start, range.end)`.
pub struct IntervalAllocator {
    range: Range<u32>,
    extents: Vec<Extent>,
    spare: Vec<NodeId>,
    by_addr: RbTree<Extent>,
    by_size: RbTree<Extent>,
    free_pages: u32,
    stats: IntervalStats,
}

impl core::fmt::Debug for IntervalAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IntervalAllocator")
            .field("range", &self.range)
            .field("extents", &self.by_addr.len())
            .field("free_pages", &self.free_pages)
            .finish()
    }
}

impl IntervalAllocator {
    /// Constructs an allocator with all of `range` free.
    pub fn new(range: Range<u32>) -> IntervalAllocator {
        let mut alloc = IntervalAllocator {
            range: range.clone(),
            extents: Vec::new(),
            spare: Vec::new(),
            by_addr: RbTree::new(BY_ADDR, by_addr),
            by_size: RbTree::new(BY_SIZE, by_size),
            free_pages: 0,
            stats: IntervalStats::default(),
        };

        if !range.is_empty() {
            alloc.insert_extent(range.start, range.end);
            alloc.free_pages = range.end - range.start;
        }

        alloc
    }

    /// Returns the managed range.
    #[inline]
    pub fn range(&self) -> Range<u32> {
        self.range.clone()
    }

    /// Returns the number of pages in the managed range.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.range.end - self.range.start
    }

    /// Returns the number of free pages.
    #[inline]
    pub fn free_pages(&self) -> u32 {
        self.free_pages
    }

    /// Returns the number of allocated or reserved pages.
    #[inline]
    pub fn used_pages(&self) -> u32 {
        self.capacity() - self.free_pages
    }

    /// Returns the allocation counters.
    #[inline]
    pub fn stats(&self) -> IntervalStats {
        self.stats
    }

    /// Returns the free extents in address order.
    pub fn extents(&self) -> impl Iterator<Item = Range<u32>> + '_ {
        self.by_addr.iter(&self.extents).map(|id| {
            let e = &self.extents[id as usize];
            e.start..e.end
        })
    }

    /// Returns the largest free extent.
    pub fn largest_extent(&self) -> Option<Range<u32>> {
        match self.by_size.first(&self.extents) {
            NIL => None,
            id => {
                let e = &self.extents[id as usize];
                Some(e.start..e.end)
            }
        }
    }

    fn new_node(&mut self, start: u32, end: u32) -> NodeId {
        let extent = Extent {
            start,
            end,
            links: [RbLink::UNLINKED; 2],
        };

        match self.spare.pop() {
            Some(id) => {
                self.extents[id as usize] = extent;
                id
            }
            None => {
                let id = NodeId::try_from(self.extents.len()).expect("extent arena overflow");
                self.extents.push(extent);
                id
            }
        }
    }

    fn insert_extent(&mut self, start: u32, end: u32) -> NodeId {
        let id = self.new_node(start, end);
        self.by_addr.insert(&mut self.extents, id);
        self.by_size.insert(&mut self.extents, id);
        id
    }

    fn remove_extent(&mut self, id: NodeId) {
        self.by_addr.remove(&mut self.extents, id);
        self.by_size.remove(&mut self.extents, id);
        self.spare.push(id);
    }

    /// Returns the extent with the greatest start address `<= addr`.
    fn extent_at_or_before(&self, addr: u32) -> NodeId {
        self.by_addr.rfind(&self.extents, |e| e.start <= addr)
    }

    /// Picks the extent to carve an aligned allocation from.
    fn choose(&mut self, size: u32, align: u32) -> Option<(NodeId, u32)> {
        let extents = &self.extents;
        let mut chosen = None;

        // Larger extents are to the left. Admissible extents are remembered
        // and the walk continues toward smaller ones; the last admissible
        // extent seen wins.
        self.by_size.walk(extents, |id, e| {
            if e.len() < size {
                return Step::Left;
            }

            match e.fit(size, align) {
                Some(at) => {
                    chosen = Some((id, at));
                    Step::Right
                }
                None => Step::Left,
            }
        });

        if chosen.is_some() {
            return chosen;
        }

        // Alignment padding can make an extent inadmissible while a smaller
        // one fits, which the descent may step past. Fall back to scanning
        // every extent that is long enough, largest first.
        let found = self
            .by_size
            .iter(extents)
            .take_while(|&id| extents[id as usize].len() >= size)
            .find_map(|id| extents[id as usize].fit(size, align).map(|at| (id, at)));

        if found.is_some() {
            self.stats.fallback_scans += 1;
        }

        found
    }

    /// Removes `[at, at + size)` from extent `id`, keeping the head and tail
    /// remainders free.
    fn carve(&mut self, id: NodeId, at: u32, size: u32) {
        let Extent { start, end, .. } = self.extents[id as usize];
        let alloc_end = at + size;
        debug_assert!(start <= at && alloc_end <= end);

        let has_head = at > start;
        let has_tail = alloc_end < end;

        self.by_size.remove(&mut self.extents, id);

        // Shrinking an extent in place never moves it past a neighbour, so
        // its position in the address tree stays valid.
        match (has_head, has_tail) {
            (true, true) => {
                self.extents[id as usize].end = at;
                self.by_size.insert(&mut self.extents, id);
                self.insert_extent(alloc_end, end);
            }
            (true, false) => {
                self.extents[id as usize].end = at;
                self.by_size.insert(&mut self.extents, id);
            }
            (false, true) => {
                self.extents[id as usize].start = alloc_end;
                self.by_size.insert(&mut self.extents, id);
            }
            (false, false) => {
                self.by_addr.remove(&mut self.extents, id);
                self.spare.push(id);
            }
        }

        self.free_pages -= size;
    }

    /// Allocates `size` pages aligned to `align` pages.
    ///
    /// Returns `None` if `size` is zero or no free extent can hold an aligned
    /// range of that size.
    pub fn allocate(&mut self, size: u32, align: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }

        let (id, at) = self.choose(size, align)?;
        self.carve(id, at, size);
        self.stats.allocs += 1;

        Some(at)
    }

    /// Returns `[addr, addr + size)` to the free extents.
    ///
    /// Freeing a range that is not currently allocated is a contract
    /// violation.
    pub fn free(&mut self, addr: u32, size: u32) {
        if size == 0 {
            return;
        }

        let end = addr + size;
        debug_assert!(
            self.range.start <= addr && end <= self.range.end,
            "freed range {addr:#x}..{end:#x} outside {:?}",
            self.range
        );

        let prev = self.extent_at_or_before(addr);
        let next = match prev {
            NIL => self.by_addr.first(&self.extents),
            p => self.by_addr.next(&self.extents, p),
        };

        debug_assert!(
            prev == NIL || self.extents[prev as usize].end <= addr,
            "double free of {addr:#x}"
        );
        debug_assert!(
            next == NIL || end <= self.extents[next as usize].start,
            "double free of {addr:#x}"
        );

        let join_prev = prev != NIL && self.extents[prev as usize].end == addr;
        let join_next = next != NIL && self.extents[next as usize].start == end;

        match (join_prev, join_next) {
            (true, true) => {
                let next_end = self.extents[next as usize].end;
                self.remove_extent(next);
                self.by_size.remove(&mut self.extents, prev);
                self.extents[prev as usize].end = next_end;
                self.by_size.insert(&mut self.extents, prev);
                self.stats.merges += 2;
            }
            (true, false) => {
                self.by_size.remove(&mut self.extents, prev);
                self.extents[prev as usize].end = end;
                self.by_size.insert(&mut self.extents, prev);
                self.stats.merges += 1;
            }
            (false, true) => {
                self.by_size.remove(&mut self.extents, next);
                self.extents[next as usize].start = addr;
                self.by_size.insert(&mut self.extents, next);
                self.stats.merges += 1;
            }
            (false, false) => {
                self.insert_extent(addr, end);
            }
        }

        self.free_pages += size;
        self.stats.frees += 1;
    }

    /// Returns whether `[addr, addr + size)` lies within one free extent.
    pub fn is_free_range(&self, addr: u32, size: u32) -> bool {
        match self.extent_at_or_before(addr) {
            NIL => false,
            id => u64::from(addr) + u64::from(size) <= u64::from(self.extents[id as usize].end),
        }
    }

    /// Reserves exactly `[addr, addr + size)`.
    ///
    /// Returns `false`, leaving the allocator unchanged, if the range is not
    /// entirely inside one free extent. That is a contract violation and
    /// trips a debug assertion.
    pub fn allocate_fixed(&mut self, addr: u32, size: u32) -> bool {
        if size == 0 {
            return true;
        }

        if !self.is_free_range(addr, size) {
            debug_assert!(false, "fixed range {addr:#x}+{size:#x} is not free");
            return false;
        }

        let id = self.extent_at_or_before(addr);
        self.carve(id, addr, size);

        true
    }

    /// Checks that both trees index the same disjoint, non-adjacent extents
    /// and that they add up to the free page count.
    #[cfg(test)]
    pub(crate) fn validate(&self) {
        self.by_addr.validate(&self.extents);
        self.by_size.validate(&self.extents);
        assert_eq!(self.by_addr.len(), self.by_size.len());

        let mut total = 0;
        let mut last_end = None;
        for r in self.extents() {
            assert!(!r.is_empty());
            assert!(self.range.start <= r.start && r.end <= self.range.end);
            if let Some(e) = last_end {
                assert!(e < r.start, "adjacent or overlapping extents at {e:#x}");
            }
            last_end = Some(r.end);
            total += r.end - r.start;
        }
        assert_eq!(total, self.free_pages);

        let mut by_size: Vec<_> = self
            .by_size
            .iter(&self.extents)
            .map(|id| self.extents[id as usize].start)
            .collect();
        by_size.sort_unstable();
        let by_addr: Vec<_> = self.extents().map(|r| r.start).collect();
        assert_eq!(by_size, by_addr);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn extents(a: &IntervalAllocator) -> Vec<Range<u32>> {
        a.extents().collect()
    }

    #[test]
    fn aligned_allocation_leaves_head_and_tail() {
        let mut a = IntervalAllocator::new(100..200);

        assert_eq!(a.allocate(30, 16), Some(112));
        assert_eq!(extents(&a), vec![100..112, 142..200]);
        assert_eq!(a.free_pages(), 70);
        a.validate();
    }

    #[test]
    fn free_merges_both_sides_in_any_order() {
        for order in [[0, 1, 2], [2, 1, 0], [1, 0, 2], [0, 2, 1]] {
            let mut a = IntervalAllocator::new(0..64);
            let blocks = [
                a.allocate(8, 1).unwrap(),
                a.allocate(8, 1).unwrap(),
                a.allocate(8, 1).unwrap(),
            ];
            assert_eq!(a.free_pages(), 40);

            for i in order {
                a.free(blocks[i], 8);
                a.validate();
            }

            assert_eq!(extents(&a), vec![0..64]);
        }
    }

    #[test]
    fn exhaustion_and_zero_size() {
        let mut a = IntervalAllocator::new(0..16);
        assert_eq!(a.allocate(0, 1), None);
        assert_eq!(a.allocate(17, 1), None);
        assert_eq!(a.allocate(16, 1), Some(0));
        assert_eq!(a.allocate(1, 1), None);
        assert_eq!(a.largest_extent(), None);
        a.free(0, 16);
        assert_eq!(a.largest_extent(), Some(0..16));
    }

    #[test]
    fn alignment_fallback_finds_smaller_extent() {
        // Two free extents: [1, 9) of length 8 cannot hold 8 pages aligned to
        // 8, while [16, 24) of the same length can.
        let mut a = IntervalAllocator::new(0..32);
        assert!(a.allocate_fixed(0, 1));
        assert!(a.allocate_fixed(9, 7));
        assert!(a.allocate_fixed(24, 8));
        assert_eq!(extents(&a), vec![1..9, 16..24]);

        assert_eq!(a.allocate(8, 8), Some(16));
        a.validate();
    }

    #[test]
    fn fixed_reserve_then_release_restores_state() {
        let mut a = IntervalAllocator::new(10..100);
        let before = extents(&a);

        assert!(a.allocate_fixed(40, 20));
        assert_eq!(extents(&a), vec![10..40, 60..100]);
        a.free(40, 20);

        assert_eq!(extents(&a), before);
        a.validate();
    }

    #[test]
    fn prefers_tightest_extent_seen_on_descent() {
        let mut a = IntervalAllocator::new(0..1000);
        // Leave free extents of length 100, 50 and 20.
        assert!(a.allocate_fixed(100, 400));
        assert!(a.allocate_fixed(550, 100));
        assert!(a.allocate_fixed(670, 330));
        assert_eq!(extents(&a), vec![0..100, 500..550, 650..670]);

        let at = a.allocate(15, 1).unwrap();
        assert!((650..670).contains(&at));
        a.validate();
    }
}
