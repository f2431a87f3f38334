//! A binary-buddy allocator over page indices.
//!
//! The allocator manages the index range `[0, 2^max_class)` as power-of-two
//! blocks. Each size class has a doubly linked free list whose nodes are the
//! first slots of the free blocks themselves, reached through a [`SlotStore`];
//! the allocator owns no node memory.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case       |
//! |--------------------------|-----------|------------------|
//! | Allocate                 | O(1)      | O(log n)         |
//! | Free                     | O(1)      | O(log n)         |
//! | Allocate fixed range     | O(log n)  | O(log² n)        |
//!
//! #### Coalescing
//!
//! Freed blocks are merged with their buddies, but merging of small classes
//! is throttled by a [`CoalescePolicy`]: while a small class has few free
//! blocks, freed blocks of that class stay on its list rather than merging.
//! Under allocation storms this avoids splitting a block only to merge it
//! back a moment later.

use alloc::vec::Vec;

use crate::entry::{BlockEntry, FreeLink, SlotStore};

/// The largest supported size class.
///
/// Slot indices must stay below [`FreeLink::NIL`].
pub const MAX_CLASS: u8 = 27;

const NUM_CLASSES: usize = MAX_CLASS as usize + 1;

const NIL: u32 = FreeLink::NIL;

/// Returns the size class of an allocation of `size` pages, i.e.
/// `ceil(log2(size))`.
#[inline]
pub fn size_class(size: u32) -> u8 {
    match size {
        0 | 1 => 0,
        _ => (u32::BITS - (size - 1).leading_zeros()) as u8,
    }
}

/// Controls when freed blocks of small classes are merged with their buddies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CoalescePolicy {
    /// Classes up to and including this one are throttled.
    pub max_throttled_class: u8,
    /// A throttled class merges only once its free list holds at least this
    /// many blocks.
    pub min_free_blocks: u32,
}

impl CoalescePolicy {
    /// Always merge free buddies.
    pub const ALWAYS: CoalescePolicy = CoalescePolicy {
        max_throttled_class: 0,
        min_free_blocks: 0,
    };

    #[inline]
    fn permits(&self, class: u8, free_blocks: u32) -> bool {
        class > self.max_throttled_class || free_blocks >= self.min_free_blocks
    }
}

impl Default for CoalescePolicy {
    fn default() -> Self {
        CoalescePolicy {
            max_throttled_class: 10,
            min_free_blocks: 20,
        }
    }
}

/// Counters kept by a [`BuddyAllocator`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BuddyStats {
    /// Successful allocations, by size class.
    pub allocs: [u64; NUM_CLASSES],
    /// Blocks split in two.
    pub splits: u64,
    /// Buddy pairs merged.
    pub merges: u64,
}

/// A binary-buddy allocator.
#[derive(Debug)]
pub struct BuddyAllocator {
    max_class: u8,
    heads: [u32; NUM_CLASSES],
    counts: [u32; NUM_CLASSES],
    free_pages: u32,
    policy: CoalescePolicy,
    stats: BuddyStats,
}

impl BuddyAllocator {
    /// Constructs an allocator over `[0, 2^max_class)` whose free lists live
    /// in `slots`.
    ///
    /// The whole range starts out as a single free block.
    ///
    /// # Panics
    ///
    /// Panics if `max_class` exceeds [`MAX_CLASS`].
    pub fn new<S: SlotStore + ?Sized>(
        max_class: u8,
        policy: CoalescePolicy,
        slots: &mut S,
    ) -> BuddyAllocator {
        assert!(
            max_class <= MAX_CLASS,
            "buddy allocator cannot manage more than 2^{MAX_CLASS} pages"
        );

        let mut buddy = BuddyAllocator {
            max_class,
            heads: [NIL; NUM_CLASSES],
            counts: [0; NUM_CLASSES],
            free_pages: 1 << max_class,
            policy,
            stats: BuddyStats::default(),
        };

        buddy.push(slots, max_class, 0);

        buddy
    }

    /// Returns the number of pages managed by this allocator.
    #[inline]
    pub fn capacity(&self) -> u32 {
        1 << self.max_class
    }

    /// Returns the largest size class.
    #[inline]
    pub fn max_class(&self) -> u8 {
        self.max_class
    }

    /// Returns the number of free pages.
    #[inline]
    pub fn free_pages(&self) -> u32 {
        self.free_pages
    }

    /// Returns the number of allocated pages.
    #[inline]
    pub fn used_pages(&self) -> u32 {
        self.capacity() - self.free_pages
    }

    /// Returns the number of free blocks of size class `class`.
    #[inline]
    pub fn free_blocks(&self, class: u8) -> u32 {
        self.counts[class as usize]
    }

    /// Returns the largest class with a free block, if any.
    pub fn largest_free_class(&self) -> Option<u8> {
        (0..=self.max_class)
            .rev()
            .find(|&class| self.heads[class as usize] != NIL)
    }

    /// Returns the allocation, split and merge counters.
    #[inline]
    pub fn stats(&self) -> BuddyStats {
        self.stats
    }

    /// Returns `(start, class)` for every free block, ordered by class and
    /// then by list position.
    pub fn free_list_snapshot<S: SlotStore + ?Sized>(&self, slots: &S) -> Vec<(u32, u8)> {
        let mut out = Vec::new();
        for class in 0..=self.max_class {
            let mut cur = self.heads[class as usize];
            while cur != NIL {
                out.push((cur, class));
                cur = slots.link(cur).next();
            }
        }
        out
    }

    /// Updates the links stored at `index`.
    fn update_link<S: SlotStore + ?Sized>(
        slots: &mut S,
        index: u32,
        f: impl FnOnce(&mut FreeLink),
    ) {
        let mut link = slots.link(index);
        f(&mut link);
        slots.set_slot(index, BlockEntry::Free(link));
    }

    /// Pushes the block at `block` onto the free list of `class`.
    fn push<S: SlotStore + ?Sized>(&mut self, slots: &mut S, class: u8, block: u32) {
        debug_assert_eq!(block & ((1 << class) - 1), 0, "misaligned free block");

        let old_head = self.heads[class as usize];
        if old_head != NIL {
            Self::update_link(slots, old_head, |l| l.set_prev(block));
        }

        slots.set_slot(block, BlockEntry::Free(FreeLink::block(class, NIL, old_head)));

        self.heads[class as usize] = block;
        self.counts[class as usize] += 1;
    }

    /// Removes `block` from the free list of `class` and clears its slot.
    fn remove<S: SlotStore + ?Sized>(&mut self, slots: &mut S, class: u8, block: u32) {
        let removed = slots.link(block);
        debug_assert_eq!(removed.size_class(), class);

        match removed.prev() {
            NIL => self.heads[class as usize] = removed.next(),
            prev => Self::update_link(slots, prev, |l| l.set_next(removed.next())),
        }

        if removed.next() != NIL {
            Self::update_link(slots, removed.next(), |l| l.set_prev(removed.prev()));
        }

        slots.set_slot(block, BlockEntry::Empty);
        self.counts[class as usize] -= 1;
    }

    /// Allocates a block of at least `size` pages.
    ///
    /// The block is `2^size_class(size)` pages long and aligned to its size.
    /// Returns `None` if `size` is zero, larger than the managed range, or if
    /// no sufficiently large block is free.
    pub fn allocate<S: SlotStore + ?Sized>(&mut self, slots: &mut S, size: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }

        let class = size_class(size);
        if class > self.max_class {
            return None;
        }

        let mut at_class = (class..=self.max_class).find(|&c| self.heads[c as usize] != NIL)?;

        let block = self.heads[at_class as usize];
        self.remove(slots, at_class, block);

        // Split repeatedly; the front half keeps the block address.
        while at_class > class {
            at_class -= 1;
            self.push(slots, at_class, block + (1 << at_class));
            self.stats.splits += 1;
        }

        self.free_pages -= 1 << class;
        self.stats.allocs[class as usize] += 1;

        Some(block)
    }

    /// Frees a block previously returned by [`allocate`](Self::allocate) for
    /// a request of `size` pages.
    ///
    /// Freeing a block which is not currently allocated is a contract
    /// violation.
    pub fn free<S: SlotStore + ?Sized>(&mut self, slots: &mut S, addr: u32, size: u32) {
        let class = size_class(size);
        self.free_block(slots, addr, class, true);
    }

    /// Returns a block to its free list. With `throttled` unset, the block
    /// merges with every free buddy regardless of the coalescing policy.
    fn free_block<S: SlotStore + ?Sized>(
        &mut self,
        slots: &mut S,
        addr: u32,
        class: u8,
        throttled: bool,
    ) {
        assert!(class <= self.max_class, "freed block larger than the allocator");
        debug_assert_eq!(addr & ((1 << class) - 1), 0, "freed block is misaligned");
        debug_assert!(
            u64::from(addr) + (1 << class) <= u64::from(self.capacity()),
            "freed block out of range"
        );
        debug_assert!(slots.slot(addr).as_free().is_none(), "double free of {addr:#x}");

        self.free_pages += 1 << class;

        let mut addr = addr;
        let mut class = class;

        while class < self.max_class
            && (!throttled || self.policy.permits(class, self.counts[class as usize]))
        {
            let buddy = addr ^ (1 << class);
            match slots.slot(buddy).as_free() {
                Some(link) if link.size_class() == class => (),
                _ => break,
            }

            self.remove(slots, class, buddy);
            addr &= !(1 << class);
            class += 1;
            self.stats.merges += 1;
        }

        self.push(slots, class, addr);
    }

    /// Splits `[addr, addr + size)` into maximal aligned power-of-two chunks.
    fn chunks(addr: u32, size: u32, max_class: u8) -> impl Iterator<Item = (u32, u8)> {
        let end = u64::from(addr) + u64::from(size);
        let mut cur = u64::from(addr);

        core::iter::from_fn(move || {
            if cur >= end {
                return None;
            }

            let align_class = if cur == 0 {
                max_class
            } else {
                (cur.trailing_zeros() as u8).min(max_class)
            };
            let fit_class = (u64::BITS - 1 - (end - cur).leading_zeros()) as u8;
            let class = align_class.min(fit_class);

            let chunk = cur as u32;
            cur += 1 << class;
            Some((chunk, class))
        })
    }

    /// Finds the free block which covers the chunk at `chunk` of class
    /// `class`.
    fn covering_block<S: SlotStore + ?Sized>(
        &self,
        slots: &S,
        chunk: u32,
        class: u8,
    ) -> Option<(u32, u8)> {
        (class..=self.max_class).find_map(|k| {
            let start = chunk & !((1 << k) - 1);
            slots
                .slot(start)
                .as_free()
                .filter(|link| link.size_class() == k)
                .map(|_| (start, k))
        })
    }

    /// Returns whether the chunk at `chunk` of class `class` is free, either
    /// inside one free block or tiled by smaller ones left unmerged by the
    /// coalescing throttle.
    fn is_free_chunk<S: SlotStore + ?Sized>(&self, slots: &S, chunk: u32, class: u8) -> bool {
        if self.covering_block(slots, chunk, class).is_some() {
            return true;
        }

        match class.checked_sub(1) {
            None => false,
            Some(half) => {
                self.is_free_chunk(slots, chunk, half)
                    && self.is_free_chunk(slots, chunk + (1 << half), half)
            }
        }
    }

    /// Returns whether every page of `[addr, addr + size)` lies in a free
    /// block.
    pub fn is_free_range<S: SlotStore + ?Sized>(&self, slots: &S, addr: u32, size: u32) -> bool {
        if u64::from(addr) + u64::from(size) > u64::from(self.capacity()) {
            return false;
        }

        Self::chunks(addr, size, self.max_class)
            .all(|(chunk, class)| self.is_free_chunk(slots, chunk, class))
    }

    /// Removes the chunk at `chunk` of class `class` from the free lists,
    /// splitting whichever free blocks cover it.
    fn carve_chunk<S: SlotStore + ?Sized>(&mut self, slots: &mut S, chunk: u32, class: u8) {
        let Some((mut start, mut k)) = self.covering_block(slots, chunk, class) else {
            // Tiled by smaller blocks; the halves are covered independently.
            let Some(half) = class.checked_sub(1) else {
                unreachable!("coverage checked by the caller");
            };
            self.carve_chunk(slots, chunk, half);
            self.carve_chunk(slots, chunk + (1 << half), half);
            return;
        };

        self.remove(slots, k, start);

        while k > class {
            k -= 1;
            let half = 1 << k;
            if chunk >= start + half {
                self.push(slots, k, start);
                start += half;
            } else {
                self.push(slots, k, start + half);
            }
            self.stats.splits += 1;
        }

        debug_assert_eq!(start, chunk);
    }

    /// Reserves exactly `[addr, addr + size)`.
    ///
    /// Every free block overlapping the range is split so that only the range
    /// itself is removed from the free lists; the head and tail remainders
    /// are returned to their lists.
    ///
    /// Returns `false`, leaving the allocator unchanged, if any part of the
    /// range is not free. That is a contract violation and trips a debug
    /// assertion.
    pub fn allocate_fixed<S: SlotStore + ?Sized>(
        &mut self,
        slots: &mut S,
        addr: u32,
        size: u32,
    ) -> bool {
        if size == 0 {
            return true;
        }

        // Check the whole range before splitting anything. Carving one chunk
        // leaves the rest of the range covered by the remainders, so a range
        // that is entirely free now stays coverable throughout.
        if !self.is_free_range(slots, addr, size) {
            debug_assert!(false, "fixed range {addr:#x}+{size:#x} is not free");
            return false;
        }

        for (chunk, class) in Self::chunks(addr, size, self.max_class) {
            self.carve_chunk(slots, chunk, class);
        }

        self.free_pages -= size;

        true
    }

    /// Releases a range reserved with
    /// [`allocate_fixed`](Self::allocate_fixed).
    ///
    /// The released chunks always merge with their free buddies, so the
    /// blocks split by the reservation are rebuilt even while the coalescing
    /// policy would defer merging.
    pub fn free_fixed<S: SlotStore + ?Sized>(&mut self, slots: &mut S, addr: u32, size: u32) {
        for (chunk, class) in Self::chunks(addr, size, self.max_class) {
            self.free_block(slots, chunk, class, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::{vec, vec::Vec};

    use super::*;

    fn slots(class: u8) -> Vec<BlockEntry> {
        vec![BlockEntry::Empty; 1 << class]
    }

    #[test]
    fn size_classes() {
        assert_eq!(size_class(1), 0);
        assert_eq!(size_class(2), 1);
        assert_eq!(size_class(3), 2);
        assert_eq!(size_class(4), 2);
        assert_eq!(size_class(5), 3);
        assert_eq!(size_class(1 << 20), 20);
        assert_eq!(size_class((1 << 20) + 1), 21);
    }

    #[test]
    fn scenario_split_then_coalesce() {
        let mut s = slots(4);
        let mut b = BuddyAllocator::new(4, CoalescePolicy::ALWAYS, &mut s);

        let a0 = b.allocate(&mut s, 3).unwrap();
        let a1 = b.allocate(&mut s, 3).unwrap();
        assert_eq!(a0, 0);
        assert_eq!(a1, 4);
        assert_eq!(b.free_pages(), 8);

        b.free(&mut s, a0, 4);
        b.free(&mut s, a1, 4);

        // [0, 8) coalesced with [8, 16) into the original block.
        assert_eq!(b.free_list_snapshot(&s), vec![(0, 4)]);
        assert_eq!(b.free_pages(), 16);
    }

    #[test]
    fn coalesces_to_eight_page_block() {
        let mut s = slots(4);
        let mut b = BuddyAllocator::new(4, CoalescePolicy::ALWAYS, &mut s);

        let a0 = b.allocate(&mut s, 3).unwrap();
        let a1 = b.allocate(&mut s, 3).unwrap();
        let hold = b.allocate(&mut s, 8).unwrap();
        assert_eq!(hold, 8);

        b.free(&mut s, a0, 4);
        b.free(&mut s, a1, 4);

        assert_eq!(b.free_list_snapshot(&s), vec![(0, 3)]);
    }

    #[test]
    fn exhaustion() {
        let mut s = slots(3);
        let mut b = BuddyAllocator::new(3, CoalescePolicy::ALWAYS, &mut s);

        assert_eq!(b.allocate(&mut s, 0), None);
        assert_eq!(b.allocate(&mut s, 9), None);
        assert_eq!(b.allocate(&mut s, 8), Some(0));
        assert_eq!(b.allocate(&mut s, 1), None);
        assert_eq!(b.largest_free_class(), None);
    }

    #[test]
    fn throttle_defers_merging() {
        let mut s = slots(4);
        let policy = CoalescePolicy {
            max_throttled_class: 1,
            min_free_blocks: 2,
        };
        let mut b = BuddyAllocator::new(4, policy, &mut s);

        let a = b.allocate(&mut s, 1).unwrap();
        let c = b.allocate(&mut s, 1).unwrap();
        assert_eq!((a, c), (0, 1));

        // Class 0 list is empty, so the first free is not merged.
        b.free(&mut s, a, 1);
        assert_eq!(b.free_blocks(0), 1);

        // With one block already listed, the class is still below the
        // threshold; the second free also stays put.
        b.free(&mut s, c, 1);
        assert_eq!(b.free_blocks(0), 2);
        assert_eq!(b.free_pages(), 16);

        // Both pages are still individually allocatable.
        assert!(b.allocate(&mut s, 1).is_some());
        assert!(b.allocate(&mut s, 1).is_some());
    }

    #[test]
    fn fixed_reserve_over_unmerged_blocks() {
        let mut s = slots(4);
        let mut b = BuddyAllocator::new(4, CoalescePolicy::default(), &mut s);

        assert_eq!(b.allocate(&mut s, 1), Some(0));
        assert_eq!(b.allocate(&mut s, 1), Some(1));
        assert_eq!(b.allocate(&mut s, 1), Some(2));

        // The throttle keeps both pages as separate class 0 blocks, next to
        // the class 0 block at 3.
        b.free(&mut s, 1, 1);
        b.free(&mut s, 2, 1);
        assert_eq!(b.free_blocks(0), 3);

        assert!(b.is_free_range(&s, 1, 3));
        assert!(b.is_free_range(&s, 2, 2));
        assert!(!b.is_free_range(&s, 0, 2));

        assert!(b.allocate_fixed(&mut s, 1, 3));
        assert_eq!(b.free_pages(), 12);
        assert_eq!(b.free_blocks(0), 0);

        // Releasing merges regardless of the throttle.
        b.free_fixed(&mut s, 1, 3);
        assert_eq!(b.free_pages(), 15);
        let mut free = b.free_list_snapshot(&s);
        free.sort();
        assert_eq!(free, vec![(1, 0), (2, 1), (4, 2), (8, 3)]);
    }

    #[test]
    fn fixed_reserve_splits_boundaries() {
        let mut s = slots(5);
        let mut b = BuddyAllocator::new(5, CoalescePolicy::ALWAYS, &mut s);

        assert!(b.allocate_fixed(&mut s, 3, 6));
        assert_eq!(b.free_pages(), 26);

        let mut free = b.free_list_snapshot(&s);
        free.sort();
        assert_eq!(free, vec![(0, 1), (2, 0), (9, 0), (10, 1), (12, 2), (16, 4)]);

        b.free_fixed(&mut s, 3, 6);
        assert_eq!(b.free_list_snapshot(&s), vec![(0, 5)]);
    }

    #[test]
    fn fixed_reserve_of_allocated_range_is_rejected() {
        let mut s = slots(4);
        let mut b = BuddyAllocator::new(4, CoalescePolicy::ALWAYS, &mut s);
        let a = b.allocate(&mut s, 4).unwrap();
        assert!(!b.is_free_range(&s, a + 1, 2));
        assert!(b.is_free_range(&s, a + 4, 12));

        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            b.allocate_fixed(&mut s, a + 1, 2)
        }));

        if cfg!(debug_assertions) {
            assert!(res.is_err());
        } else {
            assert_eq!(res.ok(), Some(false));
        }
    }
}
