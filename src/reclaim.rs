//! Deferred release of unmapped ranges.
//!
//! An unmapped range cannot be reused until every remapping unit has dropped
//! its cached translations for it. Each range is parked in a
//! [`ReclaimQueue`] together with the stamp of the invalidation that covers
//! it, and handed back to its allocator once all units report that stamp (or
//! a later one) complete.

use alloc::{collections::VecDeque, vec::Vec};

use log::error;

/// An unmapped range awaiting invalidation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pending {
    /// First page of the range.
    pub addr: u32,
    /// Length of the range in pages, as reserved from the allocator.
    pub size: u32,
    /// Stamp of the invalidation covering the range.
    pub stamp: u64,
}

/// A bounded FIFO of [`Pending`] ranges, ordered by stamp.
#[derive(Debug)]
pub struct ReclaimQueue {
    entries: VecDeque<Pending>,
    capacity: usize,
    last_stamp: u64,
    high_water: usize,
}

impl ReclaimQueue {
    /// Creates an empty queue holding at most `capacity` ranges.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> ReclaimQueue {
        assert!(capacity > 0, "reclaim queue capacity must be nonzero");

        ReclaimQueue {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            last_stamp: 0,
            high_water: 0,
        }
    }

    /// Returns the most ranges the queue can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of queued ranges.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no ranges are queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns whether another range would overflow the queue.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    /// Returns the greatest number of ranges ever queued at once.
    #[inline]
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Returns the stamp of the oldest queued range.
    #[inline]
    pub fn oldest_stamp(&self) -> Option<u64> {
        self.entries.front().map(|p| p.stamp)
    }

    /// Returns the total number of pages queued.
    pub fn pending_pages(&self) -> u64 {
        self.entries.iter().map(|p| u64::from(p.size)).sum()
    }

    /// Queues `[addr, addr + size)` behind the invalidation stamped `stamp`.
    ///
    /// # Panics
    ///
    /// Panics if the queue is full, or if `stamp` is not greater than every
    /// stamp queued before it.
    pub fn enqueue(&mut self, addr: u32, size: u32, stamp: u64) {
        assert!(
            stamp > self.last_stamp,
            "reclaim stamp {stamp} not after {}",
            self.last_stamp
        );

        if self.is_full() {
            error!(
                "reclaim queue full ({} entries) at stamp {stamp}",
                self.capacity
            );
            panic!("reclaim queue overflow");
        }

        self.entries.push_back(Pending { addr, size, stamp });
        self.last_stamp = stamp;
        self.high_water = self.high_water.max(self.entries.len());
    }

    /// Removes every range whose stamp is at most `completed`, oldest first,
    /// passing each to `reclaim`.
    ///
    /// Stops at the first range that is still awaiting invalidation. Returns
    /// the number of ranges removed.
    pub fn drain(&mut self, completed: u64, mut reclaim: impl FnMut(Pending)) -> usize {
        let mut drained = 0;

        while let Some(&head) = self.entries.front() {
            if head.stamp > completed {
                break;
            }

            self.entries.pop_front();
            reclaim(head);
            drained += 1;
        }

        drained
    }

    /// Like [`drain`](Self::drain), but collects the ranges.
    pub fn drain_to_vec(&mut self, completed: u64) -> Vec<Pending> {
        let mut out = Vec::new();
        self.drain(completed, |p| out.push(p));
        out
    }
}
