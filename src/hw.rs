//! The hardware-facing boundary.
//!
//! Everything the space needs from the platform is behind two traits: a
//! source of physical pages for table memory ([`TablePageSource`]) and the
//! remapping units that cache translations ([`InvalidationUnit`]). Register
//! layouts, unit discovery and interrupt wiring live with the implementors.

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use log::trace;

/// Supplies physical pages for page-table memory.
pub trait TablePageSource {
    /// Allocates one 4 KiB physical page and returns its page number.
    ///
    /// Returns `None` when no page is available.
    fn alloc_table_page(&mut self) -> Option<u64>;

    /// Returns a page obtained from [`alloc_table_page`](Self::alloc_table_page).
    fn free_table_page(&mut self, page: u64);

    /// Whether the remapping hardware snoops CPU caches when walking tables.
    ///
    /// When this returns `false`, every table update is followed by a call to
    /// [`flush`](Self::flush).
    fn is_coherent(&self) -> bool {
        true
    }

    /// Writes back the cache lines holding `count` entries of table page
    /// `page`, starting at entry `first`.
    fn flush(&mut self, page: u64, first: usize, count: usize) {
        let _ = (page, first, count);
    }
}

/// A remapping hardware unit with a queued invalidation interface.
///
/// Units complete invalidations in the order they are issued and publish the
/// stamp of the most recent completed one.
pub trait InvalidationUnit: Send + Sync {
    /// Queues an IOTLB invalidation of `size_hint` pages at `addr` in domain
    /// `domain_tag`, followed by a wait descriptor which publishes `stamp`
    /// once the invalidation has completed.
    fn issue_invalidate(&self, domain_tag: u16, addr: u32, size_hint: u32, stamp: u64);

    /// Returns the stamp of the most recently completed invalidation.
    ///
    /// This must never decrease.
    fn last_completed_stamp(&self) -> u64;
}

impl<T: InvalidationUnit + ?Sized> InvalidationUnit for Arc<T> {
    #[inline]
    fn issue_invalidate(&self, domain_tag: u16, addr: u32, size_hint: u32, stamp: u64) {
        (**self).issue_invalidate(domain_tag, addr, size_hint, stamp)
    }

    #[inline]
    fn last_completed_stamp(&self) -> u64 {
        (**self).last_completed_stamp()
    }
}

/// Physical pages backing a mapping.
#[derive(Copy, Clone, Debug)]
pub enum PhysPages<'a> {
    /// `count` consecutive pages starting at page number `base`.
    Contiguous {
        /// The first page number.
        base: u64,
        /// The number of pages.
        count: u32,
    },
    /// An explicit page number per page.
    List(&'a [u64]),
}

impl PhysPages<'_> {
    /// Returns the number of pages.
    #[inline]
    pub fn len(&self) -> u32 {
        match *self {
            PhysPages::Contiguous { count, .. } => count,
            PhysPages::List(pages) => {
                u32::try_from(pages.len()).expect("page list longer than the address space")
            }
        }
    }

    /// Returns whether there are no pages.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the page numbers.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        let (base, count, list) = match *self {
            PhysPages::Contiguous { base, count } => (base, count as usize, None),
            PhysPages::List(pages) => (0, pages.len(), Some(pages)),
        };

        (0..count).map(move |i| match list {
            Some(pages) => pages[i],
            None => base + i as u64,
        })
    }
}

/// Issues stamped invalidations to every registered unit.
///
/// Stamps come from one counter shared by all callers and are handed to the
/// units under a lock, so every unit sees them in increasing order.
pub struct Invalidator {
    domain_tag: u16,
    units: Vec<Box<dyn InvalidationUnit>>,
    stamp: spin::Mutex<u64>,
}

impl core::fmt::Debug for Invalidator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Invalidator")
            .field("domain_tag", &self.domain_tag)
            .field("units", &self.units.len())
            .field("stamp", &*self.stamp.lock())
            .finish()
    }
}

impl Invalidator {
    /// Creates an invalidator which tags its requests with `domain_tag` and
    /// issues them to every unit in `units`.
    pub fn new(domain_tag: u16, units: Vec<Box<dyn InvalidationUnit>>) -> Invalidator {
        Invalidator {
            domain_tag,
            units,
            stamp: spin::Mutex::new(0),
        }
    }

    /// Returns the number of units invalidations are issued to.
    #[inline]
    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    /// Assigns the next stamp and issues an invalidation of
    /// `[addr, addr + size)` tagged with it to every unit.
    pub fn submit(&self, addr: u32, size: u32) -> u64 {
        let mut stamp = self.stamp.lock();
        *stamp += 1;

        for unit in &self.units {
            unit.issue_invalidate(self.domain_tag, addr, size, *stamp);
        }

        trace!("invalidate {addr:#x}+{size:#x} stamp {}", *stamp);

        *stamp
    }

    /// Returns the most recently assigned stamp.
    pub fn issued(&self) -> u64 {
        *self.stamp.lock()
    }

    /// Returns the greatest stamp that every unit has completed.
    ///
    /// With no units registered, everything issued counts as complete.
    pub fn completed(&self) -> u64 {
        self.units
            .iter()
            .map(|unit| unit.last_completed_stamp())
            .min()
            .unwrap_or_else(|| self.issued())
    }
}
