//! The DMA address space of one remapping domain.
//!
//! [`IovaSpace`] ties the pieces together. Small mappings come from a
//! [`BuddyAllocator`] over the bottom `2^buddy_bits` pages of the space,
//! large ones from an [`IntervalAllocator`] over the rest. Translation
//! entries live in a lazily wired [`PageTable`], and unmapped ranges pass
//! through a [`ReclaimQueue`] until the hardware has dropped every cached
//! translation for them.
//!
//! ## Locking
//!
//! The buddy allocator, the table and the buddy reclaim queue sit behind one
//! lock; the interval allocator and its queue behind another. No path holds
//! both. Invalidation stamps are assigned while the owning domain's lock is
//! held, so each queue sees its stamps in increasing order.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::{
    buddy::{size_class, BuddyAllocator, CoalescePolicy, MAX_CLASS},
    entry::FreeLink,
    hw::{InvalidationUnit, Invalidator, PhysPages, TablePageSource},
    interval::IntervalAllocator,
    reclaim::ReclaimQueue,
    stats::SpaceStats,
    table::PageTable,
    wait::{DefaultWait, ExhaustionWait},
    InitError, MapError, ReserveError,
};

/// The size of a page in bytes, as a shift.
pub const PAGE_SHIFT: u32 = 12;

bitflags! {
    /// Options for a mapping request.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct MapOptions: u32 {
        /// The device may read through the mapping.
        const READ = 1 << 0;
        /// The device may write through the mapping.
        const WRITE = 1 << 1;
        /// The mapping backs paging I/O and must never wait on the interval
        /// allocator.
        const PAGING_PATH = 1 << 2;
    }
}

/// Device constraints on a mapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MapSpec {
    /// Width of the DMA addresses the device can generate, in bits.
    pub address_bits: u8,
    /// Required alignment of the mapping, in pages. Rounded up to a power of
    /// two.
    pub alignment: u32,
}

impl MapSpec {
    /// Returns the number of pages from the bottom of the space that the
    /// device can reach.
    pub fn reachable_pages(&self) -> u64 {
        match u32::from(self.address_bits).checked_sub(PAGE_SHIFT) {
            None => 0,
            Some(bits) if bits >= u64::BITS => u64::MAX,
            Some(bits) => 1 << bits,
        }
    }

    fn alignment(&self) -> u32 {
        self.alignment.max(1).checked_next_power_of_two().unwrap_or(1 << 31)
    }
}

impl Default for MapSpec {
    fn default() -> Self {
        MapSpec {
            address_bits: 64,
            alignment: 1,
        }
    }
}

/// Request sizes at which mappings go to the interval allocator.
///
/// The threshold rises as the buddy allocator fills up. Under pressure only
/// very large requests still go to the interval allocator, and everything
/// else stays on the cheaper buddy path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LargeThresholds {
    /// Threshold while the buddy pool is less than 3/4 full.
    pub relaxed: u32,
    /// Threshold while the buddy pool is less than 7/8 full.
    pub busy: u32,
    /// Threshold once the buddy pool is at least 7/8 full.
    pub crowded: u32,
}

impl LargeThresholds {
    /// Returns the threshold for a buddy pool with `used` of `capacity`
    /// pages in use.
    pub fn for_utilization(&self, used: u32, capacity: u32) -> u32 {
        let used = u64::from(used) * 8;
        let capacity = u64::from(capacity);

        if used < capacity * 6 {
            self.relaxed
        } else if used < capacity * 7 {
            self.busy
        } else {
            self.crowded
        }
    }
}

impl Default for LargeThresholds {
    fn default() -> Self {
        LargeThresholds {
            relaxed: 128,
            busy: 512,
            crowded: 8192,
        }
    }
}

/// A window of the space set aside at construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReservedRange {
    /// First page of the window.
    pub start: u32,
    /// Length of the window in pages.
    pub size: u32,
    /// Map the window one-to-one onto the same physical pages.
    pub identity: bool,
}

/// Parameters of an [`IovaSpace`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceConfig {
    /// Size of the space in pages.
    pub space_pages: u32,
    /// The buddy allocator manages `[0, 2^buddy_bits)`.
    pub buddy_bits: u8,
    /// Coalescing policy of the buddy allocator.
    pub coalesce: CoalescePolicy,
    /// Routing thresholds for large requests.
    pub large_thresholds: LargeThresholds,
    /// Ranges each reclaim queue can hold.
    pub reclaim_capacity: usize,
    /// Tag identifying the domain in invalidation requests.
    pub domain_tag: u16,
    /// Never hand out page 0.
    pub reserve_page_zero: bool,
    /// Windows reserved at construction.
    pub reserved: Vec<ReservedRange>,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        SpaceConfig {
            // 4 GiB, of which the bottom 256 MiB is buddy-managed.
            space_pages: 1 << 20,
            buddy_bits: 16,
            coalesce: CoalescePolicy::default(),
            large_thresholds: LargeThresholds::default(),
            reclaim_capacity: 2048,
            domain_tag: 0,
            reserve_page_zero: true,
            reserved: Vec::new(),
        }
    }
}

impl SpaceConfig {
    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<(), InitError> {
        if self.space_pages == 0 {
            return Err(InitError::InvalidConfig("space_pages must be nonzero"));
        }

        if self.buddy_bits > MAX_CLASS {
            return Err(InitError::InvalidConfig("buddy_bits too large"));
        }

        if (1u64 << self.buddy_bits) > u64::from(self.space_pages) {
            return Err(InitError::InvalidConfig(
                "buddy region larger than the space",
            ));
        }

        if self.reclaim_capacity == 0 {
            return Err(InitError::InvalidConfig("reclaim_capacity must be nonzero"));
        }

        let t = &self.large_thresholds;
        if t.relaxed == 0 || t.relaxed > t.busy || t.busy > t.crowded {
            return Err(InitError::InvalidConfig(
                "large thresholds must be nonzero and nondecreasing",
            ));
        }

        for r in &self.reserved {
            if r.size == 0 || u64::from(r.start) + u64::from(r.size) > u64::from(self.space_pages)
            {
                return Err(ReserveError::OutOfRange {
                    start: r.start,
                    size: r.size,
                }
                .into());
            }
        }

        Ok(())
    }

    fn buddy_pages(&self) -> u32 {
        1 << self.buddy_bits
    }
}

/// Returns whether `[lo, hi)` has room for `size` pages aligned to `align`
/// that miss every window in `windows`.
///
/// `windows` is sorted by start and its entries do not overlap.
fn fits_around(windows: &[(u32, u32)], lo: u32, hi: u32, size: u64, align: u64) -> bool {
    let hi = u64::from(hi);
    let mut cursor = u64::from(lo);

    for &(start, len) in windows {
        let (start, end) = (u64::from(start), u64::from(start) + u64::from(len));
        if end <= cursor {
            continue;
        }
        if start >= hi {
            break;
        }
        if cursor.next_multiple_of(align) + size <= start {
            return true;
        }
        cursor = end;
    }

    cursor.next_multiple_of(align) + size <= hi
}

/// Which allocator a mapping came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Pool {
    Buddy,
    Interval,
}

/// A live mapping returned by [`IovaSpace::map`].
///
/// Hand it back to [`IovaSpace::unmap`] to release it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a mapping leaks its address range"]
pub struct Mapping {
    addr: u32,
    mapped: u32,
    reserved: u32,
    pool: Pool,
}

impl Mapping {
    /// Returns the first page of the mapping.
    #[inline]
    pub fn page(&self) -> u32 {
        self.addr
    }

    /// Returns the DMA address of the mapping.
    #[inline]
    pub fn iova(&self) -> u64 {
        u64::from(self.addr) << PAGE_SHIFT
    }

    /// Returns the number of mapped pages.
    #[inline]
    pub fn pages(&self) -> u32 {
        self.mapped
    }

    /// Returns the number of pages taken from the allocator, which is at
    /// least [`pages`](Self::pages).
    #[inline]
    pub fn reserved_pages(&self) -> u32 {
        self.reserved
    }

    /// Returns whether the mapping came from the interval allocator.
    #[inline]
    pub fn is_large(&self) -> bool {
        self.pool == Pool::Interval
    }
}

/// State behind the buddy-domain lock.
struct BuddyDomain<S: TablePageSource> {
    buddy: BuddyAllocator,
    table: PageTable<S>,
    queue: ReclaimQueue,
    high_water: u32,
}

impl<S: TablePageSource> BuddyDomain<S> {
    fn reclaim(&mut self, completed: u64) -> usize {
        let BuddyDomain {
            buddy,
            table,
            queue,
            ..
        } = self;

        queue.drain(completed, |p| {
            trace!("reclaim buddy {:#x}+{:#x} stamp {}", p.addr, p.size, p.stamp);
            buddy.free(table, p.addr, p.size)
        })
    }

    fn allocate(&mut self, size: u32) -> Option<u32> {
        let addr = self.buddy.allocate(&mut self.table, size)?;
        self.high_water = self.high_water.max(self.buddy.used_pages());
        Some(addr)
    }
}

/// State behind the interval-domain lock.
struct IntervalDomain {
    interval: IntervalAllocator,
    queue: ReclaimQueue,
    high_water: u32,
}

impl IntervalDomain {
    fn reclaim(&mut self, completed: u64) -> usize {
        let IntervalDomain {
            interval, queue, ..
        } = self;

        queue.drain(completed, |p| {
            trace!("reclaim interval {:#x}+{:#x} stamp {}", p.addr, p.size, p.stamp);
            interval.free(p.addr, p.size)
        })
    }

    fn allocate(&mut self, size: u32, align: u32) -> Option<u32> {
        let addr = self.interval.allocate(size, align)?;
        self.high_water = self.high_water.max(self.interval.used_pages());
        Some(addr)
    }
}

/// The DMA address space of one remapping domain.
pub struct IovaSpace<S: TablePageSource, W: ExhaustionWait = DefaultWait> {
    space_pages: u32,
    buddy_pages: u32,
    thresholds: LargeThresholds,
    small: spin::Mutex<BuddyDomain<S>>,
    large: spin::Mutex<IntervalDomain>,
    invalidator: Invalidator,
    /// Permanently reserved windows as `(start, size)`, sorted by start.
    windows: spin::Mutex<Vec<(u32, u32)>>,
    waiter: W,
    waits: AtomicU64,
    largest: AtomicU32,
}

impl<S: TablePageSource, W: ExhaustionWait> core::fmt::Debug for IovaSpace<S, W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IovaSpace")
            .field("space_pages", &self.space_pages)
            .field("buddy_pages", &self.buddy_pages)
            .field("invalidator", &self.invalidator)
            .finish_non_exhaustive()
    }
}

impl<S: TablePageSource, W: ExhaustionWait> IovaSpace<S, W> {
    /// Builds a space from `config`.
    ///
    /// Table pages come from `source`. Unmapped ranges are invalidated on
    /// every unit in `units`, and `waiter` parks mapping requests while the
    /// space is exhausted.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is inconsistent, if `source` cannot supply
    /// the upper table levels and the buddy region's leaf pages, or if a
    /// reserved window overlaps another.
    pub fn new(
        config: SpaceConfig,
        source: S,
        units: Vec<Box<dyn InvalidationUnit>>,
        waiter: W,
    ) -> Result<IovaSpace<S, W>, InitError> {
        config.validate()?;

        let buddy_pages = config.buddy_pages();
        debug_assert!(buddy_pages < FreeLink::NIL);

        let mut table = PageTable::new(config.space_pages, source)?;

        // Free-list links live in the buddy region's slots, so its granules
        // are wired up front.
        table.ensure_present(0, buddy_pages)?;
        let buddy = BuddyAllocator::new(config.buddy_bits, config.coalesce, &mut table);

        let interval = IntervalAllocator::new(buddy_pages..config.space_pages);

        let space = IovaSpace {
            space_pages: config.space_pages,
            buddy_pages,
            thresholds: config.large_thresholds,
            small: spin::Mutex::new(BuddyDomain {
                buddy,
                table,
                queue: ReclaimQueue::with_capacity(config.reclaim_capacity),
                high_water: 0,
            }),
            large: spin::Mutex::new(IntervalDomain {
                interval,
                queue: ReclaimQueue::with_capacity(config.reclaim_capacity),
                high_water: 0,
            }),
            invalidator: Invalidator::new(config.domain_tag, units),
            windows: spin::Mutex::new(Vec::new()),
            waiter,
            waits: AtomicU64::new(0),
            largest: AtomicU32::new(0),
        };

        if config.reserve_page_zero {
            space.reserve(0, 1)?;
        }

        for r in &config.reserved {
            if r.identity {
                space.reserve_identity(r.start, r.size, MapOptions::READ | MapOptions::WRITE)?;
            } else {
                space.reserve(r.start, r.size)?;
            }
        }

        debug!(
            "iova space: {} pages, buddy {} pages, interval {} pages, {} units, {} reserved windows",
            config.space_pages,
            buddy_pages,
            config.space_pages - buddy_pages,
            space.invalidator.num_units(),
            config.reserved.len()
        );

        Ok(space)
    }

    /// Returns the number of pages in the space.
    #[inline]
    pub fn space_pages(&self) -> u32 {
        self.space_pages
    }

    /// Returns the number of pages managed by the buddy allocator.
    #[inline]
    pub fn buddy_pages(&self) -> u32 {
        self.buddy_pages
    }

    /// Returns the physical page of the root translation table.
    pub fn root_table_page(&self) -> u64 {
        self.small.lock().table.top_level_page()
    }

    fn pick_pool(&self, size: u32, options: MapOptions, spec: &MapSpec) -> Result<Pool, MapError> {
        let reach = spec.reachable_pages();
        let align = spec.alignment();

        let block = 1u64 << size_class(size.max(align));

        // Requests that no amount of reclaiming could satisfy are rejected
        // here rather than waited on.
        let (buddy_fits, interval_fits) = {
            let windows = self.windows.lock();
            (
                fits_around(&windows, 0, self.buddy_pages, block, block),
                fits_around(
                    &windows,
                    self.buddy_pages,
                    self.space_pages,
                    u64::from(size),
                    u64::from(align),
                ),
            )
        };

        let buddy_ok = reach >= u64::from(self.buddy_pages) && buddy_fits;
        let interval_ok = !options.contains(MapOptions::PAGING_PATH)
            && reach >= u64::from(self.space_pages)
            && interval_fits;

        if !interval_ok {
            return if buddy_ok {
                Ok(Pool::Buddy)
            } else {
                Err(MapError::Unaddressable)
            };
        }

        if !buddy_ok {
            return Ok(Pool::Interval);
        }

        let threshold = {
            let small = self.small.lock();
            self.thresholds
                .for_utilization(small.buddy.used_pages(), self.buddy_pages)
        };

        if size >= threshold {
            Ok(Pool::Interval)
        } else {
            Ok(Pool::Buddy)
        }
    }

    fn take_buddy(&self, size: u32, block: bool) -> Option<u32> {
        loop {
            let seen = self.waiter.generation();

            let mut small = self.small.lock();
            if let Some(addr) = small.allocate(size) {
                return Some(addr);
            }

            let reclaimed = small.reclaim(self.invalidator.completed());
            if reclaimed > 0 {
                let addr = small.allocate(size);
                drop(small);
                self.waiter.notify_all();
                if addr.is_some() {
                    return addr;
                }
                continue;
            }

            let pending = small.queue.len();
            drop(small);

            if !block {
                return None;
            }

            warn!("buddy pool exhausted for {size} pages, {pending} ranges awaiting reclaim");
            self.waits.fetch_add(1, Ordering::Relaxed);
            self.waiter.wait(seen);
        }
    }

    fn take_interval(&self, size: u32, align: u32, block: bool) -> Option<u32> {
        loop {
            let seen = self.waiter.generation();

            let mut large = self.large.lock();
            if let Some(addr) = large.allocate(size, align) {
                return Some(addr);
            }

            let reclaimed = large.reclaim(self.invalidator.completed());
            if reclaimed > 0 {
                let addr = large.allocate(size, align);
                drop(large);
                self.waiter.notify_all();
                if addr.is_some() {
                    return addr;
                }
                continue;
            }

            let pending = large.queue.len();
            drop(large);

            if !block {
                return None;
            }

            warn!("interval pool exhausted for {size} pages, {pending} ranges awaiting reclaim");
            self.waits.fetch_add(1, Ordering::Relaxed);
            self.waiter.wait(seen);
        }
    }

    /// Maps `pages` into the space.
    ///
    /// If no suitable range is free, this blocks until one is unmapped and
    /// reclaimed.
    ///
    /// # Errors
    ///
    /// * [`MapError::EmptyRequest`] if `pages` is empty.
    /// * [`MapError::Unaddressable`] if no range the device can reach is
    ///   large enough.
    /// * [`MapError::OutOfTablePages`] if the translation table cannot grow.
    pub fn map(
        &self,
        pages: PhysPages<'_>,
        options: MapOptions,
        spec: &MapSpec,
    ) -> Result<Mapping, MapError> {
        self.map_inner(pages, options, spec, true)
    }

    /// Like [`map`](Self::map), but fails with [`MapError::Exhausted`]
    /// instead of waiting when no suitable range is free.
    pub fn try_map(
        &self,
        pages: PhysPages<'_>,
        options: MapOptions,
        spec: &MapSpec,
    ) -> Result<Mapping, MapError> {
        self.map_inner(pages, options, spec, false)
    }

    fn map_inner(
        &self,
        pages: PhysPages<'_>,
        options: MapOptions,
        spec: &MapSpec,
        block: bool,
    ) -> Result<Mapping, MapError> {
        let count = pages.len();
        if count == 0 {
            return Err(MapError::EmptyRequest);
        }

        let pool = self.pick_pool(count, options, spec)?;
        let read = options.contains(MapOptions::READ);
        let write = options.contains(MapOptions::WRITE);

        let (addr, reserved) = match pool {
            Pool::Buddy => {
                let size = count.max(spec.alignment());
                let addr = self.take_buddy(size, block).ok_or(MapError::Exhausted)?;
                (addr, 1 << size_class(size))
            }
            Pool::Interval => {
                let addr = self
                    .take_interval(count, spec.alignment(), block)
                    .ok_or(MapError::Exhausted)?;
                (addr, count)
            }
        };

        {
            let mut small = self.small.lock();
            if let Err(e) = small.table.set_mapping(addr, pages, read, write) {
                // Nothing was written, so the range goes straight back.
                match pool {
                    Pool::Buddy => {
                        let BuddyDomain { buddy, table, .. } = &mut *small;
                        buddy.free(table, addr, reserved);
                    }
                    Pool::Interval => {
                        drop(small);
                        self.large.lock().interval.free(addr, reserved);
                    }
                }
                self.waiter.notify_all();
                return Err(e.into());
            }
        }

        self.largest.fetch_max(count, Ordering::Relaxed);

        trace!(
            "map {count} pages at {addr:#x} ({:?}, {reserved} reserved)",
            pool
        );

        Ok(Mapping {
            addr,
            mapped: count,
            reserved,
            pool,
        })
    }

    /// Unmaps `mapping`.
    ///
    /// The translations are removed at once. The range itself becomes
    /// available again after every unit has completed the invalidation
    /// issued here and [`reclaim`](Self::reclaim) (or an exhausted
    /// [`map`](Self::map)) has run. Blocked mapping requests are woken to
    /// retry.
    ///
    /// # Panics
    ///
    /// Panics if the owning reclaim queue is full and none of its entries has
    /// completed invalidation.
    pub fn unmap(&self, mapping: Mapping) {
        let Mapping {
            addr,
            mapped,
            reserved,
            pool,
        } = mapping;

        match pool {
            Pool::Buddy => {
                let mut small = self.small.lock();
                small.table.clear(addr, mapped);

                if small.queue.is_full() {
                    small.reclaim(self.invalidator.completed());
                }

                let stamp = self.invalidator.submit(addr, reserved);
                small.queue.enqueue(addr, reserved, stamp);
            }
            Pool::Interval => {
                self.small.lock().table.clear(addr, mapped);

                let mut large = self.large.lock();
                if large.queue.is_full() {
                    large.reclaim(self.invalidator.completed());
                }

                let stamp = self.invalidator.submit(addr, reserved);
                large.queue.enqueue(addr, reserved, stamp);
            }
        }

        trace!("unmap {mapped} pages at {addr:#x}");

        // The invalidation may already be complete, so blocked mappers get a
        // chance to reclaim the range right away.
        self.waiter.notify_all();
    }

    /// Returns every range whose invalidation has completed to its
    /// allocator, and wakes waiting mapping requests if any were returned.
    ///
    /// Call this when a unit signals completion, or periodically.
    pub fn reclaim(&self) -> usize {
        let completed = self.invalidator.completed();

        let small = self.small.lock().reclaim(completed);
        let large = self.large.lock().reclaim(completed);

        if small + large > 0 {
            self.waiter.notify_all();
        }

        small + large
    }

    /// Splits `[start, start + size)` at the buddy/interval boundary.
    fn split_range(&self, start: u32, size: u32) -> (Option<(u32, u32)>, Option<(u32, u32)>) {
        let end = start + size;
        let low = (start < self.buddy_pages).then(|| (start, end.min(self.buddy_pages) - start));
        let high = (end > self.buddy_pages).then(|| {
            let s = start.max(self.buddy_pages);
            (s, end - s)
        });
        (low, high)
    }

    /// Permanently removes `[start, start + size)` from both allocators.
    ///
    /// The range may straddle the boundary between them.
    ///
    /// # Errors
    ///
    /// Fails, leaving the space unchanged, if the range is outside the space
    /// or overlaps anything already allocated or reserved.
    pub fn reserve(&self, start: u32, size: u32) -> Result<(), ReserveError> {
        let out_of_range = ReserveError::OutOfRange { start, size };
        let overlap = ReserveError::Overlap { start, size };

        if size == 0 || u64::from(start) + u64::from(size) > u64::from(self.space_pages) {
            return Err(out_of_range);
        }

        let (low, high) = self.split_range(start, size);

        // Check the interval side first so a failure there leaves the buddy
        // side untouched.
        let mut large = self.large.lock();
        if let Some((s, n)) = high {
            if !large.interval.is_free_range(s, n) {
                return Err(overlap);
            }
        }

        if let Some((s, n)) = low {
            // Never hold both locks.
            drop(large);
            let mut small = self.small.lock();
            let BuddyDomain { buddy, table, .. } = &mut *small;
            if !buddy.is_free_range(table, s, n) {
                return Err(overlap);
            }
            buddy.allocate_fixed(table, s, n);
            drop(small);
            large = self.large.lock();
        }

        if let Some((s, n)) = high {
            if !large.interval.is_free_range(s, n) {
                drop(large);
                // Raced with an allocation since the check; undo the buddy
                // side.
                if let Some((s, n)) = low {
                    let mut small = self.small.lock();
                    let BuddyDomain { buddy, table, .. } = &mut *small;
                    buddy.free_fixed(table, s, n);
                }
                return Err(overlap);
            }

            large.interval.allocate_fixed(s, n);
        }
        drop(large);

        {
            let mut windows = self.windows.lock();
            let at = windows.partition_point(|&(s, _)| s < start);
            windows.insert(at, (start, size));
        }

        debug!("reserved {start:#x}+{size:#x}");

        Ok(())
    }

    /// Reserves `[start, start + size)` and maps each page onto the physical
    /// page with the same number.
    pub fn reserve_identity(
        &self,
        start: u32,
        size: u32,
        options: MapOptions,
    ) -> Result<(), ReserveError> {
        self.reserve(start, size)?;

        let pages = PhysPages::Contiguous {
            base: u64::from(start),
            count: size,
        };

        let res = self.small.lock().table.set_mapping(
            start,
            pages,
            options.contains(MapOptions::READ),
            options.contains(MapOptions::WRITE),
        );

        if let Err(e) = res {
            self.release_reserved(start, size);
            return Err(e.into());
        }

        Ok(())
    }

    fn release_reserved(&self, start: u32, size: u32) {
        self.windows.lock().retain(|&w| w != (start, size));

        let (low, high) = self.split_range(start, size);

        if let Some((s, n)) = low {
            let mut small = self.small.lock();
            let BuddyDomain { buddy, table, .. } = &mut *small;
            buddy.free_fixed(table, s, n);
        }

        if let Some((s, n)) = high {
            self.large.lock().interval.free(s, n);
        }
    }

    /// Returns the physical page mapped at `page`.
    pub fn translate(&self, page: u32) -> Option<u64> {
        self.small.lock().table.translate(page)
    }

    /// Returns a snapshot of the space's counters.
    pub fn stats(&self) -> SpaceStats {
        let mut stats = SpaceStats {
            space_pages: self.space_pages,
            buddy_pages: self.buddy_pages,
            interval_pages: self.space_pages - self.buddy_pages,
            largest_mapping: self.largest.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            ..SpaceStats::default()
        };

        {
            let small = self.small.lock();
            let buddy = small.buddy.stats();
            stats.buddy_used = small.buddy.used_pages();
            stats.buddy_high_water = small.high_water;
            stats.buddy_allocs = buddy.allocs;
            stats.buddy_splits = buddy.splits;
            stats.buddy_merges = buddy.merges;
            stats.pending_small = small.queue.len();
            stats.pending_high_water = small.queue.high_water();
            stats.table_levels = small.table.levels();
            stats.present_granules = small.table.present_granules();
        }

        {
            let large = self.large.lock();
            let interval = large.interval.stats();
            stats.interval_used = large.interval.used_pages();
            stats.interval_high_water = large.high_water;
            stats.interval_allocs = interval.allocs;
            stats.interval_extents = large.interval.extents().count();
            stats.interval_fallback_scans = interval.fallback_scans;
            stats.pending_large = large.queue.len();
            stats.pending_high_water = stats.pending_high_water.max(large.queue.high_water());
        }

        stats.issued_stamp = self.invalidator.issued();
        stats.completed_stamp = self.invalidator.completed();

        stats
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::{sync::Arc, vec, vec::Vec};
    use std::{thread, time::Duration};

    use super::*;
    use crate::{
        tests::{FakeUnit, PagePool},
        wait::SpinWait,
    };

    fn config(space_pages: u32, buddy_bits: u8) -> SpaceConfig {
        SpaceConfig {
            space_pages,
            buddy_bits,
            coalesce: CoalescePolicy::ALWAYS,
            reclaim_capacity: 64,
            ..SpaceConfig::default()
        }
    }

    fn space_with_unit(
        config: SpaceConfig,
    ) -> (IovaSpace<PagePool, SpinWait>, Arc<FakeUnit>) {
        let unit = Arc::new(FakeUnit::default());
        let space = IovaSpace::new(
            config,
            PagePool::default(),
            vec![Box::new(unit.clone()) as Box<dyn InvalidationUnit>],
            SpinWait::new(64),
        )
        .unwrap();
        (space, unit)
    }

    fn rw() -> MapOptions {
        MapOptions::READ | MapOptions::WRITE
    }

    fn contiguous(base: u64, count: u32) -> PhysPages<'static> {
        PhysPages::Contiguous { base, count }
    }

    #[test]
    fn thresholds_follow_utilization() {
        let t = LargeThresholds::default();
        assert_eq!(t.for_utilization(0, 1024), 128);
        assert_eq!(t.for_utilization(767, 1024), 128);
        assert_eq!(t.for_utilization(768, 1024), 512);
        assert_eq!(t.for_utilization(895, 1024), 512);
        assert_eq!(t.for_utilization(896, 1024), 8192);
    }

    #[test]
    fn reachable_pages() {
        let spec = |address_bits| MapSpec {
            address_bits,
            alignment: 1,
        };
        assert_eq!(spec(32).reachable_pages(), 1 << 20);
        assert_eq!(spec(12).reachable_pages(), 1);
        assert_eq!(spec(8).reachable_pages(), 0);
        assert_eq!(spec(64).reachable_pages(), 1 << 52);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let bad = |c: SpaceConfig| {
            IovaSpace::new(c, PagePool::default(), Vec::new(), SpinWait::default()).unwrap_err()
        };

        assert!(matches!(
            bad(SpaceConfig { space_pages: 0, ..config(1, 0) }),
            InitError::InvalidConfig(_)
        ));
        assert!(matches!(bad(config(1024, 11)), InitError::InvalidConfig(_)));
        assert!(matches!(
            bad(SpaceConfig { reclaim_capacity: 0, ..config(1024, 4) }),
            InitError::InvalidConfig(_)
        ));
        assert_eq!(
            bad(SpaceConfig {
                reserved: vec![ReservedRange { start: 1000, size: 100, identity: false }],
                ..config(1024, 4)
            }),
            InitError::Reserve(ReserveError::OutOfRange { start: 1000, size: 100 })
        );
        assert_eq!(
            bad(SpaceConfig {
                reserved: vec![
                    ReservedRange { start: 10, size: 10, identity: false },
                    ReservedRange { start: 15, size: 10, identity: false },
                ],
                ..config(1024, 6)
            }),
            InitError::Reserve(ReserveError::Overlap { start: 15, size: 10 })
        );
    }

    #[test]
    fn construction_needs_table_pages() {
        // Enough for the root but not the buddy granule.
        let res = IovaSpace::new(
            config(4096, 9),
            PagePool::with_limit(1),
            Vec::new(),
            SpinWait::default(),
        );
        assert_eq!(res.unwrap_err(), InitError::OutOfTablePages);
    }

    #[test]
    fn page_zero_is_never_handed_out() {
        let (space, _) = space_with_unit(config(64, 6));
        let m = space.map(contiguous(0x500, 1), rw(), &MapSpec::default()).unwrap();
        assert_ne!(m.page(), 0);
        assert_eq!(m.page(), 1);
        space.unmap(m);
    }

    #[test]
    fn small_requests_use_buddy() {
        let (space, _) = space_with_unit(config(1 << 12, 10));

        let m = space.map(contiguous(0x9000, 3), rw(), &MapSpec::default()).unwrap();
        assert!(!m.is_large());
        assert_eq!(m.pages(), 3);
        assert_eq!(m.reserved_pages(), 4);
        assert_eq!(m.page() % 4, 0);
        assert_eq!(m.iova(), u64::from(m.page()) << 12);

        assert_eq!(space.translate(m.page()), Some(0x9000));
        assert_eq!(space.translate(m.page() + 2), Some(0x9002));
        assert_eq!(space.translate(m.page() + 3), None);

        space.unmap(m);
    }

    #[test]
    fn large_requests_use_interval() {
        let (space, _) = space_with_unit(config(1 << 12, 10));
        let before = space.stats().present_granules;

        let m = space.map(contiguous(0x10_0000, 200), rw(), &MapSpec::default()).unwrap();
        assert!(m.is_large());
        assert!(m.page() >= 1 << 10);
        assert_eq!(m.reserved_pages(), 200);
        assert_eq!(space.translate(m.page() + 199), Some(0x10_0000 + 199));

        // The interval region is wired lazily.
        assert!(space.stats().present_granules > before);
        assert_eq!(space.stats().largest_mapping, 200);

        space.unmap(m);
    }

    #[test]
    fn paging_path_stays_in_buddy() {
        let (space, _) = space_with_unit(config(1 << 12, 10));

        let m = space
            .map(contiguous(0, 200), rw() | MapOptions::PAGING_PATH, &MapSpec::default())
            .unwrap();
        assert!(!m.is_large());
        assert_eq!(m.reserved_pages(), 256);
        space.unmap(m);

        assert_eq!(
            space.map(contiguous(0, 2048), MapOptions::PAGING_PATH, &MapSpec::default()),
            Err(MapError::Unaddressable)
        );
    }

    #[test]
    fn narrow_devices_stay_low() {
        // 1024-page buddy region, 4096-page space. A 22-bit device reaches
        // exactly the buddy region.
        let (space, _) = space_with_unit(config(1 << 12, 10));
        let narrow = MapSpec {
            address_bits: 22,
            alignment: 1,
        };

        let m = space.map(contiguous(0, 200), rw(), &narrow).unwrap();
        assert!(!m.is_large());
        space.unmap(m);

        assert_eq!(
            space.map(contiguous(0, 2048), rw(), &narrow),
            Err(MapError::Unaddressable)
        );

        let tiny = MapSpec {
            address_bits: 16,
            alignment: 1,
        };
        assert_eq!(
            space.map(contiguous(0, 1), rw(), &tiny),
            Err(MapError::Unaddressable)
        );
    }

    #[test]
    fn requests_that_never_fit_are_unaddressable() {
        // The interval region is only 3072 pages.
        let (space, _) = space_with_unit(config(1 << 12, 10));
        assert_eq!(
            space.map(contiguous(0, 4000), rw(), &MapSpec::default()),
            Err(MapError::Unaddressable)
        );

        // The only 64-page block holds the reserved page 0, and there is no
        // interval region.
        let (space, _) = space_with_unit(config(64, 6));
        assert_eq!(
            space.map(contiguous(0, 64), rw(), &MapSpec::default()),
            Err(MapError::Unaddressable)
        );
        assert_eq!(
            space.try_map(contiguous(0, 33), rw(), &MapSpec::default()),
            Err(MapError::Unaddressable)
        );
        let m = space.map(contiguous(0, 32), rw(), &MapSpec::default()).unwrap();
        assert_eq!(m.page(), 32);
        space.unmap(m);
    }

    #[test]
    fn reserved_windows_limit_what_fits() {
        // Splits the interval region into [1024, 2048) and [2064, 4096).
        let cfg = SpaceConfig {
            reserved: vec![ReservedRange { start: 2048, size: 16, identity: false }],
            ..config(1 << 12, 10)
        };
        let (space, unit) = space_with_unit(cfg);

        assert_eq!(
            space.map(contiguous(0, 2500), rw(), &MapSpec::default()),
            Err(MapError::Unaddressable)
        );

        let aligned = MapSpec {
            address_bits: 64,
            alignment: 1024,
        };
        assert_eq!(
            space.map(contiguous(0, 1500), rw(), &aligned),
            Err(MapError::Unaddressable)
        );

        let m = space.map(contiguous(0, 2000), rw(), &MapSpec::default()).unwrap();
        assert!(m.is_large());
        assert_eq!(m.page(), 2064);
        space.unmap(m);
        unit.complete_through(1);
        assert_eq!(space.reclaim(), 1);

        // Windows reserved after construction count too.
        space.reserve(3000, 8).unwrap();
        assert_eq!(
            space.try_map(contiguous(0, 2000), rw(), &MapSpec::default()),
            Err(MapError::Unaddressable)
        );
    }

    #[test]
    fn reserve_after_throttled_frees() {
        let cfg = SpaceConfig {
            coalesce: CoalescePolicy::default(),
            ..config(64, 6)
        };
        let (space, unit) = space_with_unit(cfg);

        let a = space.map(contiguous(0, 1), rw(), &MapSpec::default()).unwrap();
        let b = space.map(contiguous(0, 1), rw(), &MapSpec::default()).unwrap();
        assert_eq!((a.page(), b.page()), (1, 2));

        space.unmap(a);
        space.unmap(b);
        unit.complete_through(2);
        assert_eq!(space.reclaim(), 2);
        assert_eq!(space.stats().buddy_used, 1);

        // Pages 2 and 3 are free, but held in separate unmerged blocks.
        space.reserve(2, 2).unwrap();
        assert_eq!(space.stats().buddy_used, 3);
        assert_eq!(
            space.reserve(3, 1),
            Err(ReserveError::Overlap { start: 3, size: 1 })
        );
    }

    #[test]
    fn empty_request_is_rejected() {
        let (space, _) = space_with_unit(config(64, 6));
        assert_eq!(
            space.map(PhysPages::List(&[]), rw(), &MapSpec::default()),
            Err(MapError::EmptyRequest)
        );
    }

    #[test]
    fn alignment_is_honoured() {
        let (space, _) = space_with_unit(config(1 << 12, 10));
        let spec = MapSpec {
            address_bits: 64,
            alignment: 64,
        };

        let small = space.map(contiguous(0, 2), rw(), &spec).unwrap();
        assert_eq!(small.page() % 64, 0);
        assert_eq!(small.reserved_pages(), 64);

        let large = space.map(contiguous(0, 300), rw(), &spec).unwrap();
        assert!(large.is_large());
        assert_eq!(large.page() % 64, 0);

        space.unmap(small);
        space.unmap(large);
    }

    #[test]
    fn unmap_releases_only_after_invalidation() {
        let (space, unit) = space_with_unit(config(64, 6));

        let m = space.map(contiguous(0x40, 8), rw(), &MapSpec::default()).unwrap();
        let page = m.page();
        space.unmap(m);

        assert_eq!(space.translate(page), None);
        assert_eq!(unit.issued(), vec![(0, page, 8, 1)]);

        let stats = space.stats();
        assert_eq!(stats.pending_small, 1);
        assert_eq!(stats.issued_stamp, 1);
        assert_eq!(stats.completed_stamp, 0);
        assert_eq!(stats.buddy_used, 9);

        // Not confirmed yet.
        assert_eq!(space.reclaim(), 0);
        assert_eq!(space.stats().buddy_used, 9);

        unit.complete_through(1);
        assert_eq!(space.reclaim(), 1);

        let stats = space.stats();
        assert_eq!(stats.pending_small, 0);
        assert_eq!(stats.buddy_used, 1);
        assert_eq!(stats.buddy_high_water, 9);
    }

    #[test]
    fn try_map_fails_instead_of_waiting() {
        let (space, unit) = space_with_unit(config(64, 6));

        let a = space.map(contiguous(0, 32), rw(), &MapSpec::default()).unwrap();
        assert_eq!(
            space.try_map(contiguous(0, 32), rw(), &MapSpec::default()),
            Err(MapError::Exhausted)
        );

        space.unmap(a);
        assert_eq!(
            space.try_map(contiguous(0, 32), rw(), &MapSpec::default()),
            Err(MapError::Exhausted)
        );

        unit.complete_through(1);
        let b = space.try_map(contiguous(0, 32), rw(), &MapSpec::default()).unwrap();
        assert_eq!(b.page(), 32);
        assert_eq!(space.stats().waits, 0);
        space.unmap(b);
    }

    #[test]
    fn exhausted_map_drains_completed_ranges() {
        let (space, unit) = space_with_unit(config(64, 6));

        let a = space.map(contiguous(0, 32), rw(), &MapSpec::default()).unwrap();
        space.unmap(a);
        unit.complete_through(1);

        // Only the drained range can satisfy this.
        let b = space.map(contiguous(0, 32), rw(), &MapSpec::default()).unwrap();
        assert_eq!(b.page(), 32);
        assert_eq!(space.stats().waits, 0);
        space.unmap(b);
    }

    #[cfg(feature = "std")]
    #[test]
    fn exhausted_map_waits_for_reclaim() {
        let unit = Arc::new(FakeUnit::default());
        let space = Arc::new(
            IovaSpace::new(
                config(64, 6),
                PagePool::default(),
                vec![Box::new(unit.clone()) as Box<dyn InvalidationUnit>],
                crate::wait::CondvarWait::new(Duration::from_millis(2)),
            )
            .unwrap(),
        );

        let held = space.map(contiguous(0, 32), rw(), &MapSpec::default()).unwrap();

        let waiter = {
            let space = space.clone();
            thread::spawn(move || {
                let m = space.map(contiguous(0, 32), rw(), &MapSpec::default()).unwrap();
                let page = m.page();
                space.unmap(m);
                page
            })
        };

        thread::sleep(Duration::from_millis(20));
        space.unmap(held);
        thread::sleep(Duration::from_millis(20));
        unit.complete_through(1);

        assert_eq!(waiter.join().unwrap(), 32);
        assert!(space.stats().waits > 0);
    }

    #[cfg(feature = "std")]
    #[test]
    fn unmap_wakes_blocked_map() {
        use std::time::Instant;

        let unit = Arc::new(FakeUnit::auto_complete());
        let space = Arc::new(
            IovaSpace::new(
                config(64, 6),
                PagePool::default(),
                vec![Box::new(unit.clone()) as Box<dyn InvalidationUnit>],
                // Far longer than the test may take.
                crate::wait::CondvarWait::new(Duration::from_secs(60)),
            )
            .unwrap(),
        );

        let held = space.map(contiguous(0, 32), rw(), &MapSpec::default()).unwrap();

        let waiter = {
            let space = space.clone();
            thread::spawn(move || {
                let m = space.map(contiguous(0, 32), rw(), &MapSpec::default()).unwrap();
                let page = m.page();
                space.unmap(m);
                page
            })
        };

        while space.stats().waits == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let unmapped = Instant::now();
        space.unmap(held);

        assert_eq!(waiter.join().unwrap(), 32);
        assert!(unmapped.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn stamps_increase_across_domains() {
        let (space, unit) = space_with_unit(config(1 << 12, 10));

        let small = space.map(contiguous(0, 1), rw(), &MapSpec::default()).unwrap();
        let large = space.map(contiguous(0, 500), rw(), &MapSpec::default()).unwrap();
        let (small_page, large_page) = (small.page(), large.page());

        space.unmap(large);
        space.unmap(small);

        assert_eq!(
            unit.issued(),
            vec![(0, large_page, 500, 1), (0, small_page, 1, 2)]
        );

        // Completing only the first stamp releases only the large range.
        unit.complete_through(1);
        assert_eq!(space.reclaim(), 1);
        let stats = space.stats();
        assert_eq!(stats.pending_small, 1);
        assert_eq!(stats.pending_large, 0);
        assert_eq!(stats.interval_used, 0);
    }

    #[test]
    fn reserve_straddles_the_boundary() {
        let (space, _) = space_with_unit(config(2048, 10));

        space.reserve(1000, 100).unwrap();
        let stats = space.stats();
        assert_eq!(stats.buddy_used, 1 + 24);
        assert_eq!(stats.interval_used, 76);

        assert_eq!(
            space.reserve(1050, 10),
            Err(ReserveError::Overlap { start: 1050, size: 10 })
        );
        assert_eq!(
            space.reserve(1010, 1),
            Err(ReserveError::Overlap { start: 1010, size: 1 })
        );
        assert_eq!(
            space.reserve(2040, 16),
            Err(ReserveError::OutOfRange { start: 2040, size: 16 })
        );

        // A failed reservation changes nothing.
        assert_eq!(space.stats().buddy_used, 25);
    }

    #[test]
    fn identity_windows_translate_to_themselves() {
        let cfg = SpaceConfig {
            reserved: vec![ReservedRange { start: 0x600, size: 0x20, identity: true }],
            ..config(1 << 12, 10)
        };
        let (space, _) = space_with_unit(cfg);

        assert_eq!(space.translate(0x600), Some(0x600));
        assert_eq!(space.translate(0x61f), Some(0x61f));
        assert_eq!(space.translate(0x620), None);
        assert_eq!(space.stats().interval_used, 0x20);
    }

    #[test]
    fn table_exhaustion_returns_the_range() {
        // The root and the buddy granule, and nothing for the interval side.
        let (space, unit) = {
            let unit = Arc::new(FakeUnit::default());
            let space = IovaSpace::new(
                config(1 << 12, 9),
                PagePool::with_limit(2),
                vec![Box::new(unit.clone()) as Box<dyn InvalidationUnit>],
                SpinWait::new(64),
            )
            .unwrap();
            (space, unit)
        };

        assert_eq!(
            space.map(contiguous(0, 300), rw(), &MapSpec::default()),
            Err(MapError::OutOfTablePages)
        );
        assert_eq!(space.stats().interval_used, 0);
        assert!(unit.issued().is_empty());

        assert_eq!(
            space.reserve_identity(0x800, 4, rw()),
            Err(ReserveError::OutOfTablePages)
        );
        assert_eq!(space.stats().interval_used, 0);
    }

    #[cfg(feature = "std")]
    #[test]
    fn concurrent_map_unmap() {
        let unit = Arc::new(FakeUnit::auto_complete());
        let space = Arc::new(
            IovaSpace::new(
                config(1 << 12, 10),
                PagePool::default(),
                vec![Box::new(unit.clone()) as Box<dyn InvalidationUnit>],
                crate::wait::CondvarWait::new(Duration::from_millis(1)),
            )
            .unwrap(),
        );

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let space = space.clone();
                thread::spawn(move || {
                    for i in 0..200u32 {
                        let count = 1 + (i * 7 + t) % 300;
                        let base = u64::from(t) << 32 | u64::from(i) << 12;
                        let m = space
                            .map(contiguous(base, count), rw(), &MapSpec::default())
                            .unwrap();
                        assert_eq!(space.translate(m.page()), Some(base));
                        assert_eq!(
                            space.translate(m.page() + count - 1),
                            Some(base + u64::from(count) - 1)
                        );
                        space.unmap(m);
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }

        space.reclaim();
        let stats = space.stats();
        assert_eq!(stats.pending_small + stats.pending_large, 0);
        assert_eq!(stats.buddy_used, 1);
        assert_eq!(stats.interval_used, 0);
    }
}
