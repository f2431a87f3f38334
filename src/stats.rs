use core::fmt;

use crate::buddy::MAX_CLASS;

/// A point-in-time snapshot of an [`IovaSpace`](crate::IovaSpace).
///
/// The two allocation domains are sampled one after the other, so a
/// snapshot taken under load may mix slightly different moments.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpaceStats {
    /// Pages in the whole space.
    pub space_pages: u32,
    /// Pages managed by the buddy allocator.
    pub buddy_pages: u32,
    /// Buddy pages currently allocated, reserved or awaiting reclaim.
    pub buddy_used: u32,
    /// The greatest value `buddy_used` has reached.
    pub buddy_high_water: u32,
    /// Buddy allocations, by size class.
    pub buddy_allocs: [u64; MAX_CLASS as usize + 1],
    /// Buddy blocks split in two.
    pub buddy_splits: u64,
    /// Buddy pairs merged back together.
    pub buddy_merges: u64,
    /// Pages managed by the interval allocator.
    pub interval_pages: u32,
    /// Interval pages currently allocated, reserved or awaiting reclaim.
    pub interval_used: u32,
    /// The greatest value `interval_used` has reached.
    pub interval_high_water: u32,
    /// Successful interval allocations.
    pub interval_allocs: u64,
    /// Free extents in the interval allocator.
    pub interval_extents: usize,
    /// Allocations that needed the fallback scan.
    pub interval_fallback_scans: u64,
    /// The largest mapping ever made, in pages.
    pub largest_mapping: u32,
    /// Ranges awaiting invalidation in the buddy domain.
    pub pending_small: usize,
    /// Ranges awaiting invalidation in the interval domain.
    pub pending_large: usize,
    /// The most ranges either reclaim queue has held at once.
    pub pending_high_water: usize,
    /// Levels in the translation table, counting level 0.
    pub table_levels: usize,
    /// Level-0 table pages wired so far.
    pub present_granules: usize,
    /// The most recently issued invalidation stamp.
    pub issued_stamp: u64,
    /// The greatest stamp completed by every unit.
    pub completed_stamp: u64,
    /// Times a mapping request had to wait for space.
    pub waits: u64,
}

impl SpaceStats {
    /// Returns buddy utilization as a fraction in `[0, 1]`.
    pub fn buddy_utilization(&self) -> f32 {
        match self.buddy_pages {
            0 => 0.0,
            n => self.buddy_used as f32 / n as f32,
        }
    }
}

impl fmt::Display for SpaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "buddy: {}/{} pages ({:.1}%, peak {}), {} splits, {} merges",
            self.buddy_used,
            self.buddy_pages,
            self.buddy_utilization() * 100.0,
            self.buddy_high_water,
            self.buddy_splits,
            self.buddy_merges
        )?;
        writeln!(
            f,
            "interval: {}/{} pages (peak {}), {} allocs, {} extents",
            self.interval_used,
            self.interval_pages,
            self.interval_high_water,
            self.interval_allocs,
            self.interval_extents
        )?;
        writeln!(
            f,
            "reclaim: {} + {} pending, stamps {}/{}",
            self.pending_small, self.pending_large, self.completed_stamp, self.issued_stamp
        )?;
        write!(
            f,
            "table: {} levels, {} granules wired; {} waits",
            self.table_levels, self.present_granules, self.waits
        )
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn display_reports_utilization() {
        let stats = SpaceStats {
            buddy_pages: 1024,
            buddy_used: 256,
            buddy_high_water: 300,
            ..SpaceStats::default()
        };

        let text = stats.to_string();
        let first = text.lines().next().unwrap();
        assert_eq!(first, "buddy: 256/1024 pages (25.0%, peak 300), 0 splits, 0 merges");
        assert_eq!(SpaceStats::default().buddy_utilization(), 0.0);
    }
}
