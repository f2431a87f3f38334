//! The multi-level translation table.
//!
//! Levels 1 and up are sized for the whole space and wired when the table is
//! built. Level 0 is split into 512-entry *granules*, each backed by one table
//! page which is only obtained the first time a mapping touches it; a
//! [`Bitmap`] records which granules are wired.
//!
//! Level-0 slots are kept as [`BlockEntry`] values rather than raw hardware
//! words so that the buddy allocator can thread its free lists through them.
//! Free and empty slots read as not-present to the hardware.

use alloc::{boxed::Box, vec, vec::Vec};
use core::sync::atomic::{fence, Ordering};

use log::{debug, trace};

use crate::{
    bitmap::Bitmap,
    entry::{BlockEntry, LeafEntry, SlotStore, ENTRIES_PER_PAGE, ENTRIES_PER_PAGE_SHIFT},
    hw::{PhysPages, TablePageSource},
    TableError,
};

/// The deepest supported table, counting level 0.
pub const MAX_LEVELS: usize = 6;

type LeafPage = [BlockEntry; ENTRIES_PER_PAGE];

/// One fully wired upper level.
struct Level {
    entries: Vec<LeafEntry>,
    pages: Vec<u64>,
}

/// A lazily populated translation table over `space_pages` page indices.
pub struct PageTable<S: TablePageSource> {
    space_pages: u32,
    leaves: Vec<Option<Box<LeafPage>>>,
    leaf_pages: Vec<u64>,
    present: Bitmap,
    upper: Vec<Level>,
    source: S,
}

impl<S: TablePageSource> core::fmt::Debug for PageTable<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTable")
            .field("space_pages", &self.space_pages)
            .field("levels", &self.levels())
            .field("granules", &self.granules())
            .field("present", &self.present_granules())
            .finish()
    }
}

#[inline]
fn granule_of(index: u32) -> usize {
    (index >> ENTRIES_PER_PAGE_SHIFT) as usize
}

#[inline]
fn offset_in_granule(index: u32) -> usize {
    index as usize & (ENTRIES_PER_PAGE - 1)
}

impl<S: TablePageSource> PageTable<S> {
    /// Builds a table for `space_pages` indices, wiring every level above
    /// level 0 with pages from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::OutOfTablePages`] if `source` runs dry. Any pages
    /// obtained up to that point are handed back.
    ///
    /// # Panics
    ///
    /// Panics if `space_pages` is zero.
    pub fn new(space_pages: u32, mut source: S) -> Result<PageTable<S>, TableError> {
        assert!(space_pages > 0, "page table must cover at least one page");

        let granules = (space_pages as usize).div_ceil(ENTRIES_PER_PAGE);

        let mut upper: Vec<Level> = Vec::new();
        let mut below = granules;
        loop {
            let num_pages = below.div_ceil(ENTRIES_PER_PAGE);

            let mut pages = Vec::with_capacity(num_pages);
            for _ in 0..num_pages {
                match source.alloc_table_page() {
                    Some(page) => pages.push(page),
                    None => {
                        upper
                            .iter()
                            .flat_map(|level| level.pages.iter())
                            .chain(pages.iter())
                            .for_each(|&page| source.free_table_page(page));
                        return Err(TableError::OutOfTablePages);
                    }
                }
            }

            let mut entries = vec![LeafEntry::new(); num_pages * ENTRIES_PER_PAGE];
            if let Some(lower) = upper.last() {
                for (entry, &page) in entries.iter_mut().zip(lower.pages.iter()) {
                    *entry = LeafEntry::table(page);
                }
            }

            upper.push(Level { entries, pages });

            if num_pages == 1 {
                break;
            }
            below = num_pages;
        }

        assert!(upper.len() < MAX_LEVELS, "address space too large");

        let mut table = PageTable {
            space_pages,
            leaves: (0..granules).map(|_| None).collect(),
            leaf_pages: vec![0; granules],
            present: Bitmap::new(granules),
            upper,
            source,
        };

        for level in 2..=table.upper.len() {
            let count = table.upper[level - 2].pages.len();
            table.flush_upper(level, 0, count);
        }
        fence(Ordering::SeqCst);

        debug!(
            "page table: {} pages, {} levels, {} granules",
            space_pages,
            table.levels(),
            granules
        );

        Ok(table)
    }

    /// Returns the number of page indices covered.
    #[inline]
    pub fn space_pages(&self) -> u32 {
        self.space_pages
    }

    /// Returns the number of levels, counting level 0.
    #[inline]
    pub fn levels(&self) -> usize {
        self.upper.len() + 1
    }

    /// Returns the number of level-0 granules.
    #[inline]
    pub fn granules(&self) -> usize {
        self.leaves.len()
    }

    /// Returns the number of wired level-0 granules.
    #[inline]
    pub fn present_granules(&self) -> usize {
        self.present.count_ones()
    }

    /// Returns the physical page of the root table.
    #[inline]
    pub fn top_level_page(&self) -> u64 {
        // The topmost level always fits in one page.
        self.upper[self.upper.len() - 1].pages[0]
    }

    /// Returns the hardware entry at `index` of upper level `level`.
    ///
    /// # Panics
    ///
    /// Panics if `level` is 0 or above the root.
    pub fn upper_entry(&self, level: usize, index: usize) -> LeafEntry {
        assert!(level >= 1 && level < self.levels(), "no upper level {level}");
        self.upper[level - 1].entries[index]
    }

    /// Returns the page source.
    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns whether the granule holding `index` is wired.
    #[inline]
    pub fn is_present(&self, index: u32) -> bool {
        index < self.space_pages && self.present.get(granule_of(index))
    }

    /// Wires every granule overlapping `[start, start + count)`.
    ///
    /// Granules which are already wired are left untouched, so calling this
    /// again for the same range has no effect.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::OutOfTablePages`] if a table page cannot be
    /// obtained. Granules wired before the failure stay wired.
    pub fn ensure_present(&mut self, start: u32, count: u32) -> Result<(), TableError> {
        if count == 0 {
            return Ok(());
        }

        let end = u64::from(start) + u64::from(count);
        assert!(end <= u64::from(self.space_pages), "range beyond the table");

        let first = granule_of(start);
        let last = granule_of((end - 1) as u32);

        let mut wired = 0;
        for granule in first..=last {
            if self.present.get(granule) {
                continue;
            }

            self.wire(granule)?;
            wired += 1;
        }

        if wired > 0 {
            fence(Ordering::SeqCst);
        }

        Ok(())
    }

    fn wire(&mut self, granule: usize) -> Result<(), TableError> {
        let page = self
            .source
            .alloc_table_page()
            .ok_or(TableError::OutOfTablePages)?;

        self.leaves[granule] = Some(Box::new([BlockEntry::Empty; ENTRIES_PER_PAGE]));
        self.leaf_pages[granule] = page;
        self.present.set(granule, true);

        self.upper[0].entries[granule] = LeafEntry::table(page);
        self.flush_upper(1, granule, 1);

        trace!("granule {granule} wired to page {page:#x}");

        Ok(())
    }

    fn flush_upper(&mut self, level: usize, first: usize, count: usize) {
        if self.source.is_coherent() {
            return;
        }

        let pages = &self.upper[level - 1].pages;
        let mut index = first;
        while index < first + count {
            let page = pages[index / ENTRIES_PER_PAGE];
            let offset = index % ENTRIES_PER_PAGE;
            let n = (ENTRIES_PER_PAGE - offset).min(first + count - index);
            self.source.flush(page, offset, n);
            index += n;
        }
    }

    fn flush_leaves(&mut self, start: u32, count: u32) {
        if self.source.is_coherent() || count == 0 {
            return;
        }

        let end = start + count;
        let mut index = start;
        while index < end {
            let granule = granule_of(index);
            let offset = offset_in_granule(index);
            let n = (ENTRIES_PER_PAGE - offset).min((end - index) as usize);
            if self.present.get(granule) {
                self.source.flush(self.leaf_pages[granule], offset, n);
            }
            index += n as u32;
        }
    }

    /// Returns the slot at `index`, or `None` if its granule is not wired.
    pub fn entry(&self, index: u32) -> Option<BlockEntry> {
        if !self.is_present(index) {
            return None;
        }

        self.leaves[granule_of(index)]
            .as_ref()
            .map(|leaf| leaf[offset_in_granule(index)])
    }

    /// Returns the physical page mapped at `index`.
    pub fn translate(&self, index: u32) -> Option<u64> {
        self.entry(index)
            .and_then(BlockEntry::as_leaf)
            .map(|leaf| leaf.phys_page())
    }

    /// Maps `pages` at `[start, start + pages.len())`, wiring granules as
    /// needed.
    ///
    /// The entries are visible to the hardware once this returns.
    pub fn set_mapping(
        &mut self,
        start: u32,
        pages: PhysPages<'_>,
        read: bool,
        write: bool,
    ) -> Result<(), TableError> {
        let count = pages.len();
        self.ensure_present(start, count)?;

        for (index, page) in (start..).zip(pages.iter()) {
            debug_assert!(
                self.slot(index).as_free().is_none(),
                "mapping over free block at {index:#x}"
            );
            self.set_slot(index, BlockEntry::Leaf(LeafEntry::mapping(page, read, write)));
        }

        self.flush_leaves(start, count);
        fence(Ordering::SeqCst);

        Ok(())
    }

    /// Clears the entries in `[start, start + count)`.
    ///
    /// Slots in granules that were never wired are already clear and are
    /// skipped.
    pub fn clear(&mut self, start: u32, count: u32) {
        let end = start + count;
        for index in start..end {
            let granule = granule_of(index);
            if let Some(leaf) = self.leaves[granule].as_mut() {
                leaf[offset_in_granule(index)] = BlockEntry::Empty;
            }
        }

        self.flush_leaves(start, count);
        fence(Ordering::SeqCst);
    }
}

impl<S: TablePageSource> SlotStore for PageTable<S> {
    #[inline]
    fn slot(&self, index: u32) -> BlockEntry {
        match &self.leaves[granule_of(index)] {
            Some(leaf) => leaf[offset_in_granule(index)],
            None => panic!("slot {index:#x} read before its granule was wired"),
        }
    }

    #[inline]
    fn set_slot(&mut self, index: u32, entry: BlockEntry) {
        match &mut self.leaves[granule_of(index)] {
            Some(leaf) => leaf[offset_in_granule(index)] = entry,
            None => panic!("slot {index:#x} written before its granule was wired"),
        }
    }
}

impl<S: TablePageSource> Drop for PageTable<S> {
    fn drop(&mut self) {
        for granule in self.present.iter_ones() {
            self.source.free_table_page(self.leaf_pages[granule]);
        }

        for level in &self.upper {
            for &page in &level.pages {
                self.source.free_table_page(page);
            }
        }
    }
}
