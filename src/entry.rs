//! Level-0 table slots.
//!
//! A slot in the leaf level of the page table is in one of three states: it is
//! empty, it maps a physical page (a *leaf*), or it is the first slot of a free
//! buddy block and holds that block's free-list links. Storing the free-list
//! node in the slot itself means the buddy allocator needs no memory of its
//! own: the node *is* the table entry the block will populate once it is
//! allocated.
//!
//! Only leaves are visible to the IOMMU. Empty and free slots encode as a
//! not-present entry in [`BlockEntry::hw_bits`].

use bitfield_struct::bitfield;

/// The number of entries in one hardware table page.
pub const ENTRIES_PER_PAGE: usize = 512;

/// `log2(ENTRIES_PER_PAGE)`.
pub const ENTRIES_PER_PAGE_SHIFT: u32 = 9;

/// A populated translation entry.
///
/// This is the format of both level-0 leaves and level ≥1 entries, which hold
/// the physical page of the next-lower table page.
///
/// | Bits   | Field       |
/// |--------|-------------|
/// | 0      | `read`      |
/// | 1      | `write`     |
/// | 2–11   | reserved    |
/// | 12–62  | `phys_page` |
/// | 63     | `used`      |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct LeafEntry {
    /// Device reads through this entry are permitted.
    pub read: bool,
    /// Device writes through this entry are permitted.
    pub write: bool,
    #[bits(10)]
    __: u16,
    /// Physical page number of the target.
    #[bits(51)]
    pub phys_page: u64,
    /// Set for every entry installed by the table manager.
    pub used: bool,
}

impl LeafEntry {
    /// Creates a used entry pointing at `phys_page`.
    #[inline]
    pub fn mapping(phys_page: u64, read: bool, write: bool) -> LeafEntry {
        LeafEntry::new()
            .with_read(read)
            .with_write(write)
            .with_phys_page(phys_page)
            .with_used(true)
    }

    /// Creates a read/write entry pointing at a next-level table page.
    #[inline]
    pub fn table(phys_page: u64) -> LeafEntry {
        LeafEntry::mapping(phys_page, true, true)
    }
}

/// The links of a free buddy block.
///
/// `next` and `prev` are slot indices of neighbouring free blocks of the same
/// size class, or [`FreeLink::NIL`].
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct FreeLink {
    /// Kept zero so the hardware never sees a readable or writable entry.
    #[bits(2)]
    pub access_hint: u8,
    /// The next free block of the same class.
    #[bits(28)]
    pub next: u32,
    /// The previous free block of the same class.
    #[bits(28)]
    pub prev: u32,
    /// `log2` of the block size in pages.
    #[bits(5)]
    pub size_class: u8,
    /// Always set, marking the slot as the head of a free block.
    pub free: bool,
}

impl FreeLink {
    /// The "no link" sentinel. It is the largest value a link field can hold,
    /// so slot indices must stay below it.
    pub const NIL: u32 = (1 << 28) - 1;

    /// Creates the head slot of a free block of class `size_class`.
    #[inline]
    pub fn block(size_class: u8, prev: u32, next: u32) -> FreeLink {
        FreeLink::new()
            .with_size_class(size_class)
            .with_prev(prev)
            .with_next(next)
            .with_free(true)
    }
}

/// The state of one level-0 slot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockEntry {
    /// Neither mapped nor the head of a free block.
    #[default]
    Empty,
    /// A populated leaf.
    Leaf(LeafEntry),
    /// The head of a free buddy block.
    Free(FreeLink),
}

impl BlockEntry {
    /// Returns the entry as the IOMMU sees it.
    #[inline]
    pub fn hw_bits(self) -> u64 {
        match self {
            BlockEntry::Leaf(leaf) => leaf.into_bits(),
            BlockEntry::Empty | BlockEntry::Free(_) => 0,
        }
    }

    /// Returns the free-list links if this slot heads a free block.
    #[inline]
    pub fn as_free(self) -> Option<FreeLink> {
        match self {
            BlockEntry::Free(link) if link.free() => Some(link),
            _ => None,
        }
    }

    /// Returns the leaf if this slot is mapped.
    #[inline]
    pub fn as_leaf(self) -> Option<LeafEntry> {
        match self {
            BlockEntry::Leaf(leaf) if leaf.used() => Some(leaf),
            _ => None,
        }
    }
}

/// Random access to level-0 slots by flat index.
///
/// The buddy allocator keeps its free lists inside the slots it manages; this
/// trait is how it reaches them, whether they live in a plain vector or in the
/// lazily wired pages of a [`PageTable`](crate::table::PageTable).
pub trait SlotStore {
    /// Reads the slot at `index`.
    fn slot(&self, index: u32) -> BlockEntry;

    /// Overwrites the slot at `index`.
    fn set_slot(&mut self, index: u32, entry: BlockEntry);

    /// Returns the free links at `index`.
    ///
    /// # Panics
    ///
    /// Panics if the slot does not head a free block.
    fn link(&self, index: u32) -> FreeLink {
        match self.slot(index).as_free() {
            Some(link) => link,
            None => panic!("slot {index} is not a free block"),
        }
    }
}

impl SlotStore for [BlockEntry] {
    #[inline]
    fn slot(&self, index: u32) -> BlockEntry {
        self[index as usize]
    }

    #[inline]
    fn set_slot(&mut self, index: u32, entry: BlockEntry) {
        self[index as usize] = entry;
    }
}

impl SlotStore for alloc::vec::Vec<BlockEntry> {
    #[inline]
    fn slot(&self, index: u32) -> BlockEntry {
        self[index as usize]
    }

    #[inline]
    fn set_slot(&mut self, index: u32, entry: BlockEntry) {
        self[index as usize] = entry;
    }
}
