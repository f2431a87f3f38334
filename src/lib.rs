//! DMA address-space allocation for IOMMU remapping domains.
//!
//! An [`IovaSpace`] hands out ranges of I/O virtual pages, fills in the
//! translation table the remapping hardware walks, and holds unmapped ranges
//! back until every hardware unit has confirmed their translations are gone.
//!
//! Small, frequent mappings are served by a binary-buddy allocator whose free
//! lists live inside the level-0 table slots themselves. Large, rare mappings
//! come from an interval allocator indexed by two red-black trees, one by
//! address and one by size. Leaf table pages are only obtained when a mapping
//! first touches them.
//!
//! The platform side (table page memory and the invalidation queues of the
//! remapping units) is supplied through the traits in [`hw`].
//!
//! ## Crate features
//!
//! * `std` (default): enables [`CondvarWait`](wait::CondvarWait), which
//!   sleeps blocked mapping requests on a condition variable. Without it the
//!   crate is `no_std` (with `alloc`) and waits spin.

#![doc(html_root_url = "https://docs.rs/iova_space/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_code)]
#![cfg_attr(not(any(feature = "std", test)), no_std)]

extern crate alloc;

pub mod bitmap;
pub mod buddy;
pub mod entry;
pub mod hw;
pub mod interval;
pub mod rbtree;
pub mod reclaim;
pub mod space;
mod stats;
pub mod table;
pub mod wait;


pub use crate::{
    buddy::{BuddyAllocator, CoalescePolicy},
    hw::{InvalidationUnit, PhysPages, TablePageSource},
    interval::IntervalAllocator,
    space::{
        IovaSpace, LargeThresholds, MapOptions, MapSpec, Mapping, ReservedRange, SpaceConfig,
    },
    stats::SpaceStats,
};

/// The error type of translation-table operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    /// The [`TablePageSource`] could not supply a page.
    #[error("no page available for translation tables")]
    OutOfTablePages,
}

/// The error type of [`IovaSpace::reserve`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReserveError {
    /// The range is empty or extends past the end of the space.
    #[error("range {start:#x}+{size:#x} is outside the space")]
    OutOfRange {
        /// First page of the range.
        start: u32,
        /// Length of the range in pages.
        size: u32,
    },

    /// Part of the range is already allocated or reserved.
    #[error("range {start:#x}+{size:#x} overlaps an existing allocation")]
    Overlap {
        /// First page of the range.
        start: u32,
        /// Length of the range in pages.
        size: u32,
    },

    /// An identity window could not be mapped.
    #[error("no page available for translation tables")]
    OutOfTablePages,
}

impl From<TableError> for ReserveError {
    fn from(e: TableError) -> Self {
        match e {
            TableError::OutOfTablePages => ReserveError::OutOfTablePages,
        }
    }
}

/// The error type for [`IovaSpace`] construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    /// The configuration of the space is invalid.
    ///
    /// This variant is returned when the [`SpaceConfig`] parameters are
    /// impossible to satisfy.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The upper table levels or the buddy region's leaf pages could not be
    /// allocated.
    #[error("no page available for translation tables")]
    OutOfTablePages,

    /// A configured reserved window could not be set aside.
    #[error("reserved window: {0}")]
    Reserve(#[from] ReserveError),
}

impl From<TableError> for InitError {
    fn from(e: TableError) -> Self {
        match e {
            TableError::OutOfTablePages => InitError::OutOfTablePages,
        }
    }
}

/// The error type of [`IovaSpace::map`].
///
/// Running out of address space is not an error for [`IovaSpace::map`],
/// which waits for space to be reclaimed instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The request has no pages.
    #[error("empty mapping request")]
    EmptyRequest,

    /// No part of the space that the device can address is large enough for
    /// the request.
    #[error("no addressable range can hold the request")]
    Unaddressable,

    /// The translation table could not grow to hold the mapping.
    #[error("no page available for translation tables")]
    OutOfTablePages,

    /// No suitable range is free right now. Only returned by
    /// [`IovaSpace::try_map`].
    #[error("address space exhausted")]
    Exhausted,
}

impl From<TableError> for MapError {
    fn from(e: TableError) -> Self {
        match e {
            TableError::OutOfTablePages => MapError::OutOfTablePages,
        }
    }
}
