//! Typed decomposition of a 48-bit virtual address into paging indices.

use crate::VirtualAddress;
use core::fmt;

/// Entries per page table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Bits consumed by each table level.
const INDEX_BITS: u32 = 9;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const OFFSET_BITS: u32 = 12;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// One of the four paging levels, outermost first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl TableLevel {
    /// All levels in walk order.
    pub const WALK: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Lowest address bit of this level's index field.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes covered by a single entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// The table level an entry at this level points to, if any.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Index into this level's table for `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & INDEX_MASK) as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        }
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four table indices and the page offset of a virtual address.
///
/// Every index is below [`ENTRIES_PER_TABLE`] and the offset is below 4096.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_8880_0020_3042);
/// let ix = va.indices();
/// assert_eq!((ix.pml4, ix.pdpt, ix.pd, ix.pt, ix.offset), (273, 0, 1, 3, 0x42));
/// assert_eq!(VirtualAddress::from_indices(ix), va);
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PageTableIndices {
    pub pml4: usize,
    pub pdpt: usize,
    pub pd: usize,
    pub pt: usize,
    pub offset: usize,
}

impl PageTableIndices {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress) -> Self {
        Self {
            pml4: TableLevel::Pml4.index_of(va),
            pdpt: TableLevel::Pdpt.index_of(va),
            pd: TableLevel::Pd.index_of(va),
            pt: TableLevel::Pt.index_of(va),
            offset: (va.as_u64() & OFFSET_MASK) as usize,
        }
    }

    /// Index for the given level.
    #[inline]
    #[must_use]
    pub const fn at(&self, level: TableLevel) -> usize {
        match level {
            TableLevel::Pml4 => self.pml4,
            TableLevel::Pdpt => self.pdpt,
            TableLevel::Pd => self.pd,
            TableLevel::Pt => self.pt,
        }
    }

    /// Reassembles the raw 48-bit address (without sign extension).
    #[must_use]
    pub const fn to_raw(&self) -> u64 {
        debug_assert!(self.pml4 < ENTRIES_PER_TABLE && self.pdpt < ENTRIES_PER_TABLE);
        debug_assert!(self.pd < ENTRIES_PER_TABLE && self.pt < ENTRIES_PER_TABLE);
        ((self.pml4 as u64) << 39)
            | ((self.pdpt as u64) << 30)
            | ((self.pd as u64) << 21)
            | ((self.pt as u64) << 12)
            | (self.offset as u64 & OFFSET_MASK)
    }
}
