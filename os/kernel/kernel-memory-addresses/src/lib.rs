//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the paging and
//! allocation code.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory or MMIO space. |
//! | [`FrameNumber`] | A physical 4 KiB frame number (pfn). |
//! | [`VirtualAddress`] | A byte address in the (single) kernel address space. |
//! | [`PageTableIndices`] | The four table indices plus the page offset of a [`VirtualAddress`]. |
//!
//! Page sizes are modelled as marker types implementing [`PageSize`]; only
//! [`Size4K`] is ever mapped, [`Size2M`] describes page-directory coverage.
//!
//! ## Address decomposition
//!
//! ```text
//! | 63‒48 | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  sign |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! [`VirtualAddress::indices`] does the bit slicing once; page-table code only
//! ever works with the resulting plain indices.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! let ix = va.indices();
//! assert_eq!(ix.pml4, 511);
//! assert_eq!(ix.offset, 0x234);
//! assert_eq!(VirtualAddress::from_indices(ix), va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod frame_number;
mod indices;
mod page_size;
mod physical_address;
mod virtual_address;

pub use frame_number::FrameNumber;
pub use indices::{ENTRIES_PER_TABLE, PageTableIndices, TableLevel};
pub use page_size::{PageSize, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;
