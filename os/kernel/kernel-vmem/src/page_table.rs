//! # Page Table
//!
//! All four levels share one layout: 512 eight-byte entries in a 4 KiB-aligned
//! frame. Which level a table belongs to is implied by the walk, not stored.

use crate::PageEntryBits;
use kernel_memory_addresses::ENTRIES_PER_TABLE;

#[doc(alias = "PML4")]
#[doc(alias = "PDPT")]
#[doc(alias = "PD")]
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// Clears every entry. Fresh tables must be zeroed before they are linked.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    #[inline]
    pub fn set(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        self.entries[index] = PageEntryBits::new();
    }

    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntryBits {
        &mut self.entries[index]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    /// `(index, entry)` for every present entry.
    pub fn present(&self) -> impl Iterator<Item = (usize, PageEntryBits)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.present())
    }
}
