//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel memory manager.
//!
//! ## What you get
//! - [`PageEntryBits`], a bitfield view of one table entry, with the kernel's
//!   protection presets.
//! - A 4 KiB-aligned [`PageTable`] shared by all four levels.
//! - A [`Mapper`] that creates, looks up and removes 4 KiB mappings in a
//!   PML4-rooted tree and keeps [`PageTableStats`].
//! - A [`TempWindow`] for briefly reaching physical frames that are not
//!   otherwise mapped.
//! - The seams the mapper is generic over: [`FrameAlloc`] (where table frames
//!   come from), [`PhysMapper`] (how the kernel touches a physical frame),
//!   [`TlbFlush`] (how stale translations are dropped) and [`VirtMapper`]
//!   (how allocator metadata at virtual addresses is reached).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   maps one 4 KiB page
//!   │        │        └────────────► PDE   points to a PT
//!   │        └─────────────────────► PDPTE points to a PD
//!   └──────────────────────────────► PML4E points to a PDPT
//! ```
//!
//! Large pages are never created: every leaf lives in a PT. Bits 63‒48 of a
//! canonical address repeat bit 47; the mapper only ever sees canonical
//! addresses built through [`VirtualAddress`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mapper;
mod page_entry;
mod page_table;
mod sections;
mod stats;
mod temp_window;
mod tlb;
mod virt;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::mapper::{MapError, MapSource, Mapped, Mapper};
pub use crate::page_entry::PageEntryBits;
pub use crate::page_table::PageTable;
pub use crate::sections::{map_kernel_image, section_protection};
pub use crate::stats::PageTableStats;
pub use crate::temp_window::{MappedFrames, TempWindow};
pub use crate::tlb::{HardwareTlb, TlbFlush};
pub use crate::virt::{ActiveSpace, VirtMapper, WalkingVirtMapper};

use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, TableLevel, VirtualAddress};

/// Source of **physical** 4 KiB frames for page tables.
///
/// The implementation decides where frames come from (bootstrap bitmap,
/// buddy allocator, a test pool). Returned frames **must** be 4 KiB aligned.
pub trait FrameAlloc {
    /// Returns `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Gives a frame obtained from [`alloc_4k`](Self::alloc_4k) back.
    ///
    /// Allocators that cannot reclaim (the bootstrap bitmap after handoff, bump
    /// allocators) keep the default, which leaks.
    fn free_4k(&mut self, _pa: PhysicalAddress) {}
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, pa: PhysicalAddress) {
        (**self).free_4k(pa);
    }
}

/// Converts physical addresses to usable references in the current address
/// space (identity map, higher-half direct map, or a test RAM buffer).
pub trait PhysMapper {
    /// # Safety
    /// - `pa` must be backed by memory the mapper can reach, writable for `&mut T`.
    /// - The mapping must outlive `'a`.
    /// - `T` must match the bytes at `pa` and the caller must not create aliases.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Physical memory reached through the higher-half direct map.
#[derive(Copy, Clone, Debug)]
pub struct HhdmPhysMapper {
    base: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { base }
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new(HHDM_BASE)
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = VirtualAddress::new(self.base + pa.as_u64());
        unsafe { &mut *va.as_mut_ptr::<T>() }
    }
}

/// Reference to the page table stored in frame `pa`.
///
/// # Safety
/// `pa` must be a 4 KiB frame holding a page table, reachable through `m`.
#[inline]
pub(crate) unsafe fn table<'a, M: PhysMapper + ?Sized>(m: &M, pa: PhysicalAddress) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(pa) }
}

/// Entry `index` of the table in frame `pa`, read with a single atomic load.
///
/// Only this entry is borrowed, so a walk can run next to a [`Mapper`] writing
/// other entries of the same table.
///
/// # Safety
/// `pa` must be a 4 KiB frame holding a page table, reachable through `m`.
#[inline]
unsafe fn load_entry<M: PhysMapper + ?Sized>(m: &M, pa: PhysicalAddress, index: usize) -> PageEntryBits {
    let word: &AtomicU64 = unsafe { m.phys_to_mut::<AtomicU64>(pa + (index * 8) as u64) };
    PageEntryBits::from_bits(word.load(Ordering::Acquire))
}

/// Software walk of the tree rooted at `root`. Includes the page offset.
pub(crate) fn walk<M: PhysMapper + ?Sized>(
    phys: &M,
    root: PhysicalAddress,
    va: VirtualAddress,
) -> Option<PhysicalAddress> {
    let ix = VirtualAddress::new_canonical(va.as_u64())?.indices();
    let mut frame = root;
    for level in TableLevel::WALK {
        // Safety: `root` and every present link below it are page tables.
        let entry = unsafe { load_entry(phys, frame, ix.at(level)) };
        if !entry.present() {
            return None;
        }
        frame = entry.frame();
    }
    Some(frame + ix.offset as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAlloc, RecordingTlb, TestPhys};

    #[test]
    fn walk_adds_page_offset() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(0, 16);
        let tlb = RecordingTlb::default();
        let mut mapper = Mapper::create(&phys, &tlb, &mut alloc).expect("root");

        let va = VirtualAddress::new(0xffff_8880_0020_3000);
        let pa = PhysicalAddress::new(0xF000);
        mapper
            .map_frame(va, pa, PageEntryBits::kernel_rw(), &mut alloc)
            .expect("map");

        assert_eq!(
            walk(&phys, mapper.root(), va + 0x42),
            Some(PhysicalAddress::new(0xF042))
        );
        assert_eq!(walk(&phys, mapper.root(), va + 4096), None);
    }

    #[test]
    fn walk_runs_beside_a_mapper_growing_the_same_tables() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64);
        let tlb = RecordingTlb::default();
        let mut mapper = Mapper::create(&phys, &tlb, &mut alloc).expect("root");

        let va = VirtualAddress::new(0xffff_8880_0020_3000);
        let pa = PhysicalAddress::new(0xF000);
        mapper
            .map_frame(va, pa, PageEntryBits::kernel_rw(), &mut alloc)
            .expect("map");
        let root = mapper.root();

        std::thread::scope(|s| {
            s.spawn(|| {
                // Neighbouring PDs and PTs under the same PML4 and PDPT entries.
                for i in 1..32u64 {
                    let other = VirtualAddress::new(0xffff_8880_0020_3000 + i * (2 << 20));
                    mapper
                        .map_frame(other, PhysicalAddress::new(0x10_0000 + i * 4096), PageEntryBits::kernel_rw(), &mut alloc)
                        .expect("map neighbour");
                }
            });
            s.spawn(|| {
                for _ in 0..10_000 {
                    assert_eq!(walk(&phys, root, va + 8), Some(PhysicalAddress::new(0xF008)));
                }
            });
        });
        assert_eq!(mapper.stats().frames, 32);
    }

    #[test]
    fn hhdm_mapper_offsets_by_base() {
        let m = HhdmPhysMapper::default();
        assert_eq!(m.base(), HHDM_BASE);
        assert_eq!(HhdmPhysMapper::new(0x1000).base(), 0x1000);
    }
}
