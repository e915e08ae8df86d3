//! # Four-Level Mapper
//!
//! Creates, finds and removes 4 KiB mappings in one PML4-rooted tree.
//!
//! - Intermediate tables are created lazily by [`Mapper::ensure_table`] and are
//!   zeroed before being linked.
//! - Only canonical addresses are mapped. Lookups of a non-canonical address
//!   find nothing.
//! - [`Mapper::map_frame`] is idempotent: an existing leaf is reported, never
//!   replaced.
//! - [`Mapper::unmap_frame`] never creates tables.
//! - Every leaf change is followed by a TLB invalidation of that page.

use crate::{FrameAlloc, PageEntryBits, PageTable, PageTableStats, PhysMapper, TlbFlush, table, walk};
use kernel_memory_addresses::{PageTableIndices, PhysicalAddress, Size4K, TableLevel, VirtualAddress};
use log::{error, info, trace};

const PAGE: u64 = 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory while creating a {0} table")]
    OutOfMemory(TableLevel),
    #[error("temporary window cannot hold {requested} frames")]
    WindowFull { requested: usize },
    #[error("{va:?} already maps {existing:?}")]
    AlreadyMapped { va: VirtualAddress, existing: PhysicalAddress },
}

/// Result of [`Mapper::map_frame`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mapped {
    /// A new leaf was installed.
    New,
    /// The page was already mapped to this frame; nothing changed.
    Existing(PhysicalAddress),
}

/// Where the frames of a range mapping come from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapSource {
    /// Virtual address equals physical address.
    Identity,
    /// Consecutive frames starting at the given physical base.
    Ranged(PhysicalAddress),
}

pub struct Mapper<'m, M: PhysMapper, T: TlbFlush> {
    phys: &'m M,
    tlb: T,
    root: PhysicalAddress,
    stats: PageTableStats,
}

impl<'m, M: PhysMapper, T: TlbFlush> Mapper<'m, M, T> {
    /// Adopts an existing tree. Its pre-existing tables are not counted in [`stats`](Self::stats).
    pub const fn new(phys: &'m M, tlb: T, root: PhysicalAddress) -> Self {
        Self {
            phys,
            tlb,
            root,
            stats: PageTableStats {
                pdpt: 0,
                pd: 0,
                pt: 0,
                frames: 0,
            },
        }
    }

    /// Starts an empty tree with a freshly allocated, zeroed PML4.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if `alloc` has no frame for the root.
    pub fn create<A: FrameAlloc + ?Sized>(phys: &'m M, tlb: T, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc
            .alloc_4k()
            .ok_or(MapError::OutOfMemory(TableLevel::Pml4))?;
        unsafe { table(phys, root) }.zero();
        info!("new PML4 at {root:?}");
        Ok(Self::new(phys, tlb, root))
    }

    #[inline]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    pub const fn stats(&self) -> PageTableStats {
        self.stats
    }

    #[inline]
    pub const fn phys(&self) -> &'m M {
        self.phys
    }

    #[inline]
    pub const fn tlb(&self) -> &T {
        &self.tlb
    }

    #[inline]
    fn table(&self, pa: PhysicalAddress) -> &'m mut PageTable {
        // Safety: every frame reached from `root` is a page table owned by this tree.
        unsafe { table(self.phys, pa) }
    }

    /// The entry for `va` at `level`, if the tables above it exist.
    #[must_use]
    pub fn entry_at(&self, level: TableLevel, va: VirtualAddress) -> Option<PageEntryBits> {
        let ix = VirtualAddress::new_canonical(va.as_u64())?.indices();
        let mut frame = self.root;
        for current in TableLevel::WALK {
            let entry = self.table(frame).get(ix.at(current));
            if current == level {
                return Some(entry);
            }
            if !entry.present() {
                return None;
            }
            frame = entry.frame();
        }
        None
    }

    /// Returns the table `entry` points to, creating a zeroed `level` table if absent.
    ///
    /// A new table is linked with `link`; a present entry keeps its flags.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a new table is needed and `alloc` is exhausted.
    pub fn ensure_table<A: FrameAlloc + ?Sized>(
        &mut self,
        entry: &mut PageEntryBits,
        level: TableLevel,
        link: PageEntryBits,
        alloc: &mut A,
    ) -> Result<PhysicalAddress, MapError> {
        if entry.present() {
            return Ok(entry.frame());
        }
        let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory(level))?;
        self.table(frame).zero();
        *entry = link.with_present(true).with_frame(frame);
        self.stats.table_linked(level);
        trace!("linked {level} table {frame:?}");
        Ok(frame)
    }

    /// Makes sure the PDPT, PD and PT for `va` exist and returns the PT.
    ///
    /// Links are [`PageEntryBits::table_link`]; leaves carry the restrictions.
    pub(crate) fn ensure_path<A: FrameAlloc + ?Sized>(
        &mut self,
        va: VirtualAddress,
        alloc: &mut A,
    ) -> Result<PhysicalAddress, MapError> {
        let ix = va.indices();
        let mut frame = self.root;
        for (level, child) in [
            (TableLevel::Pml4, TableLevel::Pdpt),
            (TableLevel::Pdpt, TableLevel::Pd),
            (TableLevel::Pd, TableLevel::Pt),
        ] {
            let entry = self.table(frame).entry_mut(ix.at(level));
            frame = self.ensure_table(entry, child, PageEntryBits::table_link(), alloc)?;
        }
        Ok(frame)
    }

    /// The PT covering `va`, without creating anything.
    fn leaf_table(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pd_entry = self.entry_at(TableLevel::Pd, va)?;
        pd_entry.present().then(|| pd_entry.frame())
    }

    /// Maps the 4 KiB page at `va` to `pa` with leaf flags `prot`.
    ///
    /// If a leaf is already present, returns [`Mapped::Existing`] with the frame
    /// it points to and leaves it untouched.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when an intermediate table cannot be allocated.
    ///
    /// # Panics
    /// If either address is not 4 KiB aligned, or `va` is not canonical.
    pub fn map_frame<A: FrameAlloc + ?Sized>(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: PageEntryBits,
        alloc: &mut A,
    ) -> Result<Mapped, MapError> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            error!("map_frame: misaligned {va:?} -> {pa:?}");
            panic!("map_frame: misaligned {va:?} -> {pa:?}");
        }
        let Some(va) = VirtualAddress::new_canonical(va.as_u64()) else {
            error!("map_frame: non-canonical {va:?} -> {pa:?}");
            panic!("map_frame: non-canonical {va:?}");
        };

        let pt = self.ensure_path(va, alloc)?;
        let leaf = self.table(pt).entry_mut(va.indices().pt);
        let outcome = if leaf.present() {
            Mapped::Existing(leaf.frame())
        } else {
            *leaf = prot.with_present(true).with_frame(pa);
            self.stats.leaf_mapped();
            Mapped::New
        };
        self.tlb.invalidate_page(va);
        Ok(outcome)
    }

    /// Removes the leaf for `va` and returns the frame it mapped.
    ///
    /// `None` if any level on the way is absent; nothing is created or changed then.
    pub fn unmap_frame(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pt = self.leaf_table(va)?;
        let leaf = self.table(pt).entry_mut(va.indices().pt);
        if !leaf.present() {
            return None;
        }
        let pa = leaf.frame();
        *leaf = PageEntryBits::new();
        self.stats.leaf_unmapped();
        self.tlb.invalidate_page(va.align_down::<Size4K>());
        Some(pa)
    }

    /// Physical address `va` translates to, including the page offset.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        walk(self.phys, self.root, va)
    }

    /// Maps `pages` consecutive pages starting at `start` to frames taken from `source`.
    ///
    /// `prot` picks the leaf flags per physical frame, which lets the kernel
    /// image get per-section protections.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when page tables cannot be allocated. Pages mapped
    /// before the failure stay mapped.
    ///
    /// # Panics
    /// If any page in the range is already mapped.
    pub fn map_range<A, F>(
        &mut self,
        start: VirtualAddress,
        pages: u64,
        source: MapSource,
        mut prot: F,
        alloc: &mut A,
    ) -> Result<u64, MapError>
    where
        A: FrameAlloc + ?Sized,
        F: FnMut(PhysicalAddress) -> PageEntryBits,
    {
        let mut pa = match source {
            MapSource::Identity => PhysicalAddress::new(start.as_u64()),
            MapSource::Ranged(base) => base,
        };
        for i in 0..pages {
            let va = start + i * PAGE;
            if let Mapped::Existing(old) = self.map_frame(va, pa, prot(pa), alloc)? {
                error!("map_range: {va:?} already maps {old:?}");
                panic!("map_range: double mapping at {va:?} (have {old:?}, want {pa:?})");
            }
            pa += PAGE;
        }
        trace!("mapped {pages} pages at {start:?} from {source:?}");
        Ok(pages)
    }

    /// Calls `f` for every present leaf, in ascending table order.
    pub fn for_each_leaf(&self, mut f: impl FnMut(VirtualAddress, PageEntryBits)) {
        for (i4, e4) in self.table(self.root).present() {
            for (i3, e3) in self.table(e4.frame()).present() {
                for (i2, e2) in self.table(e3.frame()).present() {
                    for (i1, e1) in self.table(e2.frame()).present() {
                        let va = VirtualAddress::from_indices(PageTableIndices {
                            pml4: i4,
                            pdpt: i3,
                            pd: i2,
                            pt: i1,
                            offset: 0,
                        });
                        f(va, e1);
                    }
                }
            }
        }
    }

    /// Logs every leaf in `[start, end)` and returns how many there were.
    pub fn dump(&self, start: VirtualAddress, end: VirtualAddress) -> usize {
        let mut count = 0;
        self.for_each_leaf(|va, entry| {
            if va >= start && va < end {
                info!("{va:?} -> {entry}");
                count += 1;
            }
        });
        info!(
            "{count} leaves in [{start:?}, {end:?}); tables pdpt={} pd={} pt={} frames={}",
            self.stats.pdpt, self.stats.pd, self.stats.pt, self.stats.frames
        );
        count
    }

    /// Drops everything below PML4 slot `slot`, returning the table frames to `alloc`.
    pub(crate) fn release_slot<A: FrameAlloc + ?Sized>(&mut self, slot: usize, alloc: &mut A) {
        let root = self.table(self.root);
        let e4 = root.get(slot);
        if !e4.present() {
            return;
        }
        for (i3, e3) in self.table(e4.frame()).present() {
            for (i2, e2) in self.table(e3.frame()).present() {
                for (i1, _) in self.table(e2.frame()).present() {
                    self.tlb.invalidate_page(VirtualAddress::from_indices(PageTableIndices {
                        pml4: slot,
                        pdpt: i3,
                        pd: i2,
                        pt: i1,
                        offset: 0,
                    }));
                    self.stats.leaf_unmapped();
                }
                alloc.free_4k(e2.frame());
                self.stats.table_unlinked(TableLevel::Pt);
            }
            alloc.free_4k(e3.frame());
            self.stats.table_unlinked(TableLevel::Pd);
        }
        alloc.free_4k(e4.frame());
        self.stats.table_unlinked(TableLevel::Pdpt);
        root.clear(slot);
    }

    /// Writes leaf `index` of the PT at `pt` directly. The caller knows the PT exists.
    pub(crate) fn set_leaf(&mut self, pt: PhysicalAddress, index: usize, va: VirtualAddress, entry: PageEntryBits) {
        let leaf = self.table(pt).entry_mut(index);
        match (leaf.present(), entry.present()) {
            (false, true) => self.stats.leaf_mapped(),
            (true, false) => self.stats.leaf_unmapped(),
            _ => {}
        }
        *leaf = entry;
        self.tlb.invalidate_page(va);
    }
}
