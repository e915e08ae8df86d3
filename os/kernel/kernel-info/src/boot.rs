//! # Boot Inputs
//!
//! What the loader tells the memory manager: the raw physical memory map and
//! where the kernel image's sections ended up in physical memory.

use crate::memory::{KERNEL_BASE, PAGE_SIZE, PHYS_LOAD};
use kernel_memory_addresses::{FrameNumber, PhysicalAddress, VirtualAddress};

/// Classification of a memory map region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionType {
    /// Free RAM, usable once the loader is done.
    Conventional,
    /// Firmware or otherwise reserved.
    Reserved,
    /// ACPI tables; reclaimable but kept as reserved here.
    AcpiReclaimable,
    /// Memory-mapped I/O.
    Mmio,
}

/// One `(base, length, type)` triple of the boot memory map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MmapEntry {
    pub base: u64,
    pub length: u64,
    pub ty: RegionType,
}

impl MmapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, ty: RegionType) -> Self {
        Self { base, length, ty }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.ty, RegionType::Conventional)
    }

    /// Whole frames fully inside the region, as a half-open pfn range.
    #[must_use]
    pub const fn usable_frames(&self) -> (FrameNumber, FrameNumber) {
        let first = self.base.div_ceil(PAGE_SIZE);
        let end = self.end() / PAGE_SIZE;
        if end > first {
            (FrameNumber::new(first), FrameNumber::new(end))
        } else {
            (FrameNumber::new(first), FrameNumber::new(first))
        }
    }
}

/// Half-open physical byte range.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysRange {
    pub start: u64,
    pub end: u64,
}

impl PhysRange {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.start && pa.as_u64() < self.end
    }

    /// Whether any byte of frame `pfn` lies inside the range.
    #[must_use]
    pub const fn overlaps_frame(&self, pfn: FrameNumber) -> bool {
        let base = pfn.base().as_u64();
        base < self.end && base + PAGE_SIZE > self.start
    }

    /// Frames touched by the range, as a half-open pfn range.
    #[must_use]
    pub const fn frames(&self) -> (FrameNumber, FrameNumber) {
        (
            FrameNumber::new(self.start / PAGE_SIZE),
            FrameNumber::new(self.end.div_ceil(PAGE_SIZE)),
        )
    }
}

/// Physical placement of the kernel image sections.
///
/// `text` is mapped read-only and executable, `rodata` read-only and
/// non-executable, and `data` (data, bss and the boot stack) writable and
/// non-executable. All three lie inside `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelImage {
    pub text: PhysRange,
    pub rodata: PhysRange,
    pub data: PhysRange,
}

impl KernelImage {
    #[must_use]
    pub const fn start(&self) -> u64 {
        let a = if self.text.start < self.rodata.start { self.text.start } else { self.rodata.start };
        if a < self.data.start { a } else { self.data.start }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        let a = if self.text.end > self.rodata.end { self.text.end } else { self.rodata.end };
        if a > self.data.end { a } else { self.data.end }
    }

    /// The whole image, page-aligned outward.
    #[must_use]
    pub const fn span(&self) -> PhysRange {
        PhysRange::new(
            self.start() / PAGE_SIZE * PAGE_SIZE,
            self.end().div_ceil(PAGE_SIZE) * PAGE_SIZE,
        )
    }

    /// Virtual address the image frame at `pa` executes from.
    #[must_use]
    pub const fn virt_of(pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(KERNEL_BASE + (pa.as_u64() - PHYS_LOAD))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_frames_trim_partial_pages() {
        let e = MmapEntry::new(0x1800, 0x3000, RegionType::Conventional);
        let (first, end) = e.usable_frames();
        assert_eq!((first.as_u64(), end.as_u64()), (2, 4));

        let tiny = MmapEntry::new(0x1800, 0x100, RegionType::Conventional);
        let (first, end) = tiny.usable_frames();
        assert_eq!(first, end);
    }

    #[test]
    fn kernel_image_bounds() {
        let image = KernelImage {
            text: PhysRange::new(0x10_0000, 0x10_3000),
            rodata: PhysRange::new(0x10_3000, 0x10_4800),
            data: PhysRange::new(0x10_5000, 0x10_7000),
        };
        assert_eq!(image.start(), 0x10_0000);
        assert_eq!(image.end(), 0x10_7000);
        assert_eq!(image.span().frames().1.as_u64(), 0x107);
        assert_eq!(
            KernelImage::virt_of(PhysicalAddress::new(0x10_3000)).as_u64(),
            KERNEL_BASE + 0x3000
        );
    }

    #[test]
    fn frame_overlap() {
        let r = PhysRange::new(0xFEE0_0000, 0xFEE0_1000);
        assert!(r.overlaps_frame(FrameNumber::new(0xFEE00)));
        assert!(!r.overlaps_frame(FrameNumber::new(0xFEE01)));
        assert!(!r.overlaps_frame(FrameNumber::new(0xFEDFF)));
    }
}
