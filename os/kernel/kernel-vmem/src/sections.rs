//! Kernel image remapping with per-section protections.

use crate::{FrameAlloc, MapError, MapSource, Mapper, PageEntryBits, PhysMapper, TlbFlush};
use kernel_info::boot::KernelImage;
use kernel_memory_addresses::{FrameNumber, PhysicalAddress};
use log::info;

/// Leaf flags for the image frame at `pa`.
///
/// Read-only data is `RO+NX`, text is `RX`, everything else (data, bss, stack)
/// is `RW+NX`.
#[must_use]
pub const fn section_protection(image: &KernelImage, pa: PhysicalAddress) -> PageEntryBits {
    if image.rodata.contains(pa) {
        PageEntryBits::kernel_ro()
    } else if image.text.contains(pa) {
        PageEntryBits::kernel_rx()
    } else {
        PageEntryBits::kernel_rw()
    }
}

/// Maps every frame of the image at its link address.
///
/// # Errors
/// [`MapError::OutOfMemory`] when page tables cannot be allocated.
pub fn map_kernel_image<M, T, A>(
    mapper: &mut Mapper<'_, M, T>,
    image: &KernelImage,
    alloc: &mut A,
) -> Result<u64, MapError>
where
    M: PhysMapper,
    T: TlbFlush,
    A: FrameAlloc + ?Sized,
{
    let span = image.span();
    let base = PhysicalAddress::new(span.start);
    let pages = FrameNumber::count_for(span.len());
    let mapped = mapper.map_range(
        KernelImage::virt_of(base),
        pages,
        MapSource::Ranged(base),
        |pa| section_protection(image, pa),
        alloc,
    )?;
    info!("kernel image: {mapped} pages at {:?}", KernelImage::virt_of(base));
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAlloc, RecordingTlb, TestPhys};
    use kernel_info::boot::PhysRange;
    use kernel_info::memory::{KERNEL_BASE, PHYS_LOAD};
    use kernel_memory_addresses::VirtualAddress;

    fn image() -> KernelImage {
        KernelImage {
            text: PhysRange::new(PHYS_LOAD, PHYS_LOAD + 0x2000),
            rodata: PhysRange::new(PHYS_LOAD + 0x2000, PHYS_LOAD + 0x3000),
            data: PhysRange::new(PHYS_LOAD + 0x3000, PHYS_LOAD + 0x4800),
        }
    }

    #[test]
    fn sections_get_their_own_protection() {
        let img = image();
        let text = section_protection(&img, PhysicalAddress::new(PHYS_LOAD + 0x1000));
        let ro = section_protection(&img, PhysicalAddress::new(PHYS_LOAD + 0x2000));
        let rw = section_protection(&img, PhysicalAddress::new(PHYS_LOAD + 0x4000));
        assert!(!text.writable() && !text.no_execute());
        assert!(!ro.writable() && ro.no_execute());
        assert!(rw.writable() && rw.no_execute());
    }

    #[test]
    fn image_is_mapped_at_its_link_address() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(0, 16);
        let tlb = RecordingTlb::default();
        let mut mapper = Mapper::create(&phys, &tlb, &mut alloc).expect("root");

        let pages = map_kernel_image(&mut mapper, &image(), &mut alloc).expect("image");
        assert_eq!(pages, 5);
        assert_eq!(mapper.stats().frames, 5);

        let data = VirtualAddress::new(KERNEL_BASE + 0x4010);
        assert_eq!(mapper.translate(data), Some(PhysicalAddress::new(PHYS_LOAD + 0x4010)));
        let leaf = mapper
            .entry_at(kernel_memory_addresses::TableLevel::Pt, VirtualAddress::new(KERNEL_BASE))
            .expect("leaf");
        assert!(leaf.present() && leaf.global_translation() && !leaf.writable());
    }
}
