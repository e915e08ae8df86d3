//! # Physical Page Allocator
//!
//! The page-frame vector and both zones behind one lock. Blocks are handed out
//! in orders of frames from a chosen zone.

use crate::bootmem::BootMem;
use crate::error::AllocError;
use crate::frame::{PageFrame, ZoneId};
use crate::zone::{PAGE_ORDERS, Zone, ZoneArena, ZoneStats, init_zones, populate_from_bitmap, zone_for};
use core::slice;
use kernel_info::config::MemoryConfig;
use kernel_info::memory::{MAX_ORDER, PAGE_SIZE};
use kernel_memory_addresses::{FrameNumber, PhysicalAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{error, info, trace, warn};

pub(crate) struct Node<'m> {
    frames: &'m mut [PageFrame],
    zones: [Zone; 2],
}

pub struct PageAllocator<'m> {
    node: SpinLock<Node<'m>>,
}

impl<'m> PageAllocator<'m> {
    /// Builds the page-frame vector and zones, retiring the bootstrap allocator.
    ///
    /// The vector is carved from bootstrap memory first, so its own frames are
    /// accounted as used.
    ///
    /// # Panics
    /// If the bootstrap allocator cannot hold the vector.
    pub fn from_bootmem<M: PhysMapper>(mut boot: BootMem<'m, M>, config: &MemoryConfig) -> Self {
        let max_pfn = boot.max_pfn();
        let bytes = max_pfn * size_of::<PageFrame>() as u64;
        let base = boot.alloc(bytes);

        // Safety: freshly handed out by the bootstrap allocator, reserved in its
        // bitmap and exclusively owned from here on.
        #[allow(clippy::cast_possible_truncation)]
        let frames = unsafe {
            let first = boot.phys().phys_to_mut::<PageFrame>(base);
            slice::from_raw_parts_mut(core::ptr::from_mut(first), max_pfn as usize)
        };

        let mut zones = init_zones(max_pfn, config.dma_limit);
        let dma_end = zones[ZoneId::Dma.index()].end_pfn;
        for (pfn, frame) in frames.iter_mut().enumerate() {
            *frame = PageFrame::reserved(zone_for(FrameNumber::new(pfn as u64), dma_end));
        }
        populate_from_bitmap(frames, &mut zones, &boot, config.hardware_windows);
        info!("page allocator: frame vector at {base:?}, {bytes} bytes");

        Self {
            node: SpinLock::new(Node { frames, zones }),
        }
    }

    /// Allocates `1 << order` contiguous frames from `zone`.
    ///
    /// # Errors
    /// - [`AllocError::OrderTooLarge`] above `MAX_ORDER`, without touching the lists.
    /// - [`AllocError::OutOfMemory`] if the zone has no block that large.
    pub fn alloc_pages(&self, zone: ZoneId, order: usize) -> Result<PhysicalAddress, AllocError> {
        if order > MAX_ORDER {
            warn!("alloc_pages: order {order} above {MAX_ORDER}");
            return Err(AllocError::OrderTooLarge { order, max: MAX_ORDER });
        }
        self.node.with_lock(|node| node.alloc(zone, order))
    }

    /// Returns a block obtained from [`alloc_pages`](Self::alloc_pages).
    ///
    /// # Panics
    /// If `pa` is not the head of an allocated block.
    pub fn free_pages(&self, pa: PhysicalAddress) {
        self.node.with_lock(|node| node.free(pa));
    }

    #[must_use]
    pub fn free_pages_in(&self, zone: ZoneId) -> u64 {
        self.node.with_lock(|node| node.zones[zone.index()].free_pages)
    }

    #[must_use]
    pub fn zone_stats(&self, zone: ZoneId) -> ZoneStats {
        self.node.with_lock(|node| node.zones[zone.index()].stats())
    }

    /// Blocks per order on the free lists of `zone`.
    #[must_use]
    pub fn free_list_counts(&self, zone: ZoneId) -> [usize; PAGE_ORDERS] {
        self.zone_stats(zone).blocks_per_order
    }

    /// Descriptor of frame `pfn`, if it exists.
    #[must_use]
    pub fn frame(&self, pfn: FrameNumber) -> Option<PageFrame> {
        self.node.with_lock(|node| node.frames.get(pfn.as_usize()).copied())
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.node.with_lock(|node| node.frames.len())
    }

    /// Frame source for page tables: zone NORMAL, then DMA.
    #[must_use]
    pub const fn table_frames(&self) -> TableFrames<'_, 'm> {
        TableFrames(self)
    }

    /// Logs every zone and returns the numbers.
    pub fn dump_zones(&self) -> [ZoneStats; 2] {
        let stats = ZoneId::ALL.map(|z| self.zone_stats(z));
        for s in &stats {
            info!(
                "zone {}: pfn {:#x}..{:#x}, {} free pages",
                s.id, s.start_pfn, s.end_pfn, s.free_pages
            );
        }
        stats
    }

    /// Logs the free-list occupancy of every zone.
    pub fn dump_free_lists(&self) -> [ZoneStats; 2] {
        let stats = ZoneId::ALL.map(|z| self.zone_stats(z));
        for s in &stats {
            info!("zone {} free lists:", s.id);
            for (order, &n) in s.blocks_per_order.iter().enumerate() {
                if n > 0 {
                    info!("  order {order:2}: {n} blocks ({} pages)", n << order);
                }
            }
        }
        stats
    }

    #[cfg(test)]
    pub(crate) fn with_node<R>(&self, f: impl FnOnce(&mut Node<'m>) -> R) -> R {
        self.node.with_lock(f)
    }
}

impl Node<'_> {
    fn alloc(&mut self, zone: ZoneId, order: usize) -> Result<PhysicalAddress, AllocError> {
        let count = 1usize << order;
        loop {
            let z = &mut self.zones[zone.index()];
            let index = z.areas.find(&mut ZoneArena { frames: &mut *self.frames }, order)?;
            let block = &mut self.frames[index..index + count];

            let bad = block.iter().filter(|f| !f.is_allocatable()).count();
            if bad == 0 {
                for f in block.iter_mut() {
                    f.flags = f.flags.with_free(false).with_used(true);
                }
                block[0].flags.set_head(true);
                block[0].order = order_byte(order);
                z.free_pages -= count as u64;
                let pa = FrameNumber::new(index as u64).base();
                trace!("alloc_pages: {zone} order {order} -> {pa:?}");
                return Ok(pa);
            }

            // Metadata says free, frames disagree. Keep the good frames, drop
            // the bad ones from the lists and try again.
            error!("alloc_pages: block pfn {index:#x} order {order} has {bad} frames in use");
            for i in index..index + count {
                if self.frames[i].is_allocatable() {
                    z.areas.insert(&mut ZoneArena { frames: &mut *self.frames }, i, 0);
                }
            }
            z.free_pages -= bad as u64;
        }
    }

    fn free(&mut self, pa: PhysicalAddress) {
        let index = pa.frame().as_usize();
        let head = self.frames.get(index).copied();
        let Some(head) = head.filter(|f| f.flags.head() && f.flags.used() && pa.page_offset() == 0) else {
            error!("free_pages: {pa:?} is not an allocated block");
            panic!("free_pages: {pa:?} is not the head of an allocated block");
        };

        let order = usize::from(head.order);
        let count = 1usize << order;
        for f in &mut self.frames[index..index + count] {
            f.flags = f.flags.with_used(false).with_head(false).with_free(true);
        }
        let z = &mut self.zones[head.zone().index()];
        z.free_pages += count as u64;
        z.areas.insert(&mut ZoneArena { frames: &mut *self.frames }, index, order);
        trace!("free_pages: {pa:?} order {order}");
    }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn order_byte(order: usize) -> u8 {
    order as u8
}

/// [`FrameAlloc`] over a [`PageAllocator`], used for page tables after the handoff.
pub struct TableFrames<'a, 'm>(&'a PageAllocator<'m>);

impl FrameAlloc for TableFrames<'_, '_> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.0
            .alloc_pages(ZoneId::Normal, 0)
            .or_else(|_| self.0.alloc_pages(ZoneId::Dma, 0))
            .ok()
    }

    fn free_4k(&mut self, pa: PhysicalAddress) {
        self.0.free_pages(pa);
    }
}

const _: () = assert!(PAGE_SIZE == 4096);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFlags;
    use crate::test_util::{Machine, xorshift};
    use kernel_info::boot::{MmapEntry, PhysRange, RegionType};
    use kernel_info::hardware::HardwareWindow;

    /// A node whose zones hold nothing, for hand-built free lists.
    fn empty_allocator(m: &Machine) -> PageAllocator<'_> {
        let alloc = m.page_allocator();
        alloc.with_node(|node| {
            for z in &mut node.zones {
                while let Ok(i) = z.areas.find(&mut ZoneArena { frames: &mut *node.frames }, 0) {
                    node.frames[i].flags = FrameFlags::new().with_used(true);
                }
                z.free_pages = 0;
            }
        });
        alloc
    }

    /// Puts the 32 frames at `base` onto `zone` as one order-5 block.
    fn seed_order_five(alloc: &PageAllocator<'_>, zone: ZoneId, base: usize) {
        alloc.with_node(|node| {
            for f in &mut node.frames[base..base + 32] {
                f.flags = FrameFlags::new().with_free(true).with_present(true);
            }
            let z = &mut node.zones[zone.index()];
            z.areas.insert(&mut ZoneArena { frames: &mut *node.frames }, base, 5);
            z.free_pages += 32;
        });
    }

    #[test]
    fn one_order_five_block_splits_into_one_block_per_order() {
        let m = Machine::new(1024);
        let alloc = empty_allocator(&m);
        seed_order_five(&alloc, ZoneId::Normal, 512);

        let pa = alloc.alloc_pages(ZoneId::Normal, 0).expect("frame");
        assert_eq!(pa, FrameNumber::new(512).base());
        assert_eq!(alloc.free_pages_in(ZoneId::Normal), 31);
        let counts = alloc.free_list_counts(ZoneId::Normal);
        assert_eq!(&counts[..6], &[1, 1, 1, 1, 1, 0]);
        assert!(counts[6..].iter().all(|&n| n == 0));
    }

    #[test]
    fn buddies_freed_in_either_order_merge() {
        for flip in [false, true] {
            let m = Machine::new(1024);
            let alloc = empty_allocator(&m);
            seed_order_five(&alloc, ZoneId::Normal, 512);
            let a = alloc.alloc_pages(ZoneId::Normal, 0).expect("a");
            let b = alloc.alloc_pages(ZoneId::Normal, 0).expect("b");
            assert_eq!(b.as_u64() - a.as_u64(), 4096);

            let (x, y) = if flip { (b, a) } else { (a, b) };
            alloc.free_pages(x);
            alloc.free_pages(y);
            let counts = alloc.free_list_counts(ZoneId::Normal);
            assert_eq!(counts[5], 1, "everything merged back");
            assert_eq!(counts[0], 0);
        }
    }

    #[test]
    fn pair_of_order_zero_buddies_becomes_one_order_one_block() {
        let m = Machine::new(1024);
        let alloc = empty_allocator(&m);
        alloc.with_node(|node| {
            for f in &mut node.frames[600..602] {
                f.flags = FrameFlags::new().with_used(true).with_head(true);
            }
        });
        alloc.free_pages(FrameNumber::new(601).base());
        alloc.free_pages(FrameNumber::new(600).base());
        let counts = alloc.free_list_counts(ZoneId::Normal);
        assert_eq!((counts[0], counts[1]), (0, 1));
        assert_eq!(alloc.free_pages_in(ZoneId::Normal), 2);
    }

    #[test]
    fn order_above_max_is_refused_without_scanning() {
        let m = Machine::new(1024);
        let alloc = m.page_allocator();
        let before = alloc.zone_stats(ZoneId::Normal);
        assert_eq!(
            alloc.alloc_pages(ZoneId::Normal, MAX_ORDER + 1),
            Err(AllocError::OrderTooLarge {
                order: MAX_ORDER + 1,
                max: MAX_ORDER
            })
        );
        assert_eq!(alloc.zone_stats(ZoneId::Normal), before);
    }

    #[test]
    fn populate_classifies_frames() {
        let m = Machine::new(1024);
        let alloc = m.page_allocator();

        let zero = alloc.frame(FrameNumber::new(0)).expect("pfn 0");
        assert!(zero.flags.used() && zero.flags.present() && !zero.flags.free());

        let kernel = alloc.frame(FrameNumber::new(0x100)).expect("kernel");
        assert!(kernel.flags.used());

        let hole = alloc.frame(FrameNumber::new(0xA0)).expect("hole");
        assert!(hole.flags.used() && !hole.flags.present());

        let free = alloc.frame(FrameNumber::new(0x300)).expect("free");
        assert!(free.flags.free() && free.flags.present());

        for z in ZoneId::ALL {
            let s = alloc.zone_stats(z);
            assert_eq!(s.listed_pages(), s.free_pages, "zone {z}");
        }
        assert!(alloc.free_pages_in(ZoneId::Dma) > 0);
        assert!(alloc.free_pages_in(ZoneId::Normal) > 0);
    }

    #[test]
    fn hardware_windows_become_fixed_frames() {
        static WINDOWS: [HardwareWindow; 1] = [HardwareWindow {
            name: "test-mmio",
            range: PhysRange::new(0x30_0000, 0x30_2000),
        }];
        let m = Machine::with_windows(1024, &WINDOWS);
        let alloc = m.page_allocator();

        let f = alloc.frame(FrameNumber::new(0x300)).expect("frame");
        assert!(f.flags.fixmap() && !f.flags.free());
        let f = alloc.frame(FrameNumber::new(0x301)).expect("frame");
        assert!(f.flags.fixmap());
        assert!(alloc.frame(FrameNumber::new(0x302)).expect("frame").flags.free());

        let mut seen = Vec::new();
        while let Ok(pa) = alloc.alloc_pages(ZoneId::Normal, 0) {
            assert!(!(0x30_0000..0x30_2000).contains(&pa.as_u64()), "handed out {pa:?}");
            seen.push(pa);
        }
        assert!(!seen.is_empty());
    }

    #[test]
    fn corrupt_block_is_skipped_and_allocation_retries() {
        let m = Machine::new(1024);
        let alloc = empty_allocator(&m);
        seed_order_five(&alloc, ZoneId::Normal, 512);
        // Frame 515 claims to be in use while its block sits on a free list.
        alloc.with_node(|node| node.frames[515].flags.set_used(true));

        let pa = alloc.alloc_pages(ZoneId::Normal, 2).expect("good block");
        assert_eq!(pa.frame().as_u64(), 516, "first block holding 515 skipped");

        let s = alloc.zone_stats(ZoneId::Normal);
        assert_eq!(s.free_pages, 32 - 1 - 4);
        assert_eq!(s.listed_pages(), s.free_pages);
    }

    #[test]
    #[should_panic(expected = "not the head")]
    fn freeing_a_free_frame_is_fatal() {
        let m = Machine::new(1024);
        let alloc = m.page_allocator();
        alloc.free_pages(FrameNumber::new(0x300).base());
    }

    #[test]
    fn random_traffic_conserves_free_pages() {
        let m = Machine::new(2048);
        let alloc = m.page_allocator();
        let before = ZoneId::ALL.map(|z| alloc.zone_stats(z));
        let mut next = xorshift(7);
        let mut live: Vec<(PhysicalAddress, usize)> = Vec::new();

        for _ in 0..3000 {
            if live.is_empty() || next() % 5 < 3 {
                let order = (next() % 6) as usize;
                let zone = if next() % 4 == 0 { ZoneId::Dma } else { ZoneId::Normal };
                if let Ok(pa) = alloc.alloc_pages(zone, order) {
                    let (s, e) = (pa.as_u64(), pa.as_u64() + (4096 << order));
                    for &(other, o) in &live {
                        let (os, oe) = (other.as_u64(), other.as_u64() + (4096 << o));
                        assert!(e <= os || oe <= s, "overlap {pa:?} / {other:?}");
                    }
                    live.push((pa, order));
                }
            } else {
                let k = (next() as usize) % live.len();
                alloc.free_pages(live.swap_remove(k).0);
            }
        }
        for (pa, _) in live {
            alloc.free_pages(pa);
        }
        for (z, b) in ZoneId::ALL.iter().zip(before) {
            let after = alloc.zone_stats(*z);
            assert_eq!(after.free_pages, b.free_pages);
            assert_eq!(after.listed_pages(), after.free_pages);
        }
    }

    #[test]
    fn table_frames_fall_back_to_dma() {
        let map = [MmapEntry::new(0, 4 * 1024 * 1024, RegionType::Conventional)];
        let mut m = Machine::with_map(1024, &map, &[]);
        m.config.dma_limit = 16 * 1024 * 1024;
        let alloc = m.page_allocator();
        assert_eq!(alloc.free_pages_in(ZoneId::Normal), 0, "all RAM is DMA here");
        let mut frames = alloc.table_frames();
        let pa = frames.alloc_4k().expect("dma frame");
        assert_eq!(alloc.frame(pa.frame()).map(|f| f.zone()), Some(ZoneId::Dma));
        frames.free_4k(pa);
    }
}
