//! # Zones
//!
//! Physical memory is split at the DMA limit:
//!
//! ```text
//! pfn 0                 dma_end                         max_pfn
//!  ├──────── DMA ──────────┼──────────── NORMAL ────────────┤
//! ```
//!
//! Each zone owns the free lists of its frames. Blocks never merge across the
//! split because the arena refuses buddies from another zone.

use crate::bootmem::BootMem;
use crate::buddy::{Arena, BlockMeta, FreeAreas, MAX_ORDERS};
use crate::frame::{FrameFlags, PageFrame, ZoneId, link_of, link_to};
use kernel_info::boot::MmapEntry;
use kernel_info::hardware::HardwareWindow;
use kernel_info::memory::{MAX_ORDER, PAGE_SIZE};
use kernel_memory_addresses::FrameNumber;
use kernel_vmem::PhysMapper;
use log::{debug, info};

/// Orders of the physical allocator, `0..=MAX_ORDER`.
pub const PAGE_ORDERS: usize = MAX_ORDER + 1;

#[derive(Debug)]
pub struct Zone {
    pub id: ZoneId,
    pub start_pfn: u64,
    pub end_pfn: u64,
    pub(crate) free_pages: u64,
    pub(crate) areas: FreeAreas,
}

impl Zone {
    #[must_use]
    pub const fn new(id: ZoneId, start_pfn: u64, end_pfn: u64) -> Self {
        Self {
            id,
            start_pfn,
            end_pfn,
            free_pages: 0,
            areas: FreeAreas::new(PAGE_ORDERS),
        }
    }

    #[must_use]
    pub const fn free_pages(&self) -> u64 {
        self.free_pages
    }

    #[must_use]
    pub const fn contains(&self, pfn: u64) -> bool {
        pfn >= self.start_pfn && pfn < self.end_pfn
    }

    #[must_use]
    pub fn stats(&self) -> ZoneStats {
        let mut blocks_per_order = [0; PAGE_ORDERS];
        blocks_per_order.copy_from_slice(&self.areas.counts()[..PAGE_ORDERS]);
        ZoneStats {
            id: self.id,
            start_pfn: self.start_pfn,
            end_pfn: self.end_pfn,
            free_pages: self.free_pages,
            blocks_per_order,
        }
    }
}

/// Snapshot of one zone for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ZoneStats {
    pub id: ZoneId,
    pub start_pfn: u64,
    pub end_pfn: u64,
    pub free_pages: u64,
    pub blocks_per_order: [usize; PAGE_ORDERS],
}

impl ZoneStats {
    /// Free pages according to the lists; equals `free_pages` while the zone is consistent.
    #[must_use]
    pub fn listed_pages(&self) -> u64 {
        self.blocks_per_order
            .iter()
            .enumerate()
            .map(|(o, &n)| (n as u64) << o)
            .sum()
    }
}

/// Zone of frame `pfn` for a DMA zone ending at `dma_end_pfn`.
#[inline]
#[must_use]
pub const fn zone_for(pfn: FrameNumber, dma_end_pfn: u64) -> ZoneId {
    if pfn.as_u64() < dma_end_pfn {
        ZoneId::Dma
    } else {
        ZoneId::Normal
    }
}

/// Zone bounds for `max_pfn` frames with the DMA zone ending at byte `dma_limit`.
///
/// Either zone may be empty.
#[must_use]
pub fn init_zones(max_pfn: u64, dma_limit: u64) -> [Zone; 2] {
    let split = (dma_limit / PAGE_SIZE).min(max_pfn);
    let zones = [
        Zone::new(ZoneId::Dma, 0, split),
        Zone::new(ZoneId::Normal, split, max_pfn),
    ];
    for z in &zones {
        debug!("zone {}: pfn {:#x}..{:#x}", z.id, z.start_pfn, z.end_pfn);
    }
    zones
}

/// The frame vector seen as a buddy arena. Indices are frame numbers.
pub(crate) struct ZoneArena<'a> {
    pub(crate) frames: &'a mut [PageFrame],
}

impl Arena for ZoneArena<'_> {
    fn order_count(&self) -> usize {
        PAGE_ORDERS
    }

    fn address_of(&self, index: usize) -> u64 {
        index as u64 * PAGE_SIZE
    }

    #[allow(clippy::cast_possible_truncation)]
    fn index_of(&self, address: u64) -> usize {
        (address / PAGE_SIZE) as usize
    }

    fn block(&self, index: usize) -> Option<BlockMeta> {
        self.frames.get(index).map(|f| BlockMeta {
            order: f.order,
            linked: f.flags.buddy(),
            prev: link_of(f.prev),
            next: link_of(f.next),
        })
    }

    fn set_block(&mut self, index: usize, meta: BlockMeta) {
        let f = &mut self.frames[index];
        f.order = meta.order;
        f.flags.set_buddy(meta.linked);
        f.prev = link_to(meta.prev);
        f.next = link_to(meta.next);
    }

    fn same_group(&self, a: usize, b: usize) -> bool {
        match (self.frames.get(a), self.frames.get(b)) {
            (Some(x), Some(y)) => x.zone() == y.zone(),
            _ => false,
        }
    }
}

/// Classifies every frame from the bootstrap bitmap and frees the available ones.
///
/// - Frames overlapping a hardware window become fixed-mapping.
/// - Frames the bitmap holds become used; `present` only if RAM backs them.
/// - Everything else is inserted into its zone at order 0 and coalesces.
pub fn populate_from_bitmap<M: PhysMapper>(
    frames: &mut [PageFrame],
    zones: &mut [Zone; 2],
    boot: &BootMem<'_, M>,
    windows: &[HardwareWindow],
) {
    let mmap = boot.memory_map();
    let dma_end = zones[ZoneId::Dma.index()].end_pfn;
    let mut fixed = 0u64;
    let mut reserved = 0u64;

    for index in 0..frames.len() {
        let pfn = FrameNumber::new(index as u64);
        let zone = zone_for(pfn, dma_end);
        let present = is_ram(mmap, pfn);

        let mut frame = PageFrame::reserved(zone);
        if windows.iter().any(|w| w.range.overlaps_frame(pfn)) {
            frame.flags = FrameFlags::new().with_fixmap(true).with_present(present);
            frames[index] = frame;
            fixed += 1;
        } else if boot.is_reserved(pfn) {
            frame.flags.set_present(present);
            frames[index] = frame;
            reserved += 1;
        } else {
            frame.flags = FrameFlags::new().with_free(true).with_present(true);
            frames[index] = frame;
            let z = &mut zones[zone.index()];
            z.free_pages += 1;
            z.areas.insert(&mut ZoneArena { frames: &mut *frames }, index, 0);
        }
    }

    info!(
        "frames: {} total, {reserved} reserved, {fixed} fixed, {} DMA + {} NORMAL free",
        frames.len(),
        zones[0].free_pages,
        zones[1].free_pages
    );
}

fn is_ram(mmap: &[MmapEntry], pfn: FrameNumber) -> bool {
    mmap.iter().filter(|e| e.is_usable()).any(|e| {
        let (s, end) = e.usable_frames();
        pfn >= s && pfn < end
    })
}

const _: () = assert!(PAGE_ORDERS <= MAX_ORDERS);
