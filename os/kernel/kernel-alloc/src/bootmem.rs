//! # Bootstrap Bitmap Allocator
//!
//! The only allocator that exists before the page-frame vector does. One bit
//! per physical frame up to the highest usable frame; a set bit means the frame
//! is reserved, part of the kernel image, or already handed out.
//!
//! ```text
//! pfn     0   1   2   3   4   5 ...
//! bit     1   0   0   1   1   0        1 = unavailable
//!         │           └───┴── kernel image / bitmap / handed out
//!         └── real-mode IVT, never available
//! ```
//!
//! Bits only ever go from 0 to 1. [`BootMem`] is consumed by
//! [`PageAllocator::from_bootmem`](crate::PageAllocator::from_bootmem), so
//! using it after the handoff does not compile.

use crate::error::BootError;
use core::slice;
use kernel_info::boot::{KernelImage, MmapEntry};
use kernel_info::config::MemoryConfig;
use kernel_info::memory::{BOOTMEM_ALIGN, PAGE_SIZE};
use kernel_memory_addresses::{FrameNumber, PhysicalAddress};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, error, info};

const BITS: u64 = u64::BITS as u64;

pub struct BootMem<'m, M: PhysMapper> {
    phys: &'m M,
    mmap: &'m [MmapEntry],
    bitmap: &'m mut [u64],
    bitmap_base: FrameNumber,
    bitmap_frames: u64,
    max_pfn: u64,
    /// Frame the byte allocator is currently packing into.
    cursor: FrameNumber,
    /// Next free byte in `cursor`; zero means "take a fresh frame".
    offset: u64,
}

impl<'m, M: PhysMapper> BootMem<'m, M> {
    /// Builds the bitmap over the firmware memory map.
    ///
    /// # Errors
    /// - [`BootError::NotEnoughMemory`] below `config.min_memory`.
    /// - [`BootError::NoRoomForBitmap`] if no conventional region outside the
    ///   kernel image can hold the bitmap.
    pub fn from_mmap(
        phys: &'m M,
        mmap: &'m [MmapEntry],
        image: &KernelImage,
        config: &MemoryConfig,
    ) -> Result<Self, BootError> {
        let max_pfn = mmap
            .iter()
            .filter(|e| e.is_usable())
            .map(|e| e.usable_frames().1.as_u64())
            .max()
            .unwrap_or(0);
        let found = max_pfn * PAGE_SIZE;
        if found < config.min_memory {
            error!("bootmem: {found} bytes of RAM, need {}", config.min_memory);
            return Err(BootError::NotEnoughMemory {
                found,
                needed: config.min_memory,
            });
        }

        let words = max_pfn.div_ceil(BITS);
        let bitmap_frames = FrameNumber::count_for(words * 8);
        let (kernel_start, kernel_end) = image.span().frames();
        let Some(bitmap_base) = place_bitmap(mmap, bitmap_frames, kernel_start, kernel_end) else {
            error!("bootmem: no room for a {bitmap_frames}-frame bitmap");
            return Err(BootError::NoRoomForBitmap { frames: bitmap_frames });
        };

        // Safety: the bitmap frames are conventional RAM outside the kernel
        // image and nothing else owns them yet.
        #[allow(clippy::cast_possible_truncation)]
        let bitmap = unsafe {
            let first = phys.phys_to_mut::<u64>(bitmap_base.base());
            slice::from_raw_parts_mut(core::ptr::from_mut(first), words as usize)
        };

        let mut boot = Self {
            phys,
            mmap,
            bitmap,
            bitmap_base,
            bitmap_frames,
            max_pfn,
            cursor: FrameNumber::new(0),
            offset: 0,
        };
        boot.bitmap.fill(u64::MAX);
        for entry in mmap.iter().filter(|e| e.is_usable()) {
            let (start, end) = entry.usable_frames();
            boot.set_range(start.as_u64(), end.as_u64(), false);
        }
        boot.reserve_frame_range(FrameNumber::new(0), FrameNumber::new(1));
        boot.reserve_frame_range(kernel_start, kernel_end);
        boot.reserve_frame_range(bitmap_base, bitmap_base + bitmap_frames);

        info!(
            "bootmem: {max_pfn} frames, {} available, bitmap at {:?} ({bitmap_frames} frames)",
            boot.free_frames(),
            bitmap_base.base()
        );
        Ok(boot)
    }

    /// Marks `[start, end)` unavailable.
    pub fn reserve_frame_range(&mut self, start: FrameNumber, end: FrameNumber) {
        debug!("bootmem: reserve {start:?}..{end:?}");
        self.set_range(start.as_u64(), end.as_u64(), true);
    }

    /// Hands out `count` contiguous available frames.
    ///
    /// # Panics
    /// When no run of `count` frames is left. Nothing can recover this early.
    pub fn alloc_frames(&mut self, count: u64) -> PhysicalAddress {
        let Some(pfn) = self.take_run(count) else {
            error!("bootmem: out of memory allocating {count} frames");
            panic!("bootmem: no run of {count} free frames left");
        };
        pfn.base()
    }

    /// Byte allocator packing small requests into the last frame it took.
    ///
    /// Every request is 64-byte aligned; requests above one page get whole frames.
    ///
    /// # Panics
    /// As [`alloc_frames`](Self::alloc_frames).
    pub fn alloc(&mut self, size: u64) -> PhysicalAddress {
        let size = size.max(1).next_multiple_of(BOOTMEM_ALIGN);
        if size > PAGE_SIZE {
            self.offset = 0;
            return self.alloc_frames(FrameNumber::count_for(size));
        }
        if self.offset == 0 || self.offset + size > PAGE_SIZE {
            self.cursor = self.alloc_frames(1).frame();
            self.offset = 0;
        }
        let pa = self.cursor.base() + self.offset;
        self.offset = (self.offset + size) % PAGE_SIZE;
        pa
    }

    #[must_use]
    pub fn is_reserved(&self, pfn: FrameNumber) -> bool {
        let pfn = pfn.as_u64();
        pfn >= self.max_pfn || self.bit(pfn)
    }

    /// One past the highest usable frame.
    #[must_use]
    pub const fn max_pfn(&self) -> u64 {
        self.max_pfn
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        let ones: u64 = self.bitmap.iter().map(|w| u64::from(w.count_ones())).sum();
        let padding = self.bitmap.len() as u64 * BITS - self.max_pfn;
        self.max_pfn - (ones - padding.min(ones))
    }

    #[must_use]
    pub const fn bitmap_frames(&self) -> (FrameNumber, u64) {
        (self.bitmap_base, self.bitmap_frames)
    }

    #[must_use]
    pub const fn phys(&self) -> &'m M {
        self.phys
    }

    #[must_use]
    pub const fn memory_map(&self) -> &'m [MmapEntry] {
        self.mmap
    }

    fn bit(&self, pfn: u64) -> bool {
        #[allow(clippy::cast_possible_truncation)]
        let word = self.bitmap[(pfn / BITS) as usize];
        word & (1 << (pfn % BITS)) != 0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_range(&mut self, start: u64, end: u64, value: bool) {
        for pfn in start..end.min(self.max_pfn) {
            let word = &mut self.bitmap[(pfn / BITS) as usize];
            if value {
                *word |= 1 << (pfn % BITS);
            } else {
                *word &= !(1 << (pfn % BITS));
            }
        }
    }

    /// First-fit scan for `count` clear bits; marks them.
    fn take_run(&mut self, count: u64) -> Option<FrameNumber> {
        if count == 0 {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for pfn in 1..self.max_pfn {
            if self.bit(pfn) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = pfn;
            }
            run_len += 1;
            if run_len == count {
                self.set_range(run_start, run_start + count, true);
                return Some(FrameNumber::new(run_start));
            }
        }
        None
    }
}

/// Page-table frames during early boot. Exhaustion is reported, not fatal,
/// so the mapper can turn it into an error.
impl<M: PhysMapper> FrameAlloc for BootMem<'_, M> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.take_run(1).map(FrameNumber::base)
    }
}

/// First frame of a conventional run above frame 0 that holds `frames`
/// frames and avoids the kernel image `[kstart, kend)`.
fn place_bitmap(mmap: &[MmapEntry], frames: u64, kstart: FrameNumber, kend: FrameNumber) -> Option<FrameNumber> {
    mmap.iter().filter(|e| e.is_usable()).find_map(|e| {
        let (s, end) = e.usable_frames();
        let mut start = s.max(FrameNumber::new(1));
        if start < kend && start + frames > kstart {
            start = start.max(kend);
        }
        (start + frames <= end).then_some(start)
    })
}
