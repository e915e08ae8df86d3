//! Host-side stand-ins for physical RAM, a frame source and the TLB.
//!
//! Physical address `pa` is byte `pa` of a vector of 4 KiB-aligned frames, so
//! page-table code runs unchanged inside `cargo test`.

extern crate std;

use crate::{FrameAlloc, PhysMapper, TlbFlush};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use std::vec::Vec;

const PAGE: u64 = 4096;

#[repr(C, align(4096))]
struct Aligned4K(UnsafeCell<[u8; 4096]>);

/// Simulated physical memory.
pub struct TestPhys {
    frames: Vec<Aligned4K>,
}

// Tests coordinate access the same way the kernel does: through the allocator locks.
unsafe impl Sync for TestPhys {}

impl TestPhys {
    #[must_use]
    pub fn with_frames(n: usize) -> Self {
        let mut frames = Vec::with_capacity(n);
        frames.resize_with(n, || Aligned4K(UnsafeCell::new([0; 4096])));
        Self { frames }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.frames.len() as u64 * PAGE
    }

    /// The 4 KiB of frame `pa`, for assertions.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub fn frame_bytes(&self, pa: PhysicalAddress) -> &mut [u8; 4096] {
        unsafe { self.phys_to_mut(pa.align_down::<kernel_memory_addresses::Size4K>()) }
    }
}

impl PhysMapper for TestPhys {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let idx = (pa.as_u64() / PAGE) as usize;
        let off = (pa.as_u64() % PAGE) as usize;
        assert!(
            idx < self.frames.len(),
            "test RAM has no frame for {pa:?}"
        );
        assert!(off + size_of::<T>() <= 4096, "{pa:?} crosses a frame");
        let base = self.frames[idx].0.get().cast::<u8>();
        unsafe { &mut *base.add(off).cast::<T>() }
    }
}

/// Hands out frames `start..end` in order.
pub struct BumpAlloc {
    next: u64,
    end: u64,
    pub freed: Vec<PhysicalAddress>,
}

impl BumpAlloc {
    /// Frames are given as frame numbers.
    #[must_use]
    pub const fn new(start_pfn: u64, end_pfn: u64) -> Self {
        Self {
            next: start_pfn,
            end: end_pfn,
            freed: Vec::new(),
        }
    }

    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.end - self.next
    }
}

impl FrameAlloc for BumpAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        if self.next >= self.end {
            return None;
        }
        let pa = PhysicalAddress::new(self.next * PAGE);
        self.next += 1;
        Some(pa)
    }

    fn free_4k(&mut self, pa: PhysicalAddress) {
        self.freed.push(pa);
    }
}

/// Counts invalidations and remembers the last one.
#[derive(Debug, Default)]
pub struct RecordingTlb {
    count: AtomicUsize,
    last: AtomicU64,
}

impl RecordingTlb {
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last(&self) -> VirtualAddress {
        VirtualAddress::new(self.last.load(Ordering::Relaxed))
    }
}

impl TlbFlush for RecordingTlb {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.last.store(va.as_u64(), Ordering::Relaxed);
    }
}
