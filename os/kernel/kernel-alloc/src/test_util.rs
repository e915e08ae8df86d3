//! Fixtures shared by the unit tests: a small simulated machine.

use crate::bootmem::BootMem;
use crate::page_alloc::PageAllocator;
use kernel_info::boot::{KernelImage, MmapEntry, PhysRange, RegionType};
use kernel_info::config::MemoryConfig;
use kernel_info::hardware::HardwareWindow;
use kernel_info::memory::PHYS_LOAD;
use kernel_vmem::test_support::TestPhys;

pub(crate) const MIB: u64 = 1024 * 1024;

/// Deterministic pseudo-random stream for traffic tests.
pub(crate) fn xorshift(seed: u64) -> impl FnMut() -> u64 {
    let mut x = seed;
    move || {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        x
    }
}

/// RAM, a firmware map and a kernel image at 1 MiB. The DMA zone ends at 2 MiB.
pub(crate) struct Machine {
    pub(crate) phys: TestPhys,
    pub(crate) mmap: Vec<MmapEntry>,
    pub(crate) image: KernelImage,
    pub(crate) config: MemoryConfig,
}

impl Machine {
    /// `frames` frames with the legacy hole at 0x9F000..1 MiB.
    pub(crate) fn new(frames: usize) -> Self {
        Self::with_windows(frames, &[])
    }

    pub(crate) fn with_windows(frames: usize, windows: &'static [HardwareWindow]) -> Self {
        let top = frames as u64 * 4096;
        let map = [
            MmapEntry::new(0, 0x9F000, RegionType::Conventional),
            MmapEntry::new(0x9F000, 0x61000, RegionType::Reserved),
            MmapEntry::new(MIB, top - MIB, RegionType::Conventional),
        ];
        Self::with_map(frames, &map, windows)
    }

    pub(crate) fn with_map(frames: usize, map: &[MmapEntry], windows: &'static [HardwareWindow]) -> Self {
        Self {
            phys: TestPhys::with_frames(frames),
            mmap: map.to_vec(),
            image: KernelImage {
                text: PhysRange::new(PHYS_LOAD, PHYS_LOAD + 0x3000),
                rodata: PhysRange::new(PHYS_LOAD + 0x3000, PHYS_LOAD + 0x4000),
                data: PhysRange::new(PHYS_LOAD + 0x4000, PHYS_LOAD + 0x8000),
            },
            config: MemoryConfig {
                dma_limit: 2 * MIB,
                min_memory: MIB,
                hardware_windows: windows,
                ..MemoryConfig::default()
            },
        }
    }

    pub(crate) fn boot_mem(&self) -> BootMem<'_, TestPhys> {
        BootMem::from_mmap(&self.phys, &self.mmap, &self.image, &self.config).expect("bootmem")
    }

    pub(crate) fn page_allocator(&self) -> PageAllocator<'_> {
        PageAllocator::from_bootmem(self.boot_mem(), &self.config)
    }
}
