//! # Memory Manager
//!
//! Owns every allocator and the kernel page tables. Built once by
//! [`MemoryManager::boot`] and shared by reference afterwards.
//!
//! ## Boot sequence
//!
//! ```text
//! memory map ──► BootMem ──► fresh PML4 ──► direct map + kernel image
//!                   │
//!                   └──(consumed)──► PageAllocator ──► temporary window
//!                                         │
//!                                         ├──► Heap (maps on first use)
//!                                         └──► Vmalloc
//! ```
//!
//! ## Locks
//!
//! The heap, the page tables and the frame allocator each sit behind their
//! own [`SpinLock`]; vmalloc owns one for its area list. They nest only as
//! heap → page tables → frames. The vmalloc list lock is never held while
//! another allocator is called.

use crate::bootmem::BootMem;
use crate::error::{AllocError, BootError, VmallocError};
use crate::frame::ZoneId;
use crate::heap::{Heap, HeapBacking, HeapStats};
use crate::page_alloc::PageAllocator;
use crate::vmalloc::{VmBackend, Vmalloc, VmallocStats};
use crate::zone::ZoneStats;
use kernel_info::boot::{KernelImage, MmapEntry};
use kernel_info::config::MemoryConfig;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{
    ActiveSpace, HardwareTlb, HhdmPhysMapper, MapError, MapSource, Mapped, Mapper, PageEntryBits, PageTableStats,
    PhysMapper, TempWindow, TlbFlush, VirtMapper, map_kernel_image,
};
use log::{error, info};

/// The manager as the running kernel uses it.
pub type KernelMemory<'m> = MemoryManager<'m, HhdmPhysMapper, ActiveSpace, HardwareTlb>;

/// Everything [`MemoryManager::boot`] needs from the loader and the platform.
pub struct BootParams<'m, M, V, T> {
    pub phys: &'m M,
    pub virt: V,
    pub tlb: T,
    pub mmap: &'m [MmapEntry],
    pub image: KernelImage,
    pub config: MemoryConfig,
}

/// Combined statistics of all allocators.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryStats {
    pub zones: [ZoneStats; 2],
    pub heap: HeapStats,
    pub vmalloc: VmallocStats,
    pub page_tables: PageTableStats,
}

struct PageTables<'m, M: PhysMapper, T: TlbFlush> {
    mapper: Mapper<'m, M, T>,
    window: TempWindow,
}

pub struct MemoryManager<'m, M: PhysMapper, V: VirtMapper, T: TlbFlush> {
    config: MemoryConfig,
    virt: V,
    root: PhysicalAddress,
    pages: PageAllocator<'m>,
    tables: SpinLock<PageTables<'m, M, T>>,
    heap: SpinLock<Heap>,
    vmalloc: Vmalloc,
}

impl<'m, M: PhysMapper, V: VirtMapper, T: TlbFlush> MemoryManager<'m, M, V, T> {
    /// Brings up memory management from the firmware memory map.
    ///
    /// # Errors
    /// - [`BootError::Config`] for an unusable configuration.
    /// - [`BootError::NotEnoughMemory`] / [`BootError::NoRoomForBitmap`] from
    ///   the bootstrap allocator.
    /// - [`BootError::Map`] when boot page tables cannot be allocated.
    pub fn boot(params: BootParams<'m, M, V, T>) -> Result<Self, BootError> {
        let BootParams {
            phys,
            virt,
            tlb,
            mmap,
            image,
            config,
        } = params;
        config.validate()?;

        let mut boot = BootMem::from_mmap(phys, mmap, &image, &config)?;
        let mut mapper = Mapper::create(phys, tlb, &mut boot)?;
        if let Some(base) = config.direct_map_base {
            let pages = boot.max_pfn();
            mapper.map_range(
                VirtualAddress::new(base),
                pages,
                MapSource::Ranged(PhysicalAddress::zero()),
                |_| PageEntryBits::kernel_rw(),
                &mut boot,
            )?;
            info!("direct map: {pages} pages at {base:#x}");
        }
        map_kernel_image(&mut mapper, &image, &mut boot)?;

        let pages = PageAllocator::from_bootmem(boot, &config);
        let window = TempWindow::install(&mut mapper, config.temp_window_slot, &mut pages.table_frames())?;
        let root = mapper.root();

        info!(
            "memory manager up: root {root:?}, heap at {:#x}, vmalloc {:#x}..{:#x}",
            config.heap_start, config.vmalloc_start, config.vmalloc_end
        );
        Ok(Self {
            virt,
            root,
            pages,
            tables: SpinLock::new(PageTables { mapper, window }),
            heap: SpinLock::new(Heap::new(
                VirtualAddress::new(config.heap_start),
                config.heap_max_size,
                config.heap_grow_bytes,
            )),
            vmalloc: Vmalloc::new(
                VirtualAddress::new(config.vmalloc_start),
                VirtualAddress::new(config.vmalloc_end),
            ),
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Physical address of the kernel PML4.
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[must_use]
    pub const fn page_allocator(&self) -> &PageAllocator<'m> {
        &self.pages
    }

    /// # Errors
    /// See [`Heap::kmalloc`].
    pub fn kmalloc(&self, size: usize) -> Result<VirtualAddress, AllocError> {
        self.heap.with_lock(|heap| heap.kmalloc(self, size))
    }

    /// # Panics
    /// If `ptr` is not a live heap allocation.
    pub fn kfree(&self, ptr: VirtualAddress) {
        self.heap.with_lock(|heap| heap.kfree(self, ptr));
    }

    /// # Errors
    /// See [`PageAllocator::alloc_pages`].
    pub fn alloc_pages(&self, zone: ZoneId, order: usize) -> Result<PhysicalAddress, AllocError> {
        self.pages.alloc_pages(zone, order)
    }

    /// # Panics
    /// If `pa` is not the head of an allocated block.
    pub fn free_pages(&self, pa: PhysicalAddress) {
        self.pages.free_pages(pa);
    }

    /// # Errors
    /// See [`Vmalloc::vmalloc`].
    pub fn vmalloc(&self, size: u64) -> Result<VirtualAddress, VmallocError> {
        self.vmalloc.vmalloc(self, size)
    }

    /// # Panics
    /// If no area starts at `va`.
    pub fn vfree(&self, va: VirtualAddress) {
        self.vmalloc.vfree(self, va);
    }

    /// Maps a physical range, typically MMIO, into the vmalloc window.
    ///
    /// # Errors
    /// See [`Vmalloc::ioremap`].
    pub fn ioremap(&self, pa: PhysicalAddress, size: u64, prot: PageEntryBits) -> Result<VirtualAddress, VmallocError> {
        self.vmalloc.ioremap(self, pa, size, prot)
    }

    pub fn iounmap(&self, va: VirtualAddress) {
        self.vmalloc.iounmap(self, va);
    }

    /// Maps `pa` at `va` in the kernel tables.
    ///
    /// Mapping the same frame twice at one address is harmless.
    ///
    /// # Errors
    /// - [`MapError::AlreadyMapped`] if `va` maps a different frame.
    /// - [`MapError::OutOfMemory`] when a table cannot be allocated.
    ///
    /// # Panics
    /// If an address is misaligned or `va` is not canonical.
    pub fn kmap_frame(&self, va: VirtualAddress, pa: PhysicalAddress, prot: PageEntryBits) -> Result<VirtualAddress, MapError> {
        match self.map_page(va, pa, prot)? {
            Mapped::New => Ok(va),
            Mapped::Existing(existing) if existing == pa => Ok(va),
            Mapped::Existing(existing) => Err(MapError::AlreadyMapped { va, existing }),
        }
    }

    /// Removes the mapping at `va`; `None` if there was none.
    pub fn kunmap_frame(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.tables.with_lock(|t| t.mapper.unmap_frame(va))
    }

    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.tables.with_lock(|t| t.mapper.translate(va))
    }

    /// Runs `f` with the frame at `pa` mapped through the temporary window.
    ///
    /// The page tables stay locked while `f` runs, so `f` must not map or
    /// unmap anything itself.
    ///
    /// # Errors
    /// See [`TempWindow::with_frame_mapped`].
    pub fn with_frame_mapped<R>(&self, pa: PhysicalAddress, f: impl FnOnce(&mut [u8; 4096]) -> R) -> Result<R, MapError> {
        self.tables.with_lock(|t| {
            let PageTables { mapper, window } = t;
            window.with_frame_mapped(mapper, &self.virt, pa, f)
        })
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            zones: ZoneId::ALL.map(|z| self.pages.zone_stats(z)),
            heap: self.heap.with_lock(|h| h.stats()),
            vmalloc: self.vmalloc.stats(),
            page_tables: self.tables.with_lock(|t| t.mapper.stats()),
        }
    }

    pub fn dump_free_lists(&self) -> [ZoneStats; 2] {
        self.pages.dump_free_lists()
    }

    pub fn dump_zones(&self) -> [ZoneStats; 2] {
        self.pages.dump_zones()
    }

    pub fn dump_heap(&self) -> HeapStats {
        self.heap.with_lock(|h| h.dump())
    }

    pub fn dump_vmalloc(&self) -> VmallocStats {
        self.vmalloc.dump(self)
    }

    /// Logs the leaves in `[start, end)` and returns their count.
    pub fn dump_page_tables(&self, start: VirtualAddress, end: VirtualAddress) -> usize {
        self.tables.with_lock(|t| t.mapper.dump(start, end))
    }

    fn map_page(&self, va: VirtualAddress, pa: PhysicalAddress, prot: PageEntryBits) -> Result<Mapped, MapError> {
        self.tables
            .with_lock(|t| t.mapper.map_frame(va, pa, prot, &mut self.pages.table_frames()))
    }
}

impl<M: PhysMapper, V: VirtMapper, T: TlbFlush> HeapBacking for MemoryManager<'_, M, V, T> {
    fn back_page(&self, va: VirtualAddress) -> Result<(), AllocError> {
        let pa = self.pages.alloc_pages(ZoneId::Normal, 0)?;
        match self.map_page(va, pa, PageEntryBits::kernel_rw()) {
            Ok(Mapped::New) => Ok(()),
            Ok(Mapped::Existing(old)) => {
                error!("heap: {va:?} already maps {old:?}");
                panic!("heap: break page {va:?} is already mapped");
            }
            Err(e) => {
                self.pages.free_pages(pa);
                Err(e.into())
            }
        }
    }

    unsafe fn heap_mut<'a, X>(&self, va: VirtualAddress) -> &'a mut X {
        unsafe { self.virt.virt_to_mut(self.root, va) }
    }
}

impl<M: PhysMapper, V: VirtMapper, T: TlbFlush> VmBackend for MemoryManager<'_, M, V, T> {
    fn kmalloc(&self, size: usize) -> Result<VirtualAddress, AllocError> {
        Self::kmalloc(self, size)
    }

    fn kfree(&self, va: VirtualAddress) {
        Self::kfree(self, va);
    }

    fn alloc_frame(&self) -> Result<PhysicalAddress, AllocError> {
        self.pages.alloc_pages(ZoneId::Normal, 0)
    }

    fn free_frame(&self, pa: PhysicalAddress) {
        self.pages.free_pages(pa);
    }

    fn free_normal_pages(&self) -> u64 {
        self.pages.free_pages_in(ZoneId::Normal)
    }

    fn map_page(&self, va: VirtualAddress, pa: PhysicalAddress, prot: PageEntryBits) -> Result<Mapped, MapError> {
        Self::map_page(self, va, pa, prot)
    }

    fn unmap_page(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.kunmap_frame(va)
    }

    unsafe fn kernel_mut<'a, X>(&self, va: VirtualAddress) -> &'a mut X {
        unsafe { self.virt.virt_to_mut(self.root, va) }
    }
}
