//! # Kernel Memory Allocation
//!
//! Physical frames, the kmalloc heap and vmalloc areas, from the firmware
//! memory map to a running kernel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────── MemoryManager ───────────────────────┐
//! │                                                              │
//! │   kmalloc/kfree        vmalloc/vfree/ioremap    kmap_frame   │
//! │        │                     │                      │        │
//! │   ┌────▼────┐          ┌─────▼─────┐         ┌──────▼─────┐  │
//! │   │  Heap   │◄─────────┤  Vmalloc  ├────────►│ page tables│  │
//! │   └────┬────┘ descr.   └─────┬─────┘         └──────┬─────┘  │
//! │        │ frames              │ frames               │ tables │
//! │   ┌────▼─────────────────────▼──────────────────────▼─────┐  │
//! │   │          PageAllocator (zones DMA / NORMAL)            │  │
//! │   └────────────────────────────▲───────────────────────────┘  │
//! │                                │ consumes                     │
//! │                           ┌────┴────┐                         │
//! │                           │ BootMem │ (boot only)             │
//! │                           └─────────┘                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! - [`bootmem`]: bitmap allocator over the firmware memory map. It exists
//!   only until the page-frame vector is built and is consumed by the handoff.
//! - [`buddy`]: one buddy engine, generic over an [`Arena`](buddy::Arena).
//!   Physical frames and heap bytes are its two arenas.
//! - [`page_alloc`] and [`zone`]: the page-frame vector, DMA/NORMAL zones and
//!   `alloc_pages` / `free_pages`.
//! - [`heap`]: `kmalloc` / `kfree` on a lazily mapped virtual window.
//! - [`vmalloc`]: virtually contiguous areas, and `ioremap` for MMIO.
//! - [`manager`]: boot sequence, locks and the public entry points.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_alloc::{BootParams, KernelMemory, MemoryManager, ZoneId};
//! use kernel_info::boot::{KernelImage, MmapEntry};
//! use kernel_info::config::MemoryConfig;
//! use kernel_vmem::{ActiveSpace, HardwareTlb, HhdmPhysMapper};
//!
//! fn bring_up(mmap: &'static [MmapEntry], image: KernelImage) -> KernelMemory<'static> {
//!     static PHYS: HhdmPhysMapper = HhdmPhysMapper::new(kernel_info::memory::HHDM_BASE);
//!     let mm = MemoryManager::boot(BootParams {
//!         phys: &PHYS,
//!         virt: ActiveSpace,
//!         tlb: HardwareTlb,
//!         mmap,
//!         image,
//!         config: MemoryConfig::default(),
//!     })
//!     .expect("memory manager");
//!
//!     let p = mm.kmalloc(100).expect("kmalloc");
//!     mm.kfree(p);
//!     let frame = mm.alloc_pages(ZoneId::Normal, 0).expect("frame");
//!     mm.free_pages(frame);
//!     mm
//! }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod bootmem;
pub mod buddy;
pub mod error;
pub mod frame;
pub mod heap;
pub mod manager;
pub mod page_alloc;
pub mod vmalloc;
pub mod zone;

#[cfg(test)]
mod test_util;

pub use crate::bootmem::BootMem;
pub use crate::error::{AllocError, BootError, BuddyError, VmallocError};
pub use crate::frame::{FrameFlags, PageFrame, ZoneId};
pub use crate::heap::{Heap, HeapBacking, HeapStats};
pub use crate::manager::{BootParams, KernelMemory, MemoryManager, MemoryStats};
pub use crate::page_alloc::{PageAllocator, TableFrames};
pub use crate::vmalloc::{AreaRef, VmArea, VmBackend, VmFlags, Vmalloc, VmallocStats};
pub use crate::zone::{Zone, ZoneStats};
