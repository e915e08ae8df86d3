//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size4K, TableLevel, VirtualAddress};

/// Size of a page frame in bytes.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = Size4K::SHIFT;

/// Higher Half Direct Map base: physical address `pa` is reachable at `HHDM_BASE + pa`.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image is placed in physical memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// First byte of the kmalloc heap window.
pub const HEAP_START: u64 = 0xffff_c880_0000_0000;

/// Upper bound for the heap window.
pub const HEAP_MAX_SIZE: u64 = 64 * 1024 * 1024;

/// Bytes mapped into the heap per growth step.
pub const HEAP_GROW_BYTES: u64 = 64 * 1024;

/// vmalloc window, `[VMALLOC_START, VMALLOC_END)`.
pub const VMALLOC_START: u64 = 0xffff_c900_0000_0000;
pub const VMALLOC_END: u64 = 0xffff_e900_0000_0000;

/// PML4 slot reserved for the temporary frame window.
pub const TEMP_WINDOW_PML4_SLOT: usize = 509;

/// Base of the temporary frame window.
pub const TEMP_WINDOW_BASE: u64 = 0xffff_fe80_0000_0000;

/// End of the DMA zone. Frames below belong to zone DMA, the rest to zone Normal.
pub const DMA_ZONE_END: u64 = 16 * 1024 * 1024;

/// Largest buddy order for physical frames; blocks hold at most `1 << MAX_ORDER` frames.
pub const MAX_ORDER: usize = 10;

/// Smallest heap block order (32 bytes) and largest (64 KiB).
pub const HEAP_MIN_ORDER: usize = 5;
pub const HEAP_MAX_ORDER: usize = 16;

/// Byte alignment of bootstrap `alloc(size)` requests.
pub const BOOTMEM_ALIGN: u64 = 64;

/// Smallest physical memory accepted at boot.
pub const MIN_PHYSICAL_MEMORY: u64 = 2 * 1024 * 1024;

const _: () = {
    assert!(HHDM_BASE < HEAP_START);
    assert!(HEAP_START + HEAP_MAX_SIZE <= VMALLOC_START);
    assert!(VMALLOC_START < VMALLOC_END);
    assert!(VMALLOC_END <= TEMP_WINDOW_BASE);
    assert!(TEMP_WINDOW_BASE < KERNEL_BASE);
    assert!(HEAP_START % (1 << HEAP_MAX_ORDER) == 0);
    assert!(DMA_ZONE_END % (PAGE_SIZE << MAX_ORDER) == 0);
    assert!(HEAP_GROW_BYTES % PAGE_SIZE == 0);
    assert!((1 << HEAP_MIN_ORDER) >= 24);
    assert!(TEMP_WINDOW_PML4_SLOT < 512);
    assert!(
        VirtualAddress::new(TEMP_WINDOW_BASE).indices().pml4 == TEMP_WINDOW_PML4_SLOT
    );
    assert!(TableLevel::Pml4.index_of(VirtualAddress::new(HEAP_START)) != TEMP_WINDOW_PML4_SLOT);
};
