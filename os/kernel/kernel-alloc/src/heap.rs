//! # kmalloc Heap
//!
//! A byte arena at a fixed virtual window, carved into power-of-two blocks by
//! the same buddy engine as physical frames. Every block starts with a header:
//!
//! ```text
//! used block                      free block
//! ┌───────┬────────┬─────────┐     ┌───────┬────────┬──────┬──────┬──────┐
//! │ order │ status │ pad[14] │     │ order │ status │ pad6 │ prev │ next │
//! └───────┴────────┴─────────┘     └───────┴────────┴──────┴──────┴──────┘
//!   16 bytes, payload follows        24 bytes, links are heap offsets
//! ```
//!
//! The window is mapped on demand, one fresh frame at a time, through a
//! [`HeapBacking`]. Nothing is mapped until the first allocation.

use crate::buddy::{Arena, BlockMeta, FreeAreas, order_for};
use crate::error::AllocError;
use kernel_info::memory::{HEAP_MAX_ORDER, HEAP_MIN_ORDER, PAGE_SHIFT, PAGE_SIZE};
use kernel_memory_addresses::VirtualAddress;
use log::{debug, error, info, trace, warn};

/// Orders `0..=HEAP_MAX_ORDER`; orders below the minimum stay empty.
pub const HEAP_ORDERS: usize = HEAP_MAX_ORDER + 1;

/// Bytes in front of every payload.
pub const USED_HEADER: usize = size_of::<UsedHeader>();

const STATUS_NONE: u8 = 0;
const STATUS_FREE: u8 = b'F';
const STATUS_USED: u8 = b'U';
const NO_LINK: u64 = u64::MAX;

#[repr(C, align(16))]
struct UsedHeader {
    order: u8,
    status: u8,
    _pad: [u8; 14],
}

#[repr(C)]
struct FreeHeader {
    order: u8,
    status: u8,
    _pad: [u8; 6],
    prev: u64,
    next: u64,
}

const _: () = {
    assert!(size_of::<UsedHeader>() == 16);
    assert!(size_of::<FreeHeader>() == 24);
    assert!(size_of::<FreeHeader>() <= 1 << HEAP_MIN_ORDER);
};

/// Where heap pages come from and how heap memory is reached.
pub trait HeapBacking {
    /// Maps a fresh frame at the page `va`.
    ///
    /// # Errors
    /// When no frame or page table is available.
    fn back_page(&self, va: VirtualAddress) -> Result<(), AllocError>;

    /// # Safety
    /// `va` must lie in a page previously passed to [`back_page`](Self::back_page),
    /// be aligned for `T`, and `T` must not cross the page. The caller holds
    /// the heap lock.
    unsafe fn heap_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T;
}

/// Snapshot of the heap for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeapStats {
    pub start: VirtualAddress,
    /// Current break: first unmapped byte.
    pub end: VirtualAddress,
    pub mapped_bytes: u64,
    pub free_bytes: u64,
    pub blocks_per_order: [usize; HEAP_ORDERS],
}

#[derive(Debug)]
pub struct Heap {
    base: VirtualAddress,
    max_size: u64,
    grow_bytes: u64,
    brk: u64,
    free_bytes: u64,
    areas: FreeAreas,
}

impl Heap {
    /// An empty heap over `[base, base + max_size)`.
    #[must_use]
    pub const fn new(base: VirtualAddress, max_size: u64, grow_bytes: u64) -> Self {
        Self {
            base,
            max_size,
            grow_bytes,
            brk: 0,
            free_bytes: 0,
            areas: FreeAreas::new(HEAP_ORDERS),
        }
    }

    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    #[must_use]
    pub const fn mapped_bytes(&self) -> u64 {
        self.brk
    }

    /// Allocates `size` bytes, 16-byte aligned.
    ///
    /// # Errors
    /// - [`AllocError::ZeroSize`] for `size == 0`.
    /// - [`AllocError::TooLarge`] if the block would exceed the largest order.
    /// - [`AllocError::HeapExhausted`] when the window is full, or the error
    ///   the backing reported while growing.
    pub fn kmalloc<B: HeapBacking + ?Sized>(&mut self, backing: &B, size: usize) -> Result<VirtualAddress, AllocError> {
        if size == 0 {
            warn!("kmalloc: zero-sized request");
            return Err(AllocError::ZeroSize);
        }
        let Some(order) = order_for(size, USED_HEADER, HEAP_MIN_ORDER).filter(|&o| o <= HEAP_MAX_ORDER) else {
            warn!("kmalloc: {size} bytes exceed the largest heap block");
            return Err(AllocError::TooLarge { size });
        };
        let block = 1u64 << order;

        if self.free_bytes < block {
            self.grow(backing, block.max(self.grow_bytes))?;
        }
        let mut arena = self.arena(backing);
        let index = match self.areas.find(&mut arena, order) {
            Ok(index) => index,
            Err(_) => {
                // Enough bytes, but fragmented. Twice the block always holds an aligned one.
                self.grow(backing, (2 * block).max(self.grow_bytes))?;
                let mut arena = self.arena(backing);
                self.areas
                    .find(&mut arena, order)
                    .map_err(|_| AllocError::HeapExhausted)?
            }
        };

        let va = self.base + index as u64;
        // Safety: `index` heads a block inside the mapped part of the window.
        let header = unsafe { backing.heap_mut::<UsedHeader>(va) };
        header.order = order_byte(order);
        header.status = STATUS_USED;
        self.free_bytes -= block;
        trace!("kmalloc({size}) -> {:?} (order {order})", va + USED_HEADER as u64);
        Ok(va + USED_HEADER as u64)
    }

    /// Returns a block obtained from [`kmalloc`](Self::kmalloc).
    ///
    /// # Panics
    /// If `ptr` is not a live heap allocation.
    pub fn kfree<B: HeapBacking + ?Sized>(&mut self, backing: &B, ptr: VirtualAddress) {
        let offset = ptr.as_u64().wrapping_sub(self.base.as_u64());
        let in_heap = ptr >= self.base + USED_HEADER as u64 && offset < self.brk && offset % 16 == 0;
        if !in_heap {
            error!("kfree: {ptr:?} is outside the heap");
            panic!("kfree: {ptr:?} is not a heap pointer");
        }

        let va = VirtualAddress::new(ptr.as_u64() - USED_HEADER as u64);
        // Safety: inside the mapped window and 16-byte aligned.
        let header = unsafe { backing.heap_mut::<UsedHeader>(va) };
        let order = usize::from(header.order);
        if header.status != STATUS_USED || !(HEAP_MIN_ORDER..=HEAP_MAX_ORDER).contains(&order) {
            error!("kfree: {ptr:?} has no live header (status {:#x})", header.status);
            panic!("kfree: {ptr:?} is not a live allocation");
        }
        header.status = STATUS_NONE;

        self.free_bytes += 1 << order;
        #[allow(clippy::cast_possible_truncation)]
        let index = (va - self.base) as usize;
        let mut arena = self.arena(backing);
        self.areas.insert(&mut arena, index, order);
        trace!("kfree({ptr:?}) order {order}");
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut blocks_per_order = [0; HEAP_ORDERS];
        blocks_per_order.copy_from_slice(&self.areas.counts()[..HEAP_ORDERS]);
        HeapStats {
            start: self.base,
            end: self.base + self.brk,
            mapped_bytes: self.brk,
            free_bytes: self.free_bytes,
            blocks_per_order,
        }
    }

    /// Logs the heap bounds and free lists.
    pub fn dump(&self) -> HeapStats {
        let stats = self.stats();
        info!(
            "heap: {:?}..{:?}, {} bytes mapped, {} free",
            stats.start, stats.end, stats.mapped_bytes, stats.free_bytes
        );
        for (order, &n) in stats.blocks_per_order.iter().enumerate() {
            if n > 0 {
                info!("  order {order:2} ({:5} bytes): {n} blocks", 1u64 << order);
            }
        }
        stats
    }

    /// Maps at least `bytes` more at the break and frees them as page blocks.
    fn grow<B: HeapBacking + ?Sized>(&mut self, backing: &B, bytes: u64) -> Result<(), AllocError> {
        let pages = bytes.div_ceil(PAGE_SIZE);
        if self.brk + pages * PAGE_SIZE > self.max_size {
            warn!("heap: window of {} bytes is full", self.max_size);
            return Err(AllocError::HeapExhausted);
        }
        for _ in 0..pages {
            backing.back_page(self.base + self.brk)?;
            #[allow(clippy::cast_possible_truncation)]
            let index = self.brk as usize;
            self.brk += PAGE_SIZE;
            self.free_bytes += PAGE_SIZE;
            let mut arena = self.arena(backing);
            self.areas.insert(&mut arena, index, PAGE_SHIFT as usize);
        }
        debug!("heap: grew by {pages} pages to {:?}", self.base + self.brk);
        Ok(())
    }

    fn arena<'a, B: HeapBacking + ?Sized>(&self, backing: &'a B) -> HeapArena<'a, B> {
        HeapArena {
            backing,
            base: self.base,
            brk: self.brk,
        }
    }
}

/// The mapped part of the window seen as a buddy arena. Indices are byte offsets.
struct HeapArena<'a, B: HeapBacking + ?Sized> {
    backing: &'a B,
    base: VirtualAddress,
    brk: u64,
}

impl<B: HeapBacking + ?Sized> HeapArena<'_, B> {
    #[allow(clippy::mut_from_ref)]
    fn header(&self, index: usize) -> Option<&mut FreeHeader> {
        let offset = index as u64;
        (offset % (1 << HEAP_MIN_ORDER) == 0 && offset < self.brk)
            // Safety: aligned block start inside the mapped window.
            .then(|| unsafe { self.backing.heap_mut::<FreeHeader>(self.base + offset) })
    }
}

impl<B: HeapBacking + ?Sized> Arena for HeapArena<'_, B> {
    fn order_count(&self) -> usize {
        HEAP_ORDERS
    }

    fn address_of(&self, index: usize) -> u64 {
        self.base.as_u64() + index as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn index_of(&self, address: u64) -> usize {
        (address - self.base.as_u64()) as usize
    }

    fn block(&self, index: usize) -> Option<BlockMeta> {
        let h = self.header(index)?;
        let linked = h.status == STATUS_FREE;
        Some(BlockMeta {
            order: h.order,
            linked,
            prev: linked.then_some(h.prev).and_then(link_of),
            next: linked.then_some(h.next).and_then(link_of),
        })
    }

    fn set_block(&mut self, index: usize, meta: BlockMeta) {
        let Some(h) = self.header(index) else {
            error!("heap: block {index:#x} outside the mapped window");
            panic!("heap: metadata write outside the heap at offset {index:#x}");
        };
        h.order = meta.order;
        h.status = if meta.linked { STATUS_FREE } else { STATUS_NONE };
        h.prev = link_to(meta.prev);
        h.next = link_to(meta.next);
    }

    fn same_group(&self, a: usize, b: usize) -> bool {
        (a as u64) < self.brk && (b as u64) < self.brk
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn link_of(v: u64) -> Option<usize> {
    if v == NO_LINK { None } else { Some(v as usize) }
}

const fn link_to(v: Option<usize>) -> u64 {
    match v {
        Some(i) => i as u64,
        None => NO_LINK,
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn order_byte(order: usize) -> u8 {
    order as u8
}
