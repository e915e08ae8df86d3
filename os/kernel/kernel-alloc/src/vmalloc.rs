//! # vmalloc
//!
//! Virtually contiguous areas in a fixed window, backed by frames that need
//! not be contiguous. Area descriptors live on the kmalloc heap and form a
//! singly linked list in ascending address order:
//!
//! ```text
//! VMALLOC_START                                                 VMALLOC_END
//! ├── area ──┬ guard ┼─ gap ─┼──── area ────┬ guard ┼───── gap ──────────┤
//!     head ─────────────────────► next ──────────────────► 0
//! ```
//!
//! Reserving is first-fit over that list. The list lock is only held while
//! the list itself is searched or changed; heap, frame and page-table calls
//! happen outside it.

use crate::error::{AllocError, VmallocError};
use bitfield_struct::bitfield;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{MapError, Mapped, PageEntryBits};
use log::{debug, error, info, trace, warn};

/// Per-area flags.
///
/// - `ranged`: maps an existing physical range; frames are not owned.
/// - `heap`: the frame array was kmalloc'd rather than vmalloc'd.
/// - `frame_alloc`: the area owns the frames listed in its array.
/// - `no_guard`: no guard page follows the area.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct VmFlags {
    pub ranged: bool,
    pub heap: bool,
    pub frame_alloc: bool,
    pub no_guard: bool,
    #[bits(4)]
    __: u8,
}

/// One area descriptor as stored on the heap.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VmArea {
    pub start: VirtualAddress,
    /// Bytes reserved in the window, guard page included.
    pub size: u64,
    /// Pages that are mapped.
    pub pages: u64,
    pub flags: VmFlags,
    /// Array of `pages` frame addresses, if `frame_alloc`.
    frames: VirtualAddress,
    /// First frame of a ranged area.
    phys_base: PhysicalAddress,
    /// Next descriptor, or zero.
    next: VirtualAddress,
}

impl VmArea {
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + self.size)
    }
}

/// A reserved area: where its descriptor is and what it covers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AreaRef {
    desc: VirtualAddress,
    pub start: VirtualAddress,
    pub pages: u64,
}

/// What vmalloc needs from the rest of the memory manager.
pub trait VmBackend {
    /// # Errors
    /// Heap exhaustion.
    fn kmalloc(&self, size: usize) -> Result<VirtualAddress, AllocError>;
    fn kfree(&self, va: VirtualAddress);

    /// One frame from zone NORMAL.
    ///
    /// # Errors
    /// When the zone is empty.
    fn alloc_frame(&self) -> Result<PhysicalAddress, AllocError>;
    fn free_frame(&self, pa: PhysicalAddress);
    fn free_normal_pages(&self) -> u64;

    /// # Errors
    /// When a page table cannot be allocated.
    fn map_page(&self, va: VirtualAddress, pa: PhysicalAddress, prot: PageEntryBits) -> Result<Mapped, MapError>;
    fn unmap_page(&self, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// # Safety
    /// `va` must be mapped kernel memory, aligned for `T`, and `T` must not
    /// cross into another page. No other reference to it may be live.
    unsafe fn kernel_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T;
}

/// Snapshot of the area list.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct VmallocStats {
    pub areas: usize,
    /// Bytes reserved in the window, guard pages included.
    pub reserved_bytes: u64,
}

struct VmList {
    head: Option<VirtualAddress>,
    areas: usize,
    reserved: u64,
}

pub struct Vmalloc {
    start: VirtualAddress,
    end: VirtualAddress,
    list: SpinLock<VmList>,
}

impl Vmalloc {
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self {
            start,
            end,
            list: SpinLock::new(VmList {
                head: None,
                areas: 0,
                reserved: 0,
            }),
        }
    }

    /// Reserves `size` bytes (plus a guard page unless `no_guard`) at the
    /// lowest gap that fits.
    ///
    /// # Errors
    /// - [`VmallocError::ZeroSize`] for `size == 0`.
    /// - [`VmallocError::NoVirtualSpace`] when no gap is large enough, or the
    ///   span does not fit a `u64`.
    /// - [`VmallocError::Alloc`] if the descriptor cannot be kmalloc'd.
    pub fn reserve_area<B: VmBackend + ?Sized>(
        &self,
        backend: &B,
        size: u64,
        flags: VmFlags,
    ) -> Result<AreaRef, VmallocError> {
        if size == 0 {
            return Err(VmallocError::ZeroSize);
        }
        let pages = size.div_ceil(PAGE_SIZE);
        let Some(span) = pages
            .checked_add(u64::from(!flags.no_guard()))
            .and_then(|p| p.checked_mul(PAGE_SIZE))
        else {
            warn!("vmalloc: {size:#x} bytes do not fit the address space");
            return Err(VmallocError::NoVirtualSpace { bytes: size });
        };
        let desc = backend.kmalloc(size_of::<VmArea>())?;

        let placed = self.list.with_lock(|list| {
            let mut prev: Option<VirtualAddress> = None;
            let mut next = list.head;
            let mut cursor = self.start;
            while let Some(at) = next {
                // Safety: list members are live descriptors; the lock is held.
                let area = unsafe { backend.kernel_mut::<VmArea>(at) };
                if area.start - cursor >= span {
                    break;
                }
                cursor = area.end();
                prev = Some(at);
                next = link_of(area.next);
            }
            if self.end < cursor || self.end - cursor < span {
                return None;
            }

            // Safety: freshly kmalloc'd and large enough for a descriptor.
            let new = unsafe { backend.kernel_mut::<VmArea>(desc) };
            *new = VmArea {
                start: cursor,
                size: span,
                pages,
                flags,
                frames: VirtualAddress::new(0),
                phys_base: PhysicalAddress::zero(),
                next: link_to(next),
            };
            match prev {
                Some(p) => {
                    // Safety: as above.
                    let prev = unsafe { backend.kernel_mut::<VmArea>(p) };
                    prev.next = desc;
                }
                None => list.head = Some(desc),
            }
            list.areas += 1;
            list.reserved += span;
            Some(cursor)
        });

        let Some(start) = placed else {
            backend.kfree(desc);
            warn!("vmalloc: no gap of {span} bytes left");
            return Err(VmallocError::NoVirtualSpace { bytes: span });
        };
        trace!("vmalloc: reserved {start:?} + {span:#x}");
        Ok(AreaRef { desc, start, pages })
    }

    /// Allocates one NORMAL frame per page of `area` and records them.
    ///
    /// The frame array is kmalloc'd when it fits in a page, vmalloc'd otherwise.
    /// On failure every frame taken so far is returned and the area owns none.
    ///
    /// # Errors
    /// [`VmallocError::OutOfMemory`] when the zone runs dry, or the error of
    /// allocating the array.
    pub fn back_with_pages<B: VmBackend + ?Sized>(&self, backend: &B, area: &AreaRef) -> Result<(), VmallocError> {
        let bytes = area.pages * size_of::<PhysicalAddress>() as u64;
        let on_heap = bytes <= PAGE_SIZE;
        #[allow(clippy::cast_possible_truncation)]
        let array = if on_heap {
            backend.kmalloc(bytes as usize)?
        } else {
            self.vmalloc(backend, bytes)?
        };

        for i in 0..area.pages {
            match backend.alloc_frame() {
                // Safety: slot `i` of an array sized for `pages` entries.
                Ok(pa) => *unsafe { backend.kernel_mut::<PhysicalAddress>(slot(array, i)) } = pa,
                Err(_) => {
                    let free = backend.free_normal_pages();
                    warn!("vmalloc: out of frames after {i} of {} pages", area.pages);
                    for j in 0..i {
                        // Safety: filled above.
                        backend.free_frame(*unsafe { backend.kernel_mut::<PhysicalAddress>(slot(array, j)) });
                    }
                    self.free_array(backend, array, on_heap);
                    return Err(VmallocError::OutOfMemory {
                        pages: area.pages,
                        free,
                    });
                }
            }
        }

        self.list.with_lock(|_| {
            // Safety: the descriptor is live; the lock is held.
            let desc = unsafe { backend.kernel_mut::<VmArea>(area.desc) };
            desc.frames = array;
            desc.flags = desc.flags.with_frame_alloc(true).with_heap(on_heap);
        });
        Ok(())
    }

    /// Maps every page of `area` to its recorded frame.
    ///
    /// On a page-table failure the pages mapped so far are unmapped again.
    ///
    /// # Errors
    /// [`VmallocError::Map`].
    ///
    /// # Panics
    /// If a page of the area is already mapped.
    pub fn map_area<B: VmBackend + ?Sized>(
        &self,
        backend: &B,
        area: &AreaRef,
        prot: PageEntryBits,
    ) -> Result<(), VmallocError> {
        let snapshot = self.list.with_lock(|_| {
            // Safety: the descriptor is live; the lock is held.
            *unsafe { backend.kernel_mut::<VmArea>(area.desc) }
        });

        for i in 0..area.pages {
            let va = area.start + i * PAGE_SIZE;
            let pa = if snapshot.flags.ranged() {
                snapshot.phys_base + i * PAGE_SIZE
            } else {
                // Safety: `back_with_pages` filled the array.
                *unsafe { backend.kernel_mut::<PhysicalAddress>(slot(snapshot.frames, i)) }
            };
            match backend.map_page(va, pa, prot) {
                Ok(Mapped::New) => {}
                Ok(Mapped::Existing(old)) => {
                    error!("vmalloc: {va:?} already maps {old:?}");
                    panic!("vmalloc: double mapping at {va:?}");
                }
                Err(e) => {
                    for j in 0..i {
                        backend.unmap_page(area.start + j * PAGE_SIZE);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Releases the area starting exactly at `start`: unmaps it, returns owned
    /// frames and the frame array, and frees the descriptor.
    ///
    /// # Panics
    /// If no area starts at `start`.
    pub fn release<B: VmBackend + ?Sized>(&self, backend: &B, start: VirtualAddress) {
        let found = self.list.with_lock(|list| {
            let mut prev: Option<VirtualAddress> = None;
            let mut next = list.head;
            while let Some(at) = next {
                // Safety: list members are live descriptors; the lock is held.
                let area = unsafe { backend.kernel_mut::<VmArea>(at) };
                if area.start == start {
                    match prev {
                        Some(p) => {
                            // Safety: as above.
                            let prev = unsafe { backend.kernel_mut::<VmArea>(p) };
                            prev.next = area.next;
                        }
                        None => list.head = link_of(area.next),
                    }
                    list.areas -= 1;
                    list.reserved -= area.size;
                    return Some((at, *area));
                }
                if area.start > start {
                    break;
                }
                prev = Some(at);
                next = link_of(area.next);
            }
            None
        });
        let Some((desc, area)) = found else {
            error!("vfree: {start:?} does not start an area");
            panic!("vfree: no area starts at {start:?}");
        };

        for i in 0..area.pages {
            backend.unmap_page(area.start + i * PAGE_SIZE);
        }
        if area.flags.frame_alloc() {
            for i in 0..area.pages {
                // Safety: the array holds `pages` recorded frames.
                backend.free_frame(*unsafe { backend.kernel_mut::<PhysicalAddress>(slot(area.frames, i)) });
            }
            self.free_array(backend, area.frames, area.flags.heap());
        }
        backend.kfree(desc);
        trace!("vfree: released {start:?} ({} pages)", area.pages);
    }

    /// Reserves, backs and maps `size` bytes of fresh memory.
    ///
    /// # Errors
    /// - [`VmallocError::ZeroSize`] for `size == 0`.
    /// - [`VmallocError::OutOfMemory`] up front when zone NORMAL holds fewer
    ///   free pages than requested, or when backing fails.
    /// - Any error of [`reserve_area`](Self::reserve_area) or [`map_area`](Self::map_area).
    pub fn vmalloc<B: VmBackend + ?Sized>(&self, backend: &B, size: u64) -> Result<VirtualAddress, VmallocError> {
        if size == 0 {
            warn!("vmalloc: zero-sized request");
            return Err(VmallocError::ZeroSize);
        }
        let pages = size.div_ceil(PAGE_SIZE);
        let free = backend.free_normal_pages();
        if pages > free {
            warn!("vmalloc: {pages} pages requested, {free} free");
            return Err(VmallocError::OutOfMemory { pages, free });
        }

        let area = self.reserve_area(backend, size, VmFlags::new())?;
        let backed = self
            .back_with_pages(backend, &area)
            .and_then(|()| self.map_area(backend, &area, PageEntryBits::kernel_rw()));
        if let Err(e) = backed {
            self.release(backend, area.start);
            return Err(e);
        }
        debug!("vmalloc({size}) -> {:?}", area.start);
        Ok(area.start)
    }

    /// Releases an area obtained from [`vmalloc`](Self::vmalloc).
    ///
    /// # Panics
    /// As [`release`](Self::release).
    pub fn vfree<B: VmBackend + ?Sized>(&self, backend: &B, va: VirtualAddress) {
        self.release(backend, va);
    }

    /// Maps the physical range `[pa, pa + size)` into the window with `prot`.
    ///
    /// Returns the virtual address of `pa`, keeping its offset within the page.
    ///
    /// # Errors
    /// As [`reserve_area`](Self::reserve_area) and [`map_area`](Self::map_area).
    pub fn ioremap<B: VmBackend + ?Sized>(
        &self,
        backend: &B,
        pa: PhysicalAddress,
        size: u64,
        prot: PageEntryBits,
    ) -> Result<VirtualAddress, VmallocError> {
        if size == 0 {
            return Err(VmallocError::ZeroSize);
        }
        let offset = pa.page_offset();
        let Some(len) = offset.checked_add(size).filter(|_| pa.as_u64().checked_add(size).is_some()) else {
            warn!("ioremap: {pa:?} + {size:#x} wraps");
            return Err(VmallocError::NoVirtualSpace { bytes: size });
        };
        let area = self.reserve_area(backend, len, VmFlags::new().with_ranged(true))?;
        self.list.with_lock(|_| {
            // Safety: the descriptor is live; the lock is held.
            let desc = unsafe { backend.kernel_mut::<VmArea>(area.desc) };
            desc.phys_base = PhysicalAddress::new(pa.as_u64() - offset);
        });
        if let Err(e) = self.map_area(backend, &area, prot) {
            self.release(backend, area.start);
            return Err(e);
        }
        debug!("ioremap({pa:?}, {size:#x}) -> {:?}", area.start + offset);
        Ok(area.start + offset)
    }

    /// Undoes [`ioremap`](Self::ioremap). The physical range stays untouched.
    pub fn iounmap<B: VmBackend + ?Sized>(&self, backend: &B, va: VirtualAddress) {
        self.release(backend, VirtualAddress::new(va.as_u64() - va.as_u64() % PAGE_SIZE));
    }

    /// Copy of the area starting at `start`.
    #[must_use]
    pub fn area<B: VmBackend + ?Sized>(&self, backend: &B, start: VirtualAddress) -> Option<VmArea> {
        let mut found = None;
        self.for_each_area(backend, |a| {
            if a.start == start {
                found = Some(*a);
            }
        });
        found
    }

    #[must_use]
    pub fn stats(&self) -> VmallocStats {
        self.list.with_lock(|list| VmallocStats {
            areas: list.areas,
            reserved_bytes: list.reserved,
        })
    }

    /// Logs every area and returns the totals.
    pub fn dump<B: VmBackend + ?Sized>(&self, backend: &B) -> VmallocStats {
        self.for_each_area(backend, |a| {
            info!(
                "vmalloc {:?}..{:?}: {} pages{}{}",
                a.start,
                a.end(),
                a.pages,
                if a.flags.ranged() { " ranged" } else { "" },
                if a.flags.no_guard() { "" } else { " +guard" },
            );
        });
        let stats = self.stats();
        info!("vmalloc: {} areas, {} bytes reserved", stats.areas, stats.reserved_bytes);
        stats
    }

    fn for_each_area<B: VmBackend + ?Sized>(&self, backend: &B, mut f: impl FnMut(&VmArea)) {
        self.list.with_lock(|list| {
            let mut next = list.head;
            while let Some(at) = next {
                // Safety: list members are live descriptors; the lock is held.
                let area = unsafe { backend.kernel_mut::<VmArea>(at) };
                f(area);
                next = link_of(area.next);
            }
        });
    }

    fn free_array<B: VmBackend + ?Sized>(&self, backend: &B, array: VirtualAddress, on_heap: bool) {
        if on_heap {
            backend.kfree(array);
        } else {
            self.release(backend, array);
        }
    }
}

const fn slot(array: VirtualAddress, i: u64) -> VirtualAddress {
    VirtualAddress::new(array.as_u64() + i * size_of::<PhysicalAddress>() as u64)
}

const fn link_of(va: VirtualAddress) -> Option<VirtualAddress> {
    if va.as_u64() == 0 { None } else { Some(va) }
}

const fn link_to(va: Option<VirtualAddress>) -> VirtualAddress {
    match va {
        Some(va) => va,
        None => VirtualAddress::new(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    use kernel_vmem::PhysMapper;
    use kernel_vmem::test_support::TestPhys;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::collections::BTreeMap;

    const START: u64 = 0xffff_c900_0000_0000;

    /// Host heap for descriptors, test frames for pages, a map for page tables.
    struct FakeKernel {
        phys: TestPhys,
        free: RefCell<Vec<PhysicalAddress>>,
        pages: RefCell<BTreeMap<u64, PhysicalAddress>>,
        heap: RefCell<BTreeMap<u64, Layout>>,
        fail_map_at: Cell<Option<u64>>,
    }

    impl FakeKernel {
        fn new(frames: usize) -> Self {
            Self {
                phys: TestPhys::with_frames(frames),
                free: RefCell::new((0..frames as u64).rev().map(|n| PhysicalAddress::new(n * 4096)).collect()),
                pages: RefCell::default(),
                heap: RefCell::default(),
                fail_map_at: Cell::new(None),
            }
        }

        fn free_frames(&self) -> usize {
            self.free.borrow().len()
        }

        fn mapped(&self) -> usize {
            self.pages.borrow().len()
        }

        fn heap_blocks(&self) -> usize {
            self.heap.borrow().len()
        }
    }

    impl Drop for FakeKernel {
        fn drop(&mut self) {
            for (&ptr, &layout) in self.heap.borrow().iter() {
                unsafe { dealloc(ptr as *mut u8, layout) };
            }
        }
    }

    impl VmBackend for FakeKernel {
        fn kmalloc(&self, size: usize) -> Result<VirtualAddress, AllocError> {
            let layout = Layout::from_size_align(size, 16).expect("layout");
            let ptr = unsafe { alloc_zeroed(layout) };
            self.heap.borrow_mut().insert(ptr as u64, layout);
            Ok(VirtualAddress::new(ptr as u64))
        }

        fn kfree(&self, va: VirtualAddress) {
            let layout = self.heap.borrow_mut().remove(&va.as_u64()).expect("live block");
            unsafe { dealloc(va.as_u64() as *mut u8, layout) };
        }

        fn alloc_frame(&self) -> Result<PhysicalAddress, AllocError> {
            self.free.borrow_mut().pop().ok_or(AllocError::OutOfMemory)
        }

        fn free_frame(&self, pa: PhysicalAddress) {
            self.free.borrow_mut().push(pa);
        }

        fn free_normal_pages(&self) -> u64 {
            self.free_frames() as u64
        }

        fn map_page(&self, va: VirtualAddress, pa: PhysicalAddress, _prot: PageEntryBits) -> Result<Mapped, MapError> {
            if self.fail_map_at.get() == Some(va.as_u64()) {
                return Err(MapError::OutOfMemory(kernel_memory_addresses::TableLevel::Pt));
            }
            let mut pages = self.pages.borrow_mut();
            if let Some(&old) = pages.get(&va.as_u64()) {
                return Ok(Mapped::Existing(old));
            }
            pages.insert(va.as_u64(), pa);
            Ok(Mapped::New)
        }

        fn unmap_page(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
            self.pages.borrow_mut().remove(&va.as_u64())
        }

        unsafe fn kernel_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
            let page = va.as_u64() & !0xFFF;
            match self.pages.borrow().get(&page) {
                Some(&pa) => unsafe { self.phys.phys_to_mut::<T>(pa + (va.as_u64() & 0xFFF)) },
                None => unsafe { &mut *va.as_mut_ptr::<T>() },
            }
        }
    }

    fn window(pages: u64) -> Vmalloc {
        Vmalloc::new(VirtualAddress::new(START), VirtualAddress::new(START + pages * 4096))
    }

    #[test]
    fn vmalloc_then_vfree_restores_everything() {
        let k = FakeKernel::new(16);
        let vm = window(64);
        let before = vm.stats();

        let va = vm.vmalloc(&k, 3 * 4096).expect("vmalloc");
        assert_eq!(va.as_u64(), START);
        assert_eq!(k.free_frames(), 13);
        assert_eq!(k.mapped(), 3);
        assert_eq!(vm.stats(), VmallocStats { areas: 1, reserved_bytes: 4 * 4096 });
        let area = vm.area(&k, va).expect("area");
        assert!(area.flags.frame_alloc() && area.flags.heap());

        vm.vfree(&k, va);
        assert_eq!(vm.stats(), before);
        assert_eq!(k.free_frames(), 16);
        assert_eq!(k.mapped(), 0);
        assert_eq!(k.heap_blocks(), 0);
    }

    #[test]
    fn first_fit_reuses_the_lowest_gap() {
        let k = FakeKernel::new(32);
        let vm = window(64);
        let a = vm.vmalloc(&k, 4096).expect("a");
        let b = vm.vmalloc(&k, 2 * 4096).expect("b");
        let c = vm.vmalloc(&k, 4096).expect("c");
        assert_eq!(b - a, 2 * 4096, "one guard page in between");
        assert_eq!(c - b, 3 * 4096);

        vm.vfree(&k, b);
        let d = vm.vmalloc(&k, 4096).expect("d");
        assert_eq!(d, b, "gap left by b");
        let e = vm.vmalloc(&k, 2 * 4096).expect("e");
        assert!(e > c, "too big for the rest of the gap");

        let no_guard = vm
            .reserve_area(&k, 4096, VmFlags::new().with_no_guard(true))
            .expect("reserve");
        assert_eq!(vm.area(&k, no_guard.start).map(|a| a.size), Some(4096));
        for va in [a, c, d, e, no_guard.start] {
            vm.release(&k, va);
        }
        assert_eq!(vm.stats(), VmallocStats::default());
    }

    #[test]
    fn window_exhaustion_is_reported() {
        let k = FakeKernel::new(32);
        let vm = window(4);
        let a = vm.vmalloc(&k, 4096).expect("a");
        let _b = vm.vmalloc(&k, 4096).expect("b");
        assert_eq!(
            vm.vmalloc(&k, 4096),
            Err(VmallocError::NoVirtualSpace { bytes: 2 * 4096 })
        );
        assert_eq!(vm.stats().areas, 2);
        vm.vfree(&k, a);
        assert_eq!(k.heap_blocks(), 2);
    }

    #[test]
    fn spans_that_wrap_are_refused() {
        let k = FakeKernel::new(8);
        let vm = window(64);
        let huge = u64::MAX - 0xFFF;
        assert_eq!(
            vm.reserve_area(&k, huge, VmFlags::new()).map(|a| a.start),
            Err(VmallocError::NoVirtualSpace { bytes: huge })
        );
        assert_eq!(
            vm.reserve_area(&k, huge, VmFlags::new().with_no_guard(true)).map(|a| a.start),
            Err(VmallocError::NoVirtualSpace { bytes: huge })
        );
        assert_eq!(
            vm.ioremap(&k, PhysicalAddress::new(0x1010), u64::MAX - 8, PageEntryBits::mmio()),
            Err(VmallocError::NoVirtualSpace { bytes: u64::MAX - 8 })
        );
        assert_eq!(vm.stats(), VmallocStats::default());
        assert_eq!(k.heap_blocks(), 0);

        let a = vm.vmalloc(&k, 4096).expect("window still usable");
        assert_eq!(a.as_u64(), START);
        vm.vfree(&k, a);
    }

        #[test]
    fn too_many_pages_fail_before_reserving() {
        let k = FakeKernel::new(4);
        let vm = window(64);
        assert_eq!(
            vm.vmalloc(&k, 5 * 4096),
            Err(VmallocError::OutOfMemory { pages: 5, free: 4 })
        );
        assert_eq!(vm.stats().areas, 0);
        assert_eq!(vm.vmalloc(&k, 0), Err(VmallocError::ZeroSize));
    }

    #[test]
    fn map_failure_rolls_back() {
        let k = FakeKernel::new(8);
        let vm = window(64);
        k.fail_map_at.set(Some(START + 2 * 4096));
        let err = vm.vmalloc(&k, 4 * 4096);
        assert!(matches!(err, Err(VmallocError::Map(_))));
        assert_eq!(k.mapped(), 0);
        assert_eq!(k.free_frames(), 8);
        assert_eq!(vm.stats().areas, 0);
        assert_eq!(k.heap_blocks(), 0);
    }

    #[test]
    fn large_frame_arrays_are_vmalloced() {
        // 600 pages need a 4800-byte frame array: two more pages, its own area.
        let k = FakeKernel::new(640);
        let vm = window(2048);
        let va = vm.vmalloc(&k, 600 * 4096).expect("vmalloc");
        let area = vm.area(&k, va).expect("area");
        assert!(!area.flags.heap());
        assert_eq!(vm.stats().areas, 2);
        assert_eq!(k.free_frames(), 640 - 602);

        vm.vfree(&k, va);
        assert_eq!(vm.stats().areas, 0);
        assert_eq!(k.free_frames(), 640);
        assert_eq!(k.mapped(), 0);
    }

    #[test]
    fn ioremap_maps_without_owning_frames() {
        let k = FakeKernel::new(8);
        let vm = window(64);
        let va = vm
            .ioremap(&k, PhysicalAddress::new(0xFEE0_0020), 0x10, PageEntryBits::mmio())
            .expect("ioremap");
        assert_eq!(va.as_u64(), START + 0x20);
        assert_eq!(k.pages.borrow().get(&START), Some(&PhysicalAddress::new(0xFEE0_0000)));

        vm.iounmap(&k, va);
        assert_eq!(k.mapped(), 0);
        assert_eq!(k.free_frames(), 8);
    }

    #[test]
    #[should_panic(expected = "no area starts at")]
    fn release_needs_the_exact_start() {
        let k = FakeKernel::new(8);
        let vm = window(64);
        let va = vm.vmalloc(&k, 2 * 4096).expect("vmalloc");
        vm.vfree(&k, va + 4096);
    }

    #[test]
    #[should_panic(expected = "double mapping")]
    fn mapping_over_a_live_page_is_fatal() {
        let k = FakeKernel::new(8);
        let vm = window(64);
        k.pages.borrow_mut().insert(START + 4096, PhysicalAddress::new(0x7000));
        let _ = vm.vmalloc(&k, 2 * 4096);
    }
}
