//! # Temporary Window
//!
//! One PML4 slot reserved for short-lived access to arbitrary physical frames.
//! The slot has a single PDPT → PD → PT chain; the PT's 512 entries are the
//! sub-slots. Mappings exist only for the duration of a closure and are torn
//! down by a drop guard, including when the closure panics.

use crate::{FrameAlloc, MapError, Mapper, PageEntryBits, PhysMapper, TlbFlush, VirtMapper};
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PageTableIndices, PhysicalAddress, Size4K, VirtualAddress};
use log::{debug, error};

const PAGE: u64 = 4096;

pub struct TempWindow {
    slot: usize,
    base: VirtualAddress,
    pt: PhysicalAddress,
}

impl TempWindow {
    /// Claims PML4 slot `slot` for the window.
    ///
    /// Anything already below that slot (an earlier window) is unmapped and its
    /// tables are returned to `alloc` first.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the PDPT, PD or PT cannot be allocated.
    pub fn install<M, T, A>(mapper: &mut Mapper<'_, M, T>, slot: usize, alloc: &mut A) -> Result<Self, MapError>
    where
        M: PhysMapper,
        T: TlbFlush,
        A: FrameAlloc + ?Sized,
    {
        mapper.release_slot(slot, alloc);
        let base = VirtualAddress::from_indices(PageTableIndices {
            pml4: slot,
            pdpt: 0,
            pd: 0,
            pt: 0,
            offset: 0,
        });
        let pt = mapper.ensure_path(base, alloc)?;
        debug!("temporary window in PML4 slot {slot} at {base:?}");
        Ok(Self { slot, base, pt })
    }

    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Maps the frame at `pa` for the duration of `f`.
    ///
    /// # Errors
    /// Never fails for a single frame today; the `Result` mirrors
    /// [`with_frames_mapped`](Self::with_frames_mapped).
    pub fn with_frame_mapped<M, T, V, R>(
        &mut self,
        mapper: &mut Mapper<'_, M, T>,
        virt: &V,
        pa: PhysicalAddress,
        f: impl FnOnce(&mut [u8; 4096]) -> R,
    ) -> Result<R, MapError>
    where
        M: PhysMapper,
        T: TlbFlush,
        V: VirtMapper,
    {
        self.with_frames_mapped(mapper, virt, &[pa], |frames| f(frames.get_mut(0)))
    }

    /// Maps every frame of `pas` into consecutive sub-slots for the duration of `f`.
    ///
    /// # Errors
    /// [`MapError::WindowFull`] if more frames are requested than the window has sub-slots.
    ///
    /// # Panics
    /// If a frame address is not page aligned.
    pub fn with_frames_mapped<M, T, V, R>(
        &mut self,
        mapper: &mut Mapper<'_, M, T>,
        virt: &V,
        pas: &[PhysicalAddress],
        f: impl FnOnce(&mut MappedFrames<'_, V>) -> R,
    ) -> Result<R, MapError>
    where
        M: PhysMapper,
        T: TlbFlush,
        V: VirtMapper,
    {
        if pas.len() > ENTRIES_PER_TABLE {
            return Err(MapError::WindowFull { requested: pas.len() });
        }

        let mut guard = WindowGuard {
            mapper,
            pt: self.pt,
            base: self.base,
            live: 0,
        };
        for (i, &pa) in pas.iter().enumerate() {
            if !pa.is_aligned::<Size4K>() {
                error!("temporary window: misaligned frame {pa:?}");
                panic!("temporary window: misaligned frame {pa:?}");
            }
            let va = self.base + i as u64 * PAGE;
            guard
                .mapper
                .set_leaf(guard.pt, i, va, PageEntryBits::kernel_rw().with_frame(pa));
            guard.live = i + 1;
        }

        let mut frames = MappedFrames {
            virt,
            root: guard.mapper.root(),
            base: self.base,
            count: pas.len(),
        };
        Ok(f(&mut frames))
    }
}

/// Frames currently visible through the window.
pub struct MappedFrames<'w, V: VirtMapper> {
    virt: &'w V,
    root: PhysicalAddress,
    base: VirtualAddress,
    count: usize,
}

impl<V: VirtMapper> MappedFrames<'_, V> {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Window address of frame `i`.
    #[must_use]
    pub fn address(&self, i: usize) -> VirtualAddress {
        assert!(i < self.count, "window frame {i} out of {}", self.count);
        self.base + i as u64 * PAGE
    }

    /// The bytes of frame `i`.
    pub fn get_mut(&mut self, i: usize) -> &mut [u8; 4096] {
        let va = self.address(i);
        // Safety: `va` is mapped to a whole frame until the guard drops, which
        // outlives this borrow of `self`.
        unsafe { self.virt.virt_to_mut::<[u8; 4096]>(self.root, va) }
    }
}

/// Clears every sub-slot it mapped, on every exit path.
struct WindowGuard<'a, 'm, M: PhysMapper, T: TlbFlush> {
    mapper: &'a mut Mapper<'m, M, T>,
    pt: PhysicalAddress,
    base: VirtualAddress,
    live: usize,
}

impl<M: PhysMapper, T: TlbFlush> Drop for WindowGuard<'_, '_, M, T> {
    fn drop(&mut self) {
        for i in 0..self.live {
            let va = self.base + i as u64 * PAGE;
            self.mapper.set_leaf(self.pt, i, va, PageEntryBits::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WalkingVirtMapper;
    use crate::test_support::{BumpAlloc, RecordingTlb, TestPhys};

    const SLOT: usize = 509;

    #[test]
    fn frame_is_visible_only_inside_the_closure() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(0, 16);
        let tlb = RecordingTlb::default();
        let mut mapper = Mapper::create(&phys, &tlb, &mut alloc).expect("root");
        let mut window = TempWindow::install(&mut mapper, SLOT, &mut alloc).expect("window");
        let virt = WalkingVirtMapper::new(&phys);

        let target = PhysicalAddress::new(20 * 4096);
        let leaves_before = mapper.stats().frames;
        let seen = window
            .with_frame_mapped(&mut mapper, &virt, target, |bytes| {
                bytes[7] = 0xAB;
                bytes[0]
            })
            .expect("mapped");

        assert_eq!(seen, 0);
        assert_eq!(phys.frame_bytes(target)[7], 0xAB);
        assert_eq!(mapper.translate(window.base()), None);
        assert_eq!(mapper.stats().frames, leaves_before);
        assert_eq!(tlb.last(), window.base());
    }

    #[test]
    fn several_frames_share_the_window() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(0, 16);
        let tlb = RecordingTlb::default();
        let mut mapper = Mapper::create(&phys, &tlb, &mut alloc).expect("root");
        let mut window = TempWindow::install(&mut mapper, SLOT, &mut alloc).expect("window");
        let virt = WalkingVirtMapper::new(&phys);

        let a = PhysicalAddress::new(20 * 4096);
        let b = PhysicalAddress::new(21 * 4096);
        phys.frame_bytes(a)[0] = 9;
        window
            .with_frames_mapped(&mut mapper, &virt, &[a, b], |frames| {
                assert_eq!(frames.len(), 2);
                let first = frames.get_mut(0)[0];
                frames.get_mut(1)[0] = first + 1;
            })
            .expect("mapped");
        assert_eq!(phys.frame_bytes(b)[0], 10);
        assert_eq!(mapper.translate(window.base() + 4096), None);
    }

    #[test]
    fn more_than_one_table_of_frames_is_refused() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(0, 16);
        let tlb = RecordingTlb::default();
        let mut mapper = Mapper::create(&phys, &tlb, &mut alloc).expect("root");
        let mut window = TempWindow::install(&mut mapper, SLOT, &mut alloc).expect("window");
        let virt = WalkingVirtMapper::new(&phys);

        let frames = vec![PhysicalAddress::new(4096); ENTRIES_PER_TABLE + 1];
        let err = window
            .with_frames_mapped(&mut mapper, &virt, &frames, |_| ())
            .unwrap_err();
        assert_eq!(err, MapError::WindowFull { requested: 513 });
    }

    #[test]
    fn panicking_closure_still_unmaps() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(0, 16);
        let tlb = RecordingTlb::default();
        let mut mapper = Mapper::create(&phys, &tlb, &mut alloc).expect("root");
        let mut window = TempWindow::install(&mut mapper, SLOT, &mut alloc).expect("window");
        let virt = WalkingVirtMapper::new(&phys);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = window.with_frame_mapped(&mut mapper, &virt, PhysicalAddress::new(20 * 4096), |_| {
                panic!("closure failed");
            });
        }));
        assert!(result.is_err());
        assert_eq!(mapper.translate(window.base()), None);
    }

    #[test]
    fn reinstalling_tears_down_the_previous_window() {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(0, 16);
        let tlb = RecordingTlb::default();
        let mut mapper = Mapper::create(&phys, &tlb, &mut alloc).expect("root");

        let first = TempWindow::install(&mut mapper, SLOT, &mut alloc).expect("window");
        // A stray mapping left under the slot must disappear with it.
        mapper
            .map_frame(first.base() + 4096, PhysicalAddress::new(0x9000), PageEntryBits::kernel_rw(), &mut alloc)
            .expect("map");
        assert_eq!(mapper.stats().tables(), 3);

        let second = TempWindow::install(&mut mapper, SLOT, &mut alloc).expect("window");
        assert_eq!(alloc.freed.len(), 3);
        assert_eq!(mapper.stats().tables(), 3);
        assert_eq!(mapper.stats().frames, 0);
        assert_eq!(mapper.translate(second.base() + 4096), None);
        assert_eq!(second.slot(), SLOT);
    }
}
