//! # Reaching Mapped Kernel Memory
//!
//! Allocator metadata such as heap block headers and vmalloc descriptors
//! lives at *virtual* addresses. [`VirtMapper`] turns such an address into a
//! reference, either directly ([`ActiveSpace`]) or by translating through the
//! page tables and the physical mapper ([`WalkingVirtMapper`]).

use crate::{PhysMapper, walk};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Dereferences virtual addresses of the address space rooted at `root`.
pub trait VirtMapper {
    /// # Safety
    /// `va` must be mapped, suitably aligned for `T`, and `T` must not cross
    /// into an unmapped page. The caller picks a lifetime no longer than the
    /// mapping and guarantees exclusive access.
    unsafe fn virt_to_mut<'a, T>(&self, root: PhysicalAddress, va: VirtualAddress) -> &'a mut T;
}

/// The address space is loaded in CR3 on this CPU; virtual addresses are used as-is.
#[derive(Copy, Clone, Debug, Default)]
pub struct ActiveSpace;

impl VirtMapper for ActiveSpace {
    #[inline]
    unsafe fn virt_to_mut<'a, T>(&self, _root: PhysicalAddress, va: VirtualAddress) -> &'a mut T {
        unsafe { &mut *va.as_mut_ptr::<T>() }
    }
}

/// Resolves every access through a software table walk.
///
/// Works for address spaces that are not (yet) active, at the cost of a
/// four-level walk per access.
///
/// The walk takes no lock. It reads one entry per level atomically, and
/// relies on the entries it follows staying put while the target is live.
/// Links outside the temporary window are only ever added, heap pages are
/// never unmapped, and a vmalloc area leaves its list before its pages go.
pub struct WalkingVirtMapper<'m, M: PhysMapper> {
    phys: &'m M,
}

impl<'m, M: PhysMapper> WalkingVirtMapper<'m, M> {
    pub const fn new(phys: &'m M) -> Self {
        Self { phys }
    }
}

impl<M: PhysMapper> VirtMapper for WalkingVirtMapper<'_, M> {
    unsafe fn virt_to_mut<'a, T>(&self, root: PhysicalAddress, va: VirtualAddress) -> &'a mut T {
        let Some(pa) = walk(self.phys, root, va) else {
            log::error!("access to unmapped kernel address {va:?}");
            panic!("virt_to_mut: {va:?} is not mapped under root {root:?}");
        };
        unsafe { self.phys.phys_to_mut::<T>(pa) }
    }
}
