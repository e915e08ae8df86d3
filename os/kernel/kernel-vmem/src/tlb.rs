//! # Translation Cache Maintenance

use kernel_memory_addresses::VirtualAddress;

/// Invalidates cached translations after a page-table change.
pub trait TlbFlush {
    /// Drops the translation for the page containing `va` on this CPU.
    fn invalidate_page(&self, va: VirtualAddress);
}

impl<T: TlbFlush + ?Sized> TlbFlush for &T {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        (**self).invalidate_page(va);
    }
}

/// `invlpg` on the executing CPU.
#[derive(Copy, Clone, Debug, Default)]
pub struct HardwareTlb;

impl TlbFlush for HardwareTlb {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = va;
    }
}
