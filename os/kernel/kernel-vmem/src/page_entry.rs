use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// A raw x86-64 page-table entry, valid at every level.
///
/// | Bits  | Field | Meaning |
/// |-------|-------|---------|
/// | 0     | P     | present |
/// | 1     | RW    | writable |
/// | 2     | US    | user accessible |
/// | 3     | PWT   | write-through |
/// | 4     | PCD   | cache disable |
/// | 5     | A     | accessed |
/// | 6     | D     | dirty (leaf) |
/// | 7     | PS    | large page; always clear here, only 4 KiB leaves are used |
/// | 8     | G     | global (leaf) |
/// | 9‒11  |       | OS use |
/// | 12‒51 |       | frame address bits 51:12 |
/// | 52‒58 |       | OS use |
/// | 59‒62 | PKU   | protection key |
/// | 63    | NX    | no execute |
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::kernel_rw().with_frame(PhysicalAddress::new(0x7000));
/// assert!(e.present() && e.writable() && e.no_execute());
/// assert_eq!(e.frame().as_u64(), 0x7000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global_translation: bool,
    #[bits(3)]
    pub os_available_low: u8,
    /// Frame address bits 51:12.
    #[bits(40)]
    frame_bits: u64,
    #[bits(7)]
    pub os_available_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

impl PageEntryBits {
    /// Link from a table to the next-level table. Kept permissive; leaves restrict.
    #[inline]
    #[must_use]
    pub const fn table_link() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Kernel data: read/write, never executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_global_translation(true)
            .with_no_execute(true)
    }

    /// Kernel read-only data.
    #[inline]
    #[must_use]
    pub const fn kernel_ro() -> Self {
        Self::new()
            .with_present(true)
            .with_global_translation(true)
            .with_no_execute(true)
    }

    /// Kernel text: read-only and executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rx() -> Self {
        Self::new().with_present(true).with_global_translation(true)
    }

    /// Device registers: uncached, read/write, never executable.
    #[inline]
    #[must_use]
    pub const fn mmio() -> Self {
        Self::kernel_rw()
            .with_cache_disabled(true)
            .with_write_through(true)
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, pa: PhysicalAddress) -> Self {
        self.with_frame_bits(pa.as_u64() >> 12)
    }

    /// Physical frame (table or page) the entry points at.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << 12)
    }

    /// The entry with its frame address cleared, leaving only the flag bits.
    #[inline]
    #[must_use]
    pub const fn protection(&self) -> Self {
        self.with_frame_bits(0)
    }
}

/// `frame [flags]`, e.g. `0x0000000000007000 [P W - G NX -]`.
impl fmt::Display for PageEntryBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |on: bool, name: &'static str| if on { name } else { "-" };
        write!(
            f,
            "{} [{} {} {} {} {} {}]",
            self.frame(),
            bit(self.present(), "P"),
            bit(self.writable(), "W"),
            bit(self.user_access(), "U"),
            bit(self.global_translation(), "G"),
            bit(self.no_execute(), "NX"),
            bit(self.cache_disabled(), "UC"),
        )
    }
}
