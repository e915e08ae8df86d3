//! # Page-Frame Descriptors
//!
//! One [`PageFrame`] per physical frame, indexed by frame number. The vector
//! is carved out of bootstrap memory and lives for the rest of the kernel.

use bitfield_struct::bitfield;
use core::fmt;

/// Sentinel for "no link" in the intrusive free-list fields.
pub(crate) const NO_LINK: u32 = u32::MAX;

/// State bits of a frame.
///
/// - `free`: part of some free block (not handed out, not reserved).
/// - `used`: handed out, or reserved at boot.
/// - `buddy`: heads a block that sits on a free list.
/// - `head`: heads an allocated block; `order` is its size.
/// - `fixmap`: overlaps a hardware window; never allocated.
/// - `present`: backed by RAM the firmware reported as usable.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct FrameFlags {
    pub free: bool,
    pub used: bool,
    pub buddy: bool,
    pub head: bool,
    pub fixmap: bool,
    pub present: bool,
    #[bits(2)]
    __: u8,
}

/// Physical memory zones.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum ZoneId {
    /// Frames below the DMA limit, reachable by legacy devices.
    Dma = 0,
    Normal = 1,
}

impl ZoneId {
    pub const ALL: [Self; 2] = [Self::Dma, Self::Normal];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dma => "DMA",
            Self::Normal => "NORMAL",
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub(crate) const fn from_byte(b: u8) -> Self {
        if b == 0 { Self::Dma } else { Self::Normal }
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor of one physical frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageFrame {
    /// Order of the block this frame heads; 0 otherwise.
    pub order: u8,
    zone: u8,
    pub flags: FrameFlags,
    _pad: u8,
    pub(crate) prev: u32,
    pub(crate) next: u32,
}

const _: () = assert!(size_of::<PageFrame>() == 12);

impl PageFrame {
    /// A reserved frame in `zone`, not on any list.
    #[must_use]
    pub const fn reserved(zone: ZoneId) -> Self {
        Self {
            order: 0,
            zone: zone as u8,
            flags: FrameFlags::new().with_used(true),
            _pad: 0,
            prev: NO_LINK,
            next: NO_LINK,
        }
    }

    #[inline]
    #[must_use]
    pub const fn zone(&self) -> ZoneId {
        ZoneId::from_byte(self.zone)
    }

    /// Free, not fixed, not reserved: may be handed out.
    #[inline]
    #[must_use]
    pub const fn is_allocatable(&self) -> bool {
        self.flags.free() && !self.flags.fixmap() && !self.flags.used()
    }
}

#[inline]
pub(crate) const fn link_of(v: u32) -> Option<usize> {
    if v == NO_LINK { None } else { Some(v as usize) }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn link_to(v: Option<usize>) -> u32 {
    match v {
        Some(i) => i as u32,
        None => NO_LINK,
    }
}
