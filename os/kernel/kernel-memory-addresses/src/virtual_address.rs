use crate::{PageSize, PageTableIndices};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Bits of a canonical 48-bit address that must equal bit 47.
const SIGN_BITS: u64 = 0xFFFF_0000_0000_0000;
const BIT_47: u64 = 1 << 47;

/// Virtual memory address.
///
/// Only carries the kind of address; use [`VirtualAddress::new_canonical`] where
/// an address enters the kernel from outside and must be validated.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Returns `None` unless bits 63..48 are a sign extension of bit 47.
    #[inline]
    #[must_use]
    pub const fn new_canonical(v: u64) -> Option<Self> {
        let va = Self(v);
        if va.is_canonical() { Some(va) } else { None }
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let high = self.0 & SIGN_BITS;
        if self.0 & BIT_47 == 0 {
            high == 0
        } else {
            high == SIGN_BITS
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & S::MASK == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !S::MASK)
    }

    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Self {
        Self((self.0 + S::MASK) & !S::MASK)
    }

    /// Splits the address into its four table indices and page offset.
    #[inline]
    #[must_use]
    pub const fn indices(self) -> PageTableIndices {
        PageTableIndices::of(self)
    }

    /// Builds a canonical address from table indices, sign-extending bit 47.
    #[must_use]
    pub const fn from_indices(ix: PageTableIndices) -> Self {
        let raw = ix.to_raw();
        if raw & BIT_47 == 0 {
            Self(raw)
        } else {
            Self(raw | SIGN_BITS)
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Distance in bytes between two virtual addresses.
impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}
