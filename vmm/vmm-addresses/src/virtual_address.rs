use crate::PageSize;
use core::fmt;
use core::ops::{Add, AddAssign};

/// Number of linear address bits translated by 4-level paging.
pub const VIRTUAL_ADDRESS_BITS: u32 = 48;

/// Virtual (or guest-physical) memory address.
///
/// The same type is used for the hypervisor's own linear addresses and for
/// guest-physical addresses fed into an extended page table: both are the
/// *input* side of a page walk. No canonicality is enforced on construction;
/// use [`is_canonical`](Self::is_canonical) or
/// [`is_below_walk_limit`](Self::is_below_walk_limit) where it matters.
///
/// ### Examples
/// ```rust
/// # use vmm_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_8000_0000_1000);
/// assert!(va.is_canonical());
/// assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
/// assert_eq!(va.table_index(12), 1);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
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
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Bits 63:47 are all equal (sign extension of bit 47).
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let high = self.0 >> (VIRTUAL_ADDRESS_BITS - 1);
        high == 0 || high == (1 << (64 - VIRTUAL_ADDRESS_BITS + 1)) - 1
    }

    /// The address lies below 2^48, i.e. it can be resolved by a 4-level
    /// extended page walk without any sign extension.
    #[inline]
    #[must_use]
    pub const fn is_below_walk_limit(self) -> bool {
        self.0 >> VIRTUAL_ADDRESS_BITS == 0
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
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & S::MASK
    }

    /// 9-bit table index selected by the bits starting at `shift`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_index(self, shift: u32) -> usize {
        ((self.0 >> shift) & 0x1FF) as usize
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
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

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<VirtualAddress> for u64 {
    #[inline]
    fn from(va: VirtualAddress) -> Self {
        va.as_u64()
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
