//! # Typed Addresses for the Paging Engine
//!
//! Zero-cost wrappers that keep the two sides of a page walk apart:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | Input of a walk: a hypervisor linear address or a guest-physical address. |
//! | [`PhysicalAddress`] | Output of a walk: a system-physical address, or a table frame. |
//!
//! The three leaf granularities are expressed as marker types implementing
//! [`PageSize`] ([`Size4K`], [`Size2M`], [`Size1G`]), so alignment checks read
//! as `va.is_aligned::<Size2M>()` instead of mask arithmetic at every call site.
//!
//! ```rust
//! # use vmm_addresses::*;
//! let va = VirtualAddress::new(0x1111_0010);
//! assert_eq!(va.align_down::<Size4K>().as_u64(), 0x1111_0000);
//! assert_eq!(align_up(0x1001, Size4K::SIZE), 0x2000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::{PHYSICAL_ADDRESS_BITS, PhysicalAddress};
pub use virtual_address::{VIRTUAL_ADDRESS_BITS, VirtualAddress};

/// Align `x` down to the next multiple of `align` (a power of two).
///
/// ```rust
/// # use vmm_addresses::align_down;
/// assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Align `x` up to the next multiple of `align` (a power of two).
///
/// ```rust
/// # use vmm_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), 0x2000);
/// assert_eq!(align_up(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}
