//! # Page Pool for Page-Table Nodes
//!
//! The paging engine never talks to a heap. Every table node it creates is one
//! zeroed [`Page`] taken from a [`PagePool`], and every physical frame it
//! writes into an entry is obtained through the pool's linear
//! virtual↔physical window. Scoped mappings additionally reserve virtual
//! ranges through a [`MapWindowAllocator`].
//!
//! ```text
//!  pool virt  base ──────────────► base + n·4K
//!              │  offset window       │
//!  pool phys  phys_base ─────────► phys_base + n·4K
//! ```
//!
//! [`LinearPagePool`] is the in-tree implementation: a fixed region split into
//! pages, recycled through an intrusive free list, with an allocation counter
//! that makes leaks observable. [`WindowAllocator`] hands out page-granular
//! virtual windows from a reserved range.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod linear;
mod window;

use core::ptr::NonNull;
use vmm_addresses::{PhysicalAddress, VirtualAddress};
use vmm_info::memory::PAGE_SIZE;

pub use linear::LinearPagePool;
pub use window::WindowAllocator;

/// One 4 KiB, 4 KiB-aligned block; the unit every table node occupies.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    pub const ZERO: Self = Self([0; PAGE_SIZE]);
}

/// Source of zeroed pages plus the linear window that relates their
/// pointers to system-physical addresses.
pub trait PagePool {
    /// A zeroed page, or `None` once the pool is exhausted.
    fn allocate(&self) -> Option<NonNull<Page>>;

    /// Return a page obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// `page` must come from this pool and must no longer be referenced,
    /// neither by pointer nor by any page-table entry.
    unsafe fn deallocate(&self, page: NonNull<Page>);

    /// Physical address of a pointer inside the pool's window.
    fn virt_to_phys(&self, ptr: *const u8) -> PhysicalAddress;

    /// Pointer for a physical address inside the pool's window.
    fn phys_to_virt(&self, phys: PhysicalAddress) -> *mut u8;

    /// Pages currently handed out.
    fn allocated(&self) -> usize;
}

impl<T: PagePool + ?Sized> PagePool for &T {
    #[inline]
    fn allocate(&self) -> Option<NonNull<Page>> {
        (**self).allocate()
    }

    #[inline]
    unsafe fn deallocate(&self, page: NonNull<Page>) {
        unsafe { (**self).deallocate(page) }
    }

    #[inline]
    fn virt_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        (**self).virt_to_phys(ptr)
    }

    #[inline]
    fn phys_to_virt(&self, phys: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_virt(phys)
    }

    #[inline]
    fn allocated(&self) -> usize {
        (**self).allocated()
    }
}

/// Reserves virtual windows (address space only, no backing) for temporary
/// mappings.
pub trait MapWindowAllocator {
    /// Reserve `len` bytes, rounded up to whole pages; `None` when `len` is
    /// zero or the range is exhausted.
    fn alloc_window(&self, len: u64) -> Option<VirtualAddress>;

    /// Give back a window previously returned by
    /// [`alloc_window`](Self::alloc_window). Unknown addresses are ignored.
    fn free_window(&self, addr: VirtualAddress);
}

impl<T: MapWindowAllocator + ?Sized> MapWindowAllocator for &T {
    #[inline]
    fn alloc_window(&self, len: u64) -> Option<VirtualAddress> {
        (**self).alloc_window(len)
    }

    #[inline]
    fn free_window(&self, addr: VirtualAddress) {
        (**self).free_window(addr);
    }
}
