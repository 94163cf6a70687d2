use crate::{Page, PagePool};
use alloc::boxed::Box;
use alloc::vec;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use log::trace;
use vmm_addresses::PhysicalAddress;
use vmm_info::memory::PAGE_SIZE;
use vmm_sync::SpinLock;

/// Link stored in the first bytes of every **free** page.
#[repr(C)]
struct FreePage {
    next: Option<NonNull<FreePage>>,
}

/// Free-list bookkeeping.
///
/// Pages below `untouched` have been handed out at least once; the ones that
/// are currently free are chained through `head`. Pages at or above
/// `untouched` have never been used and need no list entry.
struct FreeList {
    head: Option<NonNull<FreePage>>,
    untouched: usize,
}

// Safety: the list only points into the pool's region and is always
// accessed under the pool's lock.
unsafe impl Send for FreeList {}

/// Fixed region of pages with a linear physical window.
///
/// `virt_to_phys`/`phys_to_virt` are pure offset translations between the
/// region base and `phys_base`; they are only meaningful for addresses inside
/// the region.
pub struct LinearPagePool {
    base: NonNull<Page>,
    pages: usize,
    phys_base: PhysicalAddress,
    owned: bool,
    free: SpinLock<FreeList>,
    allocated: AtomicUsize,
}

// Safety: `base`/`pages` never change; mutation goes through the lock and
// the atomic counter.
unsafe impl Send for LinearPagePool {}
unsafe impl Sync for LinearPagePool {}

impl LinearPagePool {
    /// Pool over a freshly allocated region of `pages` pages, pretending it
    /// lives at `phys_base` in physical memory.
    ///
    /// ```rust
    /// # use vmm_addresses::PhysicalAddress;
    /// # use vmm_pool::{LinearPagePool, PagePool};
    /// let pool = LinearPagePool::new(4, PhysicalAddress::new(0x10_0000));
    /// let page = pool.allocate().unwrap();
    /// let pa = pool.virt_to_phys(page.as_ptr().cast());
    /// assert_eq!(pa.as_u64() & 0xFFF, 0);
    /// assert_eq!(pool.phys_to_virt(pa), page.as_ptr().cast());
    /// assert_eq!(pool.allocated(), 1);
    /// unsafe { pool.deallocate(page) };
    /// assert_eq!(pool.allocated(), 0);
    /// ```
    #[must_use]
    pub fn new(pages: usize, phys_base: PhysicalAddress) -> Self {
        debug_assert!(phys_base.as_u64().is_multiple_of(PAGE_SIZE as u64));
        let region: Box<[Page]> = vec![Page::ZERO; pages].into_boxed_slice();
        let raw = Box::into_raw(region);
        // Safety: `Box::into_raw` never returns null.
        let base = unsafe { NonNull::new_unchecked(raw.cast::<Page>()) };
        Self::with_region(base, pages, phys_base, true)
    }

    /// Pool over memory donated by the caller (e.g. a boot-time reservation).
    ///
    /// # Safety
    /// `[base, base + pages)` must be valid, writable, exclusively owned by
    /// the pool for its whole lifetime, and physically contiguous starting
    /// at `phys_base`.
    #[must_use]
    pub unsafe fn from_region(base: NonNull<Page>, pages: usize, phys_base: PhysicalAddress) -> Self {
        Self::with_region(base, pages, phys_base, false)
    }

    const fn with_region(
        base: NonNull<Page>,
        pages: usize,
        phys_base: PhysicalAddress,
        owned: bool,
    ) -> Self {
        Self {
            base,
            pages,
            phys_base,
            owned,
            free: SpinLock::new(FreeList {
                head: None,
                untouched: 0,
            }),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Total number of pages in the region.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.pages
    }

    #[must_use]
    pub const fn phys_base(&self) -> PhysicalAddress {
        self.phys_base
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.pages * PAGE_SIZE
    }
}

impl PagePool for LinearPagePool {
    fn allocate(&self) -> Option<NonNull<Page>> {
        let page = self.free.with_lock(|list| {
            if let Some(head) = list.head {
                // Safety: free pages always carry a valid link.
                list.head = unsafe { head.as_ref().next };
                Some(head.cast::<Page>())
            } else if list.untouched < self.pages {
                let index = list.untouched;
                list.untouched += 1;
                // Safety: index is inside the region.
                Some(unsafe { self.base.add(index) })
            } else {
                None
            }
        })?;

        // Safety: the page is ours now and lies inside the region.
        unsafe { ptr::write_bytes(page.as_ptr(), 0, 1) };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        trace!("pool: allocate {:p}", page.as_ptr());
        Some(page)
    }

    unsafe fn deallocate(&self, page: NonNull<Page>) {
        debug_assert!(self.contains(page.as_ptr().cast()), "page not from this pool");
        trace!("pool: deallocate {:p}", page.as_ptr());
        self.free.with_lock(|list| {
            let node = page.cast::<FreePage>();
            // Safety: caller guarantees the page is unused; it becomes a list node.
            unsafe { node.as_ptr().write(FreePage { next: list.head }) };
            list.head = Some(node);
        });
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    fn virt_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        debug_assert!(self.contains(ptr), "pointer outside the pool window");
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        PhysicalAddress::new(self.phys_base.as_u64().wrapping_add(offset as u64))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn phys_to_virt(&self, phys: PhysicalAddress) -> *mut u8 {
        let offset = phys.as_u64().wrapping_sub(self.phys_base.as_u64()) as usize;
        debug_assert!(offset < self.pages * PAGE_SIZE, "{phys:?} outside the pool window");
        self.base.as_ptr().cast::<u8>().wrapping_add(offset)
    }

    fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Drop for LinearPagePool {
    fn drop(&mut self) {
        if self.owned {
            let slice = ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.pages);
            // Safety: created by `Box::into_raw` in `new` with the same length.
            drop(unsafe { Box::from_raw(slice) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_aligned_and_zeroed() {
        let pool = LinearPagePool::new(2, PhysicalAddress::new(0x20_0000));
        let page = pool.allocate().unwrap();
        assert_eq!(page.as_ptr() as usize % PAGE_SIZE, 0);

        unsafe {
            (*page.as_ptr()).0[17] = 0xAA;
            pool.deallocate(page);
        }

        let again = pool.allocate().unwrap();
        assert_eq!(again, page);
        assert!(unsafe { (*again.as_ptr()).0.iter().all(|&b| b == 0) });
    }

    #[test]
    fn exhaustion_and_counter() {
        let pool = LinearPagePool::new(3, PhysicalAddress::new(0x10_0000));
        let pages: Vec<_> = (0..3).map(|_| pool.allocate().unwrap()).collect();
        assert!(pool.allocate().is_none());
        assert_eq!(pool.allocated(), 3);

        for page in pages {
            unsafe { pool.deallocate(page) };
        }
        assert_eq!(pool.allocated(), 0);
        assert!(pool.allocate().is_some());
    }

    #[test]
    fn window_is_a_linear_offset() {
        let pool = LinearPagePool::new(4, PhysicalAddress::new(0x4000_0000));
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();

        let pa0 = pool.virt_to_phys(first.as_ptr().cast());
        let pa1 = pool.virt_to_phys(second.as_ptr().cast());
        assert_eq!(pa0.as_u64(), 0x4000_0000);
        assert_eq!(pa1.as_u64(), 0x4000_1000);
        assert_eq!(pool.phys_to_virt(pa1 + 0x10), second.as_ptr().cast::<u8>().wrapping_add(0x10));
    }
}
