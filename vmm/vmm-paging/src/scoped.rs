//! # Scoped Mappings
//!
//! A [`ScopedMapping`] makes physical memory (or memory reachable through a
//! foreign page table) visible in the hypervisor's address space for as long
//! as the handle lives. It owns a virtual window from a
//! [`MapWindowAllocator`] and the 4 KiB mappings placed in it:
//!
//! ```text
//!   window  ──────────────────────────────► window + window_size
//!   │ page │ page │ page │ ... │ page │
//!      ▲ get() = window + in-page offset of the first source byte
//! ```
//!
//! Dropping the handle unmaps every page of the window and frees the window.
//! If building a mapping fails half way, the pages mapped so far are removed
//! and the window is freed before the error reaches the caller.
//!
//! Only the local TLB is flushed. A mapping handed to another core needs a
//! shootdown by the caller.

use crate::entry::{Attributes, MemoryType, PageTableEntry};
use crate::mapper::Mapper;
use crate::translate::translate_with_level;
use crate::{Error, Result};
use core::fmt;
use log::{trace, warn};
use vmm_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use vmm_info::memory::{CACHE_FLUSH_ALL_THRESHOLD, CACHE_LINE_SIZE, PAGE_SIZE};
use vmm_pool::{MapWindowAllocator, PagePool};

const PAGE: u64 = Size4K::SIZE;

/// `(pointer, size, window_size)` of a released mapping.
pub type MappingParts = (*mut u8, u64, u64);

/// Owner of one temporary mapping window.
pub struct ScopedMapping<'m, M: Mapper + ?Sized> {
    mapper: Option<&'m M>,
    windows: Option<&'m dyn MapWindowAllocator>,
    /// Window base plus the in-page offset of the first byte.
    virt: VirtualAddress,
    /// Bytes the caller asked for.
    size: u64,
    /// Bytes of the window that carry mappings, counted from the window base.
    window_size: u64,
}

fn check_window(window: VirtualAddress) -> Result<()> {
    if window.is_null() || !window.is_aligned::<Size4K>() {
        return Err(Error::InvalidArgument("mapping window must be a non-null page address"));
    }
    Ok(())
}

fn check_ranges(ranges: &[(PhysicalAddress, u64)]) -> Result<u64> {
    if ranges.is_empty() {
        return Err(Error::InvalidArgument("empty range list"));
    }
    let mut total = 0_u64;
    for &(phys, len) in ranges {
        if phys.is_null() {
            return Err(Error::InvalidArgument("null physical address in range list"));
        }
        if len == 0 || len & Size4K::MASK != 0 {
            return Err(Error::InvalidArgument("range length must be a non-zero page multiple"));
        }
        total = total
            .checked_add(len)
            .ok_or(Error::InvalidArgument("range list too large"))?;
    }
    Ok(total)
}

impl<'m, M: Mapper + ?Sized> ScopedMapping<'m, M> {
    /// Empty handle that owns `window` but maps nothing yet.
    const fn owning(mapper: &'m M, windows: &'m dyn MapWindowAllocator, window: VirtualAddress) -> Self {
        Self {
            mapper: Some(mapper),
            windows: Some(windows),
            virt: window,
            size: 0,
            window_size: 0,
        }
    }

    const fn base(&self) -> VirtualAddress {
        self.virt.align_down::<Size4K>()
    }

    /// Map `phys` at the next free page of the window.
    fn push_page(&mut self, phys: PhysicalAddress, memory_type: MemoryType) -> Result<()> {
        let Some(mapper) = self.mapper else {
            return Err(Error::InvalidArgument("mapping has no mapper"));
        };
        let virt = self.base() + self.window_size;
        mapper
            .map_4k(virt, phys, Attributes::READ_WRITE, memory_type)
            .inspect_err(|err| warn!("scoped: map {virt:?} -> {phys:?} failed ({err}), rolling back"))?;
        self.window_size += PAGE;
        Ok(())
    }

    /// Map the single page at `phys` into `window`, read-write.
    ///
    /// The handle takes ownership of `window` (which must come from
    /// `windows`) whether or not construction succeeds.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] if `window` or `phys` is null or not
    ///   page aligned.
    /// - Any error of [`Mapper::map_4k`].
    pub fn new(
        mapper: &'m M,
        windows: &'m dyn MapWindowAllocator,
        window: VirtualAddress,
        phys: PhysicalAddress,
        memory_type: MemoryType,
    ) -> Result<Self> {
        if let Err(err) = check_window(window) {
            windows.free_window(window);
            return Err(err);
        }
        if phys.is_null() || !phys.is_aligned::<Size4K>() {
            windows.free_window(window);
            return Err(Error::InvalidArgument("physical address must be a non-null page address"));
        }

        let mut mapping = Self::owning(mapper, windows, window);
        mapping.push_page(phys, memory_type)?;
        mapping.size = PAGE;
        mapping.flush();
        trace!("scoped: {window:?} -> {phys:?}");
        Ok(mapping)
    }

    /// Map a list of physical ranges back to back into `window`.
    ///
    /// Each range is mapped from the page containing its first byte. The
    /// pointer keeps the in-page offset of the first range.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] for a bad window, an empty list, a null
    ///   address or a length that is zero or not a page multiple.
    /// - Any error of [`Mapper::map_4k`].
    pub fn from_ranges(
        mapper: &'m M,
        windows: &'m dyn MapWindowAllocator,
        window: VirtualAddress,
        ranges: &[(PhysicalAddress, u64)],
    ) -> Result<Self> {
        let total = match check_window(window).and_then(|()| check_ranges(ranges)) {
            Ok(total) => total,
            Err(err) => {
                windows.free_window(window);
                return Err(err);
            }
        };

        let mut mapping = Self::owning(mapper, windows, window);
        for &(phys, len) in ranges {
            let base = phys.align_down::<Size4K>();
            for offset in (0..len).step_by(PAGE_SIZE) {
                mapping.push_page(base + offset, MemoryType::WriteBack)?;
            }
        }

        mapping.virt = window + ranges[0].0.offset::<Size4K>();
        mapping.size = total;
        mapping.flush();
        trace!("scoped: {window:?} <- {} ranges, {total:#x} bytes", ranges.len());
        Ok(mapping)
    }

    /// Map `size` bytes starting at `virt` as seen through the foreign table
    /// rooted at `root` (layout `E`, table pages read through `pool`).
    ///
    /// Each page is resolved with a table walk; pages falling inside the
    /// large leaf found for a previous page reuse that result.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] for a bad window or a zero size.
    /// - Any error of [`translate`](fn@crate::translate) for a page of the range.
    /// - Any error of [`Mapper::map_4k`].
    #[allow(clippy::too_many_arguments)]
    pub fn from_foreign<E, P>(
        mapper: &'m M,
        windows: &'m dyn MapWindowAllocator,
        window: VirtualAddress,
        pool: &P,
        root: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
    ) -> Result<Self>
    where
        E: PageTableEntry,
        P: PagePool + ?Sized,
    {
        let checked = check_window(window).and_then(|()| {
            if size == 0 {
                return Err(Error::InvalidArgument("zero-sized foreign mapping"));
            }
            size.checked_add(virt.offset::<Size4K>())
                .ok_or(Error::InvalidArgument("foreign range too large"))
        });
        let window_size = match checked {
            Ok(window_size) => window_size,
            Err(err) => {
                windows.free_window(window);
                return Err(err);
            }
        };

        let mut mapping = Self::owning(mapper, windows, window);
        let start = virt.align_down::<Size4K>().as_u64();
        // (virt base, phys base, span) of the leaf that resolved the last page
        let mut leaf: Option<(u64, u64, u64)> = None;

        while mapping.window_size < window_size {
            let page = start.wrapping_add(mapping.window_size);
            let phys = match leaf {
                Some((leaf_virt, leaf_phys, span)) if page.wrapping_sub(leaf_virt) < span => {
                    leaf_phys + (page - leaf_virt)
                }
                _ => {
                    let (phys, level) =
                        translate_with_level::<E, P>(pool, root, VirtualAddress::new(page))?;
                    let mask = level.entry_span() - 1;
                    leaf = Some((page & !mask, phys.as_u64() & !mask, level.entry_span()));
                    phys.as_u64()
                }
            };
            mapping.push_page(PhysicalAddress::new(phys), MemoryType::WriteBack)?;
        }

        mapping.virt = window + virt.offset::<Size4K>();
        mapping.size = size;
        mapping.window_size = window_size;
        mapping.flush();
        trace!("scoped: {window:?} <- {virt:?} via {root:?}, {size:#x} bytes");
        Ok(mapping)
    }

    /// [`new`](Self::new) with a freshly reserved one-page window.
    ///
    /// # Errors
    /// [`Error::AllocationFailure`] if no window is available; otherwise as
    /// [`new`](Self::new).
    pub fn map_page(
        mapper: &'m M,
        windows: &'m dyn MapWindowAllocator,
        phys: PhysicalAddress,
        memory_type: MemoryType,
    ) -> Result<Self> {
        let window = windows.alloc_window(PAGE).ok_or(Error::AllocationFailure)?;
        Self::new(mapper, windows, window, phys, memory_type)
    }

    /// [`from_ranges`](Self::from_ranges) with a freshly reserved window.
    ///
    /// # Errors
    /// [`Error::AllocationFailure`] if no window is available; otherwise as
    /// [`from_ranges`](Self::from_ranges).
    pub fn map_ranges(
        mapper: &'m M,
        windows: &'m dyn MapWindowAllocator,
        ranges: &[(PhysicalAddress, u64)],
    ) -> Result<Self> {
        let total = check_ranges(ranges)?;
        let window = windows.alloc_window(total).ok_or(Error::AllocationFailure)?;
        Self::from_ranges(mapper, windows, window, ranges)
    }

    /// [`from_foreign`](Self::from_foreign) with a freshly reserved window.
    ///
    /// # Errors
    /// [`Error::AllocationFailure`] if no window is available; otherwise as
    /// [`from_foreign`](Self::from_foreign).
    pub fn map_foreign<E, P>(
        mapper: &'m M,
        windows: &'m dyn MapWindowAllocator,
        pool: &P,
        root: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
    ) -> Result<Self>
    where
        E: PageTableEntry,
        P: PagePool + ?Sized,
    {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized foreign mapping"));
        }
        let len = size.saturating_add(virt.offset::<Size4K>());
        let window = windows.alloc_window(len).ok_or(Error::AllocationFailure)?;
        Self::from_foreign::<E, P>(mapper, windows, window, pool, root, virt, size)
    }

    /// Adopt a mapping previously given up with [`release`](Self::release).
    ///
    /// # Safety
    /// `parts` must come from `release` on a mapping built with the same
    /// `mapper` and `windows`, and nothing else may own that window.
    pub unsafe fn from_raw_parts(
        mapper: &'m M,
        windows: &'m dyn MapWindowAllocator,
        parts: MappingParts,
    ) -> Self {
        let (ptr, size, window_size) = parts;
        Self {
            mapper: Some(mapper),
            windows: Some(windows),
            virt: VirtualAddress::from_ptr(ptr),
            size,
            window_size,
        }
    }

    /// Pointer to the first mapped byte (null for an empty handle).
    #[inline]
    #[must_use]
    pub const fn get(&self) -> *mut u8 {
        self.virt.as_mut_ptr()
    }

    #[inline]
    #[must_use]
    pub const fn virt(&self) -> VirtualAddress {
        self.virt
    }

    /// Bytes requested by the creator.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Bytes of the window covered by mappings, from the window base.
    #[inline]
    #[must_use]
    pub const fn window_size(&self) -> u64 {
        self.window_size
    }

    /// Whether the handle currently owns a live mapping.
    #[inline]
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        !self.virt.is_null() && self.size != 0 && self.window_size != 0
    }

    /// The mapped bytes.
    ///
    /// # Safety
    /// The memory behind the mapping must be valid for reads and must not be
    /// written through another alias while the slice lives.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        if !self.is_mapped() {
            return &[];
        }
        #[allow(clippy::cast_possible_truncation)]
        let len = self.size as usize;
        // Safety: upheld by the caller; the window maps `size` bytes from `virt`.
        unsafe { core::slice::from_raw_parts(self.get(), len) }
    }

    /// The mapped bytes, writable.
    ///
    /// # Safety
    /// As [`as_slice`](Self::as_slice), and the memory must be valid for
    /// writes with no other live alias.
    #[must_use]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        if !self.is_mapped() {
            return &mut [];
        }
        #[allow(clippy::cast_possible_truncation)]
        let len = self.size as usize;
        // Safety: upheld by the caller.
        unsafe { core::slice::from_raw_parts_mut(self.get(), len) }
    }

    /// Invalidate the local TLB entry of every page in the window.
    pub fn flush(&self) {
        let Some(mapper) = self.mapper else { return };
        let base = self.base();
        for offset in (0..self.window_size).step_by(PAGE_SIZE) {
            mapper.flush_page(base + offset);
        }
    }

    /// Write back and evict every cache line of the window. Windows of
    /// [`CACHE_FLUSH_ALL_THRESHOLD`] bytes or more flush the whole cache.
    pub fn cache_flush(&self) {
        let Some(mapper) = self.mapper else { return };
        if self.virt.is_null() {
            return;
        }
        if self.window_size >= CACHE_FLUSH_ALL_THRESHOLD {
            mapper.flush_caches();
            return;
        }
        let base = self.base();
        for offset in (0..self.window_size).step_by(CACHE_LINE_SIZE) {
            mapper.flush_line((base + offset).as_ptr());
        }
    }

    /// Give up ownership without unmapping; the handle becomes empty.
    #[must_use = "the released window stays mapped"]
    pub const fn release(&mut self) -> MappingParts {
        let parts = (self.get(), self.size, self.window_size);
        self.virt = VirtualAddress::zero();
        self.size = 0;
        self.window_size = 0;
        parts
    }

    /// Unmap and free the current window; the handle becomes empty.
    pub fn reset(&mut self) {
        self.cleanup();
    }

    /// Unmap the current window, then adopt `parts`.
    ///
    /// # Safety
    /// As [`from_raw_parts`](Self::from_raw_parts) for this handle's mapper
    /// and window allocator.
    pub unsafe fn reset_with(&mut self, parts: MappingParts) {
        self.cleanup();
        let (ptr, size, window_size) = parts;
        self.virt = VirtualAddress::from_ptr(ptr);
        self.size = size;
        self.window_size = window_size;
    }

    fn cleanup(&mut self) {
        if let (Some(mapper), Some(windows)) = (self.mapper, self.windows)
            && !self.virt.is_null()
        {
            let base = self.base();
            for offset in (0..self.window_size).step_by(PAGE_SIZE) {
                mapper.unmap(base + offset);
            }
            windows.free_window(base);
            trace!("scoped: unmap {base:?} ({:#x} bytes)", self.window_size);
        }
        self.virt = VirtualAddress::zero();
        self.size = 0;
        self.window_size = 0;
    }
}

impl<M: Mapper + ?Sized> Default for ScopedMapping<'_, M> {
    fn default() -> Self {
        Self {
            mapper: None,
            windows: None,
            virt: VirtualAddress::zero(),
            size: 0,
            window_size: 0,
        }
    }
}

impl<M: Mapper + ?Sized> Drop for ScopedMapping<'_, M> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl<M: Mapper + ?Sized> fmt::Debug for ScopedMapping<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedMapping")
            .field("virt", &self.virt)
            .field("size", &self.size)
            .field("window_size", &self.window_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostPageTable, Level, NoIntrinsics};
    use vmm_pool::{LinearPagePool, WindowAllocator};

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    fn windows() -> WindowAllocator {
        WindowAllocator::new(VirtualAddress::new(0xffff_9000_0000_0000), 0x10_0000)
    }

    #[test]
    fn default_is_empty() {
        let mapping = ScopedMapping::<HostPageTable<'_, LinearPagePool, NoIntrinsics>>::default();
        assert!(!mapping.is_mapped());
        assert!(mapping.get().is_null());
        assert_eq!(mapping.size(), 0);
        assert_eq!(unsafe { mapping.as_slice() }, &[] as &[u8]);
    }

    #[test]
    fn single_page_lifecycle() {
        let pool = LinearPagePool::new(16, pa(0x0100_0000));
        let host = HostPageTable::new(&pool, NoIntrinsics, true).unwrap();
        let windows = windows();

        let mapping = ScopedMapping::map_page(&host, &windows, pa(0x4242_0000), MemoryType::WriteBack)
            .unwrap();
        assert!(mapping.is_mapped());
        assert_eq!(mapping.size(), 0x1000);
        assert_eq!(
            Mapper::virt_to_phys(&host, mapping.virt()).unwrap(),
            pa(0x4242_0000)
        );
        assert_eq!(windows.in_use(), 1);

        let virt = mapping.virt();
        drop(mapping);
        assert_eq!(host.from(virt), Err(Error::NotMapped));
        assert_eq!(windows.in_use(), 0);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn bad_inputs_give_the_window_back() {
        let pool = LinearPagePool::new(16, pa(0x0100_0000));
        let host = HostPageTable::new(&pool, NoIntrinsics, true).unwrap();
        let windows = windows();

        let result = ScopedMapping::map_page(&host, &windows, pa(0x4242_0010), MemoryType::WriteBack);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let result = ScopedMapping::map_page(&host, &windows, pa(0), MemoryType::WriteBack);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let result = ScopedMapping::map_ranges(&host, &windows, &[(pa(0x1000), 0x800)]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let result = ScopedMapping::map_ranges(&host, &windows, &[]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        // host tables only express write-back
        let result = ScopedMapping::map_page(&host, &windows, pa(0x1000), MemoryType::Uncacheable);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        assert_eq!(windows.in_use(), 0);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn release_and_adopt() {
        let pool = LinearPagePool::new(16, pa(0x0100_0000));
        let host = HostPageTable::new(&pool, NoIntrinsics, true).unwrap();
        let windows = windows();

        let mut mapping = ScopedMapping::map_page(&host, &windows, pa(0x7000), MemoryType::WriteBack)
            .unwrap();
        let parts = mapping.release();
        assert!(!mapping.is_mapped());
        drop(mapping);
        let virt = VirtualAddress::from_ptr(parts.0);
        assert_eq!(host.from(virt), Ok(Level::L1));

        let mut other = ScopedMapping::map_page(&host, &windows, pa(0x8000), MemoryType::WriteBack)
            .unwrap();
        let other_virt = other.virt();
        unsafe { other.reset_with(parts) };
        assert_eq!(host.from(other_virt), Err(Error::NotMapped));
        assert_eq!(other.virt(), virt);
        assert_eq!(other.window_size(), 0x1000);

        other.reset();
        assert_eq!(host.from(virt), Err(Error::NotMapped));
        assert_eq!(windows.in_use(), 0);
    }
}
