//! Bundles the hypervisor's own page table with the window allocator used for
//! temporary mappings, so call sites do not thread both through every call.

use crate::entry::{MemoryType, PageTableEntry};
use crate::intrinsics::CpuIntrinsics;
use crate::scoped::ScopedMapping;
use crate::translate::translate_with_level;
use crate::{Level, Result, RootPageTable};
use vmm_addresses::{PhysicalAddress, VirtualAddress};
use vmm_pool::{MapWindowAllocator, PagePool};

/// Scoped mapping driven by a context's table.
pub type ContextMapping<'a, 'p, E, P, I> = ScopedMapping<'a, RootPageTable<'p, E, P, I>>;

/// The table scoped mappings go into, plus where their windows come from.
pub struct MemoryContext<'a, 'p, E, P, I>
where
    E: PageTableEntry,
    P: PagePool,
    I: CpuIntrinsics,
{
    table: &'a RootPageTable<'p, E, P, I>,
    windows: &'a dyn MapWindowAllocator,
}

impl<'a, 'p, E, P, I> MemoryContext<'a, 'p, E, P, I>
where
    E: PageTableEntry,
    P: PagePool,
    I: CpuIntrinsics,
{
    pub const fn new(table: &'a RootPageTable<'p, E, P, I>, windows: &'a dyn MapWindowAllocator) -> Self {
        Self { table, windows }
    }

    #[must_use]
    pub const fn table(&self) -> &'a RootPageTable<'p, E, P, I> {
        self.table
    }

    #[must_use]
    pub const fn windows(&self) -> &'a dyn MapWindowAllocator {
        self.windows
    }

    /// Pool backing the table, also used to read foreign tables.
    #[must_use]
    pub const fn pool(&self) -> &'p P {
        self.table.pool()
    }

    /// Physical address behind a pointer mapped by the context's table.
    ///
    /// # Errors
    /// [`Error::NotMapped`](crate::Error::NotMapped) if `ptr` is not mapped.
    pub fn virt_to_phys<T>(&self, ptr: *const T) -> Result<PhysicalAddress> {
        self.table
            .virt_to_phys(VirtualAddress::from_ptr(ptr))
            .map(|(phys, _)| phys)
    }

    /// Map one physical page for the lifetime of the returned handle.
    ///
    /// # Errors
    /// As [`ScopedMapping::map_page`].
    pub fn map_page(
        &self,
        phys: PhysicalAddress,
        memory_type: MemoryType,
    ) -> Result<ContextMapping<'a, 'p, E, P, I>> {
        ScopedMapping::map_page(self.table, self.windows, phys, memory_type)
    }

    /// Map a list of physical ranges contiguously.
    ///
    /// # Errors
    /// As [`ScopedMapping::map_ranges`].
    pub fn map_ranges(&self, ranges: &[(PhysicalAddress, u64)]) -> Result<ContextMapping<'a, 'p, E, P, I>> {
        ScopedMapping::map_ranges(self.table, self.windows, ranges)
    }

    /// Map `size` bytes of another address space, given the root of its
    /// page table in layout `F`.
    ///
    /// # Errors
    /// As [`ScopedMapping::map_foreign`].
    pub fn map_foreign<F: PageTableEntry>(
        &self,
        root: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
    ) -> Result<ContextMapping<'a, 'p, E, P, I>> {
        ScopedMapping::map_foreign::<F, P>(self.table, self.windows, self.pool(), root, virt, size)
    }

    /// Walk a foreign table of layout `F`.
    ///
    /// # Errors
    /// As [`translate`](fn@crate::translate).
    pub fn translate<F: PageTableEntry>(
        &self,
        root: PhysicalAddress,
        addr: VirtualAddress,
    ) -> Result<(PhysicalAddress, Level)> {
        translate_with_level::<F, P>(self.pool(), root, addr)
    }
}
