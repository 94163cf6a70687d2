//! The narrow interface [`ScopedMapping`](crate::ScopedMapping) needs from a
//! page table, so mappings can be driven by any table (or a test double
//! wrapping one).

use crate::entry::{Attributes, MemoryType, PageTableEntry};
use crate::intrinsics::CpuIntrinsics;
use crate::{Level, Result, RootPageTable};
use vmm_addresses::{PhysicalAddress, VirtualAddress};
use vmm_pool::PagePool;

/// 4 KiB mapping primitives plus the cache/TLB maintenance around them.
pub trait Mapper {
    /// Map one 4 KiB page.
    ///
    /// # Errors
    /// Whatever the underlying table reports.
    fn map_4k(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attributes,
        memory_type: MemoryType,
    ) -> Result<()>;

    /// Remove the mapping of `virt`, if any.
    fn unmap(&self, virt: VirtualAddress) -> Option<Level>;

    /// Physical address `virt` currently maps to.
    ///
    /// # Errors
    /// [`Error::NotMapped`](crate::Error::NotMapped) if there is none.
    fn virt_to_phys(&self, virt: VirtualAddress) -> Result<PhysicalAddress>;

    /// Drop the local TLB entry for the page containing `virt`.
    fn flush_page(&self, virt: VirtualAddress);

    /// Write back and evict the cache line containing `addr`.
    fn flush_line(&self, addr: *const u8);

    /// Write back and invalidate every cache of the executing core.
    fn flush_caches(&self);
}

impl<M: Mapper + ?Sized> Mapper for &M {
    fn map_4k(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attributes,
        memory_type: MemoryType,
    ) -> Result<()> {
        (**self).map_4k(virt, phys, attrs, memory_type)
    }

    fn unmap(&self, virt: VirtualAddress) -> Option<Level> {
        (**self).unmap(virt)
    }

    fn virt_to_phys(&self, virt: VirtualAddress) -> Result<PhysicalAddress> {
        (**self).virt_to_phys(virt)
    }

    fn flush_page(&self, virt: VirtualAddress) {
        (**self).flush_page(virt);
    }

    fn flush_line(&self, addr: *const u8) {
        (**self).flush_line(addr);
    }

    fn flush_caches(&self) {
        (**self).flush_caches();
    }
}

impl<E, P, I> Mapper for RootPageTable<'_, E, P, I>
where
    E: PageTableEntry,
    P: PagePool,
    I: CpuIntrinsics,
{
    fn map_4k(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attributes,
        memory_type: MemoryType,
    ) -> Result<()> {
        self.map_4k_with(virt, phys, attrs, memory_type)
    }

    fn unmap(&self, virt: VirtualAddress) -> Option<Level> {
        Self::unmap(self, virt)
    }

    fn virt_to_phys(&self, virt: VirtualAddress) -> Result<PhysicalAddress> {
        Self::virt_to_phys(self, virt).map(|(phys, _)| phys)
    }

    fn flush_page(&self, virt: VirtualAddress) {
        self.intrinsics().invlpg(virt);
    }

    fn flush_line(&self, addr: *const u8) {
        self.intrinsics().clflush(addr);
    }

    fn flush_caches(&self) {
        self.intrinsics().wbinvd();
    }
}
