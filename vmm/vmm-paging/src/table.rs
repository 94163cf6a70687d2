//! # Root Page Tables
//!
//! [`RootPageTable`] owns a complete 4-level tree and is the only way the
//! rest of the hypervisor touches page tables. Every public operation takes
//! the table's [`SpinLock`], walks or extends the tree, and issues any TLB
//! invalidation *before* the lock is released.
//!
//! The layout parameter picks the hardware consumer:
//!
//! - [`ExtendedPageTable`]: guest-physical → system-physical, loaded via [`Eptp`].
//! - [`HostPageTable`]: the hypervisor's own address space, loaded via [`Cr3`].
//!
//! Invalidation is local to the executing core. Callers that change a table
//! active on other cores must broadcast the shootdown themselves.

use crate::entry::{Attributes, EptEntry, HostEntry, MemoryType, PageTableEntry, TableKind};
use crate::intrinsics::{CpuIntrinsics, NoIntrinsics};
use crate::node::{MemoryDescriptor, PageTableNode};
use crate::{Error, LeafSize, Level, Result};
use alloc::vec::Vec;
use log::{debug, trace, warn};
use vmm_addresses::{PhysicalAddress, Size1G, Size2M, Size4K, VirtualAddress};
use vmm_info::memory::HOST_PAT;
use vmm_pool::PagePool;
use vmm_registers::cr3::Cr3;
use vmm_registers::eptp::Eptp;
use vmm_sync::SpinLock;

/// Nested paging table for one guest.
pub type ExtendedPageTable<'p, P, I> = RootPageTable<'p, EptEntry, P, I>;

/// Host paging table (the hypervisor's address space, or another CR3 tree).
pub type HostPageTable<'p, P, I> = RootPageTable<'p, HostEntry, P, I>;

/// Owner of one page-table tree.
pub struct RootPageTable<'p, E, P, I = NoIntrinsics>
where
    E: PageTableEntry,
    P: PagePool,
    I: CpuIntrinsics,
{
    pool: &'p P,
    intrinsics: I,
    is_vmm: bool,
    root_phys: PhysicalAddress,
    root: SpinLock<PageTableNode<E>>,
}

impl<'p, E, P, I> RootPageTable<'p, E, P, I>
where
    E: PageTableEntry,
    P: PagePool,
    I: CpuIntrinsics,
{
    /// Empty tree with a freshly allocated top-level table.
    ///
    /// `is_vmm` marks the hypervisor's own table: its links never grant
    /// user access and the null page can never be mapped in it.
    ///
    /// # Errors
    /// [`Error::AllocationFailure`] if the pool has no page for the root.
    pub fn new(pool: &'p P, intrinsics: I, is_vmm: bool) -> Result<Self> {
        let root = PageTableNode::allocate(pool, Level::TOP)?;
        let root_phys = root.phys();
        debug!("table: new {:?} root at {root_phys:?} (vmm: {is_vmm})", E::KIND);
        Ok(Self {
            pool,
            intrinsics,
            is_vmm,
            root_phys,
            root: SpinLock::new(root),
        })
    }

    #[inline]
    #[must_use]
    pub const fn is_vmm(&self) -> bool {
        self.is_vmm
    }

    #[inline]
    #[must_use]
    pub const fn pool(&self) -> &'p P {
        self.pool
    }

    #[inline]
    #[must_use]
    pub const fn intrinsics(&self) -> &I {
        &self.intrinsics
    }

    /// Physical frame of the top-level table.
    #[inline]
    #[must_use]
    pub const fn root_phys(&self) -> PhysicalAddress {
        self.root_phys
    }

    fn check_mapping<S: LeafSize>(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attributes,
        memory_type: MemoryType,
    ) -> Result<()> {
        if !E::KIND.accepts(virt) {
            return Err(Error::InvalidArgument("virtual address outside the walkable range"));
        }
        if E::KIND == TableKind::Host && self.is_vmm && virt.is_null() {
            return Err(Error::InvalidArgument("null virtual address"));
        }
        if !virt.is_aligned::<S>() {
            return Err(Error::InvalidArgument("virtual address not aligned to the page size"));
        }
        if !phys.is_aligned::<S>() {
            return Err(Error::InvalidArgument("physical address not aligned to the page size"));
        }
        if !phys.is_addressable() {
            return Err(Error::InvalidPhysicalAddress);
        }
        if !E::supports(memory_type) {
            return Err(Error::InvalidArgument("memory type not supported by this table"));
        }
        // EPT leaves without R/W/X are not present and would read back as holes.
        if !E::leaf(phys, attrs, memory_type, S::LEVEL).is_present() {
            return Err(Error::InvalidArgument("leaf would not be present"));
        }
        Ok(())
    }

    /// Map one page of granularity `S`.
    pub(crate) fn map<S: LeafSize>(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attributes,
        memory_type: MemoryType,
    ) -> Result<()> {
        self.check_mapping::<S>(virt, phys, attrs, memory_type)?;

        let mut root = self.root.lock();
        let result = root
            .add_page(self.pool, virt, S::LEVEL, !self.is_vmm)
            .and_then(|mut slot| {
                if !slot.is_blank() {
                    return Err(Error::AlreadyMapped);
                }
                slot.fill_leaf(phys, attrs, memory_type, S::LEVEL);
                Ok(())
            });

        match result {
            Ok(()) => {
                self.intrinsics.invlpg(virt);
                trace!(
                    "table: map {} {virt:?} -> {phys:?} ({attrs:?}, {memory_type:?})",
                    S::as_str()
                );
                Ok(())
            }
            Err(err) => {
                // Drop tables that were created for nothing.
                root.release(self.pool, virt);
                if err == Error::AllocationFailure {
                    warn!("table: map {} {virt:?} -> {phys:?}: page pool exhausted", S::as_str());
                } else {
                    debug!("table: map {} {virt:?} -> {phys:?} failed: {err}", S::as_str());
                }
                Err(err)
            }
        }
    }

    /// Map a 4 KiB page with write-back caching.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] for misaligned or out-of-range addresses.
    /// - [`Error::InvalidPhysicalAddress`] if `phys` exceeds 52 bits.
    /// - [`Error::AlreadyMapped`] if the slot is taken.
    /// - [`Error::AllocationFailure`] if intermediate tables cannot be built.
    pub fn map_4k(&self, virt: VirtualAddress, phys: PhysicalAddress, attrs: Attributes) -> Result<()> {
        self.map::<Size4K>(virt, phys, attrs, MemoryType::WriteBack)
    }

    /// Map a 2 MiB page with write-back caching; see [`map_4k`](Self::map_4k).
    ///
    /// # Errors
    /// As [`map_4k`](Self::map_4k).
    pub fn map_2m(&self, virt: VirtualAddress, phys: PhysicalAddress, attrs: Attributes) -> Result<()> {
        self.map::<Size2M>(virt, phys, attrs, MemoryType::WriteBack)
    }

    /// Map a 1 GiB page with write-back caching; see [`map_4k`](Self::map_4k).
    ///
    /// # Errors
    /// As [`map_4k`](Self::map_4k).
    pub fn map_1g(&self, virt: VirtualAddress, phys: PhysicalAddress, attrs: Attributes) -> Result<()> {
        self.map::<Size1G>(virt, phys, attrs, MemoryType::WriteBack)
    }

    /// [`map_4k`](Self::map_4k) with an explicit memory type.
    ///
    /// # Errors
    /// As [`map_4k`](Self::map_4k); additionally [`Error::InvalidArgument`]
    /// if the table layout cannot express `memory_type`.
    pub fn map_4k_with(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attributes,
        memory_type: MemoryType,
    ) -> Result<()> {
        self.map::<Size4K>(virt, phys, attrs, memory_type)
    }

    /// [`map_2m`](Self::map_2m) with an explicit memory type.
    ///
    /// # Errors
    /// As [`map_4k_with`](Self::map_4k_with).
    pub fn map_2m_with(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attributes,
        memory_type: MemoryType,
    ) -> Result<()> {
        self.map::<Size2M>(virt, phys, attrs, memory_type)
    }

    /// [`map_1g`](Self::map_1g) with an explicit memory type.
    ///
    /// # Errors
    /// As [`map_4k_with`](Self::map_4k_with).
    pub fn map_1g_with(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attributes,
        memory_type: MemoryType,
    ) -> Result<()> {
        self.map::<Size1G>(virt, phys, attrs, memory_type)
    }

    /// Remove whatever leaf translates `virt` and reclaim empty tables.
    ///
    /// Unmapping an address that is not mapped does nothing. Returns the
    /// granularity of the removed mapping.
    pub fn unmap(&self, virt: VirtualAddress) -> Option<Level> {
        let removed = self.root.with_lock(|root| {
            let removed = root.remove_page(self.pool, virt);
            if removed.is_some() {
                self.intrinsics.invlpg(virt);
            }
            removed
        });

        match removed {
            Some(level) => trace!("table: unmap {virt:?} ({level:?})"),
            None => trace!("table: unmap {virt:?}: not mapped"),
        }
        removed
    }

    /// Free any empty tables on the path to `virt`, e.g. before remapping a
    /// region at a different granularity.
    pub fn release(&self, virt: VirtualAddress) {
        self.root.with_lock(|root| root.release(self.pool, virt));
    }

    /// Copy of the leaf entry translating `virt`.
    ///
    /// # Errors
    /// [`Error::NotMapped`] if no leaf exists.
    pub fn virt_to_pte(&self, virt: VirtualAddress) -> Result<E> {
        self.root
            .with_lock(|root| root.virt_to_pte(self.pool, virt))
            .map(|(entry, _)| entry)
    }

    /// Resolve `virt` to the physical address it maps to, including the
    /// in-page offset, plus the granularity of the mapping.
    ///
    /// # Errors
    /// [`Error::NotMapped`] if no present leaf exists.
    pub fn virt_to_phys(&self, virt: VirtualAddress) -> Result<(PhysicalAddress, Level)> {
        let (entry, level) = self.root.with_lock(|root| root.virt_to_pte(self.pool, virt))?;
        if !entry.is_present() {
            return Err(Error::NotMapped);
        }
        let mask = level.entry_span() - 1;
        let phys = (entry.frame().as_u64() & !mask) | (virt.as_u64() & mask);
        Ok((PhysicalAddress::new(phys), level))
    }

    /// Level of the leaf translating `virt`.
    ///
    /// # Errors
    /// [`Error::NotMapped`] if no leaf exists.
    pub fn from(&self, virt: VirtualAddress) -> Result<Level> {
        self.root
            .with_lock(|root| root.virt_to_pte(self.pool, virt))
            .map(|(_, level)| level)
    }

    /// # Errors
    /// [`Error::NotMapped`] if no leaf exists.
    pub fn is_1g(&self, virt: VirtualAddress) -> Result<bool> {
        self.from(virt).map(|level| level == Level::L3)
    }

    /// # Errors
    /// [`Error::NotMapped`] if no leaf exists.
    pub fn is_2m(&self, virt: VirtualAddress) -> Result<bool> {
        self.from(virt).map(|level| level == Level::L2)
    }

    /// # Errors
    /// [`Error::NotMapped`] if no leaf exists.
    pub fn is_4k(&self, virt: VirtualAddress) -> Result<bool> {
        self.from(virt).map(|level| level == Level::L1)
    }

    /// One descriptor per table of the tree, root first.
    #[must_use]
    pub fn pt_to_mdl(&self) -> Vec<MemoryDescriptor> {
        let mut mdl = Vec::new();
        self.root.with_lock(|root| root.pt_to_mdl(self.pool, &mut mdl));
        mdl
    }

    /// Non-empty entries across the whole tree.
    #[must_use]
    pub fn global_size(&self) -> usize {
        self.root.with_lock(|root| root.global_size(self.pool))
    }
}

impl<E, P, I> Drop for RootPageTable<'_, E, P, I>
where
    E: PageTableEntry,
    P: PagePool,
    I: CpuIntrinsics,
{
    fn drop(&mut self) {
        debug!("table: tear down {:?} root at {:?}", E::KIND, self.root_phys);
        // Safety: `self.root` is never touched again, so the handle is unique.
        let root = unsafe { core::ptr::read(self.root.get_mut()) };
        // Safety: dropping the table ends every use of the tree.
        unsafe { root.free_all(self.pool) };
    }
}

impl<P, I> RootPageTable<'_, HostEntry, P, I>
where
    P: PagePool,
    I: CpuIntrinsics,
{
    /// CR3 value that loads this table (write-back PML4 fetches).
    #[must_use]
    pub const fn cr3(&self) -> Cr3 {
        Cr3::from_pml4_phys(self.root_phys, false, false)
    }

    /// PAT value host mappings from this table assume.
    #[must_use]
    pub const fn pat(&self) -> u64 {
        HOST_PAT
    }

    /// Load this table into CR3 on the executing core.
    ///
    /// # Safety
    /// The table must map the currently executing code, stack and data, and
    /// the PAT must hold [`pat`](Self::pat).
    #[cfg(feature = "asm")]
    pub unsafe fn activate(&self) {
        use vmm_registers::StoreRegisterUnsafe;
        unsafe { self.cr3().store_unsafe() };
    }
}

impl<P, I> RootPageTable<'_, EptEntry, P, I>
where
    P: PagePool,
    I: CpuIntrinsics,
{
    /// EPTP value that selects this table (write-back, 4-level walk).
    #[must_use]
    pub const fn eptp(&self) -> Eptp {
        Eptp::from_pml4_phys(self.root_phys)
    }
}
