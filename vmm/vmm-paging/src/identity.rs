//! Identity maps (`virt == phys`) over whole ranges, and conversion of an
//! identity-mapped region between granularities.
//!
//! Identity leaves are always read-write-execute and write-back. A failed
//! setup is not rolled back: pages mapped before the failure stay mapped.

use crate::entry::{Attributes, MemoryType, PageTableEntry};
use crate::intrinsics::CpuIntrinsics;
use crate::{Error, LeafSize, Result, RootPageTable};
use log::debug;
use vmm_addresses::{PageSize, PhysicalAddress, Size1G, Size2M, Size4K, VirtualAddress};
use vmm_pool::PagePool;

fn check_range<S: LeafSize>(start: u64, end: u64) -> Result<()> {
    if start > end {
        return Err(Error::InvalidArgument("identity range ends before it starts"));
    }
    if start & S::MASK != 0 || end & S::MASK != 0 {
        return Err(Error::InvalidArgument("identity range not aligned to the page size"));
    }
    Ok(())
}

impl<E, P, I> RootPageTable<'_, E, P, I>
where
    E: PageTableEntry,
    P: PagePool,
    I: CpuIntrinsics,
{
    fn identity_map<S: LeafSize>(&self, start: u64, end: u64) -> Result<()> {
        check_range::<S>(start, end)?;
        debug!("identity: map [{start:#x}, {end:#x}) with {} pages", S::as_str());

        for addr in (start..end).step_by(step::<S>()) {
            self.map::<S>(
                VirtualAddress::new(addr),
                PhysicalAddress::new(addr),
                Attributes::READ_WRITE_EXECUTE,
                MemoryType::WriteBack,
            )?;
        }
        Ok(())
    }

    fn identity_unmap<S: LeafSize>(&self, start: u64, end: u64) {
        debug!("identity: unmap [{start:#x}, {end:#x}) in {} steps", S::as_str());
        for addr in (start & !S::MASK..end).step_by(step::<S>()) {
            self.unmap(VirtualAddress::new(addr));
        }
    }

    /// Swap the identity region at `addr` from `Old` to `New` leaves. The
    /// region spans the larger of the two sizes and must start on it;
    /// nothing is unmapped unless it does.
    fn convert<Old: LeafSize, New: LeafSize>(&self, addr: u64) -> Result<()> {
        let region = Old::SIZE.max(New::SIZE);
        if addr & (region - 1) != 0 {
            return Err(Error::InvalidArgument("conversion address not aligned to the region"));
        }
        if !E::KIND.accepts(VirtualAddress::new(addr)) {
            return Err(Error::InvalidArgument("virtual address outside the walkable range"));
        }
        let end = addr
            .checked_add(region)
            .ok_or(Error::InvalidArgument("conversion region overflows"))?;

        debug!(
            "identity: convert {addr:#x} from {} to {} pages",
            Old::as_str(),
            New::as_str()
        );
        self.identity_unmap::<Old>(addr, end);
        self.release(VirtualAddress::new(addr));
        self.identity_map::<New>(addr, end)
    }

    /// Identity map `[start, end)` with 1 GiB pages.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if the range is inverted or misaligned;
    /// otherwise the first error of an individual map.
    pub fn setup_identity_map_1g(&self, start: u64, end: u64) -> Result<()> {
        self.identity_map::<Size1G>(start, end)
    }

    /// Identity map `[start, end)` with 2 MiB pages.
    ///
    /// # Errors
    /// See [`setup_identity_map_1g`](Self::setup_identity_map_1g).
    pub fn setup_identity_map_2m(&self, start: u64, end: u64) -> Result<()> {
        self.identity_map::<Size2M>(start, end)
    }

    /// Identity map `[start, end)` with 4 KiB pages.
    ///
    /// # Errors
    /// See [`setup_identity_map_1g`](Self::setup_identity_map_1g).
    pub fn setup_identity_map_4k(&self, start: u64, end: u64) -> Result<()> {
        self.identity_map::<Size4K>(start, end)
    }

    /// Unmap `[start, end)` in 1 GiB steps; unmapped steps are skipped.
    pub fn unmap_identity_map_1g(&self, start: u64, end: u64) {
        self.identity_unmap::<Size1G>(start, end);
    }

    /// Unmap `[start, end)` in 2 MiB steps.
    pub fn unmap_identity_map_2m(&self, start: u64, end: u64) {
        self.identity_unmap::<Size2M>(start, end);
    }

    /// Unmap `[start, end)` in 4 KiB steps.
    pub fn unmap_identity_map_4k(&self, start: u64, end: u64) {
        self.identity_unmap::<Size4K>(start, end);
    }

    /// Replace the 1 GiB identity page at `addr` with 512 2 MiB pages.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if `addr` does not start a 1 GiB region,
    /// in which case the table is left untouched; otherwise as
    /// [`setup_identity_map_2m`](Self::setup_identity_map_2m).
    pub fn identity_map_1g_to_2m(&self, addr: u64) -> Result<()> {
        self.convert::<Size1G, Size2M>(addr)
    }

    /// Replace the 1 GiB identity page at `addr` with 4 KiB pages.
    ///
    /// # Errors
    /// As [`setup_identity_map_4k`](Self::setup_identity_map_4k).
    pub fn identity_map_1g_to_4k(&self, addr: u64) -> Result<()> {
        self.convert::<Size1G, Size4K>(addr)
    }

    /// Replace the 2 MiB identity page at `addr` with 4 KiB pages.
    ///
    /// # Errors
    /// As [`setup_identity_map_4k`](Self::setup_identity_map_4k).
    pub fn identity_map_2m_to_4k(&self, addr: u64) -> Result<()> {
        self.convert::<Size2M, Size4K>(addr)
    }

    /// Collapse the 2 MiB identity pages of the 1 GiB region at `addr`.
    ///
    /// # Errors
    /// As [`setup_identity_map_1g`](Self::setup_identity_map_1g).
    pub fn identity_map_2m_to_1g(&self, addr: u64) -> Result<()> {
        self.convert::<Size2M, Size1G>(addr)
    }

    /// Collapse the 4 KiB identity pages of the 2 MiB region at `addr`.
    ///
    /// # Errors
    /// As [`setup_identity_map_2m`](Self::setup_identity_map_2m).
    pub fn identity_map_4k_to_2m(&self, addr: u64) -> Result<()> {
        self.convert::<Size4K, Size2M>(addr)
    }

    /// Collapse the 4 KiB identity pages of the 1 GiB region at `addr`.
    ///
    /// # Errors
    /// As [`setup_identity_map_1g`](Self::setup_identity_map_1g).
    pub fn identity_map_4k_to_1g(&self, addr: u64) -> Result<()> {
        self.convert::<Size4K, Size1G>(addr)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn step<S: PageSize>() -> usize {
    S::SIZE as usize
}
