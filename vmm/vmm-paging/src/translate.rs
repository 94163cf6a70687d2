//! # Foreign Table Walks
//!
//! Resolves an address through a page-table tree this crate does not own,
//! e.g. a guest's CR3 or another core's EPT, given only the physical address
//! of its top-level table. Table pages are read through the pool's linear
//! window and never written.
//!
//! The foreign tree may change underneath the walk; each entry is read once
//! with a volatile load and the result reflects whatever was observed.

use crate::entry::PageTableEntry;
use crate::{Error, Level, Result};
use vmm_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use vmm_pool::PagePool;

/// Translate `addr` through the tree rooted at `root`.
///
/// The in-page offset of `addr` is carried over at whatever granularity the
/// walk ends on.
///
/// # Errors
/// - [`Error::InvalidPhysicalAddress`] if `root` is null, misaligned or
///   beyond 52 bits.
/// - [`Error::InvalidArgument`] if `addr` cannot be walked by this layout.
/// - [`Error::NotMapped`] if an entry on the path is not present.
pub fn translate<E: PageTableEntry, P: PagePool + ?Sized>(
    pool: &P,
    root: PhysicalAddress,
    addr: VirtualAddress,
) -> Result<PhysicalAddress> {
    translate_with_level::<E, P>(pool, root, addr).map(|(phys, _)| phys)
}

/// [`translate`], additionally reporting the level of the leaf used.
///
/// # Errors
/// As [`translate`].
pub fn translate_with_level<E: PageTableEntry, P: PagePool + ?Sized>(
    pool: &P,
    root: PhysicalAddress,
    addr: VirtualAddress,
) -> Result<(PhysicalAddress, Level)> {
    if root.is_null() || !root.is_aligned::<Size4K>() || !root.is_addressable() {
        return Err(Error::InvalidPhysicalAddress);
    }
    if !E::KIND.accepts(addr) {
        return Err(Error::InvalidArgument("address outside the walkable range"));
    }

    let mut table = root;
    let mut level = Level::TOP;
    loop {
        let entry = read_entry::<E, P>(pool, table, level.index_of(addr))?;
        if !entry.is_present() {
            return Err(Error::NotMapped);
        }

        if level == Level::L1 || (level.allows_large_leaf() && entry.is_large()) {
            let mask = level.entry_span() - 1;
            let phys = (entry.frame().as_u64() & !mask) | (addr.as_u64() & mask);
            return Ok((PhysicalAddress::new(phys), level));
        }

        table = entry.frame();
        level = level.lower().ok_or(Error::NotMapped)?;
    }
}

fn read_entry<E: PageTableEntry, P: PagePool + ?Sized>(
    pool: &P,
    table: PhysicalAddress,
    index: usize,
) -> Result<E> {
    let base = pool.phys_to_virt(table).cast::<u64>();
    if base.is_null() {
        return Err(Error::InvalidPhysicalAddress);
    }
    // Safety: `table` is 4 KiB aligned and `index < 512`, so the slot lies
    // within the table page the pool window maps.
    let raw = unsafe { base.add(index).read_volatile() };
    Ok(E::from_raw(raw))
}
