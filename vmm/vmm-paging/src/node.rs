//! # Page-Table Nodes
//!
//! A [`PageTableNode`] is a handle to one 4 KiB table page taken from the
//! [`PagePool`]. Nodes are linked by *physical* address exactly as the
//! hardware walker sees them; descending means translating a link's frame
//! back into a pointer through the pool window.
//!
//! ## Ownership
//!
//! A node owns every child its link entries point at. The tree is only ever
//! modified through a `&mut` handle to its root, so no two walks can race.
//! Handles have no `Drop`: the owner (see [`RootPageTable`](crate::RootPageTable))
//! tears the tree down explicitly with [`free_all`](PageTableNode::free_all),
//! because returning pages needs the pool.
//!
//! ## Reclaiming
//!
//! [`remove_page`](PageTableNode::remove_page) and
//! [`release`](PageTableNode::release) free any node that becomes empty on
//! the way back up. Since empty children are always pruned, `size() == 0`
//! implies `global_size() == 0` for every node reachable from a root.
//! Scattered map/unmap sequences pay for this with repeated node
//! allocation; that trade keeps the tree minimal at all times.

use crate::entry::{EntryView, PageTableEntry};
use crate::{Error, Level, Result};
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr::NonNull;
use log::trace;
use vmm_addresses::{PhysicalAddress, VirtualAddress};
use vmm_info::memory::{ENTRIES_PER_TABLE, PAGE_SIZE};
use vmm_pool::{Page, PagePool};

/// In-memory layout of every table level.
#[repr(C, align(4096))]
struct RawTable {
    entries: [u64; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<RawTable>() == PAGE_SIZE);
const _: () = assert!(size_of::<Page>() == size_of::<RawTable>());

/// One table of the tree: where it lives and which level it is.
#[derive(Debug)]
pub struct MemoryDescriptor {
    /// Pool-window address of the table page.
    pub virt: VirtualAddress,
    /// System-physical address of the table page.
    pub phys: PhysicalAddress,
    /// Bytes occupied by the table.
    pub len: u64,
    pub level: Level,
}

/// Handle to one table page of a paging tree.
pub struct PageTableNode<E> {
    table: NonNull<RawTable>,
    phys: PhysicalAddress,
    level: Level,
    _layout: PhantomData<E>,
}

// Safety: the handle is the only path to its page; moving it moves that
// exclusive access along.
unsafe impl<E: Send> Send for PageTableNode<E> {}

impl<E: PageTableEntry> PageTableNode<E> {
    /// Take a zeroed page from `pool` as an empty table of `level`.
    pub fn allocate<P: PagePool>(pool: &P, level: Level) -> Result<Self> {
        let page = pool.allocate().ok_or(Error::AllocationFailure)?;
        let phys = pool.virt_to_phys(page.as_ptr().cast());
        trace!("node: allocate {level:?} table at {phys:?}");
        Ok(Self {
            table: page.cast(),
            phys,
            level,
            _layout: PhantomData,
        })
    }

    /// Handle for the child table a link entry points at.
    fn child<P: PagePool>(&self, pool: &P, link: E) -> Option<Self> {
        let level = self.level.lower()?;
        let phys = link.frame();
        let table = NonNull::new(pool.phys_to_virt(phys).cast::<RawTable>())?;
        Some(Self {
            table,
            phys,
            level,
            _layout: PhantomData,
        })
    }

    #[inline]
    #[must_use]
    pub const fn level(&self) -> Level {
        self.level
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    #[inline]
    fn entries(&self) -> &[u64; ENTRIES_PER_TABLE] {
        // Safety: the page stays allocated while the handle exists.
        unsafe { &(*self.table.as_ptr()).entries }
    }

    #[inline]
    fn entries_mut(&mut self) -> &mut [u64; ENTRIES_PER_TABLE] {
        // Safety: as above; `&mut self` serializes writers.
        unsafe { &mut (*self.table.as_ptr()).entries }
    }

    /// Typed copy of the entry at `index`.
    #[inline]
    #[must_use]
    pub fn entry(&self, index: usize) -> E {
        E::from_raw(self.entries()[index])
    }

    /// Whether an entry read at this level ends the walk.
    #[inline]
    fn is_leaf(&self, entry: E) -> bool {
        self.level == Level::L1 || (self.level.allows_large_leaf() && entry.is_large())
    }

    /// Non-empty entries in this table.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries().iter().filter(|&&raw| raw != 0).count()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().iter().all(|&raw| raw == 0)
    }

    /// Non-empty entries in this table and all tables below it.
    #[must_use]
    pub fn global_size<P: PagePool>(&self, pool: &P) -> usize {
        self.entries()
            .iter()
            .filter(|&&raw| raw != 0)
            .map(|&raw| {
                let entry = E::from_raw(raw);
                let below = if self.is_leaf(entry) {
                    0
                } else {
                    self.child(pool, entry).map_or(0, |child| child.global_size(pool))
                };
                1 + below
            })
            .sum()
    }

    /// Descend towards `leaf`, creating missing intermediate tables, and
    /// return the (possibly blank) slot for `addr` at that level.
    ///
    /// The slot is handed out unpopulated: the caller decides which access,
    /// memory-type and frame bits to write.
    ///
    /// # Errors
    /// - [`Error::AllocationFailure`] if a table could not be allocated;
    ///   tables created earlier in the same call stay linked and empty.
    /// - [`Error::AlreadyMapped`] if a large leaf sits on the path.
    /// - [`Error::InvalidArgument`] if `leaf` lies above this node's level.
    pub fn add_page<P: PagePool>(
        &mut self,
        pool: &P,
        addr: VirtualAddress,
        leaf: Level,
        user: bool,
    ) -> Result<EntryView<'_, E>> {
        if leaf > self.level {
            return Err(Error::InvalidArgument("leaf level above table level"));
        }

        let mut table = self.table;
        let mut level = self.level;
        loop {
            // Safety: `table` is a live page of this tree, and `&mut self`
            // keeps every other access out for the lifetime of the view.
            let slot = unsafe { &mut (*table.as_ptr()).entries[level.index_of(addr)] };
            if level == leaf {
                return Ok(EntryView::new(slot));
            }

            let lower = level
                .lower()
                .ok_or(Error::InvalidArgument("leaf level below L1"))?;
            let entry = E::from_raw(*slot);

            table = if entry.is_blank() {
                let child = Self::allocate(pool, lower)?;
                *slot = E::table_link(child.phys, user).into_raw();
                child.table
            } else if level.allows_large_leaf() && entry.is_large() {
                return Err(Error::AlreadyMapped);
            } else {
                NonNull::new(pool.phys_to_virt(entry.frame()).cast::<RawTable>())
                    .ok_or(Error::InvalidPhysicalAddress)?
            };
            level = lower;
        }
    }

    /// Clear the leaf for `addr` and free every table that became empty.
    ///
    /// Returns the level of the removed leaf, or `None` if nothing was mapped.
    pub fn remove_page<P: PagePool>(&mut self, pool: &P, addr: VirtualAddress) -> Option<Level> {
        let index = self.level.index_of(addr);
        let entry = self.entry(index);
        if entry.is_blank() {
            return None;
        }

        if self.is_leaf(entry) {
            self.entries_mut()[index] = 0;
            trace!("node: clear {:?} leaf for {addr:?}", self.level);
            return Some(self.level);
        }

        let mut child = self.child(pool, entry)?;
        let removed = child.remove_page(pool, addr);
        self.reclaim(pool, index, child);
        removed
    }

    /// Free the empty tables on the path to `addr`; leaves are left alone.
    pub fn release<P: PagePool>(&mut self, pool: &P, addr: VirtualAddress) {
        let index = self.level.index_of(addr);
        let entry = self.entry(index);
        if entry.is_blank() || self.is_leaf(entry) {
            return;
        }

        if let Some(mut child) = self.child(pool, entry) {
            child.release(pool, addr);
            self.reclaim(pool, index, child);
        }
    }

    /// Unlink and free `child` (stored at `index`) if it holds nothing.
    fn reclaim<P: PagePool>(&mut self, pool: &P, index: usize, child: Self) {
        if !child.is_empty() {
            return;
        }
        self.entries_mut()[index] = 0;
        trace!("node: reclaim empty {:?} table at {:?}", child.level, child.phys);
        // Safety: the only link to `child` was just cleared.
        unsafe { child.free(pool) };
    }

    /// Read-only walk to the entry that terminates the translation of `addr`.
    ///
    /// # Errors
    /// [`Error::NotMapped`] if a link or the leaf is empty.
    pub fn virt_to_pte<P: PagePool>(&self, pool: &P, addr: VirtualAddress) -> Result<(E, Level)> {
        let entry = self.entry(self.level.index_of(addr));
        if entry.is_blank() {
            return Err(Error::NotMapped);
        }
        if self.is_leaf(entry) {
            return Ok((entry, self.level));
        }
        self.child(pool, entry)
            .ok_or(Error::NotMapped)?
            .virt_to_pte(pool, addr)
    }

    /// One descriptor per table in this subtree, parents before children.
    pub fn pt_to_mdl<P: PagePool>(&self, pool: &P, out: &mut Vec<MemoryDescriptor>) {
        out.push(MemoryDescriptor {
            virt: VirtualAddress::from_ptr(self.table.as_ptr()),
            phys: self.phys,
            len: PAGE_SIZE as u64,
            level: self.level,
        });

        for &raw in self.entries() {
            let entry = E::from_raw(raw);
            if entry.is_blank() || self.is_leaf(entry) {
                continue;
            }
            if let Some(child) = self.child(pool, entry) {
                child.pt_to_mdl(pool, out);
            }
        }
    }

    /// Return this table and every table below it to the pool.
    ///
    /// # Safety
    /// Nothing may reference the subtree afterwards: no parent link, no
    /// loaded CR3/EPTP, no other handle.
    pub unsafe fn free_all<P: PagePool>(mut self, pool: &P) {
        for index in 0..ENTRIES_PER_TABLE {
            let entry = self.entry(index);
            if entry.is_blank() {
                continue;
            }
            if !self.is_leaf(entry)
                && let Some(child) = self.child(pool, entry)
            {
                // Safety: the link is cleared right below; nothing else refers to it.
                unsafe { child.free_all(pool) };
            }
            self.entries_mut()[index] = 0;
        }
        // Safety: every child is gone; the caller guarantees no outside references.
        unsafe { self.free(pool) };
    }

    /// Return this table page alone to the pool.
    unsafe fn free<P: PagePool>(self, pool: &P) {
        trace!("node: free {:?} table at {:?}", self.level, self.phys);
        // Safety: the page came from `pool` in `allocate`.
        unsafe { pool.deallocate(self.table.cast::<Page>()) };
    }
}
