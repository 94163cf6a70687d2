//! # Memory Layout and Paging Geometry

use vmm_addresses::{PHYSICAL_ADDRESS_BITS, PageSize, Size4K, VIRTUAL_ADDRESS_BITS};

/// Size of one page-table node and of the smallest mapping.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_SIZE: usize = Size4K::SIZE as usize;

/// Granularity used by `clflush` loops.
pub const CACHE_LINE_SIZE: usize = 64;

/// Windows at least this large are written back with `wbinvd` rather than a
/// `clflush` per line.
pub const CACHE_FLUSH_ALL_THRESHOLD: u64 = 0x10_0000;

/// Entries in every table level (9 index bits).
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of paging levels walked (PML4 → PT).
pub const PAGE_WALK_LEVELS: u32 = 4;

/// Physical address width assumed for frame validation.
pub const MAX_PHYS_ADDR_BITS: u32 = PHYSICAL_ADDRESS_BITS;

/// Linear (and guest-physical) address width resolved by a 4-level walk.
pub const VIRT_ADDR_BITS: u32 = VIRTUAL_ADDRESS_BITS;

/// PAT programming used while the host table is active.
///
/// Every PAT slot selects write-back; host leaves express uncached or
/// write-through access through their PCD/PWT bits alone.
pub const HOST_PAT: u64 = 0x0606_0606_0606_0606;

/// EPTP page-walk length field, encoded as "levels minus one".
pub const EPT_PAGE_WALK_LENGTH: u8 = 3;

/// Start of the virtual range reserved for scoped mapping windows.
pub const MAP_WINDOW_BASE: u64 = 0xffff_9000_0000_0000;

/// Size of the scoped-mapping window range.
pub const MAP_WINDOW_SIZE: u64 = 0x0000_0010_0000_0000; // 64 GiB

const _: () = {
    assert!(PAGE_SIZE == 4096);
    assert!(ENTRIES_PER_TABLE * 8 == PAGE_SIZE);
    assert!(PAGE_SIZE.is_multiple_of(CACHE_LINE_SIZE));
    assert!(EPT_PAGE_WALK_LENGTH as u32 == PAGE_WALK_LEVELS - 1);
    assert!(12 + 9 * PAGE_WALK_LEVELS == VIRT_ADDR_BITS);
    assert!(MAP_WINDOW_BASE.is_multiple_of(Size4K::SIZE));
    assert!(MAP_WINDOW_SIZE.is_multiple_of(Size4K::SIZE));
    assert!(MAP_WINDOW_BASE.checked_add(MAP_WINDOW_SIZE).is_some());
    assert!(CACHE_FLUSH_ALL_THRESHOLD.is_multiple_of(Size4K::SIZE));
};
