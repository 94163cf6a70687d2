//! # Page-Table Entries
//!
//! Two hardware layouts share one trait:
//!
//! - [`EptEntry`]: extended (nested) paging, guest-physical → system-physical.
//! - [`HostEntry`]: the hypervisor's own 4-level table referenced by CR3.
//!
//! Tables store raw `u64` slots. An [`EntryView`] borrows one slot and offers
//! typed read-modify-write access; it never touches anything but that slot.
//!
//! ## Shared bit layout
//!
//! | Bits  | EPT                      | Host                  |
//! |-------|--------------------------|-----------------------|
//! | 0     | read                     | present               |
//! | 1     | write                    | writable              |
//! | 2     | execute                  | user                  |
//! | 5:3   | memory type              | PWT, PCD, accessed    |
//! | 6     | ignore PAT               | dirty                 |
//! | 7     | PS (large leaf)          | PS (large leaf)       |
//! | 8     | accessed                 | global                |
//! | 9     | dirty                    | OS                    |
//! | 10    | user execute             | OS                    |
//! | 51:12 | frame                    | frame                 |
//! | 63    | suppress #VE             | no-execute            |

mod ept;
mod host;

use crate::Level;
use bitflags::bitflags;
use core::fmt;
use core::marker::PhantomData;
use vmm_addresses::{PhysicalAddress, VirtualAddress};

pub use ept::EptEntry;
pub use host::HostEntry;

/// Mask of the 40-bit frame field after shifting out the page offset.
pub(crate) const FRAME_MASK: u64 = (1 << 40) - 1;

/// Frame number stored in bits 51:12 for a physical address.
#[inline]
pub(crate) const fn frame_number(phys: PhysicalAddress) -> u64 {
    (phys.as_u64() >> 12) & FRAME_MASK
}

/// Memory type encodings shared by EPT leaves and the EPTP.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    #[default]
    WriteBack = 6,
}

impl MemoryType {
    /// Decode the 3-bit field; reserved encodings (2, 3, 7) read as UC.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            1 => Self::WriteCombining,
            4 => Self::WriteThrough,
            5 => Self::WriteProtected,
            6 => Self::WriteBack,
            _ => Self::Uncacheable,
        }
    }

    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

bitflags! {
    /// Access permissions of a mapping.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Attributes: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Attributes {
    pub const NONE: Self = Self::empty();
    pub const READ_ONLY: Self = Self::READ;
    pub const WRITE_ONLY: Self = Self::WRITE;
    pub const EXECUTE_ONLY: Self = Self::EXECUTE;
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    pub const READ_EXECUTE: Self = Self::READ.union(Self::EXECUTE);
    pub const READ_WRITE_EXECUTE: Self = Self::all();
}

/// Which hardware walker consumes a table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TableKind {
    /// Extended page table; inputs are guest-physical addresses below 2^48.
    Extended,
    /// CR3 table; inputs are canonical linear addresses.
    Host,
}

impl TableKind {
    /// Whether `addr` can be resolved by a walk of this kind.
    #[must_use]
    pub const fn accepts(self, addr: VirtualAddress) -> bool {
        match self {
            Self::Extended => addr.is_below_walk_limit(),
            Self::Host => addr.is_canonical(),
        }
    }
}

/// Behavior every table layout provides to the tree code.
pub trait PageTableEntry: Copy + fmt::Debug + Send + 'static {
    const KIND: TableKind;

    fn from_raw(raw: u64) -> Self;

    fn into_raw(self) -> u64;

    /// Entry takes part in translation (EPT: any of R/W/X; host: P).
    fn is_present(self) -> bool;

    /// PS bit. Only meaningful for entries read at L3 or L2.
    fn is_large(self) -> bool;

    /// Frame address stored in bits 51:12. Large leaves may carry attribute
    /// bits below their alignment; mask with the leaf span.
    fn frame(self) -> PhysicalAddress;

    fn attributes(self) -> Attributes;

    fn memory_type(self) -> MemoryType;

    /// Whether leaves of this layout can carry `memory_type`.
    fn supports(memory_type: MemoryType) -> bool;

    /// Non-leaf entry pointing at a child table.
    ///
    /// `user` lets a host table that is not the hypervisor's own grant
    /// user-mode access through the link; EPT links ignore it.
    fn table_link(table: PhysicalAddress, user: bool) -> Self;

    /// Terminal entry for a mapping of `level`'s granularity.
    fn leaf(phys: PhysicalAddress, attrs: Attributes, memory_type: MemoryType, level: Level) -> Self;

    #[inline]
    fn is_blank(self) -> bool {
        self.into_raw() == 0
    }
}

/// Borrowed view of one raw table slot.
pub struct EntryView<'a, E> {
    slot: &'a mut u64,
    _layout: PhantomData<E>,
}

impl<'a, E: PageTableEntry> EntryView<'a, E> {
    #[inline]
    pub(crate) const fn new(slot: &'a mut u64) -> Self {
        Self {
            slot,
            _layout: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> E {
        E::from_raw(*self.slot)
    }

    #[inline]
    pub fn set(&mut self, entry: E) {
        *self.slot = entry.into_raw();
    }

    /// Read, modify and write back the slot.
    #[inline]
    pub fn update(&mut self, f: impl FnOnce(E) -> E) {
        let entry = f(self.get());
        self.set(entry);
    }

    #[inline]
    #[must_use]
    pub fn is_blank(&self) -> bool {
        *self.slot == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        *self.slot = 0;
    }

    /// Populate a blank slot as a leaf.
    #[inline]
    pub fn fill_leaf(
        &mut self,
        phys: PhysicalAddress,
        attrs: Attributes,
        memory_type: MemoryType,
        level: Level,
    ) {
        debug_assert!(self.is_blank(), "leaf slot already populated");
        self.set(E::leaf(phys, attrs, memory_type, level));
    }
}

impl<E: PageTableEntry> fmt::Debug for EntryView<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.get(), f)
    }
}
