use super::{Attributes, FRAME_MASK, MemoryType, PageTableEntry, TableKind, frame_number};
use crate::Level;
use bitfield_struct::bitfield;
use vmm_addresses::PhysicalAddress;

/// Extended page-table entry (all four levels share this layout).
///
/// - Non-leaf: R/W/X set, frame = next table, PS = 0.
/// - Leaf (L1, or L2/L3 with PS = 1): R/W/X per mapping, memory type in
///   bits 5:3, frame = target page.
///
/// An entry is *present* when any of R/W/X is set; an all-zero slot is empty.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct EptEntry {
    /// Bit 0: read access.
    pub read: bool,
    /// Bit 1: write access.
    pub write: bool,
    /// Bit 2: execute access (supervisor execute with mode-based control).
    pub execute: bool,
    /// Bits 3–5: EPT memory type (leaves only).
    #[bits(3)]
    memory_type_bits: u8,
    /// Bit 6: ignore the guest PAT (leaves only).
    pub ignore_pat: bool,
    /// Bit 7: PS, terminal 2 MiB / 1 GiB leaf.
    pub large: bool,
    /// Bit 8: accessed (when A/D tracking is enabled in the EPTP).
    pub accessed: bool,
    /// Bit 9: dirty (leaves only).
    pub dirty: bool,
    /// Bit 10: user-mode execute (mode-based execute control).
    pub user_execute: bool,
    /// Bit 11: ignored.
    #[bits(1)]
    __ignored11: u8,
    /// Bits 12–51: frame number.
    #[bits(40)]
    frame_bits: u64,
    /// Bits 52–62: ignored / reserved.
    #[bits(11)]
    __ignored52: u16,
    /// Bit 63: suppress #VE for EPT violations caused by this entry.
    pub suppress_ve: bool,
}

impl EptEntry {
    #[inline]
    pub const fn set_frame(&mut self, phys: PhysicalAddress) {
        self.set_frame_bits(frame_number(phys));
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(mut self, phys: PhysicalAddress) -> Self {
        self.set_frame(phys);
        self
    }

    #[inline]
    pub const fn set_memory_type(&mut self, memory_type: MemoryType) {
        self.set_memory_type_bits(memory_type.into_bits() & 0b111);
    }

    #[inline]
    pub const fn set_attributes(&mut self, attrs: Attributes) {
        self.set_read(attrs.contains(Attributes::READ));
        self.set_write(attrs.contains(Attributes::WRITE));
        self.set_execute(attrs.contains(Attributes::EXECUTE));
    }
}

impl PageTableEntry for EptEntry {
    const KIND: TableKind = TableKind::Extended;

    #[inline]
    fn from_raw(raw: u64) -> Self {
        Self::from_bits(raw)
    }

    #[inline]
    fn into_raw(self) -> u64 {
        self.into_bits()
    }

    #[inline]
    fn is_present(self) -> bool {
        self.read() || self.write() || self.execute()
    }

    #[inline]
    fn is_large(self) -> bool {
        self.large()
    }

    #[inline]
    fn frame(self) -> PhysicalAddress {
        PhysicalAddress::new((self.frame_bits() & FRAME_MASK) << 12)
    }

    fn attributes(self) -> Attributes {
        let mut attrs = Attributes::NONE;
        attrs.set(Attributes::READ, self.read());
        attrs.set(Attributes::WRITE, self.write());
        attrs.set(Attributes::EXECUTE, self.execute());
        attrs
    }

    #[inline]
    fn memory_type(self) -> MemoryType {
        MemoryType::from_bits(self.memory_type_bits())
    }

    #[inline]
    fn supports(_memory_type: MemoryType) -> bool {
        true
    }

    fn table_link(table: PhysicalAddress, _user: bool) -> Self {
        Self::new()
            .with_read(true)
            .with_write(true)
            .with_execute(true)
            .with_frame(table)
    }

    fn leaf(phys: PhysicalAddress, attrs: Attributes, memory_type: MemoryType, level: Level) -> Self {
        let mut entry = Self::new().with_frame(phys);
        entry.set_attributes(attrs);
        entry.set_memory_type(memory_type);
        entry.set_large(level.allows_large_leaf());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_bits_match_hardware_layout() {
        let e = EptEntry::leaf(
            PhysicalAddress::new(0x4000_0000),
            Attributes::READ_EXECUTE,
            MemoryType::WriteBack,
            Level::L2,
        );
        assert_eq!(e.into_bits(), 0x4000_0000 | (1 << 7) | (6 << 3) | 0b101);
        assert!(e.is_present());
        assert!(e.is_large());
        assert_eq!(e.attributes(), Attributes::READ_EXECUTE);
        assert_eq!(e.memory_type(), MemoryType::WriteBack);
    }

    #[test]
    fn four_k_leaves_never_carry_ps() {
        let e = EptEntry::leaf(
            PhysicalAddress::new(0x2222_0000),
            Attributes::READ_WRITE,
            MemoryType::Uncacheable,
            Level::L1,
        );
        assert!(!e.large());
        assert_eq!(e.frame().as_u64(), 0x2222_0000);
        assert_eq!(e.into_bits() >> 12, 0x2_2220);
    }

    #[test]
    fn frame_setter_masks_out_of_range_bits() {
        let mut e = EptEntry::new().with_suppress_ve(true);
        e.set_frame(PhysicalAddress::new(0xFFF0_0000_1234_5FFF));
        assert_eq!(e.frame().as_u64(), 0x1234_5000);
        assert!(e.suppress_ve());
        assert!(!e.read());
    }

    #[test]
    fn links_grant_full_access() {
        let link = EptEntry::table_link(PhysicalAddress::new(0x7000), false);
        assert_eq!(link.into_bits(), 0x7000 | 0b111);
        assert!(!link.is_large());
    }

    #[test]
    fn no_permissions_means_not_present() {
        let e = EptEntry::leaf(
            PhysicalAddress::new(0x1000),
            Attributes::NONE,
            MemoryType::WriteBack,
            Level::L1,
        );
        assert!(!e.is_present());
        assert!(!e.is_blank());
    }
}
