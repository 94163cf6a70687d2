use super::{Attributes, FRAME_MASK, MemoryType, PageTableEntry, TableKind, frame_number};
use crate::Level;
use bitfield_struct::bitfield;
use vmm_addresses::PhysicalAddress;

/// 4-level host paging entry (PML4E / PDPTE / PDE / PTE).
///
/// In 2 MiB and 1 GiB leaves bit 12 is the PAT selector rather than part of
/// the frame. Bit 7 alone cannot tell a large leaf from a 4 KiB PTE with PAT
/// set, so [`frame`](PageTableEntry::frame) returns bits 51:12 as stored and
/// callers that know the level mask with the leaf span.
///
/// Host mappings are always write-back: the PAT programmed alongside these
/// tables selects WB for every index, so PWT/PCD are left clear.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct HostEntry {
    /// Bit 0: present.
    pub present: bool,
    /// Bit 1: writable.
    pub writable: bool,
    /// Bit 2: user accessible.
    pub user: bool,
    /// Bit 3: PWT.
    pub write_through: bool,
    /// Bit 4: PCD.
    pub cache_disable: bool,
    /// Bit 5: accessed.
    pub accessed: bool,
    /// Bit 6: dirty (leaves only).
    pub dirty: bool,
    /// Bit 7: PS in PDPTEs/PDEs, PAT in PTEs.
    pub large: bool,
    /// Bit 8: global (leaves only).
    pub global: bool,
    /// Bits 9–11: available to software.
    #[bits(3)]
    pub os_available_low: u8,
    /// Bits 12–51: frame number.
    #[bits(40)]
    frame_bits: u64,
    /// Bits 52–58: available to software.
    #[bits(7)]
    pub os_available_high: u8,
    /// Bits 59–62: protection key (leaves only).
    #[bits(4)]
    pub protection_key: u8,
    /// Bit 63: execute disable.
    pub no_execute: bool,
}

impl HostEntry {
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
}

impl PageTableEntry for HostEntry {
    const KIND: TableKind = TableKind::Host;

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
        self.present()
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
        attrs.set(Attributes::READ, self.present());
        attrs.set(Attributes::WRITE, self.present() && self.writable());
        attrs.set(Attributes::EXECUTE, self.present() && !self.no_execute());
        attrs
    }

    #[inline]
    fn memory_type(self) -> MemoryType {
        MemoryType::WriteBack
    }

    #[inline]
    fn supports(memory_type: MemoryType) -> bool {
        memory_type == MemoryType::WriteBack
    }

    fn table_link(table: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(table)
    }

    fn leaf(phys: PhysicalAddress, attrs: Attributes, _memory_type: MemoryType, level: Level) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(attrs.contains(Attributes::WRITE))
            .with_no_execute(!attrs.contains(Attributes::EXECUTE))
            .with_large(level.allows_large_leaf())
            .with_frame(phys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_leaf_is_nx() {
        let e = HostEntry::leaf(
            PhysicalAddress::new(0x2222_0000),
            Attributes::READ_WRITE,
            MemoryType::WriteBack,
            Level::L1,
        );
        assert_eq!(e.into_bits(), (1 << 63) | 0x2222_0000 | 0b11);
        assert_eq!(e.attributes(), Attributes::READ_WRITE);
    }

    #[test]
    fn read_execute_large_leaf() {
        let e = HostEntry::leaf(
            PhysicalAddress::new(0x4000_0000),
            Attributes::READ_EXECUTE,
            MemoryType::WriteBack,
            Level::L3,
        );
        assert!(e.is_large());
        assert!(!e.writable());
        assert!(!e.no_execute());
        assert_eq!(e.attributes(), Attributes::READ_EXECUTE);
        assert_eq!(e.memory_type(), MemoryType::WriteBack);
    }

    #[test]
    fn pte_pat_bit_keeps_odd_frame() {
        // bit 7 of a 4 KiB PTE is PAT, bit 12 stays part of the frame
        let pte = HostEntry::from_bits(0x5000 | (1 << 7) | 0b11);
        assert_eq!(pte.frame().as_u64(), 0x5000);
        let small = HostEntry::from_bits(0x0000_1000 | 1);
        assert_eq!(small.frame().as_u64(), 0x1000);
    }

    #[test]
    fn links_carry_user_only_when_requested() {
        let kernel = HostEntry::table_link(PhysicalAddress::new(0x9000), false);
        let guest = HostEntry::table_link(PhysicalAddress::new(0x9000), true);
        assert_eq!(kernel.into_bits(), 0x9000 | 0b011);
        assert_eq!(guest.into_bits(), 0x9000 | 0b111);
    }

    #[test]
    fn only_write_back_is_supported() {
        assert!(HostEntry::supports(MemoryType::WriteBack));
        assert!(!HostEntry::supports(MemoryType::Uncacheable));
    }
}
