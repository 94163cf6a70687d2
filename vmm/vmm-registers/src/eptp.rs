use bitfield_struct::bitfield;
use vmm_addresses::PhysicalAddress;
use vmm_info::memory::EPT_PAGE_WALK_LENGTH;

/// Memory type used by the processor when reading the EPT paging structures.
pub const EPTP_MEMORY_TYPE_UC: u8 = 0;
/// Write-back; the only type worth using for EPT structures in RAM.
pub const EPTP_MEMORY_TYPE_WB: u8 = 6;

/// Extended-page-table pointer (VMCS field `EPT_POINTER`).
///
/// | Bits  | Field |
/// |-------|-------|
/// | 2:0   | paging-structure memory type (0 = UC, 6 = WB) |
/// | 5:3   | page-walk length minus one |
/// | 6     | enable accessed/dirty flags |
/// | 7     | enforce supervisor shadow-stack access rights |
/// | 11:8  | reserved |
/// | 51:12 | PML4 frame |
/// | 63:52 | reserved |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Eptp {
    #[bits(3)]
    pub memory_type: u8,

    #[bits(3)]
    pub page_walk_length: u8,

    pub accessed_dirty: bool,

    pub supervisor_shadow_stack: bool,

    #[bits(4)]
    __reserved0: u8,

    #[bits(40)]
    pml4_frame: u64,

    #[bits(12)]
    __reserved1: u16,
}

impl Eptp {
    const FRAME_MASK: u64 = (1 << 40) - 1;

    /// Write-back, 4-level walk, no A/D tracking.
    #[must_use]
    pub const fn from_pml4_phys(pml4: PhysicalAddress) -> Self {
        debug_assert!(pml4.as_u64() & 0xFFF == 0, "EPT PML4 must be 4K-aligned");
        Self::new()
            .with_memory_type(EPTP_MEMORY_TYPE_WB)
            .with_page_walk_length(EPT_PAGE_WALK_LENGTH)
            .with_pml4_frame((pml4.as_u64() >> 12) & Self::FRAME_MASK)
    }

    #[must_use]
    pub const fn pml4_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_frame() << 12)
    }
}
