use bitfield_struct::bitfield;
use vmm_addresses::PhysicalAddress;

#[cfg(feature = "asm")]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// CR3 with PCID disabled: the PML4 frame of the host table plus the cache
/// controls applied to the PML4 fetch itself.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    /// Bits 0–2: reserved.
    #[bits(3)]
    __reserved0: u8,

    /// Bit 3: PWT, write-through for PML4 accesses.
    pub pwt: bool,

    /// Bit 4: PCD, cache disable for PML4 accesses.
    pub pcd: bool,

    /// Bits 5–11: reserved.
    #[bits(7)]
    __reserved1: u8,

    /// Bits 12–51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_frame: u64,

    /// Bits 52–63: reserved.
    #[bits(12)]
    __reserved2: u16,
}

impl Cr3 {
    const FRAME_MASK: u64 = (1 << 40) - 1;

    /// Build a CR3 value for a 4 KiB-aligned PML4.
    #[must_use]
    pub const fn from_pml4_phys(pml4: PhysicalAddress, pwt: bool, pcd: bool) -> Self {
        debug_assert!(pml4.as_u64() & 0xFFF == 0, "PML4 base must be 4K-aligned");
        Self::new()
            .with_pwt(pwt)
            .with_pcd(pcd)
            .with_pml4_frame((pml4.as_u64() >> 12) & Self::FRAME_MASK)
    }

    #[must_use]
    pub const fn pml4_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_frame() << 12)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
