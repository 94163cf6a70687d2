//! # Typed Paging Registers and Instructions
//!
//! - [`cr3::Cr3`]: root pointer of a host (hypervisor) page table.
//! - [`eptp::Eptp`]: root pointer of an extended page table, as written into the VMCS.
//! - [`instructions`]: `invlpg`, `clflush` and `wbinvd` (feature `asm`).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "eptp")]
pub mod eptp;

#[cfg(feature = "asm")]
pub mod instructions;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Control registers can only be read in ring 0 / VMX root operation.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Writing a root pointer switches the active address space.
    unsafe fn store_unsafe(self);
}
