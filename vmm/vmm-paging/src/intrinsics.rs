//! TLB and cache maintenance, behind a trait so hosted tests can observe it.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use vmm_addresses::VirtualAddress;

/// Processor-local cache and TLB maintenance.
///
/// Implementations act on the executing core only and cannot fail.
pub trait CpuIntrinsics {
    fn invlpg(&self, addr: VirtualAddress);

    fn clflush(&self, addr: *const u8);

    fn wbinvd(&self);
}

impl<T: CpuIntrinsics + ?Sized> CpuIntrinsics for &T {
    #[inline]
    fn invlpg(&self, addr: VirtualAddress) {
        (**self).invlpg(addr);
    }

    #[inline]
    fn clflush(&self, addr: *const u8) {
        (**self).clflush(addr);
    }

    #[inline]
    fn wbinvd(&self) {
        (**self).wbinvd();
    }
}

/// The real instructions; only valid in ring 0 / VMX root operation.
#[cfg(feature = "asm")]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Intrinsics;

#[cfg(feature = "asm")]
impl CpuIntrinsics for X86Intrinsics {
    #[inline]
    fn invlpg(&self, addr: VirtualAddress) {
        // Safety: the paging engine runs at CPL 0.
        unsafe { vmm_registers::instructions::invlpg(addr.as_u64()) }
    }

    #[inline]
    fn clflush(&self, addr: *const u8) {
        // Safety: callers only flush lines of live mappings.
        unsafe { vmm_registers::instructions::clflush(addr) }
    }

    #[inline]
    fn wbinvd(&self) {
        // Safety: the paging engine runs at CPL 0.
        unsafe { vmm_registers::instructions::wbinvd() }
    }
}

/// Does nothing; for tables that are never loaded into hardware.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoIntrinsics;

impl CpuIntrinsics for NoIntrinsics {
    #[inline]
    fn invlpg(&self, _addr: VirtualAddress) {}

    #[inline]
    fn clflush(&self, _addr: *const u8) {}

    #[inline]
    fn wbinvd(&self) {}
}

/// Counts every maintenance operation and remembers the last invalidated page.
#[derive(Debug, Default)]
pub struct RecordingIntrinsics {
    invlpg: AtomicUsize,
    clflush: AtomicUsize,
    wbinvd: AtomicUsize,
    last_invlpg: AtomicU64,
}

impl RecordingIntrinsics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            invlpg: AtomicUsize::new(0),
            clflush: AtomicUsize::new(0),
            wbinvd: AtomicUsize::new(0),
            last_invlpg: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn invlpg_count(&self) -> usize {
        self.invlpg.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn clflush_count(&self) -> usize {
        self.clflush.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn wbinvd_count(&self) -> usize {
        self.wbinvd.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_invlpg(&self) -> VirtualAddress {
        VirtualAddress::new(self.last_invlpg.load(Ordering::Relaxed))
    }
}

impl CpuIntrinsics for RecordingIntrinsics {
    fn invlpg(&self, addr: VirtualAddress) {
        self.last_invlpg.store(addr.as_u64(), Ordering::Relaxed);
        self.invlpg.fetch_add(1, Ordering::Relaxed);
    }

    fn clflush(&self, _addr: *const u8) {
        self.clflush.fetch_add(1, Ordering::Relaxed);
    }

    fn wbinvd(&self) {
        self.wbinvd.fetch_add(1, Ordering::Relaxed);
    }
}
