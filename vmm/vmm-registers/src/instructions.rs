//! Raw cache and TLB maintenance instructions.
//!
//! All of these act on the executing logical processor only.

/// Invalidate any TLB entry for the page containing `addr`.
///
/// # Safety
/// Privileged instruction; requires CPL 0.
#[inline]
pub unsafe fn invlpg(addr: u64) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
}

/// Flush the cache line containing `addr` from every cache level.
///
/// # Safety
/// `addr` must be mapped; `clflush` on an unmapped address faults.
#[inline]
pub unsafe fn clflush(addr: *const u8) {
    unsafe {
        core::arch::asm!("clflush [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
}

/// Write back and invalidate all caches.
///
/// # Safety
/// Privileged instruction; requires CPL 0.
#[inline]
pub unsafe fn wbinvd() {
    unsafe {
        core::arch::asm!("wbinvd", options(nostack, preserves_flags));
    }
}
