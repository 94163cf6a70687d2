use crate::MapWindowAllocator;
use alloc::collections::BTreeMap;
use log::{trace, warn};
use vmm_addresses::{PageSize, Size4K, VirtualAddress, align_up};
use vmm_info::memory::{MAP_WINDOW_BASE, MAP_WINDOW_SIZE};
use vmm_sync::SpinLock;

/// First-fit allocator of page-granular virtual windows inside a fixed range.
///
/// Only address space is reserved; mapping the window is up to the caller.
pub struct WindowAllocator {
    base: u64,
    size: u64,
    /// Live windows, keyed by start address, valued by length in bytes.
    live: SpinLock<BTreeMap<u64, u64>>,
}

impl WindowAllocator {
    /// Allocator over `[base, base + size)`; both must be page-aligned.
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        debug_assert!(base.is_aligned::<Size4K>());
        debug_assert!(size & Size4K::MASK == 0);
        Self {
            base: base.as_u64(),
            size,
            live: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Number of windows currently reserved.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.live.with_lock(|live| live.len())
    }
}

impl Default for WindowAllocator {
    fn default() -> Self {
        Self::new(VirtualAddress::new(MAP_WINDOW_BASE), MAP_WINDOW_SIZE)
    }
}

impl MapWindowAllocator for WindowAllocator {
    fn alloc_window(&self, len: u64) -> Option<VirtualAddress> {
        if len == 0 {
            return None;
        }
        let len = align_up(len, Size4K::SIZE);
        let end = self.base + self.size;

        self.live.with_lock(|live| {
            let mut cursor = self.base;
            for (&start, &used) in live.iter() {
                if start - cursor >= len {
                    break;
                }
                cursor = start + used;
            }

            if end - cursor < len {
                warn!("window: no room for {len:#x} bytes");
                return None;
            }

            live.insert(cursor, len);
            trace!("window: reserve {cursor:#x}+{len:#x}");
            Some(VirtualAddress::new(cursor))
        })
    }

    fn free_window(&self, addr: VirtualAddress) {
        let removed = self.live.with_lock(|live| live.remove(&addr.as_u64()));
        match removed {
            Some(len) => trace!("window: release {addr}+{len:#x}"),
            None => warn!("window: release of unknown window {addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> WindowAllocator {
        WindowAllocator::new(VirtualAddress::new(0x1000_0000), 0x10_000)
    }

    #[test]
    fn rounds_up_to_pages() {
        let windows = allocator();
        let a = windows.alloc_window(1).unwrap();
        let b = windows.alloc_window(0x1001).unwrap();
        assert_eq!(a.as_u64(), 0x1000_0000);
        assert_eq!(b.as_u64(), 0x1000_1000);
        assert_eq!(windows.in_use(), 2);
    }

    #[test]
    fn reuses_freed_gaps() {
        let windows = allocator();
        let a = windows.alloc_window(0x2000).unwrap();
        let b = windows.alloc_window(0x1000).unwrap();
        windows.free_window(a);

        let c = windows.alloc_window(0x1000).unwrap();
        assert_eq!(c, a);
        let d = windows.alloc_window(0x2000).unwrap();
        assert_eq!(d.as_u64(), b.as_u64() + 0x1000);
    }

    #[test]
    fn rejects_zero_and_exhaustion() {
        let windows = allocator();
        assert!(windows.alloc_window(0).is_none());
        assert!(windows.alloc_window(0x10_000).is_some());
        assert!(windows.alloc_window(0x1000).is_none());
    }

    #[test]
    fn unknown_free_is_ignored() {
        let windows = allocator();
        windows.free_window(VirtualAddress::new(0xdead_0000));
        assert_eq!(windows.in_use(), 0);
    }
}
