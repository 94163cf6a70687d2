use core::cell::Cell;
use vmm_addresses::{PhysicalAddress, VirtualAddress};
use vmm_info::memory::{CACHE_FLUSH_ALL_THRESHOLD, MAP_WINDOW_BASE, PAGE_SIZE};
use vmm_paging::{
    Attributes, Error, HostEntry, HostPageTable, Level, Mapper, MemoryContext, MemoryType,
    NoIntrinsics, PageTableEntry, RecordingIntrinsics, ScopedMapping,
};
use vmm_pool::{LinearPagePool, MapWindowAllocator, PagePool, WindowAllocator};

const PAGE: u64 = 0x1000;

fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

fn windows() -> WindowAllocator {
    WindowAllocator::new(va(MAP_WINDOW_BASE), 0x100_0000)
}

/// Lets `remaining` mappings through, then fails every further one.
struct FailAfter<'a, M: Mapper> {
    inner: &'a M,
    remaining: Cell<usize>,
}

impl<M: Mapper> Mapper for FailAfter<'_, M> {
    fn map_4k(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attrs: Attributes,
        memory_type: MemoryType,
    ) -> Result<(), Error> {
        match self.remaining.get() {
            0 => Err(Error::AllocationFailure),
            n => {
                self.remaining.set(n - 1);
                self.inner.map_4k(virt, phys, attrs, memory_type)
            }
        }
    }

    fn unmap(&self, virt: VirtualAddress) -> Option<Level> {
        self.inner.unmap(virt)
    }

    fn virt_to_phys(&self, virt: VirtualAddress) -> Result<PhysicalAddress, Error> {
        self.inner.virt_to_phys(virt)
    }

    fn flush_page(&self, virt: VirtualAddress) {
        self.inner.flush_page(virt);
    }

    fn flush_line(&self, addr: *const u8) {
        self.inner.flush_line(addr);
    }

    fn flush_caches(&self) {
        self.inner.flush_caches();
    }
}

#[test]
fn range_list_maps_page_by_page() {
    let pool = LinearPagePool::new(16, pa(0x0400_0000));
    let host = HostPageTable::new(&pool, NoIntrinsics, true).unwrap();
    let windows = windows();
    let window = windows.alloc_window(4 * PAGE).unwrap();

    let mapping = ScopedMapping::from_ranges(
        &host,
        &windows,
        window,
        &[(pa(0x1111_0010), 2 * PAGE), (pa(0x1111_4000), 2 * PAGE)],
    )
    .unwrap();

    assert_eq!(mapping.size(), 4 * PAGE);
    assert_eq!(mapping.window_size(), 4 * PAGE);
    assert_eq!(mapping.virt(), window + 0x10);
    let expected = [0x1111_0000, 0x1111_1000, 0x1111_4000, 0x1111_5000];
    for (page, phys) in (0..).zip(expected) {
        let pte = host.virt_to_pte(window + page * PAGE).unwrap();
        assert_eq!(pte.frame(), pa(phys));
        assert!(pte.writable());
    }

    drop(mapping);
    for page in 0..4 {
        assert_eq!(host.virt_to_pte(window + page * PAGE), Err(Error::NotMapped));
    }
    assert_eq!(windows.in_use(), 0);
    assert_eq!(pool.allocated(), 1);
}

#[test]
fn failed_construction_unmaps_what_it_mapped() {
    let pool = LinearPagePool::new(16, pa(0x0400_0000));
    let host = HostPageTable::new(&pool, NoIntrinsics, true).unwrap();
    let failing = FailAfter {
        inner: &host,
        remaining: Cell::new(2),
    };
    let windows = windows();
    let window = windows.alloc_window(4 * PAGE).unwrap();

    let result = ScopedMapping::from_ranges(
        &failing,
        &windows,
        window,
        &[(pa(0x2000_0000), 4 * PAGE)],
    );

    assert_eq!(result.unwrap_err(), Error::AllocationFailure);
    for page in 0..4 {
        assert_eq!(host.virt_to_pte(window + page * PAGE), Err(Error::NotMapped));
    }
    assert_eq!(windows.in_use(), 0);
    assert_eq!(pool.allocated(), 1);
}

#[test]
fn foreign_range_crosses_leaf_sizes() {
    let pool = LinearPagePool::new(32, pa(0x0400_0000));
    let host = HostPageTable::new(&pool, NoIntrinsics, true).unwrap();
    let guest = HostPageTable::new(&pool, NoIntrinsics, false).unwrap();
    let windows = windows();
    let ctx = MemoryContext::new(&host, &windows);

    guest.map_2m(va(0x40_0000), pa(0x9000_0000), Attributes::READ_WRITE).unwrap();
    guest.map_4k(va(0x60_0000), pa(0x7000), Attributes::READ_ONLY).unwrap();

    let mapping = ctx
        .map_foreign::<HostEntry>(guest.root_phys(), va(0x5F_F800), 0x1000)
        .unwrap();

    assert_eq!(mapping.size(), 0x1000);
    assert_eq!(mapping.window_size(), 0x1800);
    let base = mapping.virt().align_down::<vmm_addresses::Size4K>();
    assert_eq!(mapping.virt(), base + 0x800);
    assert_eq!(ctx.virt_to_phys(base.as_ptr::<u8>()), Ok(pa(0x901F_F000)));
    assert_eq!(ctx.virt_to_phys((base + PAGE).as_ptr::<u8>()), Ok(pa(0x7000)));

    // the whole 2 MiB leaf is served from one walk
    let big = ctx
        .map_foreign::<HostEntry>(guest.root_phys(), va(0x40_0000), 8 * PAGE)
        .unwrap();
    let big_base = big.virt();
    for page in 0..8 {
        assert_eq!(
            Mapper::virt_to_phys(&host, big_base + page * PAGE),
            Ok(pa(0x9000_0000 + page * PAGE))
        );
    }

    drop((mapping, big));
    assert_eq!(windows.in_use(), 0);
}

#[test]
fn foreign_hole_fails_cleanly() {
    let pool = LinearPagePool::new(32, pa(0x0400_0000));
    let host = HostPageTable::new(&pool, NoIntrinsics, true).unwrap();
    let guest = HostPageTable::new(&pool, NoIntrinsics, false).unwrap();
    let windows = windows();
    let ctx = MemoryContext::new(&host, &windows);

    guest.map_4k(va(0x1000), pa(0x5000), Attributes::READ_WRITE).unwrap();
    let allocated = pool.allocated();

    let result = ctx.map_foreign::<HostEntry>(guest.root_phys(), va(0x1000), 2 * PAGE);
    assert_eq!(result.unwrap_err(), Error::NotMapped);
    assert_eq!(windows.in_use(), 0);
    assert_eq!(pool.allocated(), allocated);

    let result = ctx.map_foreign::<HostEntry>(pa(0x123), va(0x1000), PAGE);
    assert_eq!(result.unwrap_err(), Error::InvalidPhysicalAddress);
    assert!(matches!(
        ctx.map_foreign::<HostEntry>(guest.root_phys(), va(0x1000), 0),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(windows.in_use(), 0);
}

#[test]
fn flushes_reach_the_cpu() {
    let pool = LinearPagePool::new(16, pa(0x0400_0000));
    let host = HostPageTable::new(&pool, RecordingIntrinsics::new(), true).unwrap();
    let windows = windows();
    let ctx = MemoryContext::new(&host, &windows);

    let mapping = ctx.map_page(pa(0xB000), MemoryType::WriteBack).unwrap();
    // map + flush
    assert_eq!(host.intrinsics().invlpg_count(), 2);
    assert_eq!(host.intrinsics().last_invlpg(), mapping.virt());

    mapping.cache_flush();
    assert_eq!(host.intrinsics().clflush_count(), PAGE_SIZE / 64);

    drop(mapping);
    assert_eq!(host.intrinsics().invlpg_count(), 3);
}

#[test]
fn large_window_flushes_whole_cache() {
    let pool = LinearPagePool::new(16, pa(0x0400_0000));
    let host = HostPageTable::new(&pool, RecordingIntrinsics::new(), true).unwrap();
    let windows = windows();
    let ctx = MemoryContext::new(&host, &windows);

    let mapping = ctx
        .map_ranges(&[(pa(0x1000_0000), CACHE_FLUSH_ALL_THRESHOLD)])
        .unwrap();
    mapping.cache_flush();

    assert_eq!(host.intrinsics().wbinvd_count(), 1);
    assert_eq!(host.intrinsics().clflush_count(), 0);
}

#[test]
fn mapped_bytes_are_visible_through_the_window() {
    // Windows are real pool pages so the slice can be dereferenced.
    struct Direct<'a> {
        pool: &'a LinearPagePool,
    }

    impl Mapper for Direct<'_> {
        fn map_4k(
            &self,
            _virt: VirtualAddress,
            _phys: PhysicalAddress,
            _attrs: Attributes,
            _memory_type: MemoryType,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn unmap(&self, _virt: VirtualAddress) -> Option<Level> {
            Some(Level::L1)
        }

        fn virt_to_phys(&self, virt: VirtualAddress) -> Result<PhysicalAddress, Error> {
            Ok(self.pool.virt_to_phys(virt.as_ptr()))
        }

        fn flush_page(&self, _virt: VirtualAddress) {}

        fn flush_line(&self, _addr: *const u8) {}

        fn flush_caches(&self) {}
    }

    struct PoolWindows<'a> {
        pool: &'a LinearPagePool,
        page: Cell<Option<VirtualAddress>>,
    }

    impl MapWindowAllocator for PoolWindows<'_> {
        fn alloc_window(&self, _len: u64) -> Option<VirtualAddress> {
            let page = self.pool.allocate()?;
            let virt = VirtualAddress::from_ptr(page.as_ptr());
            self.page.set(Some(virt));
            Some(virt)
        }

        fn free_window(&self, addr: VirtualAddress) {
            if self.page.take() == Some(addr) {
                let page = core::ptr::NonNull::new(addr.as_mut_ptr()).unwrap();
                unsafe { self.pool.deallocate(page) };
            }
        }
    }

    let pool = LinearPagePool::new(4, pa(0x0400_0000));
    let mapper = Direct { pool: &pool };
    let windows = PoolWindows {
        pool: &pool,
        page: Cell::new(None),
    };

    let mut mapping = ScopedMapping::map_page(&mapper, &windows, pa(0x1000), MemoryType::WriteBack)
        .unwrap();
    (unsafe { mapping.as_mut_slice() })[..4].copy_from_slice(b"vmm!");
    assert_eq!(&unsafe { mapping.as_slice() }[..4], b"vmm!");
    assert_eq!(pool.allocated(), 1);

    drop(mapping);
    assert_eq!(pool.allocated(), 0);
}
