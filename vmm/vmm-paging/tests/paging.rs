use vmm_addresses::{PhysicalAddress, VirtualAddress};
use vmm_paging::{
    Attributes, CpuIntrinsics, EptEntry, Error, ExtendedPageTable, HostEntry, HostPageTable, Level,
    NoIntrinsics, PageTableEntry, RecordingIntrinsics, RootPageTable, translate, translate_with_level,
};
use vmm_pool::{LinearPagePool, PagePool};

const PAGE: u64 = 0x1000;
const MB2: u64 = 0x20_0000;
const GB1: u64 = 0x4000_0000;

fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

fn pool(pages: usize) -> LinearPagePool {
    LinearPagePool::new(pages, pa(0x0400_0000))
}

fn map_at<E: PageTableEntry, P: PagePool, I: CpuIntrinsics>(
    table: &RootPageTable<'_, E, P, I>,
    level: Level,
    virt: u64,
    phys: u64,
    attrs: Attributes,
) -> Result<(), Error> {
    match level {
        Level::L1 => table.map_4k(va(virt), pa(phys), attrs),
        Level::L2 => table.map_2m(va(virt), pa(phys), attrs),
        Level::L3 | Level::L4 => table.map_1g(va(virt), pa(phys), attrs),
    }
}

#[test]
fn map_4k_then_lookup() {
    let pool = pool(16);
    let ept = ExtendedPageTable::new(&pool, NoIntrinsics, false).unwrap();

    ept.map_4k(va(0x1111_0000), pa(0x2222_0000), Attributes::READ_WRITE)
        .unwrap();

    let pte = ept.virt_to_pte(va(0x1111_0000)).unwrap();
    assert!(pte.is_present());
    assert!(pte.write());
    assert_eq!(pte.frame(), pa(0x2222_0000));
}

#[test]
fn large_page_at_guest_zero_resolves_through_walk() {
    let pool = pool(16);
    let ept = ExtendedPageTable::new(&pool, NoIntrinsics, false).unwrap();

    ept.map_2m(va(0), pa(0x4000_0000), Attributes::READ_EXECUTE).unwrap();

    assert_eq!(
        translate::<EptEntry, _>(&pool, ept.root_phys(), va(0x1000)),
        Ok(pa(0x4000_1000))
    );
}

#[test]
fn unmapped_page_is_not_found() {
    let pool = pool(16);
    let host = HostPageTable::new(&pool, NoIntrinsics, true).unwrap();

    host.map_4k(va(0xffff_8000_0010_0000), pa(0x3000), Attributes::READ_ONLY)
        .unwrap();
    host.unmap(va(0xffff_8000_0010_0000));

    assert_eq!(host.virt_to_pte(va(0xffff_8000_0010_0000)), Err(Error::NotMapped));
}

#[test]
fn identity_map_small_range() {
    let pool = pool(16);
    let ept = ExtendedPageTable::new(&pool, NoIntrinsics, false).unwrap();

    ept.setup_identity_map_4k(0x1000, 0x4000).unwrap();
    for addr in [0x1000, 0x2000, 0x3000] {
        let pte = ept.virt_to_pte(va(addr)).unwrap();
        assert_eq!(pte.frame(), pa(addr));
    }
    assert_eq!(ept.virt_to_pte(va(0x4000)), Err(Error::NotMapped));
    assert_eq!(pool.allocated(), 4);

    ept.unmap_identity_map_4k(0x1000, 0x4000);
    for addr in [0x1000, 0x2000, 0x3000] {
        assert_eq!(ept.virt_to_pte(va(addr)), Err(Error::NotMapped));
    }
    assert_eq!(pool.allocated(), 1);
    assert_eq!(ept.pt_to_mdl().len(), 1);
}

#[test]
fn every_granularity_round_trips_frame_and_permissions() {
    let pool = pool(64);
    let ept = ExtendedPageTable::new(&pool, NoIntrinsics, false).unwrap();
    let host = HostPageTable::new(&pool, NoIntrinsics, false).unwrap();

    let cases = [
        (Level::L1, 0x0000_0000_0000_5000, 0x0000_0001_2345_6000, Attributes::READ_ONLY),
        (Level::L1, 0x0000_7FFF_FFFF_F000, 0x000F_FFFF_FFFF_F000, Attributes::READ_WRITE),
        (Level::L2, 0x0000_0000_0060_0000, 0x0000_0000_8000_0000, Attributes::READ_EXECUTE),
        (Level::L2, 0x0000_0040_0020_0000, 0x0000_0000_0020_0000, Attributes::READ_WRITE_EXECUTE),
        (Level::L3, 0x0000_0080_0000_0000, 0x0000_0000_C000_0000, Attributes::READ_WRITE),
    ];

    for (level, virt, phys, attrs) in cases {
        map_at(&ept, level, virt, phys, attrs).unwrap();
        map_at(&host, level, virt, phys, attrs).unwrap();

        let ept_pte = ept.virt_to_pte(va(virt)).unwrap();
        assert_eq!(ept_pte.frame(), pa(phys));
        assert_eq!(ept_pte.attributes(), attrs);
        assert_eq!(ept.from(va(virt)), Ok(level));

        let host_pte = host.virt_to_pte(va(virt)).unwrap();
        assert_eq!(host_pte.frame(), pa(phys));
        assert_eq!(host_pte.attributes(), attrs | Attributes::READ);
        assert_eq!(host.from(va(virt)), Ok(level));
    }
}

#[test]
fn unmap_of_absent_address_touches_nothing() {
    let pool = pool(16);
    let ept = ExtendedPageTable::new(&pool, RecordingIntrinsics::new(), false).unwrap();

    ept.map_4k(va(0x1000), pa(0xA000), Attributes::READ_WRITE).unwrap();
    ept.map_2m(va(0x40_0000), pa(0x80_0000), Attributes::READ_ONLY).unwrap();
    let before = ept.pt_to_mdl().len();

    assert_eq!(ept.unmap(va(0x2000)), None);
    assert_eq!(ept.unmap(va(0x0000_7000_0000_0000)), None);
    assert_eq!(ept.unmap(va(0x1000_0000)), None);

    assert_eq!(ept.pt_to_mdl().len(), before);
    assert_eq!(ept.virt_to_phys(va(0x1000)), Ok((pa(0xA000), Level::L1)));
    assert_eq!(ept.virt_to_phys(va(0x41_0000)), Ok((pa(0x81_0000), Level::L2)));
    // only the two maps invalidated anything
    assert_eq!(ept.intrinsics().invlpg_count(), 2);
}

#[test]
fn second_map_is_refused() {
    let pool = pool(16);
    let host = HostPageTable::new(&pool, NoIntrinsics, true).unwrap();

    host.map_4k(va(0x20_0000), pa(0x5000), Attributes::READ_ONLY).unwrap();
    let allocated = pool.allocated();

    assert_eq!(
        host.map_4k(va(0x20_0000), pa(0x6000), Attributes::READ_WRITE_EXECUTE),
        Err(Error::AlreadyMapped)
    );

    let pte = host.virt_to_pte(va(0x20_0000)).unwrap();
    assert_eq!(pte.frame(), pa(0x5000));
    assert_eq!(pte.attributes(), Attributes::READ_ONLY);
    assert_eq!(pool.allocated(), allocated);
}

#[test]
fn scattered_pages_leave_no_tables_behind() {
    let pool = pool(128);
    let ept = ExtendedPageTable::new(&pool, NoIntrinsics, false).unwrap();
    let baseline = pool.allocated();

    let pages: Vec<u64> = (0..24)
        .map(|i: u64| (i % 3) * 0x80_0000_0000 + (i % 5) * GB1 + i * MB2 + (i % 7) * PAGE)
        .collect();
    for (&gpa, i) in pages.iter().zip(0_u64..) {
        ept.map_4k(va(gpa), pa(0x1_0000_0000 + i * PAGE), Attributes::READ_WRITE)
            .unwrap();
    }
    assert!(pool.allocated() > baseline);

    for &gpa in &pages {
        assert_eq!(ept.unmap(va(gpa)), Some(Level::L1));
    }
    assert_eq!(pool.allocated(), baseline);
    assert_eq!(ept.global_size(), 0);
}

#[test]
fn dropping_a_populated_table_returns_every_page() {
    let pool = pool(128);
    let baseline = pool.allocated();
    {
        let host = HostPageTable::new(&pool, NoIntrinsics, true).unwrap();
        host.setup_identity_map_2m(MB2, 16 * MB2).unwrap();
        host.setup_identity_map_4k(0x4000_0000, 0x4001_0000).unwrap();
        host.map_1g(va(0xffff_8000_0000_0000), pa(0), Attributes::READ_WRITE)
            .unwrap();
        assert!(pool.allocated() - baseline >= 6);
    }
    assert_eq!(pool.allocated(), baseline);
}

#[test]
fn large_leaf_translation_covers_whole_page() {
    let pool = pool(16);
    let host = HostPageTable::new(&pool, NoIntrinsics, false).unwrap();
    let v = 0x0000_0012_3460_0000;
    let p = 0x0000_0000_9AC0_0000;

    host.map_2m(va(v), pa(p), Attributes::READ_WRITE).unwrap();

    for delta in [0, 1, PAGE - 1, PAGE, 0x1_2345, MB2 - PAGE, MB2 - 1] {
        assert_eq!(
            translate_with_level::<HostEntry, _>(&pool, host.root_phys(), va(v + delta)),
            Ok((pa(p + delta), Level::L2))
        );
    }
    assert_eq!(
        translate::<HostEntry, _>(&pool, host.root_phys(), va(v + MB2)),
        Err(Error::NotMapped)
    );
}

#[test]
fn tables_are_usable_from_several_threads() {
    let pool = pool(256);
    let ept = ExtendedPageTable::new(&pool, NoIntrinsics, false).unwrap();

    std::thread::scope(|s| {
        for t in 0..4_u64 {
            let ept = &ept;
            s.spawn(move || {
                for i in 0..32 {
                    let gpa = t * GB1 + i * PAGE;
                    ept.map_4k(va(gpa), pa(gpa), Attributes::READ_WRITE).unwrap();
                }
                for i in 0..32 {
                    let gpa = t * GB1 + i * PAGE;
                    assert_eq!(ept.unmap(va(gpa)), Some(Level::L1));
                }
            });
        }
    });

    assert_eq!(pool.allocated(), 1);
}
