use kernel_regions::{ProcessId, RefDrop, RegionError, RegionMap, ShmId};

const PAGE: u64 = 0x1000;
const CREATOR: ProcessId = ProcessId(7);
const READER: ProcessId = ProcessId(8);
const STRANGER: ProcessId = ProcessId(9);

#[test]
fn extent_outlives_its_owner() {
    let map = RegionMap::with_extent(PAGE, 0, 0x10000).unwrap();
    let (id, shm) = map.allocate_shared(0x2000, CREATOR).unwrap();
    assert_eq!(map.used_memory(), 0x2000);

    map.shm_allow(shm, CREATOR, READER, false).unwrap();
    assert_eq!(map.shm_attach(shm, READER), Ok((id, false)));
    assert_eq!(
        map.shm_attach(shm, STRANGER),
        Err(RegionError::PermissionDenied {
            id: shm,
            pid: STRANGER
        })
    );

    // Creator exits: ownership is dropped, its reference goes with it.
    assert_eq!(map.orphan_shared(CREATOR), 1);
    assert_eq!(map.shm_deref(id), Ok(RefDrop::Remaining(1)));
    assert!(map.region(id).unwrap().used);
    assert_eq!(map.find_shared(shm), Some(id));

    // The reader still has access after the owner is gone.
    let region = map.region(id).unwrap();
    assert_eq!(region.permission(READER), Some(false));
    assert!(region.shared().unwrap().is_orphaned());

    assert_eq!(map.shm_deref(id), Ok(RefDrop::Released));
    assert_eq!(map.find_shared(shm), None);
    assert_eq!(map.used_memory(), 0);
    assert_eq!(map.regions().len(), 1);
    map.verify().unwrap();
}

#[test]
fn shared_operations_reject_plain_regions() {
    let map = RegionMap::with_extent(PAGE, 0, 0x10000).unwrap();
    let plain = map.allocate(0x1000).unwrap();
    assert_eq!(map.shm_ref(plain), Err(RegionError::NotShared(plain)));
    assert_eq!(map.shm_deref(plain), Err(RegionError::NotShared(plain)));
    assert_eq!(
        map.shm_attach(ShmId(1), READER),
        Err(RegionError::SharedNotFound(ShmId(1)))
    );

    let (id, _) = map.allocate_shared(0x1000, CREATOR).unwrap();
    assert_eq!(map.cow_ref(id), Err(RegionError::NotCopyOnWrite(id)));
}

#[test]
fn owner_can_upgrade_a_grant() {
    let map = RegionMap::with_extent(PAGE, 0, 0x10000).unwrap();
    let (id, shm) = map.allocate_shared(0x1000, CREATOR).unwrap();
    map.shm_allow(shm, CREATOR, READER, false).unwrap();
    map.shm_allow(shm, CREATOR, READER, true).unwrap();
    assert_eq!(map.shm_attach(shm, READER), Ok((id, true)));
    assert_eq!(map.shm_attach(shm, CREATOR), Ok((id, true)));
    assert_eq!(map.shm_ref(id), Ok(4));
}

#[test]
fn no_space_for_shared_extent() {
    let map = RegionMap::with_extent(PAGE, 0, 0x2000).unwrap();
    assert_eq!(
        map.allocate_shared(0x3000, CREATOR),
        Err(RegionError::NoSpace { requested: 0x3000 })
    );
    assert_eq!(map.used_memory(), 0);
}

#[test]
fn last_reference_releases_the_whole_extent() {
    let map = RegionMap::with_extent(PAGE, 0, 0x10000).unwrap();
    let (id, shm) = map.allocate_shared(0x3000, CREATOR).unwrap();
    assert_eq!(
        map.split(id, 0x1000, 0x1000),
        Err(RegionError::SharedExtent(id))
    );
    assert_eq!(map.region(id).unwrap().size, 0x3000);

    assert_eq!(map.orphan_shared(CREATOR), 1);
    assert_eq!(map.shm_deref(id), Ok(RefDrop::Released));
    assert_eq!(map.find_shared(shm), None);
    assert_eq!(map.used_memory(), 0);
    assert_eq!(map.regions().len(), 1);
    map.verify().unwrap();
}
