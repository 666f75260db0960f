//! Random operation sequences must never break the chain.

use kernel_regions::{RegionError, RegionId, RegionMap};
use proptest::prelude::*;

const PAGE: u64 = 0x1000;
const SPACE: u64 = 0x40_0000;

#[derive(Debug, Clone)]
enum Op {
    Allocate(u64),
    AllocateAt(u64, u64),
    Free(usize),
    Split(usize, u64, u64),
    CowRef(usize),
    CowDeref(usize),
    Shared(u64),
    ShmDeref(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..0x8000).prop_map(Op::Allocate),
        2 => (0u64..SPACE, 1u64..0x4000).prop_map(|(a, s)| Op::AllocateAt(a, s)),
        4 => any::<usize>().prop_map(Op::Free),
        1 => (any::<usize>(), 0u64..8, 1u64..8).prop_map(|(i, o, n)| Op::Split(i, o, n)),
        1 => any::<usize>().prop_map(Op::CowRef),
        1 => any::<usize>().prop_map(Op::CowDeref),
        1 => (1u64..0x4000).prop_map(Op::Shared),
        1 => any::<usize>().prop_map(Op::ShmDeref),
    ]
}

fn pick(held: &[RegionId], i: usize) -> Option<RegionId> {
    (!held.is_empty()).then(|| held[i % held.len()])
}

fn apply(map: &RegionMap, held: &mut Vec<RegionId>, op: &Op) {
    match *op {
        Op::Allocate(size) => {
            if let Ok(id) = map.allocate(size) {
                held.push(id);
            }
        }
        Op::AllocateAt(address, size) => {
            if let Ok(id) = map.allocate_at(address, size) {
                let region = map.region(id).unwrap();
                assert!(region.contains(address));
                assert!(region.end() >= address + size);
                held.push(id);
            }
        }
        Op::Free(i) => {
            if let Some(id) = pick(held, i) {
                held.retain(|&h| h != id);
                let _ = map.free(id);
            }
        }
        Op::Split(i, offset, pages) => {
            if let Some(id) = pick(held, i) {
                if let Some(region) = map.region(id) {
                    let start = region.start + offset * PAGE;
                    if map.split(id, start, pages * PAGE).is_ok() {
                        // Split-off neighbours are allocated too.
                        for (nid, r) in map.regions() {
                            if r.used && !r.reserved && !held.contains(&nid) {
                                held.push(nid);
                            }
                        }
                    }
                }
            }
        }
        Op::CowRef(i) => {
            if let Some(id) = pick(held, i) {
                let _ = map.cow_ref(id);
            }
        }
        Op::CowDeref(i) => {
            if let Some(id) = pick(held, i) {
                let _ = map.cow_deref(id);
            }
        }
        Op::Shared(size) => {
            if let Ok((id, _)) = map.allocate_shared(size, kernel_regions::ProcessId(1)) {
                held.push(id);
            }
        }
        Op::ShmDeref(i) => {
            if let Some(id) = pick(held, i) {
                match map.shm_deref(id) {
                    Ok(_) | Err(RegionError::NotShared(_) | RegionError::UnknownRegion(_)) => {}
                    Err(e) => panic!("unexpected {e}"),
                }
            }
        }
    }
}

proptest! {
    #[test]
    fn chain_invariants_hold(ops in proptest::collection::vec(arb_op(), 1..64)) {
        let map = RegionMap::with_extent(PAGE, 0, SPACE).unwrap();
        let mut held = Vec::new();
        for op in &ops {
            apply(&map, &mut held, op);
            prop_assert_eq!(map.verify(), Ok(()));
            let info = map.info();
            prop_assert!(info.is_consistent());
            prop_assert_eq!(info.total, SPACE);
            prop_assert_eq!(map.used_memory() % PAGE, 0);
        }
    }

    #[test]
    fn freeing_everything_restores_one_region(
        sizes in proptest::collection::vec(1u64..0x6000, 1..32)
    ) {
        let map = RegionMap::with_extent(PAGE, 0, SPACE).unwrap();
        let ids: Vec<_> = sizes.iter().filter_map(|&s| map.allocate(s).ok()).collect();
        let expected: u64 = sizes.iter().map(|s| s.div_ceil(PAGE) * PAGE).sum();
        prop_assert_eq!(map.used_memory(), expected);

        for id in ids.into_iter().rev() {
            prop_assert_eq!(map.free(id), Ok(()));
        }
        prop_assert_eq!(map.regions().len(), 1);
        prop_assert_eq!(map.used_memory(), 0);
    }
}
