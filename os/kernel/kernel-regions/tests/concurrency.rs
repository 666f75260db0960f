use kernel_regions::{MapLock, RefDrop, RegionMap};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

const PAGE: u64 = 0x1000;

#[test]
fn contended_allocate_and_free_keep_the_chain_intact() {
    let threads = 8;
    let iters = 500;

    let map = Arc::new(RegionMap::with_extent(PAGE, 0, 0x100_0000).unwrap());
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for t in 0..threads {
        let map = Arc::clone(&map);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            let mut held = Vec::new();
            for i in 0..iters {
                let pages = ((t + i) % 4 + 1) as u64;
                if let Ok(id) = map.allocate(pages * PAGE) {
                    let region = map.region(id).unwrap();
                    assert!(region.used, "handed out a free region");
                    assert_eq!(region.size, pages * PAGE);
                    held.push(id);
                }
                if i % 3 == 2 {
                    if let Some(id) = held.pop() {
                        map.free(id).unwrap();
                    }
                }
                thread::yield_now();
            }
            for id in held {
                map.free(id).unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    map.verify().unwrap();
    assert_eq!(map.used_memory(), 0);
    assert_eq!(map.regions().len(), 1);
}

#[test]
fn cow_derefs_race_to_a_single_release() {
    let threads = 8;
    let map = Arc::new(RegionMap::with_extent(PAGE, 0, 0x10000).unwrap());
    let id = map.allocate(PAGE).unwrap();
    for _ in 1..threads {
        map.cow_ref(id).unwrap();
    }
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let map = Arc::clone(&map);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                map.cow_deref(id).unwrap() == RefDrop::Released
            })
        })
        .collect();

    let released = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&r| r)
        .count();
    assert_eq!(released, 1);
    assert_eq!(map.used_memory(), 0);
    map.verify().unwrap();
}

#[test]
fn lock_is_released_on_panic() {
    let l = MapLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert!(!l.is_locked());
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn region_map_is_send_and_sync() {
    fn takes<S: Send + Sync>(_s: &S) {}
    let map = RegionMap::with_extent(PAGE, 0, 0x1000).unwrap();
    takes(&map);
}
