//! Facade contract tests over both backends.

use xalloc_core::{
    AllocError, AllocFlags, AllocatorConfig, ExtendedAllocator, FRESH_POISON, FailurePlan,
    PoolConfig, PoolHeap, Site, SystemHeap, UsageTag, map, site,
};

fn pool_facade(main: usize, temp: usize) -> ExtendedAllocator<PoolHeap> {
    let heap = PoolHeap::new(&PoolConfig::single(main).with_temp(temp).with_self_check(true))
        .expect("pool heap");
    ExtendedAllocator::new(heap, AllocatorConfig::debug().with_halt_on_corruption(false))
}

fn alloc(facade: &ExtendedAllocator<PoolHeap>, size: usize) -> Result<Option<usize>, AllocError> {
    facade.alloc(size, 0, AllocFlags::empty(), Site::UNKNOWN)
}

#[test]
fn aligned_round_trip_on_pool() {
    let facade = pool_facade(64 * 1024, 0);
    for align in [0, 8, 16, 32, 64] {
        let ptr = facade
            .alloc(100, align, AllocFlags::empty(), site!())
            .unwrap()
            .unwrap();
        let expected = if align == 0 { 16 } else { align };
        assert_eq!(ptr % expected, 0, "align {align}");
        facade.write(ptr, &[align as u8; 100]).unwrap();
        assert_eq!(facade.read(ptr, 100).unwrap(), vec![align as u8; 100]);
    }
    assert_eq!(facade.live_count(), 5);
    assert_eq!(facade.bytes_allocated(), 500);
    for record in facade.report_allocs() {
        facade.free(Some(record.ptr)).unwrap();
    }
    assert_eq!(facade.bytes_allocated(), 0);
    let full = facade.with_backend(|heap| heap.main().stats());
    assert_eq!(full.used_blocks, 0);
    assert_eq!(full.free_blocks, 1);
}

#[test]
fn aligned_round_trip_on_system_heap() {
    let facade = ExtendedAllocator::new(SystemHeap::new(), AllocatorConfig::debug());
    let ptr = facade
        .alloc(300, 256, AllocFlags::CLEAR, site!(Texture))
        .unwrap()
        .unwrap();
    assert_eq!(ptr % 256, 0);
    assert!(facade.read(ptr, 300).unwrap().iter().all(|&b| b == 0));

    let payload: Vec<u8> = (0..=255).cycle().take(300).collect();
    facade.write(ptr, &payload).unwrap();
    let grown = facade
        .realloc(Some(ptr), 5000, AllocFlags::empty(), site!(Texture))
        .unwrap()
        .unwrap();
    assert_eq!(grown % 256, 0);
    assert_eq!(facade.read(grown, 300).unwrap(), payload);

    let shrunk = facade
        .realloc(Some(grown), 10, AllocFlags::empty(), site!(Texture))
        .unwrap()
        .unwrap();
    assert_eq!(facade.read(shrunk, 10).unwrap(), &payload[..10]);
    facade.free(Some(shrunk)).unwrap();
    assert_eq!(facade.with_backend(SystemHeap::region_count), 0);
    assert_eq!(facade.avail(AllocFlags::empty()), None);
}

#[test]
fn alignment_beyond_granularity_is_padded() {
    let facade = pool_facade(64 * 1024, 0);
    // 128 > granularity: padded to fit inside a 64-aligned region.
    let ptr = facade
        .alloc(32, 128, AllocFlags::empty(), Site::UNKNOWN)
        .unwrap()
        .unwrap();
    assert_eq!(ptr % 128, 0);
    assert_eq!(
        facade.alloc(32, 96, AllocFlags::empty(), Site::UNKNOWN),
        Err(AllocError::InvalidAlignment(96))
    );
}

fn pool_facade_with(main: usize, anti_coincidence: bool) -> ExtendedAllocator<PoolHeap> {
    let heap = PoolHeap::new(&PoolConfig::single(main).with_self_check(true)).expect("pool heap");
    let config = AllocatorConfig::debug()
        .with_anti_coincidence(anti_coincidence)
        .with_halt_on_corruption(false);
    ExtendedAllocator::new(heap, config)
}

#[test]
fn same_size_realloc_keeps_contents_and_alignment() {
    for anti in [false, true] {
        let facade = pool_facade_with(1024 * 1024, anti);
        for align in [0, 8, 64, 128, 256, 1024] {
            let expected = if align == 0 { 16 } else { align };
            for size in [1, 100, 1000, 5000] {
                let ptr = facade
                    .alloc(size, align, AllocFlags::empty(), Site::UNKNOWN)
                    .unwrap()
                    .unwrap();
                let pattern: Vec<u8> = (0..size).map(|i| (i * 7 + align) as u8).collect();
                facade.write(ptr, &pattern).unwrap();

                let again = facade
                    .realloc(Some(ptr), size, AllocFlags::empty(), Site::UNKNOWN)
                    .unwrap()
                    .unwrap();
                assert_eq!(again, ptr, "anti {anti} align {align} size {size}");
                assert_eq!(again % expected, 0, "anti {anti} align {align} size {size}");
                assert_eq!(facade.read(again, size).unwrap(), pattern);
                assert_eq!(facade.usable_size(again), Ok(size));
                facade.free(Some(again)).unwrap();
            }
        }
        assert_eq!(facade.live_count(), 0);
        assert_eq!(facade.with_backend(|heap| heap.main().stats().used_blocks), 0);
    }
}

#[test]
fn three_way_merge_realloc_shifts_payload_offset() {
    // Granularity 64, so a 128-aligned block sits at offset 64 or 128 past
    // its region start depending on which half of a 128-byte line it lands.
    let facade = pool_facade_with(64 * 1024, false);
    let below = facade.alloc(128, 0, AllocFlags::empty(), Site::UNKNOWN).unwrap(); // 3 units
    let ptr = facade
        .alloc(100, 128, AllocFlags::empty(), Site::UNKNOWN)
        .unwrap()
        .unwrap(); // 7 units
    let above = facade.alloc(1, 0, AllocFlags::empty(), Site::UNKNOWN).unwrap(); // 2 units
    let _fence = facade.alloc(1, 0, AllocFlags::empty(), Site::UNKNOWN).unwrap();
    let payload: Vec<u8> = (0..100u8).collect();
    facade.write(ptr, &payload).unwrap();
    facade.free(below).unwrap();
    facade.free(above).unwrap();

    // 400 bytes needs all 12 units: the region moves down by three units.
    let moved = facade
        .realloc(Some(ptr), 400, AllocFlags::empty(), Site::UNKNOWN)
        .unwrap()
        .unwrap();
    assert!(moved < ptr);
    assert_eq!(moved % 128, 0);
    assert_ne!(ptr - moved, 3 * 64);
    assert_eq!(facade.read(moved, 100).unwrap(), payload);
    assert!(facade.read(moved + 100, 300).unwrap().iter().all(|&b| b == FRESH_POISON));
    assert_eq!(facade.live_count(), 2);
    facade.with_backend(|heap| heap.check()).unwrap();
}

#[test]
fn failure_plan_is_deterministic_for_alloc() {
    let facade = pool_facade(64 * 1024, 0);
    facade.test_fail_after(Some(FailurePlan::every(3, 2)));
    let outcomes: Vec<bool> = (0..10).map(|_| alloc(&facade, 24).is_ok()).collect();
    assert_eq!(
        outcomes,
        vec![true, true, false, true, false, true, false, true, false, true]
    );
    assert_eq!(facade.live_count(), 6);

    // Zero-size requests are not counted.
    facade.test_fail_after(Some(FailurePlan::once(1)));
    assert_eq!(alloc(&facade, 0), Ok(None));
    assert_eq!(alloc(&facade, 8), Err(AllocError::InjectedFailure { call: 1 }));
    facade.test_fail_after(None);
    assert!(alloc(&facade, 8).unwrap().is_some());
}

#[test]
fn failure_plan_counts_shrinks_only_when_asked() {
    let facade = pool_facade(64 * 1024, 0);
    let ptr = alloc(&facade, 256).unwrap();

    facade.test_fail_after(Some(FailurePlan::once(1)));
    let shrunk = facade
        .realloc(ptr, 128, AllocFlags::empty(), Site::UNKNOWN)
        .unwrap();
    assert_eq!(
        facade.realloc(shrunk, 512, AllocFlags::empty(), Site::UNKNOWN),
        Err(AllocError::InjectedFailure { call: 1 })
    );
    // A failed realloc leaves the block untouched.
    assert_eq!(facade.usable_size(shrunk.unwrap()), Ok(128));

    facade.test_fail_after(Some(FailurePlan::once(1).with_shrink()));
    assert_eq!(
        facade.realloc(shrunk, 64, AllocFlags::empty(), Site::UNKNOWN),
        Err(AllocError::InjectedFailure { call: 1 })
    );
}

#[test]
fn failure_plan_is_deterministic_for_realloc() {
    let facade = pool_facade(64 * 1024, 0);
    let mut ptr = alloc(&facade, 16).unwrap();
    let mut size = 16;

    facade.test_fail_after(Some(FailurePlan::every(2, 3)));
    let mut outcomes = Vec::new();
    for _ in 0..10 {
        match facade.realloc(ptr, size + 16, AllocFlags::empty(), Site::UNKNOWN) {
            Ok(grown) => {
                ptr = grown;
                size += 16;
                outcomes.push(true);
            }
            Err(AllocError::InjectedFailure { .. }) => outcomes.push(false),
            Err(err) => panic!("unexpected realloc error: {err}"),
        }
        // Same-size and shrinking reallocs are not counted.
        ptr = facade
            .realloc(ptr, size, AllocFlags::empty(), Site::UNKNOWN)
            .unwrap();
        ptr = facade
            .realloc(ptr, size - 1, AllocFlags::empty(), Site::UNKNOWN)
            .unwrap();
        size -= 1;
    }
    assert_eq!(
        outcomes,
        vec![true, false, true, true, false, true, true, false, true, true]
    );

    // With shrinks included every realloc advances the schedule.
    facade.test_fail_after(Some(FailurePlan::every(2, 3).with_shrink()));
    let outcomes: Vec<bool> = [size + 8, size, size + 8, size, size + 8, size]
        .into_iter()
        .map(|target| {
            match facade.realloc(ptr, target, AllocFlags::empty(), Site::UNKNOWN) {
                Ok(resized) => {
                    ptr = resized;
                    true
                }
                Err(_) => false,
            }
        })
        .collect();
    assert_eq!(outcomes, vec![true, false, true, true, false, true]);
    facade.test_fail_after(None);
    assert_eq!(facade.live_count(), 1);
}

#[test]
fn next_alloc_override_reuses_compatible_block() {
    let facade = pool_facade(64 * 1024, 0);
    let held = alloc(&facade, 128).unwrap().unwrap();
    facade.test_set_next_alloc(Some(held)).unwrap();

    let got = facade
        .alloc(64, 0, AllocFlags::CLEAR, site!(Font))
        .unwrap()
        .unwrap();
    assert_eq!(got, held);
    assert_eq!(facade.usable_size(got), Ok(64));
    assert!(facade.read(got, 64).unwrap().iter().all(|&b| b == 0));
    assert_eq!(facade.live_count(), 1);
    assert_eq!(facade.report_allocs()[0].site.tag, UsageTag::Font);

    // The override is consumed.
    let next = alloc(&facade, 64).unwrap().unwrap();
    assert_ne!(next, held);
}

#[test]
fn next_alloc_override_frees_incompatible_block() {
    let facade = pool_facade(64 * 1024, 0);
    let small = alloc(&facade, 16).unwrap().unwrap();
    // Keeps the freed hole too small for the next request.
    let _spacer = alloc(&facade, 16).unwrap().unwrap();
    facade.test_set_next_alloc(Some(small)).unwrap();
    let big = alloc(&facade, 256).unwrap().unwrap();
    assert_ne!(big, small);
    assert_eq!(facade.live_count(), 2);
    assert!(facade.free(Some(small)).is_err());

    // Displacing a pending override frees it immediately.
    let first = alloc(&facade, 32).unwrap().unwrap();
    let second = alloc(&facade, 32).unwrap().unwrap();
    facade.test_set_next_alloc(Some(first)).unwrap();
    facade.test_set_next_alloc(Some(second)).unwrap();
    assert_eq!(facade.live_count(), 3);
    assert_eq!(alloc(&facade, 32).unwrap(), Some(second));
}

#[test]
fn checkpoints_isolate_test_allocations() {
    let facade = pool_facade(64 * 1024, 0);
    let outer = alloc(&facade, 10).unwrap().unwrap();
    let cp = facade.test_checkpoint();
    assert_eq!(facade.live_count(), 0);
    assert_eq!(facade.bytes_allocated(), 10);

    let inner = alloc(&facade, 20).unwrap().unwrap();
    let visible: Vec<_> = facade.report_allocs().iter().map(|r| r.ptr).collect();
    assert_eq!(visible, vec![inner]);

    facade.test_restore(cp).unwrap();
    let visible: Vec<_> = facade.report_allocs().iter().map(|r| r.ptr).collect();
    assert_eq!(visible, vec![outer, inner]);
    assert_eq!(facade.test_restore(cp), Err(AllocError::StaleCheckpoint));
}

#[test]
fn hidden_blocks_can_still_be_freed() {
    let facade = pool_facade(64 * 1024, 0);
    let ptr = alloc(&facade, 10).unwrap();
    let cp = facade.test_checkpoint();
    facade.free(ptr).unwrap();
    assert_eq!(facade.bytes_allocated(), 0);
    facade.test_restore(cp).unwrap();
    assert_eq!(facade.live_count(), 0);
}

#[test]
fn double_free_is_reported() {
    let facade = pool_facade(64 * 1024, 0);
    let ptr = alloc(&facade, 48).unwrap();
    facade.free(ptr).unwrap();
    assert!(matches!(
        facade.free(ptr),
        Err(AllocError::Corrupted { .. })
    ));
    assert!(matches!(
        facade.realloc(ptr, 64, AllocFlags::empty(), Site::UNKNOWN),
        Err(AllocError::Corrupted { .. })
    ));
}

#[test]
#[should_panic(expected = "xalloc: free")]
fn double_free_halts_in_debug_preset() {
    let heap = PoolHeap::new(&PoolConfig::single(4096)).unwrap();
    let facade = ExtendedAllocator::new(heap, AllocatorConfig::debug());
    let ptr = facade
        .alloc(48, 0, AllocFlags::empty(), Site::UNKNOWN)
        .unwrap();
    facade.free(ptr).unwrap();
    let _ = facade.free(ptr);
}

#[test]
fn usage_map_sorts_by_address() {
    let heap = PoolHeap::new(&PoolConfig::single(4096)).unwrap();
    let facade = ExtendedAllocator::new(
        heap,
        AllocatorConfig::debug()
            .with_anti_coincidence(false)
            .with_halt_on_corruption(false),
    );
    // Allocated first, but carved from the top of the pool.
    facade
        .alloc(800, 0, AllocFlags::TOP, site!(Sound))
        .unwrap()
        .unwrap();
    facade
        .alloc(1000, 0, AllocFlags::empty(), site!(Texture))
        .unwrap()
        .unwrap();

    let (base, size) = facade.with_backend(|heap| (heap.main().base(), heap.main().size()));
    let tags = facade.get_map(base, size, 4);
    assert_eq!(
        tags,
        vec![
            UsageTag::Texture,
            UsageTag::Texture,
            UsageTag::Free,
            UsageTag::Sound
        ]
    );
    assert_eq!(map::render(&tags).len(), 4);

    let order: Vec<_> = facade.report_allocs().iter().map(|r| r.site.tag).collect();
    assert_eq!(order, vec![UsageTag::Texture, UsageTag::Sound]);
}

#[test]
fn temp_realloc_falls_back_to_main_pool() {
    let facade = pool_facade(64 * 1024, 8 * 1024);
    let ptr = facade
        .alloc(4000, 0, AllocFlags::TEMP, Site::UNKNOWN)
        .unwrap()
        .unwrap();
    assert!(facade.with_backend(|heap| heap.temp().unwrap().contains(ptr)));
    facade.fill(ptr, 4000, 0x5A).unwrap();

    let moved = facade
        .realloc(Some(ptr), 12_000, AllocFlags::TEMP, Site::UNKNOWN)
        .unwrap()
        .unwrap();
    assert!(facade.with_backend(|heap| heap.main().contains(moved)));
    assert!(facade.read(moved, 4000).unwrap().iter().all(|&b| b == 0x5A));
    assert_eq!(facade.with_backend(|heap| heap.temp().unwrap().stats().used_blocks), 0);
}

#[test]
fn forced_backend_failure_and_synthetic_avail() {
    let facade = pool_facade(64 * 1024, 0);
    facade.test_fail_sys(true);
    assert!(alloc(&facade, 8).unwrap_err().is_exhaustion());
    facade.test_fail_sys(false);
    assert!(alloc(&facade, 8).is_ok());

    facade.test_set_avail(Some(1234));
    assert_eq!(facade.avail(AllocFlags::empty()), Some(1234));
    assert_eq!(facade.contig(AllocFlags::TEMP), Some(1234));
    facade.test_set_avail(None);
    let real = facade.avail(AllocFlags::empty()).unwrap();
    assert!(real > 60 * 1024);
}

#[test]
fn avail_is_backend_usable_and_contig_is_request_sized() {
    let release = pool_facade_with(16 * 1024, false);
    assert_eq!(release.avail(AllocFlags::empty()), Some(16 * 1024 - 16));
    // Header rounded to the default alignment.
    assert_eq!(release.contig(AllocFlags::empty()), Some(16 * 1024 - 16 - 48));

    let debug = pool_facade_with(16 * 1024, true);
    assert_eq!(debug.avail(AllocFlags::empty()), Some(16 * 1024 - 16));
    let contig = debug.contig(AllocFlags::empty()).unwrap();
    assert_eq!(contig, 16 * 1024 - 16 - 64);
    // The reported figure is a request that actually fits.
    let ptr = debug
        .alloc(contig, 0, AllocFlags::empty(), Site::UNKNOWN)
        .unwrap();
    assert!(ptr.is_some());
    assert_eq!(debug.contig(AllocFlags::empty()), Some(0));
}

#[test]
fn strdup_round_trip() {
    let facade = pool_facade(64 * 1024, 0);
    let ptr = facade
        .strdup(Some(b"allocator".as_slice()), AllocFlags::empty(), site!(Debug))
        .unwrap()
        .unwrap();
    assert_eq!(facade.usable_size(ptr), Ok(10));
    assert_eq!(facade.read(ptr, 10).unwrap(), b"allocator\0");
}
