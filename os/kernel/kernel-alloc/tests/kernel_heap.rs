use kernel_alloc::{HeapAllocator, HeapError, KernelHeapAllocator, class_size, size_class};
use kernel_frames::testing::PhysArena;
use kernel_frames::{FrameOwner, HhdmPhysMapper, PhysMapper, PhysicalMemory};
use kernel_memory_addresses::PhysicalAddress;
use std::ptr::NonNull;

fn pool(frames: usize) -> (PhysArena, PhysicalMemory<HhdmPhysMapper>) {
    let arena = PhysArena::new(PhysicalAddress::new(0x4000_0000), frames);
    let mut pm = PhysicalMemory::new(arena.mapper());
    pm.add_range(arena.base(), frames as u64).unwrap();
    (arena, pm)
}

#[test]
fn every_size_class_round_trips() {
    let (_arena, mut pm) = pool(256);
    let mut heap = KernelHeapAllocator::new();

    let sizes = [1usize, 15, 16, 17, 100, 255, 512, 1000, 2048, 2049, 3000, 4076];
    let mut live = Vec::new();
    for (i, &n) in sizes.iter().enumerate() {
        let p = heap.allocate(&mut pm, n).unwrap();
        assert_eq!(p.as_ptr().addr() % 16, 0, "n = {n}");
        let pattern = i as u8 + 1;
        unsafe { p.as_ptr().write_bytes(pattern, n) };
        live.push((p, n, pattern));
    }
    let after_alloc = heap.remaining();

    // no allocation overwrote another
    for &(p, n, pattern) in &live {
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), n) };
        assert!(bytes.iter().all(|&b| b == pattern), "n = {n}");
    }

    let in_use: usize = sizes.iter().map(|&n| heap.actual_size(n)).sum();
    assert_eq!(after_alloc + in_use, heap.total());

    for (p, _, _) in live {
        heap.free(&mut pm, p).unwrap();
    }
    assert_eq!(heap.remaining(), heap.total());
}

#[test]
fn repeated_round_trips_keep_remaining_stable() {
    let (_arena, mut pm) = pool(64);
    let mut heap = KernelHeapAllocator::new();

    // warm up so every class has its pages
    for n in [8usize, 300, 3000] {
        let p = heap.allocate(&mut pm, n).unwrap();
        heap.free(&mut pm, p).unwrap();
    }
    let remaining = heap.remaining();
    let frames = pm.remaining();

    for _ in 0..100 {
        for n in [8usize, 300, 3000] {
            let p = heap.allocate(&mut pm, n).unwrap();
            heap.free(&mut pm, p).unwrap();
            assert_eq!(heap.remaining(), remaining);
        }
    }
    assert_eq!(pm.remaining(), frames);
}

#[test]
fn size_classes_match_slab_sizes() {
    let heap = KernelHeapAllocator::new();
    for n in [1usize, 16, 33, 64, 65, 2048] {
        let class = size_class(n).unwrap();
        assert_eq!(heap.actual_size(n), class_size(class));
        assert!(class_size(class) >= n);
    }
    assert_eq!(heap.actual_size(2049), 4096);
}

#[test]
fn requests_beyond_a_page_are_rejected() {
    let (_arena, mut pm) = pool(16);
    let mut heap = KernelHeapAllocator::new();
    assert_eq!(heap.allocate(&mut pm, 0), Err(HeapError::ZeroSize));
    assert!(matches!(
        heap.allocate(&mut pm, 8192),
        Err(HeapError::TooLarge { requested: 8192, .. })
    ));
}

#[test]
fn free_of_non_heap_memory_is_refused() {
    let (arena, mut pm) = pool(16);
    let mut heap = KernelHeapAllocator::new();

    let frame = pm.allocate(1, FrameOwner::Frames).unwrap();
    let ptr = NonNull::new(arena.mapper().phys_to_ptr::<u8>(frame)).unwrap();
    assert_eq!(
        heap.free(&mut pm, ptr),
        Err(HeapError::ForeignPointer(ptr.as_ptr().addr()))
    );
}

#[test]
fn exhausted_frames_surface_as_frame_errors() {
    let (_arena, mut pm) = pool(8);
    let mut heap = KernelHeapAllocator::new();

    // 7 usable frames: one batch of 4 buddy pages fits, the second does not
    let mut live = Vec::new();
    let err = loop {
        match heap.allocate(&mut pm, 4000) {
            Ok(p) => live.push(p),
            Err(e) => break e,
        }
    };
    assert_eq!(live.len(), 4);
    assert!(matches!(err, HeapError::Frame(_)));
}
