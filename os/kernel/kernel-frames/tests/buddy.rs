use kernel_frames::testing::PhysArena;
use kernel_frames::{BuddyFrameAllocator, FrameOwner, HhdmPhysMapper, PhysicalMemory, order_for};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

const BASE: u64 = 0x1000_0000;

fn buddy(arena: &PhysArena) -> BuddyFrameAllocator<HhdmPhysMapper> {
    let mut b = BuddyFrameAllocator::new(arena.mapper());
    b.add_frames(arena.base(), arena.frames() as u64).unwrap();
    b
}

fn page(n: u64) -> PhysicalAddress {
    PhysicalAddress::new(BASE + n * PAGE_SIZE)
}

#[test]
fn split_and_reuse_sequence() {
    let arena = PhysArena::new(PhysicalAddress::new(BASE), 1024);
    let mut b = buddy(&arena);

    assert_eq!(b.allocate(300), Ok(page(0)));
    assert_eq!(b.allocate(50), Ok(page(320)));
    b.free(page(0), 300).unwrap();
    assert_eq!(b.allocate(400), Ok(page(512)));

    assert_eq!(b.remaining(), 1024 - 50 - 400);
    assert_eq!(b.count_free_frames(), b.remaining());
}

#[test]
fn single_frame_frees_are_coalesced_in_batches() {
    let arena = PhysArena::new(PhysicalAddress::new(BASE), 64);
    let mut b = buddy(&arena);

    let frames: Vec<_> = (0..64).map(|_| b.allocate(1).unwrap()).collect();
    assert_eq!(b.remaining(), 0);
    for o in 0..=BuddyFrameAllocator::<HhdmPhysMapper>::MAX_ORDER {
        assert_eq!(b.free_blocks(o), 0);
    }

    for pa in &frames[..31] {
        b.free(*pa, 1).unwrap();
    }
    assert_eq!(b.free_blocks(0), 31);
    assert_eq!(b.free_blocks(1), 0);

    // the 32nd free at order 0 sorts and merges the list
    b.free(frames[31], 1).unwrap();
    assert_eq!(b.free_blocks(0), 8);
    assert_eq!(b.free_blocks(1), 12);
    assert_eq!(b.count_free_frames(), 32);

    for pa in &frames[32..] {
        b.free(*pa, 1).unwrap();
    }
    assert_eq!(b.remaining(), 64);
    assert_eq!(b.count_free_frames(), 64);

    // merged blocks are usable as larger allocations
    let pair = b.allocate(2).unwrap();
    assert_eq!(pair.as_u64() % (2 * PAGE_SIZE), 0);
}

#[test]
fn mixed_workload_conserves_frames() {
    let arena = PhysArena::new(PhysicalAddress::new(BASE), 2048);
    let mut b = buddy(&arena);
    let mut live: Vec<(PhysicalAddress, usize)> = Vec::new();

    // deterministic LCG
    let mut seed = 0x2545_F491_4F6C_DD1D_u64;
    let mut next = move || {
        seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        (seed >> 33) as usize
    };

    for _ in 0..2_000 {
        if live.is_empty() || next() % 3 != 0 {
            let n = 1 + next() % 40;
            if let Ok(pa) = b.allocate(n) {
                let order = order_for(n as u64);
                assert_eq!(pa.as_u64() % (PAGE_SIZE << order), 0);
                assert!(arena.contains(pa) && arena.contains(pa + (n as u64 - 1) * PAGE_SIZE));
                live.push((pa, n));
            }
        } else {
            let (pa, n) = live.swap_remove(next() % live.len());
            b.free(pa, n).unwrap();
        }
        let in_use: usize = live.iter().map(|(_, n)| n).sum();
        assert_eq!(b.remaining() + in_use as u64, 2048);
    }

    // no two live allocations overlap
    live.sort_by_key(|(pa, _)| *pa);
    for w in live.windows(2) {
        assert!(w[0].0 + w[0].1 as u64 * PAGE_SIZE <= w[1].0);
    }

    for (pa, n) in live.drain(..) {
        b.free(pa, n).unwrap();
    }
    assert_eq!(b.remaining(), 2048);
    assert_eq!(b.count_free_frames(), 2048);
}

#[test]
fn pool_tracks_heap_owned_frames() {
    let arena = PhysArena::new(PhysicalAddress::new(BASE), 512);
    let mut pm = PhysicalMemory::new(arena.mapper());
    let usable = pm.add_range(arena.base(), 512).unwrap();
    assert_eq!(usable, 511);

    let heap = pm.allocate(4, FrameOwner::Heap(2)).unwrap();
    let table = pm.allocate(1, FrameOwner::Frames).unwrap();
    assert_eq!(pm.metadata().owner(heap), Ok(FrameOwner::Heap(2)));
    assert_eq!(pm.metadata().owner(table), Ok(FrameOwner::Frames));

    pm.free(table, 1, FrameOwner::Frames).unwrap();
    pm.free(heap, 4, FrameOwner::Heap(2)).unwrap();
    assert_eq!(pm.remaining(), usable);
}
