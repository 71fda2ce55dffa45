use kernel_frames::testing::PhysArena;
use kernel_frames::{HhdmPhysMapper, PhysMapper};
use kernel_info::boot::{MemoryKind, MemoryMapEntry};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_mm::{AddressSpace, ErrorKind, MemError, MemoryConfig, MemoryManager, PhysicalRange};
use kernel_vmem::{MappingPolicy, PageFaultError, PagingError, Protection};
use kernel_vms::RegionFlags;

type Manager = MemoryManager<HhdmPhysMapper>;

const USER_BASE: u64 = 0x40_0000;
const READ_MISS: PageFaultError = PageFaultError::new().with_user(true);
const WRITE_MISS: PageFaultError = PageFaultError::new().with_user(true).with_write(true);
const WRITE_PROTECTED: PageFaultError = PageFaultError::new()
    .with_present(true)
    .with_user(true)
    .with_write(true);

fn manager(frames: usize, boot_heap: usize) -> (PhysArena, Manager) {
    let ram = PhysArena::new(PhysicalAddress::new(0x1000_0000), frames);
    let ranges = [PhysicalRange::new(ram.base(), frames as u64)];
    let config = MemoryConfig::new(ram.mapper(), &ranges)
        .with_boot_heap_size(boot_heap)
        .with_user_window(VirtualAddress::new(USER_BASE), 0x1000_0000);
    let mm = Manager::new(config).unwrap();
    (ram, mm)
}

fn page(n: u64) -> VirtualAddress {
    VirtualAddress::new(USER_BASE + n * PAGE_SIZE)
}

fn write_byte(mm: &Manager, space: &AddressSpace<HhdmPhysMapper>, v: VirtualAddress, value: u8) {
    let pa = mm.translate(space, v).unwrap();
    unsafe { mm.pool().mapper().phys_to_ptr::<u8>(pa).write(value) }
}

fn read_byte(mm: &Manager, space: &AddressSpace<HhdmPhysMapper>, v: VirtualAddress) -> u8 {
    let pa = mm.translate(space, v).unwrap();
    unsafe { mm.pool().mapper().phys_to_ptr::<u8>(pa).read() }
}

#[test]
fn frame_allocation_survives_fragmentation() {
    let (_ram, mut mm) = manager(2048, 0);
    let first = mm.allocate_frames(300).unwrap();
    let live = mm.allocate_frames(50).unwrap();
    mm.free_frames(first, 300).unwrap();

    let big = mm.allocate_frames(400).unwrap();
    assert!(big.is_aligned_to(PAGE_SIZE));
    let (big_end, live_end) = (big + 400 * PAGE_SIZE, live + 50 * PAGE_SIZE);
    assert!(big_end <= live || live_end <= big, "{big:?} overlaps {live:?}");

    mm.free_frames(big, 400).unwrap();
    mm.free_frames(live, 50).unwrap();
    assert_eq!(
        mm.free_frames(live, 50).map_err(|e| e.kind()),
        Err(ErrorKind::VerificationFailed)
    );
}

#[test]
fn ranges_come_from_the_usable_map_entries() {
    let ram = PhysArena::new(PhysicalAddress::new(0x1000_0000), 96);
    let map = [
        MemoryMapEntry {
            base: 0x0,
            length: 0x1000_0000,
            kind: MemoryKind::Reserved,
        },
        // starts mid-frame; the partial frame is dropped
        MemoryMapEntry::usable(0x1000_0800, 64 * PAGE_SIZE - 0x800),
        MemoryMapEntry::usable(0x1004_0000, 32 * PAGE_SIZE),
    ];
    let ranges: Vec<_> = map.iter().filter_map(PhysicalRange::from_entry).collect();
    assert_eq!(
        ranges,
        [
            PhysicalRange::new(PhysicalAddress::new(0x1000_1000), 63),
            PhysicalRange::new(PhysicalAddress::new(0x1004_0000), 32),
        ]
    );

    let mm = Manager::new(MemoryConfig::new(ram.mapper(), &ranges).with_boot_heap_size(0)).unwrap();
    // one metadata frame per range, two frames for the kernel root
    assert_eq!(mm.stats().frames_total, 62 + 31);
    assert_eq!(mm.stats().frames_free, 62 + 31 - 2);
}

#[test]
fn empty_memory_map_is_refused() {
    let ram = PhysArena::new(PhysicalAddress::new(0x1000_0000), 1);
    let config = MemoryConfig::new(ram.mapper(), &[]);
    assert_eq!(Manager::new(config).err(), Some(MemError::NoUsableMemory));
}

#[test]
fn heap_blocks_keep_their_contents() {
    let (_ram, mut mm) = manager(256, 0);
    let sizes = [1, 16, 24, 100, 512, 2048, 3000, 4000];
    let blocks: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(i, &n)| {
            let p = mm.allocate(n).unwrap();
            unsafe { p.as_ptr().write_bytes(i as u8 + 1, n) };
            (p, n, i as u8 + 1)
        })
        .collect();

    for &(p, n, fill) in &blocks {
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), n) };
        assert!(bytes.iter().all(|&b| b == fill), "block of {n} bytes was clobbered");
    }
    for &(p, _, _) in &blocks {
        mm.free(p).unwrap();
    }

    let stats = mm.stats();
    assert_eq!(stats.heap_free, stats.heap_total);
    assert_eq!(mm.allocate(0).map_err(|e| e.kind()), Err(ErrorKind::IllegalArguments));
    assert_eq!(
        mm.allocate(1 << 20).map_err(|e| e.kind()),
        Err(ErrorKind::IllegalArguments)
    );
}

#[test]
fn boot_heap_is_carved_from_ram() {
    let (_ram, without) = manager(256, 0);
    let (_ram2, mut mm) = manager(256, 64 * 1024);
    let stats = mm.stats();
    assert_eq!(stats.frames_free, without.stats().frames_free - 16);
    assert!(stats.boot_heap_total > 0 && stats.boot_heap_total <= 64 * 1024);

    let a = mm.boot_allocate(100).unwrap();
    let b = mm.boot_allocate(1000).unwrap();
    assert_eq!(a.as_ptr().addr() % 16, 0);
    mm.boot_free(a).unwrap();
    mm.boot_free(b).unwrap();
    assert_eq!(mm.stats().boot_heap_free, stats.boot_heap_free);

    let mut outside = 0u64;
    let foreign = core::ptr::NonNull::from(&mut outside).cast::<u8>();
    assert_eq!(
        mm.boot_free(foreign).map_err(|e| e.kind()),
        Err(ErrorKind::VerificationFailed)
    );
}

#[test]
fn address_spaces_share_the_kernel_half() {
    let (_ram, mut mm) = manager(256, 0);
    let kv = VirtualAddress::new(0xFFFF_8000_0010_0000);
    let frame = mm.allocate_frames(1).unwrap();
    mm.map_kernel(kv, frame, 1, Protection::KERNEL_RW).unwrap();
    assert_eq!(mm.translate_kernel(kv + 0x20), Some(frame + 0x20));

    let a = mm.create_address_space().unwrap();
    let b = mm.create_address_space().unwrap();
    assert_ne!(a.root_page(), b.root_page());
    assert_eq!(mm.translate(&a, kv), Some(frame));
    assert_eq!(mm.translate(&b, kv), Some(frame));
    assert_eq!(mm.stats().address_spaces, 2);

    mm.release(a).unwrap();
    mm.release(b).unwrap();
    assert_eq!(mm.translate_kernel(kv), Some(frame));
    assert_eq!(mm.stats().address_spaces, 0);

    mm.unmap_kernel(kv, 1).unwrap();
    assert_eq!(mm.translate_kernel(kv), None);
    mm.free_frames(frame, 1).unwrap();
}

#[test]
fn mmap_places_regions_and_faults_back_them() {
    let (_ram, mut mm) = manager(256, 0);
    let baseline = mm.stats().frames_free;
    let mut space = mm.create_address_space().unwrap();

    let a = mm
        .mmap(&mut space, None, 3 * PAGE_SIZE, RegionFlags::USER_DATA, MappingPolicy::LazyAnonymous)
        .unwrap();
    assert_eq!((a.begin(), a.pages()), (page(0), 3));

    // partial pages are rounded up; a free hint is honoured
    let b = mm
        .mmap(&mut space, Some(page(10)), 100, RegionFlags::USER_DATA, MappingPolicy::PrivateOwned)
        .unwrap();
    assert_eq!((b.begin(), b.pages()), (page(10), 1));

    // a taken hint falls back to the first gap
    let c = mm
        .mmap(&mut space, Some(page(1)), 2 * PAGE_SIZE, RegionFlags::USER_DATA, MappingPolicy::Cow)
        .unwrap();
    assert_eq!(c.begin(), page(3));

    assert_eq!(mm.translate(&space, page(1)), None);
    mm.handle_page_fault(&mut space, page(1) + 0x123, READ_MISS).unwrap();
    assert!(mm.translate(&space, page(1)).is_some());
    assert_eq!(read_byte(&mm, &space, page(1)), 0);

    let miss = mm.handle_page_fault(&mut space, page(7), READ_MISS).unwrap_err();
    assert_eq!(miss, MemError::NoRegion(page(7)));
    assert_eq!(miss.kind(), ErrorKind::NotFound);

    let shared = mm.mmap(
        &mut space,
        None,
        PAGE_SIZE,
        RegionFlags::USER_DATA,
        MappingPolicy::SharedReadOnly,
    );
    assert_eq!(
        shared,
        Err(MemError::Paging(PagingError::InvalidPolicy(MappingPolicy::SharedReadOnly)))
    );

    mm.release(space).unwrap();
    assert_eq!(mm.stats().frames_free, baseline);
}

#[test]
fn read_only_regions_refuse_writes() {
    let (_ram, mut mm) = manager(128, 0);
    let mut space = mm.create_address_space().unwrap();
    let ro = RegionFlags::new().with_user(true);
    mm.mmap(&mut space, None, PAGE_SIZE, ro, MappingPolicy::LazyAnonymous)
        .unwrap();

    let err = mm.handle_page_fault(&mut space, page(0), WRITE_MISS).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    mm.handle_page_fault(&mut space, page(0), READ_MISS).unwrap();
    mm.release(space).unwrap();
}

#[test]
fn fork_copies_on_the_first_write() {
    let (_ram, mut mm) = manager(256, 0);
    let baseline = mm.stats().frames_free;
    let mut parent = mm.create_address_space().unwrap();
    mm.mmap(&mut parent, None, 2 * PAGE_SIZE, RegionFlags::USER_DATA, MappingPolicy::LazyAnonymous)
        .unwrap();
    mm.handle_page_fault(&mut parent, page(0), WRITE_MISS).unwrap();
    write_byte(&mm, &parent, page(0), 0x42);

    let mut child = mm.fork(&mut parent).unwrap();
    assert_eq!(child.space().len(), 1);
    let shared = mm.translate(&parent, page(0)).unwrap();
    assert_eq!(mm.translate(&child, page(0)), Some(shared));

    mm.handle_page_fault(&mut child, page(0), WRITE_PROTECTED).unwrap();
    let copy = mm.translate(&child, page(0)).unwrap();
    assert_ne!(copy, shared);
    assert_eq!(read_byte(&mm, &child, page(0)), 0x42);

    write_byte(&mm, &child, page(0), 0x17);
    assert_eq!(read_byte(&mm, &parent, page(0)), 0x42);

    // the untouched page is backed independently on each side
    mm.handle_page_fault(&mut child, page(1), READ_MISS).unwrap();
    assert_eq!(mm.translate(&parent, page(1)), None);

    mm.release(child).unwrap();
    assert_eq!(mm.translate(&parent, page(0)), Some(shared));
    mm.release(parent).unwrap();
    assert_eq!(mm.stats().frames_free, baseline);
}

#[test]
fn munmap_splits_the_region_it_cuts() {
    let (_ram, mut mm) = manager(256, 0);
    let mut space = mm.create_address_space().unwrap();
    mm.mmap(&mut space, None, 8 * PAGE_SIZE, RegionFlags::USER_DATA, MappingPolicy::LazyAnonymous)
        .unwrap();
    for p in 0..8 {
        mm.handle_page_fault(&mut space, page(p), READ_MISS).unwrap();
    }

    mm.munmap(&mut space, page(2), 3 * PAGE_SIZE).unwrap();
    let regions: Vec<_> = space.space().regions().map(|r| (r.begin(), r.pages())).collect();
    assert_eq!(regions, [(page(0), 2), (page(5), 3)]);
    assert!(mm.translate(&space, page(1)).is_some());
    assert_eq!(mm.translate(&space, page(3)), None);
    assert_eq!(
        mm.handle_page_fault(&mut space, page(3), READ_MISS),
        Err(MemError::NoRegion(page(3)))
    );
    mm.release(space).unwrap();
}

#[test]
fn a_full_window_reports_no_space() {
    let ram = PhysArena::new(PhysicalAddress::new(0x1000_0000), 128);
    let ranges = [PhysicalRange::new(ram.base(), 128)];
    let config = MemoryConfig::new(ram.mapper(), &ranges)
        .with_boot_heap_size(0)
        .with_user_window(VirtualAddress::new(USER_BASE), 16 * PAGE_SIZE);
    let mut mm = Manager::new(config).unwrap();
    let mut space = mm.create_address_space().unwrap();

    mm.mmap(&mut space, None, 12 * PAGE_SIZE, RegionFlags::USER_DATA, MappingPolicy::LazyAnonymous)
        .unwrap();
    let err = mm
        .mmap(&mut space, None, 8 * PAGE_SIZE, RegionFlags::USER_DATA, MappingPolicy::LazyAnonymous)
        .unwrap_err();
    assert_eq!(err, MemError::NoSpace(8 * PAGE_SIZE));
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    mm.release(space).unwrap();
}
