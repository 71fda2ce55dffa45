//! # Memory Layout and Allocator Tuning

/// End of userspace VA range after which Kernel space begins.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Lowest address handed out to user mappings; the first 4 MiB stay unmapped
/// to catch null dereferences.
pub const USERSPACE_START: u64 = 0x0000_0000_0040_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Index of the first PML4 slot belonging to the kernel half.
pub const KERNEL_PML4_START: usize = 256;

/// Base page and frame size.
pub const PAGE_SIZE: u64 = 4096;

/// Largest buddy order of the frame allocator. A top-order block spans
/// `2^FRAME_MAX_ORDER` frames (16 MiB).
pub const FRAME_MAX_ORDER: usize = 12;

/// Frees on one order before that order's free list is sorted and merged.
pub const FRAME_FREE_BEFORE_TIDY_UP: usize = 32;

/// Blocks kept on a list while merging, so a tidy up never drains it.
pub const FRAME_MIN_KEEP: usize = 8;

/// Maximum number of disjoint physical ranges the frame metadata can index.
pub const MAX_FRAME_RANGES: usize = 16;

/// Largest buddy order of the heap allocator. Order `k` blocks are
/// `2^(k + HEAP_MIN_ORDER_SHIFT)` bytes, so the top order is one page.
pub const HEAP_MAX_ORDER: usize = 7;

/// `log2` of the smallest heap block (32 bytes).
pub const HEAP_MIN_ORDER_SHIFT: u32 = 5;

/// Pages requested from the frame allocator whenever the heap runs dry.
pub const HEAP_TAKE_PAGES_BATCH: usize = 4;

/// Frees on one heap order before it is tidied up.
pub const HEAP_FREE_BEFORE_TIDY_UP: usize = 32;

/// Heap blocks kept on a list while merging.
pub const HEAP_MIN_KEEP: usize = 8;

/// Smallest slab object.
pub const SLAB_MIN_SIZE: usize = 16;

/// Alignment (and size granularity) of slab objects.
pub const SLAB_ALIGN: usize = 16;

/// Largest size class served by the kernel heap's slabs; larger requests go
/// to the buddy heap.
pub const KERNEL_HEAP_MAX_SLAB: usize = 2048;

/// Default size of the boot heap the memory manager carves out of RAM.
pub const BOOT_HEAP_SIZE: usize = 256 * 1024;

const _: () = {
    assert!(PAGE_SIZE == kernel_memory_addresses::PAGE_SIZE);
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(USERSPACE_START < USERSPACE_END);
    assert!(FRAME_MIN_KEEP + 2 <= FRAME_FREE_BEFORE_TIDY_UP);
    assert!(1 << (HEAP_MAX_ORDER as u32 + HEAP_MIN_ORDER_SHIFT) == PAGE_SIZE);
    assert!(KERNEL_HEAP_MAX_SLAB.is_power_of_two());
    assert!(SLAB_MIN_SIZE.is_power_of_two() && SLAB_ALIGN.is_power_of_two());
    assert!(BOOT_HEAP_SIZE.is_multiple_of(PAGE_SIZE as usize));
};
