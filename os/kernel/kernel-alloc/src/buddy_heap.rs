//! # Buddy heap
//!
//! Byte-granular buddy allocator for blocks of 32 B up to one page. Block
//! `order` spans `2^(order + 5)` bytes. When the top order runs dry, pages
//! are requested from the frame allocator in small batches and tagged with
//! this heap's owner tag, which lets the kernel heap route `free` calls back
//! here from the pointer alone.
//!
//! Every live block carries a header (`size`, `padding`, magic) right before
//! the returned pointer and a tail magic in its last four bytes:
//!
//! ```text
//! | BlockHeader (16) | user bytes ............ | pad | tail magic (4) |
//! ^ base             ^ returned pointer                       base + size ^
//! ```

use crate::error::HeapError;
use crate::{BLOCK_HEADER_MAGIC, BLOCK_TAIL_MAGIC, BlockHeader, HeapAllocator};
use core::ptr::{NonNull, null_mut};
use kernel_frames::{FrameAlloc, FrameOwner, PhysMapper};
use kernel_info::memory::{
    HEAP_FREE_BEFORE_TIDY_UP, HEAP_MAX_ORDER, HEAP_MIN_KEEP, HEAP_MIN_ORDER_SHIFT,
    HEAP_TAKE_PAGES_BATCH,
};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use log::{debug, trace, warn};

const HEADER: usize = size_of::<BlockHeader>();
const TAIL: usize = size_of::<u32>();

/// Bytes in a block of `order`.
#[inline]
const fn order_len(order: usize) -> usize {
    1 << (order + HEAP_MIN_ORDER_SHIFT as usize)
}

const TOP_LEN: usize = order_len(HEAP_MAX_ORDER);

const _: () = assert!(TOP_LEN == PAGE_SIZE as usize);

#[inline]
const fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

#[repr(C)]
struct HeapNode {
    next: *mut HeapNode,
}

#[derive(Copy, Clone)]
struct BlockList {
    head: *mut HeapNode,
    blocks: usize,
    frees_since_tidy: usize,
}

impl BlockList {
    const EMPTY: Self = Self {
        head: null_mut(),
        blocks: 0,
        frees_since_tidy: 0,
    };
}

pub struct BuddyHeapAllocator {
    tag: u8,
    lists: [BlockList; HEAP_MAX_ORDER + 1],
    total: usize,
    remaining: usize,
}

// Safety: blocks are only reached through `&mut self`.
unsafe impl Send for BuddyHeapAllocator {}

impl BuddyHeapAllocator {
    /// Largest request that fits a top-order block.
    pub const MAX_REQUEST: usize = TOP_LEN - HEADER - TAIL;

    /// A heap whose pages are tagged [`FrameOwner::Heap(tag)`](FrameOwner::Heap).
    #[must_use]
    pub const fn new(tag: u8) -> Self {
        Self {
            tag,
            lists: [BlockList::EMPTY; HEAP_MAX_ORDER + 1],
            total: 0,
            remaining: 0,
        }
    }

    #[must_use]
    pub const fn tag(&self) -> u8 {
        self.tag
    }

    #[must_use]
    pub fn free_blocks(&self, order: usize) -> usize {
        self.lists.get(order).map_or(0, |l| l.blocks)
    }

    /// Length of the buddy block charged for a request of `n` bytes: the
    /// [`actual_size`](HeapAllocator::actual_size) rounded up to a power of
    /// two.
    #[must_use]
    pub fn block_size(&self, n: usize) -> usize {
        order_len(Self::order_for(self.actual_size(n)))
    }

    /// Order serving a block of `actual` bytes.
    fn order_for(actual: usize) -> usize {
        (0..=HEAP_MAX_ORDER)
            .find(|&o| order_len(o) >= actual)
            .unwrap_or(HEAP_MAX_ORDER)
    }

    fn take<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        order: usize,
    ) -> Result<*mut HeapNode, HeapError> {
        if let Some(block) = self.pop(order) {
            return Ok(block);
        }
        if order == HEAP_MAX_ORDER {
            self.take_pages(frames)?;
        } else {
            let big = self.take(frames, order + 1)?;
            self.push(order, big.wrapping_byte_add(order_len(order)));
            self.push(order, big);
        }
        self.pop(order)
            .ok_or(HeapError::OutOfMemory { requested: order_len(order) })
    }

    fn take_pages<F: FrameAlloc>(&mut self, frames: &mut F) -> Result<(), HeapError> {
        let pa = frames.alloc_frames(HEAP_TAKE_PAGES_BATCH, FrameOwner::Heap(self.tag))?;
        let base = frames.mapper().phys_to_ptr::<u8>(pa);
        for i in 0..HEAP_TAKE_PAGES_BATCH {
            self.push(HEAP_MAX_ORDER, base.wrapping_add(i * TOP_LEN).cast());
        }
        let bytes = HEAP_TAKE_PAGES_BATCH * TOP_LEN;
        self.total += bytes;
        self.remaining += bytes;
        debug!("buddy heap {}: took {HEAP_TAKE_PAGES_BATCH} pages at {pa:?}", self.tag);
        Ok(())
    }

    /// Sort the list of `order` and merge buddies; at the top order merged
    /// pairs go back to the frame allocator.
    fn tidy_up<F: FrameAlloc>(&mut self, frames: &mut F, order: usize) -> Result<(), HeapError> {
        let head = self.lists[order].head;
        self.lists[order].head = merge_sort(head);

        let len = order_len(order);
        let mut prev: *mut HeapNode = null_mut();
        let mut cur = self.lists[order].head;
        while !cur.is_null() && self.lists[order].blocks >= HEAP_MIN_KEEP + 2 {
            let next = next_of(cur);
            if !next.is_null() && cur.addr() + len == next.addr() && cur.addr() % (2 * len) == 0 {
                let after = next_of(next);
                if prev.is_null() {
                    self.lists[order].head = after;
                } else {
                    set_next(prev, after);
                }
                self.lists[order].blocks -= 2;
                if order == HEAP_MAX_ORDER {
                    self.release_pages(frames, cur)?;
                } else {
                    self.push(order + 1, cur);
                }
                cur = after;
            } else {
                prev = cur;
                cur = next;
            }
        }
        trace!(
            "buddy heap {}: order {order} tidied, {} blocks left",
            self.tag, self.lists[order].blocks
        );
        Ok(())
    }

    /// Return the two pages starting at `pair` to the frame allocator.
    fn release_pages<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        pair: *mut HeapNode,
    ) -> Result<(), HeapError> {
        let pa = frames.mapper().virt_to_phys(VirtualAddress::from_ptr(pair));
        if let Err(e) = frames.free_frames(pa, 2, FrameOwner::Heap(self.tag)) {
            warn!("buddy heap {}: could not release pages at {pa:?}: {e}", self.tag);
            self.push(HEAP_MAX_ORDER, pair.wrapping_byte_add(TOP_LEN));
            self.push(HEAP_MAX_ORDER, pair);
            return Err(e.into());
        }
        self.total -= 2 * TOP_LEN;
        self.remaining -= 2 * TOP_LEN;
        debug!("buddy heap {}: released 2 pages at {pa:?}", self.tag);
        Ok(())
    }

    fn push(&mut self, order: usize, block: *mut HeapNode) {
        let list = &mut self.lists[order];
        set_next(block, list.head);
        list.head = block;
        list.blocks += 1;
    }

    fn pop(&mut self, order: usize) -> Option<*mut HeapNode> {
        let list = &mut self.lists[order];
        let block = list.head;
        if block.is_null() {
            return None;
        }
        list.head = next_of(block);
        list.blocks -= 1;
        Some(block)
    }

    fn verify<F: FrameAlloc>(
        &self,
        frames: &F,
        ptr: NonNull<u8>,
    ) -> Result<(*mut u8, usize), HeapError> {
        let addr = ptr.as_ptr().addr();
        let pa = frames.mapper().virt_to_phys(VirtualAddress::from_ptr(ptr.as_ptr()));
        if addr % 16 != 0 || frames.frame_owner(pa) != Ok(FrameOwner::Heap(self.tag)) {
            return Err(HeapError::ForeignPointer(addr));
        }
        // the header never crosses a page: blocks are at least 32 bytes and aligned
        let header = ptr.as_ptr().wrapping_sub(HEADER).cast::<BlockHeader>();
        // SAFETY: `ptr` points into a page owned by this heap.
        let h = unsafe { header.read() };
        if h.magic != BLOCK_HEADER_MAGIC {
            warn!("buddy heap {}: header magic mismatch at {addr:#x}", self.tag);
            return Err(HeapError::VerificationFailed { ptr: addr, what: "header magic" });
        }
        if !h.size.is_power_of_two() || h.size < order_len(0) || h.size > TOP_LEN {
            return Err(HeapError::VerificationFailed { ptr: addr, what: "block size" });
        }
        let base = header.cast::<u8>().wrapping_sub(h.padding as usize);
        if base.addr() % h.size != 0 {
            return Err(HeapError::VerificationFailed { ptr: addr, what: "block alignment" });
        }
        let tail = base.wrapping_add(h.size - TAIL).cast::<u32>();
        // SAFETY: the tail lies in the same block as the verified header.
        if unsafe { tail.read() } != BLOCK_TAIL_MAGIC {
            warn!("buddy heap {}: tail magic mismatch for {addr:#x}", self.tag);
            return Err(HeapError::VerificationFailed { ptr: addr, what: "tail magic" });
        }
        Ok((base, h.size))
    }
}

impl HeapAllocator for BuddyHeapAllocator {
    fn allocate<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        n: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if n == 0 {
            return Err(HeapError::ZeroSize);
        }
        if n > Self::MAX_REQUEST {
            return Err(HeapError::TooLarge { requested: n, limit: Self::MAX_REQUEST });
        }
        let order = Self::order_for(self.actual_size(n));
        let size = order_len(order);
        let base = self.take(frames, order)?.cast::<u8>();

        let user = base.wrapping_add(align_up(HEADER, 16));
        let header = user.wrapping_sub(HEADER);
        // SAFETY: header and tail lie inside the block just taken.
        unsafe {
            header.cast::<BlockHeader>().write(BlockHeader {
                size,
                padding: (header.addr() - base.addr()) as u32,
                magic: BLOCK_HEADER_MAGIC,
            });
            base.wrapping_add(size - TAIL).cast::<u32>().write(BLOCK_TAIL_MAGIC);
        }
        self.remaining -= size;
        NonNull::new(user).ok_or(HeapError::OutOfMemory { requested: n })
    }

    fn free<F: FrameAlloc>(&mut self, frames: &mut F, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let (base, size) = self.verify(frames, ptr)?;
        // SAFETY: verified block of this heap.
        unsafe {
            ptr.as_ptr().wrapping_sub(HEADER).cast::<BlockHeader>().write(BlockHeader::default());
            base.wrapping_add(size - TAIL).cast::<u32>().write(0);
        }
        let order = Self::order_for(size);
        self.push(order, base.cast());
        self.remaining += size;

        // the block is back on its list; a failed tidy-up only leaves pages unreturned
        self.lists[order].frees_since_tidy += 1;
        if self.lists[order].frees_since_tidy >= HEAP_FREE_BEFORE_TIDY_UP {
            self.lists[order].frees_since_tidy = 0;
            if let Err(e) = self.tidy_up(frames, order) {
                warn!("buddy heap {}: tidy-up of order {order} failed: {e}", self.tag);
            }
        }
        Ok(())
    }

    fn actual_size(&self, n: usize) -> usize {
        align_up(n + align_up(HEADER, 16) + TAIL, order_len(0))
    }

    fn remaining(&self) -> usize {
        self.remaining
    }

    fn total(&self) -> usize {
        self.total
    }
}

#[inline]
fn next_of(node: *mut HeapNode) -> *mut HeapNode {
    // SAFETY: `node` is a free block of this heap.
    unsafe { (*node).next }
}

#[inline]
fn set_next(node: *mut HeapNode, next: *mut HeapNode) {
    // SAFETY: `node` is a free block of this heap.
    unsafe { (*node).next = next }
}

fn merge_sort(head: *mut HeapNode) -> *mut HeapNode {
    if head.is_null() || next_of(head).is_null() {
        return head;
    }
    let mut slow = head;
    let mut fast = next_of(head);
    while !fast.is_null() {
        fast = next_of(fast);
        if !fast.is_null() {
            fast = next_of(fast);
            slow = next_of(slow);
        }
    }
    let second = next_of(slow);
    set_next(slow, null_mut());
    merge(merge_sort(head), merge_sort(second))
}

fn merge(mut a: *mut HeapNode, mut b: *mut HeapNode) -> *mut HeapNode {
    let mut head: *mut HeapNode = null_mut();
    let mut tail: *mut HeapNode = null_mut();
    while !a.is_null() && !b.is_null() {
        let pick = if a.addr() <= b.addr() {
            let p = a;
            a = next_of(a);
            p
        } else {
            let p = b;
            b = next_of(b);
            p
        };
        if tail.is_null() {
            head = pick;
        } else {
            set_next(tail, pick);
        }
        tail = pick;
    }
    let rest = if a.is_null() { b } else { a };
    if tail.is_null() {
        rest
    } else {
        set_next(tail, rest);
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_frames::PhysicalMemory;
    use kernel_frames::testing::PhysArena;
    use kernel_memory_addresses::PhysicalAddress;

    fn pool(arena: &PhysArena) -> PhysicalMemory<kernel_frames::HhdmPhysMapper> {
        let mut pm = PhysicalMemory::new(arena.mapper());
        pm.add_range(arena.base(), arena.frames() as u64).unwrap();
        pm
    }

    #[test]
    fn actual_sizes() {
        let h = BuddyHeapAllocator::new(1);
        assert_eq!(h.actual_size(1), 32);
        assert_eq!(h.actual_size(12), 32);
        assert_eq!(h.actual_size(13), 64);
        assert_eq!(h.actual_size(100), 128);
        assert_eq!(h.actual_size(BuddyHeapAllocator::MAX_REQUEST), 4096);
    }

    #[test]
    fn first_allocation_takes_a_batch_of_pages() {
        let arena = PhysArena::new(PhysicalAddress::new(0x80_0000), 64);
        let mut pm = pool(&arena);
        let mut h = BuddyHeapAllocator::new(5);

        let before = pm.remaining();
        let p = h.allocate(&mut pm, 100).unwrap();
        assert_eq!(pm.remaining(), before - HEAP_TAKE_PAGES_BATCH as u64);
        assert_eq!(h.total(), HEAP_TAKE_PAGES_BATCH * 4096);
        assert_eq!(h.remaining(), h.total() - 128);
        assert_eq!(p.as_ptr().addr() % 16, 0);

        let pa = arena.mapper().virt_to_phys(VirtualAddress::from_ptr(p.as_ptr()));
        assert_eq!(pm.metadata().owner(pa), Ok(FrameOwner::Heap(5)));

        h.free(&mut pm, p).unwrap();
        assert_eq!(h.remaining(), h.total());
    }

    #[test]
    fn oversized_and_empty_requests() {
        let arena = PhysArena::new(PhysicalAddress::new(0x80_0000), 16);
        let mut pm = pool(&arena);
        let mut h = BuddyHeapAllocator::new(1);
        assert_eq!(h.allocate(&mut pm, 0), Err(HeapError::ZeroSize));
        assert_eq!(
            h.allocate(&mut pm, 4077),
            Err(HeapError::TooLarge { requested: 4077, limit: 4076 })
        );
        assert_eq!(h.total(), 0);
    }

    #[test]
    fn corrupted_tail_is_detected() {
        let arena = PhysArena::new(PhysicalAddress::new(0x80_0000), 16);
        let mut pm = pool(&arena);
        let mut h = BuddyHeapAllocator::new(1);
        let p = h.allocate(&mut pm, 40).unwrap();
        // 40 + 16 + 4 rounds up to 64; overrun into the tail magic
        unsafe { p.as_ptr().write_bytes(0x55, 48) };
        assert_eq!(
            h.free(&mut pm, p),
            Err(HeapError::VerificationFailed {
                ptr: p.as_ptr().addr(),
                what: "tail magic"
            })
        );
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let arena = PhysArena::new(PhysicalAddress::new(0x80_0000), 16);
        let mut pm = pool(&arena);
        let mut a = BuddyHeapAllocator::new(1);
        let mut b = BuddyHeapAllocator::new(2);
        let p = a.allocate(&mut pm, 8).unwrap();
        assert_eq!(b.free(&mut pm, p), Err(HeapError::ForeignPointer(p.as_ptr().addr())));
        a.free(&mut pm, p).unwrap();
    }

    #[test]
    fn top_order_pairs_return_to_the_frame_allocator() {
        let arena = PhysArena::new(PhysicalAddress::new(0x80_0000), 128);
        let mut pm = pool(&arena);
        let mut h = BuddyHeapAllocator::new(3);
        let start = pm.remaining();

        let blocks: Vec<_> = (0..40).map(|_| h.allocate(&mut pm, 4000).unwrap()).collect();
        assert_eq!(h.total(), 40 * 4096);
        assert_eq!(pm.remaining(), start - 40);

        for p in blocks {
            h.free(&mut pm, p).unwrap();
        }
        // one tidy-up after the 32nd free: 12 pairs released, 8 blocks kept
        assert_eq!(h.total(), 16 * 4096);
        assert_eq!(h.remaining(), h.total());
        assert_eq!(pm.remaining(), start - 16);
    }

    /// Frame source that hands out frames but refuses to take any back.
    struct KeepsFrames<'a>(&'a mut PhysicalMemory<kernel_frames::HhdmPhysMapper>);

    impl FrameAlloc for KeepsFrames<'_> {
        type Mapper = kernel_frames::HhdmPhysMapper;

        fn mapper(&self) -> Self::Mapper {
            self.0.mapper()
        }

        fn alloc_frames(
            &mut self,
            count: usize,
            owner: FrameOwner,
        ) -> Result<PhysicalAddress, kernel_frames::FrameError> {
            self.0.alloc_frames(count, owner)
        }

        fn free_frames(
            &mut self,
            base: PhysicalAddress,
            _count: usize,
            _owner: FrameOwner,
        ) -> Result<(), kernel_frames::FrameError> {
            Err(kernel_frames::FrameError::DoubleFree(base))
        }

        fn frame_owner(
            &self,
            pa: PhysicalAddress,
        ) -> Result<FrameOwner, kernel_frames::FrameError> {
            self.0.frame_owner(pa)
        }
    }

    #[test]
    fn frees_succeed_when_pages_cannot_be_returned() {
        let arena = PhysArena::new(PhysicalAddress::new(0x80_0000), 128);
        let mut pm = pool(&arena);
        let mut h = BuddyHeapAllocator::new(3);

        let blocks: Vec<_> = (0..40).map(|_| h.allocate(&mut pm, 4000).unwrap()).collect();
        let frames = pm.remaining();
        {
            let mut keeps = KeepsFrames(&mut pm);
            for p in &blocks {
                assert_eq!(h.free(&mut keeps, *p), Ok(()));
            }
        }
        // every block is free again and the pages stayed with the heap
        assert_eq!(h.total(), 40 * 4096);
        assert_eq!(h.remaining(), h.total());
        assert_eq!(h.free_blocks(HEAP_MAX_ORDER), 40);

        // the blocks are reusable without taking new frames
        let again: Vec<_> = (0..40).map(|_| h.allocate(&mut pm, 4000).unwrap()).collect();
        assert_eq!(pm.remaining(), frames);
        assert_eq!(h.remaining(), 0);
        for p in again {
            h.free(&mut pm, p).unwrap();
        }
    }

    #[test]
    fn block_size_is_the_charged_power_of_two() {
        let h = BuddyHeapAllocator::new(1);
        assert_eq!(h.block_size(1), 32);
        assert_eq!(h.block_size(13), 64);
        assert_eq!(h.block_size(100), 128);
        assert_eq!(h.actual_size(2049), 2080);
        assert_eq!(h.block_size(2049), 4096);
        assert_eq!(h.block_size(BuddyHeapAllocator::MAX_REQUEST), 4096);
    }
}
