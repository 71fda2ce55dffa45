//! # Boot heap
//!
//! A first-fit, split-and-coalesce free-list allocator over one fixed region.
//! It serves allocations before the frame allocator exists (the frame
//! metadata and the range table are not heap-allocated, but early kernel
//! structures are) and keeps working afterwards for anything allocated from
//! it.
//!
//! Free blocks start with a [`ListNode`]; live allocations are preceded by a
//! [`BlockHeader`] that records the span of the block they were carved from,
//! so `free` needs only the pointer.
//!
//! ```text
//! free:  | ListNode | payload ...................... |
//! live:  | (slack)  | BlockHeader | user bytes | slack |
//!        ^ start                  ^ ptr               ^ start + span
//! ```

use crate::error::HeapError;
use crate::{BLOCK_HEADER_MAGIC, BlockHeader, HeapAllocator};
use core::ptr::{self, NonNull, null_mut};
use kernel_frames::FrameAlloc;
use log::{debug, warn};

/// Granularity of every block boundary.
const GRANULE: usize = 16;

/// Header stored at the beginning of every **free** block.
///
/// - `size` is the number of payload bytes **after** the header.
/// - `next` links to the next free block. Free blocks are kept **sorted by
///   address** to enable coalescing.
#[repr(C)]
struct ListNode {
    size: usize,
    next: *mut ListNode,
}

const NODE: usize = size_of::<ListNode>();
const HEADER: usize = size_of::<BlockHeader>();

const _: () = assert!(NODE <= GRANULE && HEADER == GRANULE);

impl ListNode {
    const fn new(size: usize) -> Self {
        Self {
            size,
            next: null_mut(),
        }
    }
}

/// Align `addr` upwards to `align` (must be a power of two).
#[inline]
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + (align - 1)) & !(align - 1)
}

/// The boot heap.
///
/// # Invariants
/// - All free blocks are non-overlapping, lie within the region and are
///   aligned to 16 bytes.
/// - `head` is a sentinel; the first real block is at `head.next`.
pub struct FreeListAllocator {
    head: ListNode,
    start: usize,
    end: usize,
    remaining: usize,
}

// Safety: the list is only reached through `&mut self`; the owner
// serializes access (spin lock or critical section).
unsafe impl Send for FreeListAllocator {}

impl Default for FreeListAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeListAllocator {
    /// An allocator without memory; [`init`](Self::init) hands it a region.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: ListNode::new(0),
            start: 0,
            end: 0,
            remaining: 0,
        }
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.end != 0
    }

    /// Manage the region `[start, start + size)`.
    ///
    /// # Safety
    /// - The range must be valid, writable and exclusive to the allocator for
    ///   as long as the allocator is used.
    /// - Must be called at most once.
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) {
        let begin = align_up(start.addr(), GRANULE);
        let end = (start.addr() + size) & !(GRANULE - 1);
        if end <= begin + NODE {
            warn!("boot heap: region at {start:p} ({size} bytes) is too small");
            return;
        }
        let node = start.with_addr(begin).cast::<ListNode>();
        // SAFETY: the caller hands us the region.
        unsafe { node.write(ListNode::new(end - begin - NODE)) };
        self.head.next = node;
        self.start = begin;
        self.end = end;
        self.remaining = end - begin;
        debug!("boot heap: {} bytes at {begin:#x}", end - begin);
    }

    /// Whether `ptr` lies inside the managed region.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        (self.start..self.end).contains(&ptr.addr())
    }

    /// First-fit allocation of `n` bytes aligned to `align` (at least 16).
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`] or [`HeapError::OutOfMemory`].
    pub fn allocate_aligned(&mut self, n: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        if n == 0 {
            return Err(HeapError::ZeroSize);
        }
        let align = align.max(GRANULE).next_power_of_two();
        let mut prev = &raw mut self.head;
        // SAFETY: `prev` is the sentinel or a node of the list.
        let mut current = unsafe { (*prev).next };
        while !current.is_null() {
            let block_start = current.addr();
            // SAFETY: `current` is a node of the list.
            let block_end = block_start + NODE + unsafe { (*current).size };
            let user = align_up(block_start + HEADER, align);
            let user_end = align_up(user.saturating_add(n), GRANULE);
            if user_end <= block_end {
                // SAFETY: `prev` and `current` are adjacent list nodes.
                unsafe { (*prev).next = (*current).next };

                let mut span_start = block_start;
                let head_rest = user - HEADER - block_start;
                if head_rest >= NODE {
                    // SAFETY: the head remainder lies in the unlinked block.
                    unsafe {
                        self.add_free_region(current.with_addr(block_start).cast(), head_rest);
                    }
                    span_start = user - HEADER;
                }
                let mut span_end = block_end;
                let tail_rest = block_end - user_end;
                if tail_rest >= NODE {
                    // SAFETY: the tail remainder lies in the unlinked block.
                    unsafe { self.add_free_region(current.with_addr(user_end).cast(), tail_rest) };
                    span_end = user_end;
                }

                let span = span_end - span_start;
                let header = current.with_addr(user - HEADER).cast::<BlockHeader>();
                // SAFETY: the header lies inside the allocated span.
                unsafe {
                    header.write(BlockHeader {
                        size: span,
                        padding: (user - HEADER - span_start) as u32,
                        magic: BLOCK_HEADER_MAGIC,
                    });
                }
                self.remaining -= span;
                // SAFETY: `user` lies inside the region and is non-null.
                return Ok(unsafe { NonNull::new_unchecked(current.with_addr(user).cast()) });
            }
            prev = current;
            // SAFETY: `current` is a node of the list.
            current = unsafe { (*current).next };
        }
        Err(HeapError::OutOfMemory { requested: n })
    }

    /// Return an allocation to the list.
    ///
    /// # Errors
    /// - [`HeapError::ForeignPointer`] for pointers outside the region.
    /// - [`HeapError::VerificationFailed`] if the block header is damaged.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let addr = ptr.as_ptr().addr();
        if !self.contains(ptr.as_ptr()) || addr < self.start + HEADER || addr % GRANULE != 0 {
            return Err(HeapError::ForeignPointer(addr));
        }
        let header = ptr.as_ptr().with_addr(addr - HEADER).cast::<BlockHeader>();
        // SAFETY: `addr - HEADER` is inside the region.
        let h = unsafe { header.read() };
        if h.magic != BLOCK_HEADER_MAGIC {
            return Err(HeapError::VerificationFailed {
                ptr: addr,
                what: "header magic",
            });
        }
        let start = addr - HEADER - h.padding as usize;
        if start < self.start || h.size < HEADER || start + h.size > self.end {
            return Err(HeapError::VerificationFailed {
                ptr: addr,
                what: "block span",
            });
        }

        // SAFETY: the header lies inside the block being freed.
        unsafe { header.write(BlockHeader::default()) };
        // SAFETY: the span was verified to be inside the region.
        unsafe { self.add_free_region(ptr.as_ptr().with_addr(start).cast(), h.size) };
        self.remaining += h.size;
        Ok(())
    }

    /// Insert a free region of `size` bytes (including the node) at `node`,
    /// in address order, and coalesce it with its neighbours.
    ///
    /// # Safety
    /// `[node, node + size)` must be unused memory of this region.
    unsafe fn add_free_region(&mut self, node: *mut ListNode, size: usize) {
        let addr = node.addr();
        let mut prev = &raw mut self.head;
        // SAFETY: list traversal.
        let mut current = unsafe { (*prev).next };
        while !current.is_null() && current.addr() < addr {
            prev = current;
            // SAFETY: list traversal.
            current = unsafe { (*current).next };
        }
        // SAFETY: `node` is unused memory; `prev` is a list node or the sentinel.
        unsafe {
            node.write(ListNode::new(size - NODE));
            (*node).next = current;
            (*prev).next = node;
            self.coalesce(prev);
        }
    }

    /// Merge the block after `prev` with its successor, then `prev` with it.
    ///
    /// # Safety
    /// The list invariants must hold.
    unsafe fn coalesce(&mut self, prev: *mut ListNode) {
        // SAFETY: list traversal.
        let curr = unsafe { (*prev).next };
        if curr.is_null() {
            return;
        }
        // SAFETY: `curr` is a list node.
        unsafe {
            let next = (*curr).next;
            if !next.is_null() && curr.addr() + NODE + (*curr).size == next.addr() {
                (*curr).size += NODE + (*next).size;
                (*curr).next = (*next).next;
            }
        }
        // the sentinel is not memory
        if !ptr::eq(prev, &raw const self.head) {
            // SAFETY: `prev` and `curr` are list nodes.
            unsafe {
                if prev.addr() + NODE + (*prev).size == curr.addr() {
                    (*prev).size += NODE + (*curr).size;
                    (*prev).next = (*curr).next;
                }
            }
        }
    }

    /// Number of free blocks on the list.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head.next;
        while !cur.is_null() {
            count += 1;
            // SAFETY: list traversal.
            cur = unsafe { (*cur).next };
        }
        count
    }
}

impl HeapAllocator for FreeListAllocator {
    fn allocate<F: FrameAlloc>(
        &mut self,
        _frames: &mut F,
        n: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        self.allocate_aligned(n, GRANULE)
    }

    fn free<F: FrameAlloc>(&mut self, _frames: &mut F, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.deallocate(ptr)
    }

    fn actual_size(&self, n: usize) -> usize {
        HEADER + align_up(n, GRANULE)
    }

    fn remaining(&self) -> usize {
        self.remaining
    }

    fn total(&self) -> usize {
        self.end - self.start
    }
}
