//! # Buddy frame allocator
//!
//! Hands out physically contiguous runs of 4 KiB frames. Free memory is kept
//! in one singly linked list per order; a block of order `k` spans `2^k`
//! frames and starts at a physical address aligned to its own size. The list
//! links live in the first eight bytes of each free block and are reached
//! through the [`PhysMapper`].
//!
//! ## Allocation
//!
//! A request for `n` frames is served from the smallest order with
//! `2^order >= n`. Empty orders are refilled by splitting a block of the next
//! order (both halves are pushed, the lower half is served). Frames past `n`
//! are recycled right away, so the caller owns exactly `n` frames.
//!
//! ## Freeing and coalescing
//!
//! Freed runs are decomposed into aligned power-of-two blocks and pushed
//! without looking for buddies. Each order counts its frees; after
//! [`FRAME_FREE_BEFORE_TIDY_UP`] of them the list is merge-sorted by address
//! and adjacent buddies are combined into the next order, keeping at least
//! [`FRAME_MIN_KEEP`] blocks on the list.

use crate::error::FrameError;
use crate::phys_mapper::PhysMapper;
use kernel_info::memory::{FRAME_FREE_BEFORE_TIDY_UP, FRAME_MAX_ORDER, FRAME_MIN_KEEP};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use log::{debug, trace};

/// End-of-list marker. Physical address zero is a valid frame.
const NIL: u64 = u64::MAX;

/// Frames in a block of `order`.
#[inline]
const fn order_frames(order: usize) -> u64 {
    1 << order
}

/// Bytes in a block of `order`.
#[inline]
const fn order_bytes(order: usize) -> u64 {
    PAGE_SIZE << order
}

/// Smallest order whose blocks hold `frames` frames.
#[inline]
#[must_use]
pub const fn order_for(frames: u64) -> usize {
    if frames <= 1 {
        0
    } else {
        (u64::BITS - (frames - 1).leading_zeros()) as usize
    }
}

#[derive(Copy, Clone, Debug)]
struct FreeList {
    head: u64,
    blocks: usize,
    frees_since_tidy: usize,
}

impl FreeList {
    const EMPTY: Self = Self {
        head: NIL,
        blocks: 0,
        frees_since_tidy: 0,
    };
}

pub struct BuddyFrameAllocator<M: PhysMapper> {
    mapper: M,
    lists: [FreeList; FRAME_MAX_ORDER + 1],
    total: u64,
    remaining: u64,
}

impl<M: PhysMapper> BuddyFrameAllocator<M> {
    pub const MAX_ORDER: usize = FRAME_MAX_ORDER;

    #[must_use]
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            lists: [FreeList::EMPTY; FRAME_MAX_ORDER + 1],
            total: 0,
            remaining: 0,
        }
    }

    /// Frames ever handed to this allocator.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Frames currently free.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Number of blocks on the free list of `order`.
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> usize {
        self.lists.get(order).map_or(0, |l| l.blocks)
    }

    /// Free frames as seen by walking every list; equals
    /// [`remaining`](Self::remaining) while the allocator is consistent.
    #[must_use]
    pub fn count_free_frames(&self) -> u64 {
        let mut frames = 0;
        for order in 0..=FRAME_MAX_ORDER {
            let mut cur = self.lists[order].head;
            while cur != NIL {
                frames += order_frames(order);
                cur = self.next_of(cur);
            }
        }
        frames
    }

    /// Hand a run of `frames` frames starting at `base` to the allocator.
    ///
    /// # Errors
    /// [`FrameError::Unaligned`] if `base` is not page aligned.
    pub fn add_frames(&mut self, base: PhysicalAddress, frames: u64) -> Result<(), FrameError> {
        if !base.is_aligned_to(PAGE_SIZE) {
            return Err(FrameError::Unaligned(base));
        }
        if frames == 0 {
            return Ok(());
        }
        debug!("buddy: adding {frames} frames at {base:?}");
        self.recycle(base.as_u64(), frames);
        self.total += frames;
        self.remaining += frames;
        Ok(())
    }

    /// Allocate `frames` physically contiguous frames.
    ///
    /// The returned address is aligned to the order the request was served
    /// from.
    ///
    /// # Errors
    /// - [`FrameError::ZeroLength`] for `frames == 0`.
    /// - [`FrameError::OutOfMemory`] if no block of a sufficient order exists.
    pub fn allocate(&mut self, frames: usize) -> Result<PhysicalAddress, FrameError> {
        if frames == 0 {
            return Err(FrameError::ZeroLength);
        }
        let n = frames as u64;
        let order = order_for(n);
        if order > FRAME_MAX_ORDER {
            return Err(FrameError::OutOfMemory { requested: frames });
        }

        let block = self
            .take(order)
            .ok_or(FrameError::OutOfMemory { requested: frames })?;

        let surplus = order_frames(order) - n;
        if surplus > 0 {
            self.recycle(block + n * PAGE_SIZE, surplus);
        }
        self.remaining -= n;
        trace!("buddy: allocated {frames} frames at {block:#x} (order {order})");
        Ok(PhysicalAddress::new(block))
    }

    /// Return `frames` frames starting at `base`.
    ///
    /// # Errors
    /// - [`FrameError::ZeroLength`] / [`FrameError::Unaligned`] for bad arguments.
    /// - [`FrameError::Overfree`] if more frames would be free than were ever added.
    pub fn free(&mut self, base: PhysicalAddress, frames: usize) -> Result<(), FrameError> {
        if frames == 0 {
            return Err(FrameError::ZeroLength);
        }
        if !base.is_aligned_to(PAGE_SIZE) {
            return Err(FrameError::Unaligned(base));
        }
        let n = frames as u64;
        if self.remaining + n > self.total {
            return Err(FrameError::Overfree { frames: n });
        }

        self.recycle(base.as_u64(), n);
        self.remaining += n;

        let order = (u64::BITS - 1 - n.leading_zeros()) as usize;
        let order = order.min(FRAME_MAX_ORDER);
        let list = &mut self.lists[order];
        list.frees_since_tidy += 1;
        if list.frees_since_tidy >= FRAME_FREE_BEFORE_TIDY_UP {
            list.frees_since_tidy = 0;
            self.tidy_up(order);
        }
        Ok(())
    }

    /// Pop a block of `order`, splitting higher orders as needed.
    fn take(&mut self, order: usize) -> Option<u64> {
        if let Some(block) = self.pop(order) {
            return Some(block);
        }
        if order == FRAME_MAX_ORDER {
            return None;
        }
        let big = self.take(order + 1)?;
        self.push(order, big + order_bytes(order));
        self.push(order, big);
        self.pop(order)
    }

    /// Decompose `[base, base + frames)` into aligned blocks and push them.
    fn recycle(&mut self, mut base: u64, mut frames: u64) {
        // Leading blocks until `base` is aligned for larger orders.
        let mut order = 0;
        while frames > 0 && order_frames(order) <= frames && order < FRAME_MAX_ORDER {
            if base & order_bytes(order) != 0 {
                self.push(order, base);
                base += order_bytes(order);
                frames -= order_frames(order);
            }
            order += 1;
        }

        while frames >= order_frames(FRAME_MAX_ORDER) {
            self.push(FRAME_MAX_ORDER, base);
            base += order_bytes(FRAME_MAX_ORDER);
            frames -= order_frames(FRAME_MAX_ORDER);
        }

        for order in (0..FRAME_MAX_ORDER).rev() {
            if frames & order_frames(order) != 0 {
                self.push(order, base);
                base += order_bytes(order);
                frames -= order_frames(order);
            }
        }
        debug_assert_eq!(frames, 0);
    }

    /// Sort the list of `order` and merge buddies into `order + 1`.
    fn tidy_up(&mut self, order: usize) {
        if order >= FRAME_MAX_ORDER {
            return;
        }
        let head = self.lists[order].head;
        self.lists[order].head = self.merge_sort(head);

        let size = order_bytes(order);
        let before = self.lists[order].blocks;
        let mut prev = NIL;
        let mut cur = self.lists[order].head;
        while cur != NIL && self.lists[order].blocks >= FRAME_MIN_KEEP + 2 {
            let next = self.next_of(cur);
            if next != NIL && cur + size == next && cur % (2 * size) == 0 {
                let after = self.next_of(next);
                if prev == NIL {
                    self.lists[order].head = after;
                } else {
                    self.set_next(prev, after);
                }
                self.lists[order].blocks -= 2;
                self.push(order + 1, cur);
                cur = after;
            } else {
                prev = cur;
                cur = next;
            }
        }
        debug!(
            "buddy: tidied order {order}: {before} -> {} blocks",
            self.lists[order].blocks
        );
    }

    /// In-place merge sort of a linked list by address.
    fn merge_sort(&mut self, head: u64) -> u64 {
        if head == NIL || self.next_of(head) == NIL {
            return head;
        }

        // split after the middle node
        let mut slow = head;
        let mut fast = self.next_of(head);
        while fast != NIL {
            fast = self.next_of(fast);
            if fast != NIL {
                fast = self.next_of(fast);
                slow = self.next_of(slow);
            }
        }
        let second = self.next_of(slow);
        self.set_next(slow, NIL);

        let a = self.merge_sort(head);
        let b = self.merge_sort(second);
        self.merge(a, b)
    }

    fn merge(&mut self, mut a: u64, mut b: u64) -> u64 {
        let mut head = NIL;
        let mut tail = NIL;
        while a != NIL && b != NIL {
            let pick = if a <= b {
                let p = a;
                a = self.next_of(a);
                p
            } else {
                let p = b;
                b = self.next_of(b);
                p
            };
            if tail == NIL {
                head = pick;
            } else {
                self.set_next(tail, pick);
            }
            tail = pick;
        }
        let rest = if a == NIL { b } else { a };
        if tail == NIL {
            rest
        } else {
            self.set_next(tail, rest);
            head
        }
    }

    fn push(&mut self, order: usize, block: u64) {
        debug_assert_eq!(block % order_bytes(order), 0, "misaligned buddy block");
        let list = &mut self.lists[order];
        let head = list.head;
        list.head = block;
        list.blocks += 1;
        self.set_next(block, head);
    }

    fn pop(&mut self, order: usize) -> Option<u64> {
        let block = self.lists[order].head;
        if block == NIL {
            return None;
        }
        self.lists[order].head = self.next_of(block);
        self.lists[order].blocks -= 1;
        Some(block)
    }

    #[inline]
    fn next_of(&self, block: u64) -> u64 {
        let ptr = self.mapper.phys_to_ptr::<u64>(PhysicalAddress::new(block));
        // SAFETY: `block` is a free block owned by this allocator.
        unsafe { ptr.read() }
    }

    #[inline]
    fn set_next(&mut self, block: u64, next: u64) {
        let ptr = self.mapper.phys_to_ptr::<u64>(PhysicalAddress::new(block));
        // SAFETY: `block` is a free block owned by this allocator.
        unsafe { ptr.write(next) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PhysArena;

    const BASE: u64 = 0x4000_0000;

    fn allocator(arena: &PhysArena) -> BuddyFrameAllocator<crate::HhdmPhysMapper> {
        let mut b = BuddyFrameAllocator::new(arena.mapper());
        b.add_frames(arena.base(), arena.frames() as u64).unwrap();
        b
    }

    #[test]
    fn order_rounding() {
        assert_eq!(order_for(1), 0);
        assert_eq!(order_for(2), 1);
        assert_eq!(order_for(3), 2);
        assert_eq!(order_for(300), 9);
        assert_eq!(order_for(4096), 12);
        assert_eq!(order_for(4097), 13);
    }

    #[test]
    fn aligned_range_becomes_one_block() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 1024);
        let b = allocator(&arena);
        assert_eq!(b.free_blocks(10), 1);
        assert_eq!(b.total(), 1024);
        assert_eq!(b.count_free_frames(), 1024);
    }

    #[test]
    fn misaligned_range_is_decomposed() {
        // frames 3..13 relative to an aligned base: 1@3, 4@4, 4@8, 1@12
        let arena = PhysArena::new(PhysicalAddress::new(BASE + 3 * PAGE_SIZE), 10);
        let b = allocator(&arena);
        assert_eq!(b.count_free_frames(), 10);
        assert_eq!(b.free_blocks(0), 2);
        assert_eq!(b.free_blocks(2), 2);
        assert_eq!(b.free_blocks(1), 0);
        assert_eq!(b.free_blocks(3), 0);
    }

    #[test]
    fn allocations_are_aligned_to_their_order() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 512);
        let mut b = allocator(&arena);
        for n in [1usize, 2, 3, 5, 8, 13, 21, 34] {
            let pa = b.allocate(n).unwrap();
            let order = order_for(n as u64);
            assert_eq!(pa.as_u64() % order_bytes(order), 0, "n = {n}");
        }
    }

    #[test]
    fn surplus_frames_stay_free() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 16);
        let mut b = allocator(&arena);
        let a = b.allocate(3).unwrap();
        assert_eq!(a.as_u64(), BASE);
        assert_eq!(b.remaining(), 13);
        // the fourth frame of the order-2 block went back to order 0
        let c = b.allocate(1).unwrap();
        assert_eq!(c.as_u64(), BASE + 3 * PAGE_SIZE);
    }

    #[test]
    fn zero_and_oversized_requests_fail() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 8);
        let mut b = allocator(&arena);
        assert_eq!(b.allocate(0), Err(FrameError::ZeroLength));
        assert_eq!(
            b.allocate(9),
            Err(FrameError::OutOfMemory { requested: 9 })
        );
        assert_eq!(
            b.allocate(5000),
            Err(FrameError::OutOfMemory { requested: 5000 })
        );
        assert_eq!(b.remaining(), 8);
    }

    #[test]
    fn free_rejects_more_than_was_added() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 4);
        let mut b = allocator(&arena);
        assert_eq!(
            b.free(PhysicalAddress::new(BASE), 1),
            Err(FrameError::Overfree { frames: 1 })
        );
        assert_eq!(
            b.free(PhysicalAddress::new(BASE + 1), 1),
            Err(FrameError::Unaligned(PhysicalAddress::new(BASE + 1)))
        );
    }

    #[test]
    fn merge_sort_orders_by_address() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 8);
        let mut b = BuddyFrameAllocator::new(arena.mapper());
        for i in [5u64, 1, 7, 3, 0, 6, 2, 4] {
            b.push(0, BASE + i * PAGE_SIZE);
        }
        let head = b.lists[0].head;
        b.lists[0].head = b.merge_sort(head);

        let mut seen = Vec::new();
        let mut cur = b.lists[0].head;
        while cur != NIL {
            seen.push((cur - BASE) / PAGE_SIZE);
            cur = b.next_of(cur);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn tidy_up_merges_buddies_but_keeps_a_reserve() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 32);
        let mut b = BuddyFrameAllocator::new(arena.mapper());
        // 32 single frames, pushed in reverse so the list is unsorted
        for i in (0..32u64).rev() {
            b.push(0, BASE + i * PAGE_SIZE);
        }
        b.tidy_up(0);

        // pairs are merged while at least MIN_KEEP + 2 blocks remain
        assert!(b.free_blocks(0) >= FRAME_MIN_KEEP);
        assert!(b.free_blocks(0) < FRAME_MIN_KEEP + 2);
        let merged = b.free_blocks(1);
        assert_eq!(b.free_blocks(0) + 2 * merged, 32);

        // every merged block starts at an even frame
        let mut cur = b.lists[1].head;
        while cur != NIL {
            assert_eq!((cur - BASE) % (2 * PAGE_SIZE), 0);
            cur = b.next_of(cur);
        }
    }

    #[test]
    fn tidy_up_skips_non_buddies() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 64);
        let mut b = BuddyFrameAllocator::new(arena.mapper());
        // odd/even pairs straddling a buddy boundary: (1,2), (5,6), ...
        for i in 0..16u64 {
            b.push(0, BASE + (4 * i + 1) * PAGE_SIZE);
            b.push(0, BASE + (4 * i + 2) * PAGE_SIZE);
        }
        b.tidy_up(0);
        assert_eq!(b.free_blocks(1), 0);
        assert_eq!(b.free_blocks(0), 32);
    }
}
