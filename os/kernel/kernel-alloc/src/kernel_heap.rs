//! # Kernel heap
//!
//! Size-class front end over eight slab allocators (16 B to 2 KiB) and a
//! buddy heap for anything up to a page. Every sub-allocator tags its pages
//! with its own heap tag, so `free` looks up the owner of the page behind
//! the pointer and forwards to the allocator that handed it out.

use crate::buddy_heap::BuddyHeapAllocator;
use crate::error::HeapError;
use crate::slab::SlabAllocator;
use crate::HeapAllocator;
use core::alloc::Layout;
use core::ptr::NonNull;
use kernel_frames::{FrameAlloc, FrameOwner, PhysMapper};
use kernel_info::memory::KERNEL_HEAP_MAX_SLAB;
use kernel_memory_addresses::VirtualAddress;
use log::warn;

const MIN_CLASS_SHIFT: u32 = 4;

/// Number of slab size classes.
pub const SLAB_CLASSES: usize =
    (KERNEL_HEAP_MAX_SLAB.trailing_zeros() - MIN_CLASS_SHIFT + 1) as usize;

/// Heap tag of the first slab class; class `i` uses `KERNEL_HEAP_TAG + i`
/// and the buddy heap the tag after the last class.
pub const KERNEL_HEAP_TAG: u8 = 1;

const BUDDY_TAG: u8 = KERNEL_HEAP_TAG + SLAB_CLASSES as u8;

/// Slab class for `n` bytes, if `n` fits a slab.
#[must_use]
pub const fn size_class(n: usize) -> Option<usize> {
    if n > KERNEL_HEAP_MAX_SLAB {
        return None;
    }
    let shift = if n <= 1 { 0 } else { usize::BITS - (n - 1).leading_zeros() };
    let shift = if shift < MIN_CLASS_SHIFT { MIN_CLASS_SHIFT } else { shift };
    Some((shift - MIN_CLASS_SHIFT) as usize)
}

/// Slab size of class `class`.
#[must_use]
pub const fn class_size(class: usize) -> usize {
    1 << (class + MIN_CLASS_SHIFT as usize)
}

pub struct KernelHeapAllocator {
    slabs: [SlabAllocator; SLAB_CLASSES],
    buddy: BuddyHeapAllocator,
}

impl Default for KernelHeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHeapAllocator {
    #[must_use]
    pub const fn new() -> Self {
        let mut slabs = [const { SlabAllocator::new(0, 16) }; SLAB_CLASSES];
        let mut i = 0;
        while i < SLAB_CLASSES {
            slabs[i] = SlabAllocator::new(KERNEL_HEAP_TAG + i as u8, class_size(i));
            i += 1;
        }
        Self {
            slabs,
            buddy: BuddyHeapAllocator::new(BUDDY_TAG),
        }
    }

    /// Whether `owner` is one of this heap's page tags.
    #[must_use]
    pub const fn owns(owner: FrameOwner) -> bool {
        matches!(owner, FrameOwner::Heap(tag) if tag >= KERNEL_HEAP_TAG && tag <= BUDDY_TAG)
    }

    /// Largest size served.
    #[must_use]
    pub const fn max_request() -> usize {
        BuddyHeapAllocator::MAX_REQUEST
    }

    #[must_use]
    pub fn slab(&self, class: usize) -> Option<&SlabAllocator> {
        self.slabs.get(class)
    }

    #[must_use]
    pub const fn buddy(&self) -> &BuddyHeapAllocator {
        &self.buddy
    }

    /// Allocate for a [`Layout`]. Alignments above 16 bytes are served from
    /// the slab class matching `max(size, align)`, whose slabs are naturally
    /// aligned to their size.
    ///
    /// # Errors
    /// [`HeapError::TooLarge`] if the alignment cannot be honoured, plus the
    /// errors of [`HeapAllocator::allocate`].
    pub fn allocate_layout<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        layout: Layout,
    ) -> Result<NonNull<u8>, HeapError> {
        if layout.align() <= 16 {
            return self.allocate(frames, layout.size());
        }
        let n = layout.size().max(layout.align());
        let class = size_class(n).ok_or(HeapError::TooLarge {
            requested: n,
            limit: KERNEL_HEAP_MAX_SLAB,
        })?;
        self.slabs[class].allocate(frames, n)
    }
}

impl HeapAllocator for KernelHeapAllocator {
    fn allocate<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        n: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if n == 0 {
            return Err(HeapError::ZeroSize);
        }
        match size_class(n) {
            Some(class) => self.slabs[class].allocate(frames, n),
            None => self.buddy.allocate(frames, n),
        }
    }

    fn free<F: FrameAlloc>(&mut self, frames: &mut F, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let pa = frames.mapper().virt_to_phys(VirtualAddress::from_ptr(ptr.as_ptr()));
        match frames.frame_owner(pa) {
            Ok(FrameOwner::Heap(BUDDY_TAG)) => self.buddy.free(frames, ptr),
            Ok(FrameOwner::Heap(tag)) if Self::owns(FrameOwner::Heap(tag)) => {
                self.slabs[usize::from(tag - KERNEL_HEAP_TAG)].free(frames, ptr)
            }
            other => {
                warn!("kernel heap: free of {ptr:p} in a page owned by {other:?}");
                Err(HeapError::ForeignPointer(ptr.as_ptr().addr()))
            }
        }
    }

    fn actual_size(&self, n: usize) -> usize {
        match size_class(n) {
            Some(class) => class_size(class),
            None => self.buddy.block_size(n),
        }
    }

    fn remaining(&self) -> usize {
        self.slabs.iter().map(HeapAllocator::remaining).sum::<usize>() + self.buddy.remaining()
    }

    fn total(&self) -> usize {
        self.slabs.iter().map(HeapAllocator::total).sum::<usize>() + self.buddy.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_cover_16_bytes_to_2_kib() {
        assert_eq!(SLAB_CLASSES, 8);
        assert_eq!(size_class(0), Some(0));
        assert_eq!(size_class(1), Some(0));
        assert_eq!(size_class(16), Some(0));
        assert_eq!(size_class(17), Some(1));
        assert_eq!(size_class(1024), Some(6));
        assert_eq!(size_class(1025), Some(7));
        assert_eq!(size_class(2048), Some(7));
        assert_eq!(size_class(2049), None);
        assert_eq!(class_size(7), 2048);
    }

    #[test]
    fn tags_are_distinct() {
        let heap = KernelHeapAllocator::new();
        for (i, s) in heap.slabs.iter().enumerate() {
            assert_eq!(s.tag(), KERNEL_HEAP_TAG + i as u8);
            assert_eq!(s.slab_size(), class_size(i));
        }
        assert_eq!(heap.buddy.tag(), BUDDY_TAG);
        assert!(KernelHeapAllocator::owns(FrameOwner::Heap(BUDDY_TAG)));
        assert!(!KernelHeapAllocator::owns(FrameOwner::Heap(BUDDY_TAG + 1)));
        assert!(!KernelHeapAllocator::owns(FrameOwner::Frames));
    }
}
