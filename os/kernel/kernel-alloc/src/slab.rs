//! # Slab allocator
//!
//! Fixed-size objects carved out of whole pages. Each page taken from the
//! frame allocator is split into `PAGE_SIZE / slab_size` slabs that go onto a
//! singly linked free list; allocation and free are a pop and a push. Pages
//! are kept for the lifetime of the allocator.

use crate::error::HeapError;
use crate::HeapAllocator;
use core::ptr::{NonNull, null_mut};
use kernel_frames::{FrameAlloc, FrameOwner, PhysMapper};
use kernel_info::memory::{SLAB_ALIGN, SLAB_MIN_SIZE};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use log::debug;

const PAGE: usize = PAGE_SIZE as usize;

#[repr(C)]
struct SlabNode {
    next: *mut SlabNode,
}

pub struct SlabAllocator {
    tag: u8,
    slab_size: usize,
    free: *mut SlabNode,
    pages: usize,
    total: usize,
    remaining: usize,
}

// Safety: slabs are only reached through `&mut self`.
unsafe impl Send for SlabAllocator {}

impl SlabAllocator {
    /// Slabs of at least `size` bytes, in pages tagged
    /// [`FrameOwner::Heap(tag)`](FrameOwner::Heap).
    #[must_use]
    pub const fn new(tag: u8, size: usize) -> Self {
        let size = if size < SLAB_MIN_SIZE { SLAB_MIN_SIZE } else { size };
        Self {
            tag,
            slab_size: (size + SLAB_ALIGN - 1) & !(SLAB_ALIGN - 1),
            free: null_mut(),
            pages: 0,
            total: 0,
            remaining: 0,
        }
    }

    #[must_use]
    pub const fn slab_size(&self) -> usize {
        self.slab_size
    }

    #[must_use]
    pub const fn tag(&self) -> u8 {
        self.tag
    }

    /// Pages taken from the frame allocator so far.
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    fn expand<F: FrameAlloc>(&mut self, frames: &mut F) -> Result<(), HeapError> {
        let pa = frames.alloc_frames(1, FrameOwner::Heap(self.tag))?;
        let page = frames.mapper().phys_to_ptr::<u8>(pa);
        let count = PAGE / self.slab_size;
        for i in (0..count).rev() {
            let node = page.wrapping_add(i * self.slab_size).cast::<SlabNode>();
            // SAFETY: the slab lies in the page just taken.
            unsafe { node.write(SlabNode { next: self.free }) };
            self.free = node;
        }
        self.pages += 1;
        self.total += count * self.slab_size;
        self.remaining += count * self.slab_size;
        debug!("slab {}B: new page at {pa:?} ({count} slabs)", self.slab_size);
        Ok(())
    }
}

impl HeapAllocator for SlabAllocator {
    fn allocate<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        n: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if n == 0 {
            return Err(HeapError::ZeroSize);
        }
        if n > self.slab_size {
            return Err(HeapError::TooLarge { requested: n, limit: self.slab_size });
        }
        if self.free.is_null() {
            self.expand(frames)?;
        }
        let node = self.free;
        // SAFETY: `node` is the head of the free list.
        self.free = unsafe { (*node).next };
        self.remaining -= self.slab_size;
        NonNull::new(node.cast()).ok_or(HeapError::OutOfMemory { requested: n })
    }

    fn free<F: FrameAlloc>(&mut self, frames: &mut F, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let addr = ptr.as_ptr().addr();
        let in_page = addr % PAGE;
        let pa = frames.mapper().virt_to_phys(VirtualAddress::from_ptr(ptr.as_ptr()));
        if in_page % self.slab_size != 0
            || in_page + self.slab_size > PAGE
            || frames.frame_owner(pa) != Ok(FrameOwner::Heap(self.tag))
        {
            return Err(HeapError::ForeignPointer(addr));
        }
        let node = ptr.as_ptr().cast::<SlabNode>();
        // SAFETY: `node` is a slab of one of our pages.
        unsafe { node.write(SlabNode { next: self.free }) };
        self.free = node;
        self.remaining += self.slab_size;
        Ok(())
    }

    fn actual_size(&self, _n: usize) -> usize {
        self.slab_size
    }

    fn remaining(&self) -> usize {
        self.remaining
    }

    fn total(&self) -> usize {
        self.total
    }
}
