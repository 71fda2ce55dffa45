//! # Kernel Heap Allocators
//!
//! Byte-granular allocators layered on top of the frame allocator in
//! `kernel-frames`.
//!
//! ```text
//! ┌──────────────────────────────┐   ┌─────────────────────────┐
//! │ KernelHeapAllocator          │   │ FreeListAllocator       │
//! │  8 × SlabAllocator (16..2K)  │   │  boot heap, one region  │
//! │  BuddyHeapAllocator (≤ 4K)   │   │  carved out at boot     │
//! └──────────────┬───────────────┘   └─────────────────────────┘
//!                │ pages tagged FrameOwner::Heap(tag)
//! ┌──────────────▼───────────────┐
//! │ FrameAlloc (PhysicalMemory)  │
//! └──────────────────────────────┘
//! ```
//!
//! All allocators implement [`HeapAllocator`]. They never block and never
//! reclaim memory on their own. The frame source is passed into every call,
//! so a heap does not hold a reference to the frame allocator.
//!
//! [`GlobalHeap`] adapts any [`HeapBackend`] to `core::alloc::GlobalAlloc`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

mod buddy_heap;
mod error;
mod free_list;
mod global;
mod kernel_heap;
mod slab;

pub use crate::buddy_heap::BuddyHeapAllocator;
pub use crate::error::HeapError;
pub use crate::free_list::FreeListAllocator;
pub use crate::global::{GlobalHeap, HeapBackend};
pub use crate::kernel_heap::{
    KERNEL_HEAP_TAG, KernelHeapAllocator, SLAB_CLASSES, class_size, size_class,
};
pub use crate::slab::SlabAllocator;

use core::ptr::NonNull;
use kernel_frames::FrameAlloc;

/// Common interface of the heap allocators.
pub trait HeapAllocator {
    /// Allocate `n` bytes, aligned to at least 16.
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`] for `n == 0`, [`HeapError::TooLarge`] beyond
    /// the allocator's limit, [`HeapError::OutOfMemory`] or a frame error when
    /// no memory is left.
    fn allocate<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        n: usize,
    ) -> Result<NonNull<u8>, HeapError>;

    /// Return memory obtained from [`allocate`](Self::allocate).
    ///
    /// # Errors
    /// [`HeapError::ForeignPointer`] or [`HeapError::VerificationFailed`] for
    /// pointers this allocator did not hand out (or whose block was damaged).
    fn free<F: FrameAlloc>(&mut self, frames: &mut F, ptr: NonNull<u8>) -> Result<(), HeapError>;

    /// Size of a request of `n` bytes once headers and rounding are added.
    ///
    /// For the slab and kernel heaps this is what `remaining` drops by. The
    /// buddy heap charges the power-of-two block holding it instead, see
    /// [`BuddyHeapAllocator::block_size`].
    fn actual_size(&self, n: usize) -> usize;

    /// Free bytes held by the allocator.
    fn remaining(&self) -> usize;

    /// Bytes under management.
    fn total(&self) -> usize;
}

/// Header in front of every live buddy-heap and boot-heap block.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct BlockHeader {
    /// Span of the block in bytes.
    pub size: usize,
    /// Distance from the block start to this header.
    pub padding: u32,
    pub magic: u32,
}

pub(crate) const BLOCK_HEADER_MAGIC: u32 = 0x9AE8_4D4B;
pub(crate) const BLOCK_TAIL_MAGIC: u32 = 0xB4D4_8EA9;
