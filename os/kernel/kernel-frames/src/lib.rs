//! # Physical Frame Management
//!
//! Owns the machine's usable RAM at 4 KiB granularity.
//!
//! | Type | Role |
//! |------|------|
//! | [`BuddyFrameAllocator`] | Power-of-two free lists with deferred coalescing. |
//! | [`FrameMetadata`] | Four bytes per frame: owner, heap tag, copy-on-write count. |
//! | [`PhysicalMemory`] | Allocator and metadata combined; the one frame source. |
//! | [`FrameReaper`] | Batches frame releases from address-space teardown. |
//! | [`PhysMapper`] | Turns physical addresses into pointers (HHDM). |
//!
//! The heaps, page tables and address spaces only see the [`FrameAlloc`]
//! trait, which [`PhysicalMemory`] implements.
//!
//! ## Example
//!
//! ```rust
//! # use kernel_frames::testing::PhysArena;
//! # use kernel_frames::{FrameOwner, PhysicalMemory};
//! # use kernel_memory_addresses::PhysicalAddress;
//! let ram = PhysArena::new(PhysicalAddress::new(0x10_0000), 256);
//! let mut pm = PhysicalMemory::new(ram.mapper());
//! let usable = pm.add_range(ram.base(), 256).unwrap();
//!
//! let pa = pm.allocate(3, FrameOwner::Frames).unwrap();
//! assert_eq!(pm.remaining(), usable - 3);
//! pm.free(pa, 3, FrameOwner::Frames).unwrap();
//! assert_eq!(pm.remaining(), usable);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation, clippy::missing_panics_doc)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

mod buddy;
mod error;
mod metadata;
mod phys_mapper;
mod pool;
mod reaper;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::buddy::{BuddyFrameAllocator, order_for};
pub use crate::error::FrameError;
pub use crate::metadata::{FrameFlags, FrameMetadata, FrameMetadataUnit, FrameOwner};
pub use crate::phys_mapper::{HhdmPhysMapper, PhysMapper};
pub use crate::pool::PhysicalMemory;
pub use crate::reaper::FrameReaper;

use kernel_memory_addresses::PhysicalAddress;

/// Source of physical frames for the heaps and page tables.
pub trait FrameAlloc {
    type Mapper: PhysMapper;

    /// Mapper through which allocated frames can be accessed.
    fn mapper(&self) -> Self::Mapper;

    /// Allocate `count` contiguous frames and record them as owned by `owner`.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] when no suitable block is left.
    fn alloc_frames(
        &mut self,
        count: usize,
        owner: FrameOwner,
    ) -> Result<PhysicalAddress, FrameError>;

    /// Return frames obtained from [`alloc_frames`](Self::alloc_frames).
    ///
    /// # Errors
    /// Ownership violations reported by the metadata.
    fn free_frames(
        &mut self,
        base: PhysicalAddress,
        count: usize,
        owner: FrameOwner,
    ) -> Result<(), FrameError>;

    /// Current owner of the frame containing `pa`.
    ///
    /// # Errors
    /// [`FrameError::UnknownFrame`] for frames outside managed memory.
    fn frame_owner(&self, pa: PhysicalAddress) -> Result<FrameOwner, FrameError>;
}
