//! # Physical memory pool
//!
//! [`PhysicalMemory`] is the single owner of all usable RAM. It pairs the
//! [`BuddyFrameAllocator`] with the [`FrameMetadata`] so that every block
//! handed out is recorded with its owner, and every block returned is
//! checked against that record before the buddy lists see it again.

use crate::buddy::BuddyFrameAllocator;
use crate::error::FrameError;
use crate::metadata::{FrameMetadata, FrameOwner};
use crate::phys_mapper::PhysMapper;
use crate::FrameAlloc;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use log::{info, warn};

pub struct PhysicalMemory<M: PhysMapper> {
    mapper: M,
    buddy: BuddyFrameAllocator<M>,
    metadata: FrameMetadata<M>,
}

impl<M: PhysMapper> PhysicalMemory<M> {
    #[must_use]
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            buddy: BuddyFrameAllocator::new(mapper),
            metadata: FrameMetadata::new(mapper),
        }
    }

    /// Register a usable RAM range. Its tail is reserved for frame metadata;
    /// the rest becomes allocatable.
    ///
    /// Returns the number of allocatable frames added.
    ///
    /// # Errors
    /// Propagates the range checks of
    /// [`FrameMetadata::register_range`].
    pub fn add_range(&mut self, base: PhysicalAddress, frames: u64) -> Result<u64, FrameError> {
        let (usable_base, usable) = self.metadata.register_range(base, frames)?;
        self.buddy.add_frames(usable_base, usable)?;
        info!(
            "physical memory: {usable} of {frames} frames at {base:?} usable ({} KiB total free)",
            self.buddy.remaining() * PAGE_SIZE / 1024
        );
        Ok(usable)
    }

    /// Allocate `count` contiguous frames for `owner`.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`], [`FrameError::ZeroLength`], or a metadata
    /// inconsistency (the block is returned to the buddy lists in that case).
    pub fn allocate(
        &mut self,
        count: usize,
        owner: FrameOwner,
    ) -> Result<PhysicalAddress, FrameError> {
        let pa = self.buddy.allocate(count)?;
        if let Err(e) = self.metadata.mark_allocated(pa, count, owner) {
            warn!("physical memory: metadata refused {count} frames at {pa:?}: {e}");
            self.buddy.free(pa, count)?;
            return Err(e);
        }
        Ok(pa)
    }

    /// Like [`allocate`](Self::allocate), with the frames zero-filled.
    ///
    /// # Errors
    /// See [`allocate`](Self::allocate).
    pub fn allocate_zeroed(
        &mut self,
        count: usize,
        owner: FrameOwner,
    ) -> Result<PhysicalAddress, FrameError> {
        let pa = self.allocate(count, owner)?;
        self.zero(pa, count);
        Ok(pa)
    }

    /// Return `count` frames from `base` that were allocated for `owner`.
    ///
    /// # Errors
    /// Ownership violations ([`FrameError::OwnerMismatch`],
    /// [`FrameError::DoubleFree`], [`FrameError::UnknownFrame`]) leave both
    /// the metadata and the buddy lists unchanged.
    pub fn free(
        &mut self,
        base: PhysicalAddress,
        count: usize,
        owner: FrameOwner,
    ) -> Result<(), FrameError> {
        if count == 0 {
            return Err(FrameError::ZeroLength);
        }
        self.metadata.mark_freed(base, count, owner)?;
        self.buddy.free(base, count)
    }

    /// Zero-fill `count` frames.
    pub fn zero(&self, base: PhysicalAddress, count: usize) {
        let ptr = self.mapper.phys_to_ptr::<u8>(base);
        // SAFETY: callers pass frames they own.
        unsafe { ptr.write_bytes(0, count * PAGE_SIZE as usize) };
    }

    /// Copy `count` frames from `src` to `dst`. The ranges must not overlap.
    pub fn copy_frames(&self, dst: PhysicalAddress, src: PhysicalAddress, count: usize) {
        let d = self.mapper.phys_to_ptr::<u8>(dst);
        let s = self.mapper.phys_to_ptr::<u8>(src);
        // SAFETY: callers pass distinct frames they own.
        unsafe { core::ptr::copy_nonoverlapping(s, d, count * PAGE_SIZE as usize) };
    }

    #[must_use]
    pub const fn metadata(&self) -> &FrameMetadata<M> {
        &self.metadata
    }

    pub const fn metadata_mut(&mut self) -> &mut FrameMetadata<M> {
        &mut self.metadata
    }

    #[must_use]
    pub const fn buddy(&self) -> &BuddyFrameAllocator<M> {
        &self.buddy
    }

    /// Allocatable frames ever added.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.buddy.total()
    }

    /// Frames currently free.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.buddy.remaining()
    }

    #[must_use]
    pub const fn mapper(&self) -> M {
        self.mapper
    }
}

impl<M: PhysMapper> FrameAlloc for PhysicalMemory<M> {
    type Mapper = M;

    fn mapper(&self) -> M {
        self.mapper
    }

    fn alloc_frames(
        &mut self,
        count: usize,
        owner: FrameOwner,
    ) -> Result<PhysicalAddress, FrameError> {
        self.allocate(count, owner)
    }

    fn free_frames(
        &mut self,
        base: PhysicalAddress,
        count: usize,
        owner: FrameOwner,
    ) -> Result<(), FrameError> {
        self.free(base, count, owner)
    }

    fn frame_owner(&self, pa: PhysicalAddress) -> Result<FrameOwner, FrameError> {
        self.metadata.owner(pa)
    }
}
