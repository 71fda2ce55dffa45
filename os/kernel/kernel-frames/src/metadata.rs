//! # Per-frame metadata
//!
//! Every managed frame has a four-byte [`FrameMetadataUnit`] describing who
//! owns it, how many address spaces share it copy-on-write, and whether it
//! is waiting in the reaper. The units of a physical range are stored at the
//! end of that range, so registering a range shrinks the usable part by the
//! few frames the array needs.
//!
//! ```text
//!  base                                          base + frames * 4 KiB
//!  | usable frames ......................... | unit array (ceil(4n / 4K)) |
//! ```

use crate::error::FrameError;
use crate::phys_mapper::PhysMapper;
use bitfield_struct::bitfield;
use kernel_info::memory::MAX_FRAME_RANGES;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use log::debug;

/// Ownership and state bits of one frame.
#[bitfield(u8)]
pub struct FrameFlags {
    /// Handed out by the frame allocator.
    pub used_by_frame_allocator: bool,
    /// Handed out to one of the heaps; see [`FrameMetadataUnit::heap_tag`].
    pub used_by_heap_allocator: bool,
    /// Parked in the reaper, waiting to be returned to its owner.
    pub collected: bool,
    #[bits(5)]
    __: u8,
}

/// Metadata of a single physical frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameMetadataUnit {
    pub flags: FrameFlags,
    /// Identifies the heap that owns the frame when
    /// [`FrameFlags::used_by_heap_allocator`] is set.
    pub heap_tag: u8,
    /// Number of additional mappings sharing the frame copy-on-write.
    pub cow: u16,
}

const _: () = assert!(size_of::<FrameMetadataUnit>() == 4);

impl FrameMetadataUnit {
    #[must_use]
    pub const fn owner(&self) -> FrameOwner {
        if self.flags.used_by_frame_allocator() {
            FrameOwner::Frames
        } else if self.flags.used_by_heap_allocator() {
            FrameOwner::Heap(self.heap_tag)
        } else {
            FrameOwner::Free
        }
    }
}

/// Who a frame currently belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FrameOwner {
    Free,
    /// Allocated directly from the frame allocator (page tables, user pages).
    Frames,
    /// Backing memory of the heap with the given tag.
    Heap(u8),
}

#[derive(Copy, Clone, Debug)]
struct RangeHeader {
    base_frame: u64,
    frames: u64,
    units: PhysicalAddress,
}

impl RangeHeader {
    const fn contains(&self, frame: u64) -> bool {
        frame >= self.base_frame && frame < self.base_frame + self.frames
    }

    const fn overlaps(&self, base_frame: u64, frames: u64) -> bool {
        base_frame < self.base_frame + self.frames && self.base_frame < base_frame + frames
    }
}

/// Table of metadata arrays, one per registered physical range.
pub struct FrameMetadata<M: PhysMapper> {
    mapper: M,
    ranges: [Option<RangeHeader>; MAX_FRAME_RANGES],
}

impl<M: PhysMapper> FrameMetadata<M> {
    #[must_use]
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            ranges: [None; MAX_FRAME_RANGES],
        }
    }

    /// Frames needed to hold the units of a `frames`-frame range.
    #[must_use]
    pub const fn metadata_frames(frames: u64) -> u64 {
        (frames * size_of::<FrameMetadataUnit>() as u64).div_ceil(PAGE_SIZE)
    }

    /// Track `frames` frames starting at `base`, placing the unit array at
    /// the end of the range.
    ///
    /// Returns the part of the range that is left for allocation.
    ///
    /// # Errors
    /// - [`FrameError::Unaligned`] if `base` is not page aligned.
    /// - [`FrameError::RangeTooSmall`] if nothing is left after the metadata.
    /// - [`FrameError::RangeOverlap`] if the range intersects a registered one.
    /// - [`FrameError::RangeTableFull`] if all range slots are taken.
    pub fn register_range(
        &mut self,
        base: PhysicalAddress,
        frames: u64,
    ) -> Result<(PhysicalAddress, u64), FrameError> {
        if !base.is_aligned_to(PAGE_SIZE) {
            return Err(FrameError::Unaligned(base));
        }
        let meta = Self::metadata_frames(frames);
        if frames <= meta {
            return Err(FrameError::RangeTooSmall(base));
        }
        let usable = frames - meta;
        let base_frame = base.as_u64() >> PAGE_SHIFT;

        if self
            .ranges
            .iter()
            .flatten()
            .any(|r| r.overlaps(base_frame, frames))
        {
            return Err(FrameError::RangeOverlap(base));
        }
        let slot = self
            .ranges
            .iter_mut()
            .find(|r| r.is_none())
            .ok_or(FrameError::RangeTableFull)?;

        let units = base + usable * PAGE_SIZE;
        let ptr = self.mapper.phys_to_ptr::<u8>(units);
        // SAFETY: the tail of the range is reserved for the unit array and no
        // one else references it.
        unsafe { ptr.write_bytes(0, (meta * PAGE_SIZE) as usize) };

        *slot = Some(RangeHeader {
            base_frame,
            frames: usable,
            units,
        });
        debug!("frame metadata: {usable} frames at {base:?}, units at {units:?} ({meta} frames)");
        Ok((base, usable))
    }

    /// Whether `pa` lies in a registered range.
    #[must_use]
    pub fn tracks(&self, pa: PhysicalAddress) -> bool {
        self.locate(pa).is_some()
    }

    fn locate(&self, pa: PhysicalAddress) -> Option<*mut FrameMetadataUnit> {
        let frame = pa.as_u64() >> PAGE_SHIFT;
        let range = self.ranges.iter().flatten().find(|r| r.contains(frame))?;
        let index = frame - range.base_frame;
        let units = self.mapper.phys_to_ptr::<FrameMetadataUnit>(range.units);
        // SAFETY: `index` is within the unit array of this range.
        Some(unsafe { units.add(index as usize) })
    }

    /// Metadata of the frame containing `pa`.
    ///
    /// # Errors
    /// [`FrameError::UnknownFrame`] for untracked frames.
    pub fn unit(&self, pa: PhysicalAddress) -> Result<&FrameMetadataUnit, FrameError> {
        let ptr = self.locate(pa).ok_or(FrameError::UnknownFrame(pa))?;
        // SAFETY: unit arrays are only reachable through `self`.
        Ok(unsafe { &*ptr })
    }

    /// Mutable metadata of the frame containing `pa`.
    ///
    /// # Errors
    /// [`FrameError::UnknownFrame`] for untracked frames.
    pub fn unit_mut(&mut self, pa: PhysicalAddress) -> Result<&mut FrameMetadataUnit, FrameError> {
        let ptr = self.locate(pa).ok_or(FrameError::UnknownFrame(pa))?;
        // SAFETY: unit arrays are only reachable through `self`, which is
        // borrowed mutably.
        Ok(unsafe { &mut *ptr })
    }

    /// Owner of the frame containing `pa`.
    ///
    /// # Errors
    /// [`FrameError::UnknownFrame`] for untracked frames.
    pub fn owner(&self, pa: PhysicalAddress) -> Result<FrameOwner, FrameError> {
        self.unit(pa).map(FrameMetadataUnit::owner)
    }

    /// Record `count` frames from `base` as allocated to `owner`.
    ///
    /// Nothing is modified unless every frame is currently free.
    ///
    /// # Errors
    /// [`FrameError::UnknownFrame`] or [`FrameError::AlreadyAllocated`].
    pub fn mark_allocated(
        &mut self,
        base: PhysicalAddress,
        count: usize,
        owner: FrameOwner,
    ) -> Result<(), FrameError> {
        debug_assert_ne!(owner, FrameOwner::Free);
        for pa in frames(base, count) {
            if self.owner(pa)? != FrameOwner::Free {
                return Err(FrameError::AlreadyAllocated(pa));
            }
        }
        for pa in frames(base, count) {
            let unit = self.unit_mut(pa)?;
            *unit = FrameMetadataUnit::default();
            match owner {
                FrameOwner::Free => {}
                FrameOwner::Frames => unit.flags.set_used_by_frame_allocator(true),
                FrameOwner::Heap(tag) => {
                    unit.flags.set_used_by_heap_allocator(true);
                    unit.heap_tag = tag;
                }
            }
        }
        Ok(())
    }

    /// Record `count` frames from `base` as free again.
    ///
    /// Nothing is modified unless every frame is owned by `owner`.
    ///
    /// # Errors
    /// [`FrameError::UnknownFrame`], [`FrameError::DoubleFree`] or
    /// [`FrameError::OwnerMismatch`].
    pub fn mark_freed(
        &mut self,
        base: PhysicalAddress,
        count: usize,
        owner: FrameOwner,
    ) -> Result<(), FrameError> {
        for pa in frames(base, count) {
            match self.owner(pa)? {
                FrameOwner::Free => return Err(FrameError::DoubleFree(pa)),
                actual if actual != owner => {
                    return Err(FrameError::OwnerMismatch {
                        frame: pa,
                        expected: owner,
                        actual,
                    });
                }
                _ => {}
            }
        }
        for pa in frames(base, count) {
            *self.unit_mut(pa)? = FrameMetadataUnit::default();
        }
        Ok(())
    }

    /// Add one copy-on-write sharer; returns the new count.
    ///
    /// # Errors
    /// [`FrameError::UnknownFrame`] or [`FrameError::CowOverflow`].
    pub fn share(&mut self, pa: PhysicalAddress) -> Result<u16, FrameError> {
        let unit = self.unit_mut(pa)?;
        unit.cow = unit.cow.checked_add(1).ok_or(FrameError::CowOverflow(pa))?;
        Ok(unit.cow)
    }

    /// Drop one copy-on-write sharer; returns the new count.
    ///
    /// # Errors
    /// [`FrameError::UnknownFrame`] or [`FrameError::NotShared`].
    pub fn unshare(&mut self, pa: PhysicalAddress) -> Result<u16, FrameError> {
        let unit = self.unit_mut(pa)?;
        unit.cow = unit.cow.checked_sub(1).ok_or(FrameError::NotShared(pa))?;
        Ok(unit.cow)
    }

    /// Current copy-on-write count.
    ///
    /// # Errors
    /// [`FrameError::UnknownFrame`] for untracked frames.
    pub fn cow(&self, pa: PhysicalAddress) -> Result<u16, FrameError> {
        self.unit(pa).map(|u| u.cow)
    }

    /// # Errors
    /// [`FrameError::UnknownFrame`] for untracked frames.
    pub fn set_collected(
        &mut self,
        pa: PhysicalAddress,
        collected: bool,
    ) -> Result<(), FrameError> {
        self.unit_mut(pa)?.flags.set_collected(collected);
        Ok(())
    }

    /// Untracked frames count as not collected.
    #[must_use]
    pub fn is_collected(&self, pa: PhysicalAddress) -> bool {
        self.unit(pa).is_ok_and(|u| u.flags.collected())
    }
}

/// Page-aligned addresses of `count` frames starting at `base`.
fn frames(base: PhysicalAddress, count: usize) -> impl Iterator<Item = PhysicalAddress> {
    (0..count as u64).map(move |i| base + i * PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PhysArena;

    const BASE: u64 = 0x10_0000;

    #[test]
    fn units_live_at_the_end_of_the_range() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 64);
        let mut meta = FrameMetadata::new(arena.mapper());
        let (base, usable) = meta.register_range(arena.base(), 64).unwrap();
        assert_eq!(base, arena.base());
        assert_eq!(usable, 63);
        assert!(meta.tracks(base));
        assert!(meta.tracks(base + 62 * PAGE_SIZE));
        assert!(!meta.tracks(base + 63 * PAGE_SIZE));
        assert_eq!(
            meta.unit(base + 63 * PAGE_SIZE).map(|_| ()),
            Err(FrameError::UnknownFrame(base + 63 * PAGE_SIZE))
        );
    }

    #[test]
    fn metadata_size_rounds_up() {
        assert_eq!(FrameMetadata::<crate::HhdmPhysMapper>::metadata_frames(1), 1);
        assert_eq!(FrameMetadata::<crate::HhdmPhysMapper>::metadata_frames(1024), 1);
        assert_eq!(FrameMetadata::<crate::HhdmPhysMapper>::metadata_frames(1025), 2);
    }

    #[test]
    fn register_rejects_bad_ranges() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 8);
        let mut meta = FrameMetadata::new(arena.mapper());
        assert_eq!(
            meta.register_range(arena.base(), 1),
            Err(FrameError::RangeTooSmall(arena.base()))
        );
        assert_eq!(
            meta.register_range(arena.base() + 1, 4),
            Err(FrameError::Unaligned(arena.base() + 1))
        );
        meta.register_range(arena.base(), 4).unwrap();
        assert_eq!(
            meta.register_range(arena.base() + 2 * PAGE_SIZE, 4),
            Err(FrameError::RangeOverlap(arena.base() + 2 * PAGE_SIZE))
        );
    }

    #[test]
    fn ownership_transitions() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 16);
        let mut meta = FrameMetadata::new(arena.mapper());
        let (base, _) = meta.register_range(arena.base(), 16).unwrap();

        meta.mark_allocated(base, 2, FrameOwner::Heap(3)).unwrap();
        assert_eq!(meta.owner(base + PAGE_SIZE), Ok(FrameOwner::Heap(3)));
        assert_eq!(
            meta.mark_allocated(base + PAGE_SIZE, 2, FrameOwner::Frames),
            Err(FrameError::AlreadyAllocated(base + PAGE_SIZE))
        );
        // the failed call left the second frame untouched
        assert_eq!(meta.owner(base + 2 * PAGE_SIZE), Ok(FrameOwner::Free));

        assert_eq!(
            meta.mark_freed(base, 2, FrameOwner::Frames),
            Err(FrameError::OwnerMismatch {
                frame: base,
                expected: FrameOwner::Frames,
                actual: FrameOwner::Heap(3),
            })
        );
        meta.mark_freed(base, 2, FrameOwner::Heap(3)).unwrap();
        assert_eq!(
            meta.mark_freed(base, 1, FrameOwner::Heap(3)),
            Err(FrameError::DoubleFree(base))
        );
    }

    #[test]
    fn cow_counting() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 8);
        let mut meta = FrameMetadata::new(arena.mapper());
        let (base, _) = meta.register_range(arena.base(), 8).unwrap();
        meta.mark_allocated(base, 1, FrameOwner::Frames).unwrap();

        assert_eq!(meta.unshare(base), Err(FrameError::NotShared(base)));
        assert_eq!(meta.share(base), Ok(1));
        assert_eq!(meta.share(base), Ok(2));
        assert_eq!(meta.unshare(base), Ok(1));
        assert_eq!(meta.cow(base), Ok(1));

        meta.unit_mut(base).unwrap().cow = u16::MAX;
        assert_eq!(meta.share(base), Err(FrameError::CowOverflow(base)));

        // freeing resets the count
        meta.mark_freed(base, 1, FrameOwner::Frames).unwrap();
        assert_eq!(meta.cow(base), Ok(0));
    }

    #[test]
    fn collected_flag() {
        let arena = PhysArena::new(PhysicalAddress::new(BASE), 8);
        let mut meta = FrameMetadata::new(arena.mapper());
        let (base, _) = meta.register_range(arena.base(), 8).unwrap();
        assert!(!meta.is_collected(base));
        meta.set_collected(base, true).unwrap();
        assert!(meta.is_collected(base));
        assert!(!meta.is_collected(PhysicalAddress::new(0)));
    }
}
