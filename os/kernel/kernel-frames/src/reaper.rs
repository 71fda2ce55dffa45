//! # Deferred frame release
//!
//! Tearing down an address space can release thousands of frames one page
//! at a time. Instead of pushing each one through the buddy allocator, the
//! frames are *collected*: flagged in their metadata and chained into runs.
//! A run is a maximal stretch of physically adjacent collected frames with
//! the same owner. Its bookkeeping node is written into its first frame and
//! the address of that frame into the last word of its last frame, so a new
//! frame joins the run in front of it without walking back over it.
//! [`FrameReaper::reap`] later hands each run back in a single call.
//!
//! The collected flag lives in the shared frame metadata, and runs grow by
//! looking at that flag. Several reapers may exist, but only one of them may
//! hold collected frames at a time: drain a reaper before another collects.

use crate::error::FrameError;
use crate::metadata::FrameOwner;
use crate::phys_mapper::PhysMapper;
use crate::pool::PhysicalMemory;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use log::{debug, warn};

const NIL: u64 = u64::MAX;

/// Offset of the run head back-reference inside a run's last frame.
const TAIL_OFFSET: u64 = PAGE_SIZE - size_of::<u64>() as u64;

/// Header of a collected run, stored in the run's first frame.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct RunNode {
    frames: u64,
    next: u64,
    prev: u64,
}

const _: () = assert!(size_of::<RunNode>() as u64 <= TAIL_OFFSET);

#[derive(Debug)]
pub struct FrameReaper {
    head: u64,
    pending: u64,
}

impl Default for FrameReaper {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReaper {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: NIL, pending: 0 }
    }

    /// Frames waiting to be reaped.
    #[must_use]
    pub const fn pending(&self) -> u64 {
        self.pending
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head == NIL
    }

    /// Number of runs on the list.
    #[must_use]
    pub fn runs<M: PhysMapper>(&self, pool: &PhysicalMemory<M>) -> usize {
        let mut count = 0;
        let mut cur = self.head;
        while cur != NIL {
            count += 1;
            cur = read(pool, cur).next;
        }
        count
    }

    /// Queue `count` allocated frames starting at `base` for release.
    ///
    /// # Errors
    /// - [`FrameError::ZeroLength`] for `count == 0`.
    /// - [`FrameError::UnknownFrame`] for untracked frames.
    /// - [`FrameError::DoubleFree`] if a frame is free or already collected.
    /// - [`FrameError::OwnerMismatch`] if the frames have different owners.
    pub fn collect<M: PhysMapper>(
        &mut self,
        pool: &mut PhysicalMemory<M>,
        base: PhysicalAddress,
        count: usize,
    ) -> Result<(), FrameError> {
        if count == 0 {
            return Err(FrameError::ZeroLength);
        }
        if !base.is_aligned_to(PAGE_SIZE) {
            return Err(FrameError::Unaligned(base));
        }
        let owner = pool.metadata().owner(base)?;
        for i in 0..count as u64 {
            let pa = base + i * PAGE_SIZE;
            let actual = pool.metadata().owner(pa)?;
            if actual == FrameOwner::Free || pool.metadata().is_collected(pa) {
                return Err(FrameError::DoubleFree(pa));
            }
            if actual != owner {
                return Err(FrameError::OwnerMismatch {
                    frame: pa,
                    expected: owner,
                    actual,
                });
            }
        }
        for i in 0..count as u64 {
            pool.metadata_mut().set_collected(base + i * PAGE_SIZE, true)?;
        }

        // runs are maximal, so a collected frame right before `base` is the
        // last frame of its run
        let before = base.as_u64().checked_sub(PAGE_SIZE);
        let start = match before {
            Some(last) if joins(pool, PhysicalAddress::new(last), owner) => {
                let start = read_tail(pool, last);
                let mut node = read(pool, start);
                node.frames += count as u64;
                write(pool, start, node);
                start
            }
            _ => {
                let start = base.as_u64();
                self.push(pool, start, count as u64);
                start
            }
        };

        // absorb the run that starts right after
        let mut node = read(pool, start);
        let after = start + node.frames * PAGE_SIZE;
        if joins(pool, PhysicalAddress::new(after), owner) {
            let absorbed = read(pool, after);
            self.unlink(pool, absorbed);
            node = read(pool, start);
            node.frames += absorbed.frames;
            write(pool, start, node);
        }
        write_tail(pool, start + (node.frames - 1) * PAGE_SIZE, start);

        self.pending += count as u64;
        Ok(())
    }

    /// Return every collected run to its owner.
    ///
    /// All runs are processed even if some fail.
    ///
    /// # Errors
    /// The first error encountered.
    pub fn reap<M: PhysMapper>(
        &mut self,
        pool: &mut PhysicalMemory<M>,
    ) -> Result<u64, FrameError> {
        let mut cur = self.head;
        self.head = NIL;
        self.pending = 0;

        let mut released = 0;
        let mut first_error = None;
        while cur != NIL {
            let node = read(pool, cur);
            let base = PhysicalAddress::new(cur);
            match release_run(pool, base, node.frames) {
                Ok(()) => released += node.frames,
                Err(e) => {
                    warn!("reaper: failed to release {} frames at {base:?}: {e}", node.frames);
                    first_error.get_or_insert(e);
                }
            }
            cur = node.next;
        }
        if released > 0 {
            debug!("reaper: released {released} frames");
        }
        first_error.map_or(Ok(released), Err)
    }

    fn push<M: PhysMapper>(&mut self, pool: &PhysicalMemory<M>, start: u64, frames: u64) {
        let next = self.head;
        write(pool, start, RunNode { frames, next, prev: NIL });
        if next != NIL {
            let mut old = read(pool, next);
            old.prev = start;
            write(pool, next, old);
        }
        self.head = start;
    }

    fn unlink<M: PhysMapper>(&mut self, pool: &PhysicalMemory<M>, node: RunNode) {
        if node.prev == NIL {
            self.head = node.next;
        } else {
            let mut prev = read(pool, node.prev);
            prev.next = node.next;
            write(pool, node.prev, prev);
        }
        if node.next != NIL {
            let mut next = read(pool, node.next);
            next.prev = node.prev;
            write(pool, node.next, next);
        }
    }
}

fn release_run<M: PhysMapper>(
    pool: &mut PhysicalMemory<M>,
    base: PhysicalAddress,
    frames: u64,
) -> Result<(), FrameError> {
    let owner = pool.metadata().owner(base)?;
    for i in 0..frames {
        pool.metadata_mut().set_collected(base + i * PAGE_SIZE, false)?;
    }
    pool.free(base, frames as usize, owner)
}

/// Whether the frame at `pa` is collected and owned by `owner`.
fn joins<M: PhysMapper>(
    pool: &PhysicalMemory<M>,
    pa: PhysicalAddress,
    owner: FrameOwner,
) -> bool {
    pool.metadata().is_collected(pa) && pool.metadata().owner(pa) == Ok(owner)
}

fn read<M: PhysMapper>(pool: &PhysicalMemory<M>, pa: u64) -> RunNode {
    // SAFETY: run heads are collected frames owned by the reaper.
    unsafe { pool.mapper().phys_to_ptr::<RunNode>(PhysicalAddress::new(pa)).read() }
}

fn write<M: PhysMapper>(pool: &PhysicalMemory<M>, pa: u64, node: RunNode) {
    // SAFETY: run heads are collected frames owned by the reaper.
    unsafe { pool.mapper().phys_to_ptr::<RunNode>(PhysicalAddress::new(pa)).write(node) }
}

/// Head of the run whose last frame is `last`.
fn read_tail<M: PhysMapper>(pool: &PhysicalMemory<M>, last: u64) -> u64 {
    let pa = PhysicalAddress::new(last + TAIL_OFFSET);
    // SAFETY: `last` is the last frame of a collected run.
    unsafe { pool.mapper().phys_to_ptr::<u64>(pa).read() }
}

fn write_tail<M: PhysMapper>(pool: &PhysicalMemory<M>, last: u64, start: u64) {
    let pa = PhysicalAddress::new(last + TAIL_OFFSET);
    // SAFETY: `last` is the last frame of a collected run.
    unsafe { pool.mapper().phys_to_ptr::<u64>(pa).write(start) }
}
