//! # Mapping policies
//!
//! Every occupied entry of an extended page table carries a
//! [`MappingPolicy`]. The policy decides what happens to the entry when the
//! address space is forked (`copy_entry`), when an access faults
//! (`handle_fault`) and when the mapping goes away (`release_entry`).
//!
//! | Policy           | copy                      | fault                   | release         |
//! |------------------|---------------------------|-------------------------|-----------------|
//! | `Kernel`         | share entry and subtree   | unsupported             | clear           |
//! | `SharedReadOnly` | new tables, shared frames | write: access violation | clear           |
//! | `PrivateOwned`   | new tables, copied frames | demand-zero if unbacked | free frame      |
//! | `Cow`            | share frame read-only     | write: copy if shared   | free or unshare |
//! | `LazyAnonymous`  | like `Cow`                | demand-zero, then `Cow` | like `Cow`      |
//! | `Mixed`          | recurse per child         | n/a (tables only)       | recurse         |
//!
//! Frames are never freed directly: they go through the root's
//! [`FrameReaper`], so a release in the middle of a walk never touches the
//! buddy lists.

use crate::error::PagingError;
use crate::fault::{FaultKind, PageFaultError};
use crate::level::PagingLevel;
use crate::page_entry_bits::PageEntryBits;
use crate::table::{ENTRIES, ExtendedPageTable};
use kernel_frames::{FrameOwner, FrameReaper, PhysMapper, PhysicalMemory};
use kernel_memory_addresses::VirtualAddress;
use log::{debug, trace, warn};

/// Behaviour attached to a mapping. Stored as one byte in the extra table.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MappingPolicy {
    /// Global kernel mapping shared by every address space.
    Kernel = 1,
    /// Frames shared between address spaces and never writable.
    SharedReadOnly = 2,
    /// Frames owned by exactly one address space; forks copy eagerly.
    PrivateOwned = 3,
    /// Frames shared read-only after a fork until the first write.
    Cow = 4,
    /// Anonymous memory backed on first touch, copy-on-write afterwards.
    LazyAnonymous = 5,
    /// Table entry whose subtree holds more than one policy.
    Mixed = 6,
}

impl MappingPolicy {
    #[must_use]
    pub const fn slot(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_slot(slot: u8) -> Option<Self> {
        match slot {
            1 => Some(Self::Kernel),
            2 => Some(Self::SharedReadOnly),
            3 => Some(Self::PrivateOwned),
            4 => Some(Self::Cow),
            5 => Some(Self::LazyAnonymous),
            6 => Some(Self::Mixed),
            _ => None,
        }
    }

    /// Whether releasing a mapping of this policy may free its frames.
    #[must_use]
    pub const fn owns_frames(self) -> bool {
        matches!(self, Self::PrivateOwned | Self::Cow | Self::LazyAnonymous)
    }

    /// Duplicate slot `i` of `src` into `dst` for a forked address space.
    pub(crate) fn copy_entry<M: PhysMapper>(
        self,
        ctx: &mut Context<'_, M>,
        level: PagingLevel,
        src: ExtendedPageTable<M>,
        dst: ExtendedPageTable<M>,
        i: usize,
    ) -> Result<(), PagingError> {
        let entry = src.entry(i);
        let extra = src.extra(i);
        if self == Self::Kernel {
            dst.set_raw(i, entry, extra);
            return Ok(());
        }
        if !entry.is_leaf(level) {
            return copy_subtree(ctx, level, src, dst, i);
        }
        if !entry.present() {
            dst.set_raw(i, entry, extra);
            return Ok(());
        }

        let frame = entry.physical_address();
        match self {
            Self::Kernel | Self::SharedReadOnly => dst.set_raw(i, entry, extra),
            Self::PrivateOwned => {
                let frames = level.frames();
                let copy = ctx.pool.allocate(frames, FrameOwner::Frames)?;
                ctx.pool.copy_frames(copy, frame, frames);
                dst.set_raw(i, entry.with_physical_address(copy), extra);
            }
            Self::Cow | Self::LazyAnonymous => {
                let shares = ctx.pool.metadata_mut().share(frame)?;
                trace!("{frame:?} shared copy-on-write ({shares} extra mappings)");
                let shared = entry.with_writable(false);
                src.set_entry(i, shared);
                dst.set_raw(i, shared, extra);
            }
            Self::Mixed => return Err(PagingError::Inconsistent(src.physical_address())),
        }
        Ok(())
    }

    /// Resolve a fault on the leaf in slot `i` of `table`.
    pub(crate) fn handle_fault<M: PhysMapper>(
        self,
        ctx: &mut Context<'_, M>,
        level: PagingLevel,
        table: ExtendedPageTable<M>,
        i: usize,
        address: VirtualAddress,
        error: PageFaultError,
    ) -> Result<(), PagingError> {
        let entry = table.entry(i);
        let unsupported = PagingError::UnsupportedFault {
            address,
            policy: self,
            code: error.into_bits(),
        };
        let violation = PagingError::AccessViolation {
            address,
            policy: self,
        };

        match self {
            Self::Kernel | Self::Mixed => Err(unsupported),
            Self::SharedReadOnly => {
                if error.write() && entry.present() {
                    warn!("write to shared read-only mapping at {address:?}");
                    Err(violation)
                } else {
                    Err(unsupported)
                }
            }
            Self::PrivateOwned | Self::Cow | Self::LazyAnonymous => {
                if error.write() && !entry.write_intent() {
                    return Err(violation);
                }
                if !entry.present() {
                    if error.kind() != FaultKind::Missing {
                        return Err(unsupported);
                    }
                    return demand_zero(ctx, level, table, i, entry, address);
                }
                if self == Self::PrivateOwned || !error.is_write_protection() || entry.writable() {
                    return Err(unsupported);
                }
                break_share(ctx, level, table, i, entry, address)
            }
        }
    }

    /// Drop the mapping in slot `i` of `table`. The slot is vacant
    /// afterwards even if returning a frame failed.
    pub(crate) fn release_entry<M: PhysMapper>(
        self,
        ctx: &mut Context<'_, M>,
        level: PagingLevel,
        table: ExtendedPageTable<M>,
        i: usize,
    ) -> Result<(), PagingError> {
        let entry = table.entry(i);
        if self == Self::Kernel {
            table.clear(i);
            return Ok(());
        }
        if !entry.is_leaf(level) {
            return release_subtree(ctx, level, table, i);
        }

        let result = if entry.present() {
            self.release_frame(ctx, level, entry)
        } else {
            Ok(())
        };
        table.clear(i);
        result
    }

    fn release_frame<M: PhysMapper>(
        self,
        ctx: &mut Context<'_, M>,
        level: PagingLevel,
        entry: PageEntryBits,
    ) -> Result<(), PagingError> {
        let frame = entry.physical_address();
        match self {
            Self::Kernel | Self::SharedReadOnly => {}
            Self::PrivateOwned => ctx.reaper.collect(ctx.pool, frame, level.frames())?,
            Self::Cow | Self::LazyAnonymous => {
                // a writable leaf is the only reference to its frame
                if entry.writable() || ctx.pool.metadata().cow(frame)? == 0 {
                    ctx.reaper.collect(ctx.pool, frame, level.frames())?;
                } else {
                    ctx.pool.metadata_mut().unshare(frame)?;
                }
            }
            Self::Mixed => return Err(PagingError::Inconsistent(frame)),
        }
        Ok(())
    }
}

/// What the policies need besides the tables themselves.
pub(crate) struct Context<'a, M: PhysMapper> {
    pub pool: &'a mut PhysicalMemory<M>,
    pub reaper: &'a mut FrameReaper,
}

/// Release slot `i` through whatever policy it carries.
pub(crate) fn release_slot<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    i: usize,
) -> Result<(), PagingError> {
    match table.extra(i).policy() {
        Some(policy) => policy.release_entry(ctx, level, table, i),
        None => Ok(()),
    }
}

/// Release every slot of `table`. Keeps going after failures and reports
/// the first one.
pub(crate) fn release_all<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
) -> Result<(), PagingError> {
    let mut first_error = None;
    for i in 0..ENTRIES {
        if let Err(e) = release_slot(ctx, level, table, i) {
            warn!("releasing slot {i} of {:?} failed: {e}", table.physical_address());
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn release_subtree<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    i: usize,
) -> Result<(), PagingError> {
    let child = table.child(i);
    table.clear(i);
    let Some(next) = level.next() else {
        return Err(PagingError::Inconsistent(table.physical_address()));
    };
    let released = release_all(ctx, next, child);
    child.free(ctx.pool)?;
    released
}

fn copy_subtree<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    level: PagingLevel,
    src: ExtendedPageTable<M>,
    dst: ExtendedPageTable<M>,
    i: usize,
) -> Result<(), PagingError> {
    let Some(next) = level.next() else {
        return Err(PagingError::Inconsistent(src.physical_address()));
    };
    let from = src.child(i);
    let to = ExtendedPageTable::allocate(ctx.pool)?;
    for j in 0..ENTRIES {
        let Some(policy) = from.extra(j).policy() else {
            continue;
        };
        if let Err(e) = policy.copy_entry(ctx, next, from, to, j) {
            // undo the partial copy; the source keeps its entries
            if let Err(cleanup) = release_all(ctx, next, to) {
                warn!("cleanup of partial table copy failed: {cleanup}");
            }
            to.free(ctx.pool)?;
            return Err(e);
        }
    }
    dst.set_raw(
        i,
        src.entry(i).with_physical_address(to.physical_address()),
        src.extra(i),
    );
    Ok(())
}

fn demand_zero<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    i: usize,
    entry: PageEntryBits,
    address: VirtualAddress,
) -> Result<(), PagingError> {
    let frame = ctx.pool.allocate_zeroed(level.frames(), FrameOwner::Frames)?;
    debug!("demand-zero {frame:?} mapped for {address:?}");
    table.set_entry(
        i,
        entry
            .with_physical_address(frame)
            .with_present(true)
            .with_writable(entry.write_intent()),
    );
    Ok(())
}

fn break_share<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    i: usize,
    entry: PageEntryBits,
    address: VirtualAddress,
) -> Result<(), PagingError> {
    let frame = entry.physical_address();
    let mut target = frame;
    if ctx.pool.metadata().cow(frame)? > 0 {
        let frames = level.frames();
        target = ctx.pool.allocate(frames, FrameOwner::Frames)?;
        ctx.pool.copy_frames(target, frame, frames);
        ctx.pool.metadata_mut().unshare(frame)?;
        debug!("copy-on-write at {address:?}: {frame:?} copied to {target:?}");
    } else {
        debug!("copy-on-write at {address:?}: last reference to {frame:?} made writable");
    }
    table.set_entry(i, entry.with_physical_address(target).with_writable(true));
    Ok(())
}
