//! # Extended page table root
//!
//! [`ExtendedPageTableRoot`] owns the top-level extended table of one
//! address space and the [`FrameReaper`] that collects frames released by
//! its mappings. All walks are recursive over at most four levels.
//!
//! Ranges are split per level the same way everywhere: starting at `v`, the
//! entry at each level covers
//! `min(remaining, pages until the end of that entry's span)` pages.
//!
//! Every operation that releases frames reaps before it returns. The
//! reapers of different roots share the collected flag in the frame
//! metadata, so no root may keep collected frames across operations.

use crate::error::PagingError;
use crate::fault::PageFaultError;
use crate::level::PagingLevel;
use crate::page_entry_bits::PageEntryBits;
use crate::policy::{Context, MappingPolicy, release_all, release_slot};
use crate::protection::{DrawFlags, Protection};
use crate::table::{ENTRIES, ExtendedPageTable, ExtraEntry};
use kernel_frames::{FrameReaper, PhysMapper, PhysicalMemory};
use kernel_info::memory::KERNEL_PML4_START;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use log::{debug, info, trace, warn};

pub struct ExtendedPageTableRoot<M: PhysMapper> {
    top: ExtendedPageTable<M>,
    reaper: FrameReaper,
}

impl<M: PhysMapper> core::fmt::Debug for ExtendedPageTableRoot<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtendedPageTableRoot")
            .field("root_page", &self.top.physical_address())
            .field("reaper", &self.reaper)
            .finish()
    }
}

/// State threaded through a draw.
struct DrawJob {
    frame: PhysicalAddress,
    policy: MappingPolicy,
    prot: Protection,
    flags: DrawFlags,
    /// Position being drawn; everything below it is done.
    at: VirtualAddress,
}

impl DrawJob {
    fn fits_huge(&self, level: PagingLevel, sub_n: u64) -> bool {
        self.flags.allow_huge()
            && level.allows_huge()
            && sub_n == level.pages()
            && (self.flags.lazy() || self.frame.is_aligned_to(level.span()))
    }
}

impl<M: PhysMapper> ExtendedPageTableRoot<M> {
    /// An empty address space.
    ///
    /// # Errors
    /// Frame exhaustion while allocating the top-level table.
    pub fn new(pool: &mut PhysicalMemory<M>) -> Result<Self, PagingError> {
        let top = ExtendedPageTable::allocate(pool)?;
        debug!("page table root created at {:?}", top.physical_address());
        Ok(Self {
            top,
            reaper: FrameReaper::new(),
        })
    }

    /// The value to load into CR3.
    #[must_use]
    pub const fn root_page(&self) -> PhysicalAddress {
        self.top.physical_address()
    }

    /// The top-level extended table.
    #[must_use]
    pub const fn top(&self) -> ExtendedPageTable<M> {
        self.top
    }

    #[must_use]
    pub const fn reaper(&self) -> &FrameReaper {
        &self.reaper
    }

    /// Return every frame collected so far to the pool. The public
    /// operations already do this; it is only needed after a failed reap.
    ///
    /// # Errors
    /// The first frame error met; the remaining runs are still released.
    pub fn reap(&mut self, pool: &mut PhysicalMemory<M>) -> Result<u64, PagingError> {
        Ok(self.reaper.reap(pool)?)
    }

    /// Share the kernel half of `kernel` with this address space. The copied
    /// top-level entries are marked [`MappingPolicy::Kernel`], so this space
    /// never copies or frees the tables behind them.
    pub fn share_kernel_half(&mut self, kernel: &Self) {
        for i in KERNEL_PML4_START..ENTRIES {
            let (entry, policy) = kernel.top.get(i);
            if policy.is_some() {
                let count = kernel.top.extra(i).child_count;
                self.top
                    .set_raw(i, entry, ExtraEntry::new(count, MappingPolicy::Kernel));
            }
        }
    }

    /// Map `n` pages at `v` to the frames starting at `p` under `policy`.
    ///
    /// With [`DrawFlags::lazy`] the entries are occupied but not present and
    /// `p` is ignored. Existing mappings in the range are released through
    /// their own policy first, unless [`DrawFlags::assert_blank`] is set, in
    /// which case nothing is changed and [`PagingError::NotBlank`] returned.
    ///
    /// If the draw fails midway, the entries it wrote and the tables it
    /// created are removed again; the frames at `p` are not touched.
    ///
    /// # Errors
    /// - [`PagingError::Unaligned`] / [`PagingError::NonCanonical`] for bad
    ///   ranges.
    /// - [`PagingError::InvalidPolicy`] for [`MappingPolicy::Mixed`].
    /// - [`PagingError::NotBlank`], [`PagingError::HugePageSplit`],
    ///   [`PagingError::KernelSubtree`].
    /// - [`PagingError::OutOfMemory`] when a table cannot be allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn draw(
        &mut self,
        pool: &mut PhysicalMemory<M>,
        v: VirtualAddress,
        p: PhysicalAddress,
        n: u64,
        policy: MappingPolicy,
        prot: Protection,
        flags: DrawFlags,
    ) -> Result<(), PagingError> {
        if n == 0 {
            return Ok(());
        }
        check_range(v, n)?;
        if !flags.lazy() && !p.is_aligned_to(PAGE_SIZE) {
            return Err(PagingError::Unaligned(p.as_u64()));
        }
        if policy == MappingPolicy::Mixed {
            return Err(PagingError::InvalidPolicy(policy));
        }
        if flags.assert_blank() {
            check_blank(PagingLevel::Pml4, self.top, v, n)?;
        }

        let mut job = DrawJob {
            frame: if flags.lazy() { PhysicalAddress::zero() } else { p },
            policy,
            prot,
            flags,
            at: v,
        };
        let mut ctx = Context {
            pool: &mut *pool,
            reaper: &mut self.reaper,
        };
        let drawn = draw_level(&mut ctx, PagingLevel::Pml4, self.top, v, n, &mut job);
        if let Err(e) = drawn {
            warn!("draw of {n} pages at {v:?} failed at {:?}: {e}", job.at);
            rollback(pool, self.top, v, job.at);
        }
        // mappings replaced by the draw were collected
        let reaped = self.reaper.reap(pool);
        drawn?;
        reaped?;
        trace!("drew {n} pages at {v:?} as {policy:?}");
        Ok(())
    }

    /// Remove the mappings of `n` pages at `v`, releasing each through its
    /// policy. Tables left without occupied entries are freed and released
    /// frames are reaped.
    ///
    /// # Errors
    /// Range errors, [`PagingError::HugePageSplit`] when only part of a huge
    /// page is covered, or the first release failure (the rest of the range
    /// is still erased).
    pub fn erase(
        &mut self,
        pool: &mut PhysicalMemory<M>,
        v: VirtualAddress,
        n: u64,
    ) -> Result<(), PagingError> {
        if n == 0 {
            return Ok(());
        }
        check_range(v, n)?;
        let mut ctx = Context {
            pool: &mut *pool,
            reaper: &mut self.reaper,
        };
        let erased = erase_level(&mut ctx, PagingLevel::Pml4, self.top, v, n);
        let reaped = self.reaper.reap(pool);
        erased?;
        reaped?;
        Ok(())
    }

    /// Physical address `v` currently maps to. Unbacked lazy entries
    /// translate to `None`.
    #[must_use]
    pub fn translate(&self, v: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.top;
        let mut level = PagingLevel::Pml4;
        loop {
            let i = level.index(v);
            let (entry, policy) = table.get(i);
            if policy.is_none() || !entry.present() {
                return None;
            }
            if entry.is_leaf(level) {
                return Some(entry.physical_address() + (v.as_u64() & (level.span() - 1)));
            }
            table = table.child(i);
            level = level.next()?;
        }
    }

    /// Policy of the leaf governing `v`, or `None` if nothing is drawn
    /// there. Table summaries are not trusted: a uniform subtree may still
    /// have vacant slots.
    #[must_use]
    pub fn peek(&self, v: VirtualAddress) -> Option<MappingPolicy> {
        let mut table = self.top;
        let mut level = PagingLevel::Pml4;
        loop {
            let i = level.index(v);
            let (entry, policy) = table.get(i);
            let policy = policy?;
            if entry.is_leaf(level) {
                return Some(policy);
            }
            table = table.child(i);
            level = level.next()?;
        }
    }

    /// Fork: a new root whose entries are copies of this one's, each made by
    /// its own policy. Copy-on-write entries of `self` become read-only.
    ///
    /// # Errors
    /// Frame exhaustion; the partial copy is released before returning.
    pub fn copy_table(&mut self, pool: &mut PhysicalMemory<M>) -> Result<Self, PagingError> {
        let mut copy = Self::new(pool)?;
        let mut ctx = Context {
            pool: &mut *pool,
            reaper: &mut copy.reaper,
        };
        for i in 0..ENTRIES {
            let Some(policy) = self.top.extra(i).policy() else {
                continue;
            };
            if let Err(e) = policy.copy_entry(&mut ctx, PagingLevel::Pml4, self.top, copy.top, i) {
                warn!("copy of page table root {:?} failed: {e}", self.root_page());
                if let Err(cleanup) = copy.release_table(pool) {
                    warn!("cleanup of partial page table copy failed: {cleanup}");
                }
                return Err(e);
            }
        }
        info!(
            "page table root {:?} copied to {:?}",
            self.root_page(),
            copy.root_page()
        );
        Ok(copy)
    }

    /// Release every mapping through its policy, free the top table and
    /// reap. Returns the number of frames given back by the reaper.
    ///
    /// # Errors
    /// The first failure; everything that can be released still is.
    pub fn release_table(mut self, pool: &mut PhysicalMemory<M>) -> Result<u64, PagingError> {
        let root = self.root_page();
        let mut ctx = Context {
            pool: &mut *pool,
            reaper: &mut self.reaper,
        };
        let released = release_all(&mut ctx, PagingLevel::Pml4, self.top);
        let freed = self.top.free(pool);
        let reaped = self.reaper.reap(pool);
        released?;
        freed?;
        let frames = reaped?;
        info!("page table root {root:?} released, {frames} frames reaped");
        Ok(frames)
    }

    /// Dispatch a page fault at `v` to the policy of the leaf governing it.
    ///
    /// # Errors
    /// [`PagingError::NotMapped`] when nothing is drawn at `v`, otherwise
    /// whatever the policy reports.
    pub fn handle_page_fault(
        &mut self,
        pool: &mut PhysicalMemory<M>,
        v: VirtualAddress,
        error: PageFaultError,
    ) -> Result<(), PagingError> {
        let mut table = self.top;
        let mut level = PagingLevel::Pml4;
        loop {
            let i = level.index(v);
            let (entry, policy) = table.get(i);
            let Some(policy) = policy else {
                return Err(PagingError::NotMapped(v));
            };
            if entry.is_leaf(level) {
                trace!("page fault at {v:?} ({error}) handled by {policy:?}");
                let mut ctx = Context {
                    pool,
                    reaper: &mut self.reaper,
                };
                return policy.handle_fault(&mut ctx, level, table, i, v, error);
            }
            table = table.child(i);
            level = level
                .next()
                .ok_or(PagingError::Inconsistent(table.physical_address()))?;
        }
    }
}

fn check_range(v: VirtualAddress, n: u64) -> Result<(), PagingError> {
    if !v.is_aligned_to(PAGE_SIZE) {
        return Err(PagingError::Unaligned(v.as_u64()));
    }
    let last = n
        .checked_mul(PAGE_SIZE)
        .and_then(|len| v.checked_add(len - 1));
    match last {
        Some(last)
            if v.is_canonical()
                && last.is_canonical()
                && (v.as_u64() ^ last.as_u64()) >> 47 == 0 =>
        {
            Ok(())
        }
        _ => Err(PagingError::NonCanonical { start: v, pages: n }),
    }
}

const fn advance(v: VirtualAddress, pages: u64) -> VirtualAddress {
    VirtualAddress::new(v.as_u64().wrapping_add(pages << PAGE_SHIFT))
}

/// Fails with `NotBlank` at the first occupied leaf in the range.
fn check_blank<M: PhysMapper>(
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    mut v: VirtualAddress,
    n: u64,
) -> Result<(), PagingError> {
    let mut remaining = n;
    while remaining > 0 {
        let i = level.index(v);
        let sub_n = remaining.min(level.pages_to_boundary(v));
        if table.is_occupied(i) {
            let entry = table.entry(i);
            match level.next() {
                Some(next) if !entry.is_leaf(level) => check_blank(next, table.child(i), v, sub_n)?,
                _ => return Err(PagingError::NotBlank(v)),
            }
        }
        v = advance(v, sub_n);
        remaining -= sub_n;
    }
    Ok(())
}

fn draw_level<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    mut v: VirtualAddress,
    n: u64,
    job: &mut DrawJob,
) -> Result<(), PagingError> {
    let mut remaining = n;
    while remaining > 0 {
        let i = level.index(v);
        let sub_n = remaining.min(level.pages_to_boundary(v));
        job.at = v;

        match level.next() {
            Some(next) if !job.fits_huge(level, sub_n) => {
                let child = descend(ctx, level, table, i, v, sub_n, job)?;
                draw_level(ctx, next, child, v, sub_n, job)?;
                let (count, summary) = child.summarize();
                table.set_summary(i, count, summary.unwrap_or(job.policy));
            }
            _ => {
                write_leaf(ctx, level, table, i, v, job)?;
                job.frame += sub_n * PAGE_SIZE;
            }
        }

        v = advance(v, sub_n);
        remaining -= sub_n;
    }
    Ok(())
}

fn write_leaf<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    i: usize,
    v: VirtualAddress,
    job: &DrawJob,
) -> Result<(), PagingError> {
    if table.is_occupied(i) {
        if job.flags.assert_blank() {
            return Err(PagingError::NotBlank(v));
        }
        release_slot(ctx, level, table, i)?;
    }
    let entry = job
        .prot
        .leaf(level, job.frame, job.policy, !job.flags.lazy());
    table.set(i, entry, job.policy);
    Ok(())
}

/// The table below slot `i`, created if missing. A huge leaf fully covered
/// by the draw is released to make room.
fn descend<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    i: usize,
    v: VirtualAddress,
    sub_n: u64,
    job: &DrawJob,
) -> Result<ExtendedPageTable<M>, PagingError> {
    let (entry, policy) = table.get(i);
    match policy {
        None => new_child(ctx, table, i, v, job),
        Some(MappingPolicy::Kernel) if job.policy != MappingPolicy::Kernel => {
            Err(PagingError::KernelSubtree(v))
        }
        Some(_) if entry.is_leaf(level) => {
            if sub_n != level.pages() || job.flags.assert_blank() {
                return Err(PagingError::HugePageSplit(v));
            }
            release_slot(ctx, level, table, i)?;
            new_child(ctx, table, i, v, job)
        }
        Some(_) => {
            if job.prot.user && !entry.user_access() {
                table.set_entry(i, entry.with_user_access(true));
            }
            Ok(table.child(i))
        }
    }
}

fn new_child<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    table: ExtendedPageTable<M>,
    i: usize,
    v: VirtualAddress,
    job: &DrawJob,
) -> Result<ExtendedPageTable<M>, PagingError> {
    let child =
        ExtendedPageTable::allocate(ctx.pool).map_err(|e| PagingError::table_alloc(e, v))?;
    table.set(
        i,
        PageEntryBits::table(child.physical_address(), job.prot.user),
        job.policy,
    );
    Ok(child)
}

fn erase_level<M: PhysMapper>(
    ctx: &mut Context<'_, M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    mut v: VirtualAddress,
    n: u64,
) -> Result<(), PagingError> {
    let mut remaining = n;
    let mut first_error = None;
    while remaining > 0 {
        let i = level.index(v);
        let sub_n = remaining.min(level.pages_to_boundary(v));

        if table.is_occupied(i) {
            let full = sub_n == level.pages();
            let result = match level.next() {
                Some(next) if !full && !table.entry(i).is_leaf(level) => {
                    let child = table.child(i);
                    let erased = erase_level(ctx, next, child, v, sub_n);
                    refresh(ctx.pool, table, i, child).and(erased)
                }
                _ if full => release_slot(ctx, level, table, i),
                _ => Err(PagingError::HugePageSplit(v)),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        v = advance(v, sub_n);
        remaining -= sub_n;
    }
    first_error.map_or(Ok(()), Err)
}

/// Recount the children of slot `i`; free the child table once it is empty.
fn refresh<M: PhysMapper>(
    pool: &mut PhysicalMemory<M>,
    table: ExtendedPageTable<M>,
    i: usize,
    child: ExtendedPageTable<M>,
) -> Result<(), PagingError> {
    match child.summarize() {
        (count, Some(summary)) => {
            table.set_summary(i, count, summary);
            Ok(())
        }
        (_, None) => {
            table.clear(i);
            Ok(child.free(pool)?)
        }
    }
}

/// Undo a failed draw of `[start, at)` without releasing any frame, then
/// drop tables left empty on the path to `at`.
fn rollback<M: PhysMapper>(
    pool: &mut PhysicalMemory<M>,
    top: ExtendedPageTable<M>,
    start: VirtualAddress,
    at: VirtualAddress,
) {
    let pages = (at - start) >> PAGE_SHIFT;
    if let Err(e) = forget_range(pool, PagingLevel::Pml4, top, start, pages) {
        warn!("rollback of {pages} pages at {start:?} failed: {e}");
    }
    if let Err(e) = prune_path(pool, PagingLevel::Pml4, top, at) {
        warn!("pruning tables at {at:?} failed: {e}");
    }
}

fn forget_range<M: PhysMapper>(
    pool: &mut PhysicalMemory<M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    mut v: VirtualAddress,
    n: u64,
) -> Result<(), PagingError> {
    let mut remaining = n;
    while remaining > 0 {
        let i = level.index(v);
        let sub_n = remaining.min(level.pages_to_boundary(v));
        if table.is_occupied(i) {
            match level.next() {
                Some(next) if sub_n != level.pages() && !table.entry(i).is_leaf(level) => {
                    let child = table.child(i);
                    forget_range(pool, next, child, v, sub_n)?;
                    refresh(pool, table, i, child)?;
                }
                _ => forget_slot(pool, level, table, i)?,
            }
        }
        v = advance(v, sub_n);
        remaining -= sub_n;
    }
    Ok(())
}

/// Vacate slot `i` without releasing frames. Tables below it are freed
/// unless they are shared kernel tables.
fn forget_slot<M: PhysMapper>(
    pool: &mut PhysicalMemory<M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    i: usize,
) -> Result<(), PagingError> {
    let (entry, policy) = table.get(i);
    table.clear(i);
    if policy == Some(MappingPolicy::Kernel) || entry.is_leaf(level) {
        return Ok(());
    }
    let Some(next) = level.next() else {
        return Ok(());
    };
    // SAFETY: the cleared slot pointed at a live table that nothing else
    // references any more.
    let child = unsafe { ExtendedPageTable::from_phys(entry.physical_address(), pool.mapper()) };
    for j in 0..ENTRIES {
        forget_slot(pool, next, child, j)?;
    }
    Ok(child.free(pool)?)
}

fn prune_path<M: PhysMapper>(
    pool: &mut PhysicalMemory<M>,
    level: PagingLevel,
    table: ExtendedPageTable<M>,
    v: VirtualAddress,
) -> Result<(), PagingError> {
    let i = level.index(v);
    let (entry, policy) = table.get(i);
    let Some(next) = level.next() else {
        return Ok(());
    };
    if policy.is_none() || entry.is_leaf(level) {
        return Ok(());
    }
    let child = table.child(i);
    prune_path(pool, next, child, v)?;
    refresh(pool, table, i, child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_frames::testing::PhysArena;
    use kernel_frames::{FrameOwner, HhdmPhysMapper};

    fn pool(frames: usize) -> (PhysArena, PhysicalMemory<HhdmPhysMapper>) {
        let arena = PhysArena::new(PhysicalAddress::new(0x800_0000), frames);
        let mut pm = PhysicalMemory::new(arena.mapper());
        pm.add_range(arena.base(), frames as u64).unwrap();
        (arena, pm)
    }

    const V: VirtualAddress = VirtualAddress::new(0x0000_0040_0000_0000);

    #[test]
    fn range_checks() {
        assert_eq!(
            check_range(VirtualAddress::new(0x1001), 1),
            Err(PagingError::Unaligned(0x1001))
        );
        assert!(check_range(VirtualAddress::new(0x0000_7FFF_FFFF_F000), 1).is_ok());
        assert!(matches!(
            check_range(VirtualAddress::new(0x0000_7FFF_FFFF_F000), 2),
            Err(PagingError::NonCanonical { .. })
        ));
        assert!(check_range(VirtualAddress::new(0xFFFF_FFFF_FFFF_F000), 1).is_ok());
    }

    #[test]
    fn lazy_draw_occupies_without_backing() {
        let (_arena, mut pm) = pool(64);
        let mut root = ExtendedPageTableRoot::new(&mut pm).unwrap();
        let flags = DrawFlags::new().with_lazy(true).with_assert_blank(true);
        let lazy = MappingPolicy::LazyAnonymous;
        root.draw(&mut pm, V, PhysicalAddress::zero(), 3, lazy, Protection::USER_RW, flags)
            .unwrap();

        assert_eq!(root.translate(V), None);
        assert_eq!(root.peek(V + 2 * PAGE_SIZE), Some(MappingPolicy::LazyAnonymous));
        assert_eq!(root.peek(V + 3 * PAGE_SIZE), None);
        assert_eq!(
            root.draw(
                &mut pm,
                V + PAGE_SIZE,
                PhysicalAddress::zero(),
                1,
                lazy,
                Protection::USER_RW,
                flags,
            ),
            Err(PagingError::NotBlank(V + PAGE_SIZE))
        );
        root.release_table(&mut pm).unwrap();
    }

    #[test]
    fn failed_draw_leaves_no_tables_behind() {
        // 8 frames: 1 metadata, 2 root, 2 PDPT, 2 PD; the PT cannot be allocated
        let (_arena, mut pm) = pool(8);
        let mut root = ExtendedPageTableRoot::new(&mut pm).unwrap();
        let before = pm.remaining();
        let frame = PhysicalAddress::new(0x800_0000);

        let kernel = MappingPolicy::Kernel;
        let err = root
            .draw(&mut pm, V, frame, 1, kernel, Protection::KERNEL_RW, DrawFlags::new())
            .unwrap_err();
        assert_eq!(err, PagingError::OutOfMemory(V));
        assert_eq!(pm.remaining(), before);
        assert!(!root.top().is_occupied(PagingLevel::Pml4.index(V)));
        root.release_table(&mut pm).unwrap();
    }

    #[test]
    fn mixing_into_shared_kernel_tables_is_refused() {
        let (_arena, mut pm) = pool(64);
        let mut kernel = ExtendedPageTableRoot::new(&mut pm).unwrap();
        let kv = VirtualAddress::new(0xFFFF_8000_0000_0000);
        let frame = pm.allocate(1, FrameOwner::Frames).unwrap();
        let flags = DrawFlags::new();
        kernel
            .draw(&mut pm, kv, frame, 1, MappingPolicy::Kernel, Protection::KERNEL_RW, flags)
            .unwrap();

        let mut user = ExtendedPageTableRoot::new(&mut pm).unwrap();
        user.share_kernel_half(&kernel);
        assert_eq!(user.translate(kv), Some(frame));
        assert_eq!(
            user.draw(
                &mut pm,
                kv + PAGE_SIZE,
                frame,
                1,
                MappingPolicy::Cow,
                Protection::KERNEL_RW,
                flags,
            ),
            Err(PagingError::KernelSubtree(kv + PAGE_SIZE))
        );

        // releasing the user space leaves the kernel's tables alone
        user.release_table(&mut pm).unwrap();
        assert_eq!(kernel.translate(kv), Some(frame));
        kernel.release_table(&mut pm).unwrap();
    }

    #[test]
    fn roots_format_with_their_page() {
        let (_arena, mut pm) = pool(16);
        let root = ExtendedPageTableRoot::new(&mut pm).unwrap();
        let text = format!("{root:?}");
        assert!(text.starts_with("ExtendedPageTableRoot"));
        assert!(text.contains(&format!("{:?}", root.root_page())));
        root.release_table(&mut pm).unwrap();
    }
}
