//! # Virtual memory space
//!
//! The bookkeeping half of an address space: which ranges of the managed
//! window are in use, with what rights and under which mapping policy. The
//! page tables are the other half; operations that change both take the
//! [`ExtendedPageTableRoot`] and the frame pool as arguments.
//!
//! Regions are backed lazily. Adding one draws occupied-but-not-present
//! entries, and frames only appear when the first access faults.

use crate::error::VmsError;
use crate::rbtree::{Iter, NodeId, RegionTree};
use crate::region::{RegionFlags, VirtualMemoryRegion};
use kernel_frames::{PhysMapper, PhysicalMemory};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{DrawFlags, ExtendedPageTableRoot, MappingPolicy};
use log::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct VirtualMemorySpace {
    tree: RegionTree,
    base: VirtualAddress,
    length: u64,
}

impl VirtualMemorySpace {
    /// An empty space managing `[base, base + length)`.
    ///
    /// # Errors
    /// Unaligned or empty windows, and windows wrapping the address space.
    pub fn new(base: VirtualAddress, length: u64) -> Result<Self, VmsError> {
        if !base.is_aligned_to(PAGE_SIZE) {
            return Err(VmsError::Unaligned(base.as_u64()));
        }
        if length % PAGE_SIZE != 0 {
            return Err(VmsError::Unaligned(length));
        }
        if length == 0 {
            return Err(VmsError::ZeroLength);
        }
        if base.checked_add(length).is_none() {
            return Err(VmsError::OutOfBounds { begin: base, length });
        }
        Ok(Self {
            tree: RegionTree::new(),
            base,
            length,
        })
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// First address past the window.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.length)
    }

    /// Number of regions.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.tree.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Reserve room for `additional` regions, so that the next inserts do
    /// not allocate.
    pub fn reserve(&mut self, additional: usize) {
        self.tree.reserve(additional);
    }

    #[must_use]
    pub const fn tree(&self) -> &RegionTree {
        &self.tree
    }

    fn check_range(&self, begin: VirtualAddress, length: u64) -> Result<(), VmsError> {
        if !begin.is_aligned_to(PAGE_SIZE) {
            return Err(VmsError::Unaligned(begin.as_u64()));
        }
        if length % PAGE_SIZE != 0 {
            return Err(VmsError::Unaligned(length));
        }
        if length == 0 {
            return Err(VmsError::ZeroLength);
        }
        match begin.checked_add(length) {
            Some(end) if begin >= self.base && end <= self.end() => Ok(()),
            _ => Err(VmsError::OutOfBounds { begin, length }),
        }
    }

    /// Record a region and draw it lazily into `root`.
    ///
    /// Nothing changes if the range overlaps an existing region or the draw
    /// fails.
    ///
    /// # Errors
    /// - [`VmsError::Overlap`] with the region in the way.
    /// - Range errors, and [`VmsError::Paging`] from the draw.
    #[allow(clippy::too_many_arguments)]
    pub fn add_region<M: PhysMapper>(
        &mut self,
        root: &mut ExtendedPageTableRoot<M>,
        pool: &mut PhysicalMemory<M>,
        begin: VirtualAddress,
        length: u64,
        flags: RegionFlags,
        policy: MappingPolicy,
    ) -> Result<VirtualMemoryRegion, VmsError> {
        self.check_range(begin, length)?;
        let region = VirtualMemoryRegion::new(begin, length, flags, policy);
        let id = self.tree.insert(region).map_err(|existing| {
            let existing = *self.tree.get(existing);
            warn!("region {region:?} rejected, overlaps {existing:?}");
            VmsError::Overlap(existing)
        })?;

        let lazy = DrawFlags::new().with_lazy(true).with_assert_blank(true);
        if let Err(e) = root.draw(
            pool,
            begin,
            PhysicalAddress::zero(),
            region.pages(),
            policy,
            flags.protection(),
            lazy,
        ) {
            warn!("drawing region {region:?} failed: {e}");
            self.tree.remove(id);
            return Err(e.into());
        }
        debug!("region {region:?} added");
        Ok(region)
    }

    /// The region containing `addr`.
    #[must_use]
    pub fn get_region(&self, addr: VirtualAddress) -> Option<&VirtualMemoryRegion> {
        self.tree.search(addr).map(|id| self.tree.get(id))
    }

    /// All regions in address order.
    #[must_use]
    pub fn regions(&self) -> Iter<'_> {
        self.tree.iter()
    }

    /// The region below the one containing `addr`.
    #[must_use]
    pub fn prev_region(&self, addr: VirtualAddress) -> Option<&VirtualMemoryRegion> {
        let id = self.tree.search(addr)?;
        self.tree.predecessor(id).map(|id| self.tree.get(id))
    }

    /// The region above the one containing `addr`.
    #[must_use]
    pub fn next_region(&self, addr: VirtualAddress) -> Option<&VirtualMemoryRegion> {
        let id = self.tree.search(addr)?;
        self.tree.successor(id).map(|id| self.tree.get(id))
    }

    /// Lowest free range of `length` bytes at or above `prefer` (or the
    /// window start). A `prefer` that finds nothing falls back to a search
    /// of the whole window.
    #[must_use]
    pub fn get_first_fit(
        &self,
        prefer: Option<VirtualAddress>,
        length: u64,
    ) -> Option<VirtualAddress> {
        if length == 0 || length % PAGE_SIZE != 0 {
            return None;
        }
        let hint = prefer
            .filter(|p| p.is_aligned_to(PAGE_SIZE) && *p >= self.base && *p < self.end());
        match hint {
            Some(p) => self.fit_from(p, length).or_else(|| self.fit_from(self.base, length)),
            None => self.fit_from(self.base, length),
        }
    }

    fn fit_from(&self, start: VirtualAddress, length: u64) -> Option<VirtualAddress> {
        let mut cursor = start;
        let mut next = self.tree.lower_bound(cursor);
        loop {
            let gap_end = next.map_or(self.end(), |id| self.tree.get(id).begin());
            if gap_end >= cursor && gap_end - cursor >= length {
                return Some(cursor);
            }
            let id = next?;
            cursor = cursor.max(self.tree.get(id).end());
            next = self.tree.successor(id);
        }
    }

    /// Forget the region containing `addr` and erase its mappings.
    ///
    /// # Errors
    /// [`VmsError::NotFound`], or the failure of the erase (the region is
    /// gone either way).
    pub fn remove_region<M: PhysMapper>(
        &mut self,
        root: &mut ExtendedPageTableRoot<M>,
        pool: &mut PhysicalMemory<M>,
        addr: VirtualAddress,
    ) -> Result<VirtualMemoryRegion, VmsError> {
        let id = self.tree.search(addr).ok_or(VmsError::NotFound(addr))?;
        let region = self.tree.remove(id);
        root.erase(pool, region.begin(), region.pages())?;
        debug!("region {region:?} removed");
        Ok(region)
    }

    /// Cut the region containing `ptr` in two at `ptr`. Both halves keep the
    /// flags and policy; the mappings are untouched. Returns the upper half,
    /// or `None` if `ptr` already starts a region.
    ///
    /// # Errors
    /// [`VmsError::Unaligned`], [`VmsError::NotFound`].
    pub fn split(&mut self, ptr: VirtualAddress) -> Result<Option<VirtualMemoryRegion>, VmsError> {
        if !ptr.is_aligned_to(PAGE_SIZE) {
            return Err(VmsError::Unaligned(ptr.as_u64()));
        }
        let id = self.tree.search(ptr).ok_or(VmsError::NotFound(ptr))?;
        let region = *self.tree.get(id);
        if ptr == region.begin() {
            return Ok(None);
        }
        let upper = region.with_range(ptr, region.end() - ptr);
        self.tree.get_mut(id).set_range(region.begin(), ptr - region.begin());
        self.insert_or_restore(id, region, upper)?;
        Ok(Some(upper))
    }

    /// Insert `upper`, split off the region `id` used to be. On failure the
    /// region is restored to `original`.
    fn insert_or_restore(
        &mut self,
        id: NodeId,
        original: VirtualMemoryRegion,
        upper: VirtualMemoryRegion,
    ) -> Result<NodeId, VmsError> {
        self.tree.insert(upper).map_err(|existing| {
            let existing = *self.tree.get(existing);
            self.tree
                .get_mut(id)
                .set_range(original.begin(), original.length());
            warn!("split of {original:?} collided with {existing:?}");
            VmsError::Overlap(existing)
        })
    }

    /// Remove `[begin, begin + length)` from the space. Regions inside the
    /// range disappear, regions overlapping one edge shrink, and a region
    /// spanning the whole range is split around it. Exactly the erased
    /// range is unmapped.
    ///
    /// # Errors
    /// Range errors, or the failure of the page table erase.
    pub fn erase<M: PhysMapper>(
        &mut self,
        root: &mut ExtendedPageTableRoot<M>,
        pool: &mut PhysicalMemory<M>,
        begin: VirtualAddress,
        length: u64,
    ) -> Result<(), VmsError> {
        self.check_range(begin, length)?;
        let end = begin + length;

        let mut cursor = self.tree.lower_bound(begin);
        while let Some(id) = cursor {
            let region = *self.tree.get(id);
            if region.begin() >= end {
                break;
            }
            cursor = self.tree.successor(id);

            match (region.begin() < begin, region.end() > end) {
                (false, false) => {
                    self.tree.remove(id);
                }
                (true, false) => {
                    self.tree
                        .get_mut(id)
                        .set_range(region.begin(), begin - region.begin());
                }
                (false, true) => {
                    self.tree.get_mut(id).set_range(end, region.end() - end);
                }
                (true, true) => {
                    let upper = region.with_range(end, region.end() - end);
                    self.tree
                        .get_mut(id)
                        .set_range(region.begin(), begin - region.begin());
                    self.insert_or_restore(id, region, upper)?;
                }
            }
        }

        root.erase(pool, begin, length >> PAGE_SHIFT)?;
        debug!("erased {length:#x} bytes at {begin:?}");
        Ok(())
    }

    /// Take over the regions of `src`, for a forked address space whose
    /// page tables were copied separately.
    ///
    /// # Errors
    /// [`VmsError::NotEmpty`] if this space already has regions.
    pub fn copy_from(&mut self, src: &Self) -> Result<(), VmsError> {
        if !self.is_empty() {
            return Err(VmsError::NotEmpty);
        }
        self.tree = src.tree.clone();
        self.base = src.base;
        self.length = src.length;
        info!("copied {} regions", self.len());
        Ok(())
    }

    /// Remove every region and its mappings.
    ///
    /// # Errors
    /// The first erase failure; all regions are removed regardless.
    pub fn clear<M: PhysMapper>(
        &mut self,
        root: &mut ExtendedPageTableRoot<M>,
        pool: &mut PhysicalMemory<M>,
    ) -> Result<(), VmsError> {
        let mut first_error = None;
        while let Some(id) = self.tree.first() {
            let region = self.tree.remove(id);
            if let Err(e) = root.erase(pool, region.begin(), region.pages()) {
                warn!("erasing {region:?} failed: {e}");
                first_error.get_or_insert(VmsError::from(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x40_0000;

    fn space_with(regions: &[(u64, u64)]) -> VirtualMemorySpace {
        let mut space = VirtualMemorySpace::new(VirtualAddress::new(BASE), 64 * PAGE_SIZE).unwrap();
        for &(page, pages) in regions {
            let region = VirtualMemoryRegion::new(
                VirtualAddress::new(BASE + page * PAGE_SIZE),
                pages * PAGE_SIZE,
                RegionFlags::USER_DATA,
                MappingPolicy::LazyAnonymous,
            );
            space.tree.insert(region).unwrap();
        }
        space
    }

    fn page(n: u64) -> VirtualAddress {
        VirtualAddress::new(BASE + n * PAGE_SIZE)
    }

    #[test]
    fn first_fit_walks_the_gaps() {
        let space = space_with(&[(0, 2), (4, 4), (10, 50)]);
        assert_eq!(space.get_first_fit(None, PAGE_SIZE), Some(page(2)));
        assert_eq!(space.get_first_fit(None, 2 * PAGE_SIZE), Some(page(2)));
        assert_eq!(space.get_first_fit(None, 3 * PAGE_SIZE), Some(page(60)));
        assert_eq!(space.get_first_fit(None, 5 * PAGE_SIZE), None);

        // a free hint is taken as is, a busy one moves up
        assert_eq!(space.get_first_fit(Some(page(8)), PAGE_SIZE), Some(page(8)));
        assert_eq!(space.get_first_fit(Some(page(5)), PAGE_SIZE), Some(page(8)));
        // nothing above the hint: start over from the bottom
        assert_eq!(space.get_first_fit(Some(page(63)), 2 * PAGE_SIZE), Some(page(2)));
        assert_eq!(space.get_first_fit(None, 0x800), None);
    }

    #[test]
    fn first_fit_in_an_empty_space() {
        let space = space_with(&[]);
        assert_eq!(space.get_first_fit(None, 64 * PAGE_SIZE), Some(page(0)));
        assert_eq!(space.get_first_fit(None, 65 * PAGE_SIZE), None);
    }

    #[test]
    fn split_keeps_attributes() {
        let mut space = space_with(&[(4, 8)]);
        let upper = space.split(page(6)).unwrap().unwrap();
        assert_eq!(upper.begin(), page(6));
        assert_eq!(upper.length(), 6 * PAGE_SIZE);
        assert_eq!(upper.policy(), MappingPolicy::LazyAnonymous);
        assert_eq!(space.get_region(page(5)).unwrap().end(), page(6));
        assert_eq!(space.len(), 2);

        assert_eq!(space.split(page(6)), Ok(None));
        assert_eq!(space.split(page(20)), Err(VmsError::NotFound(page(20))));
        assert_eq!(space.prev_region(page(7)).unwrap().begin(), page(4));
        assert_eq!(space.next_region(page(4)).unwrap().begin(), page(6));
    }

    #[test]
    fn copy_requires_an_empty_target() {
        let src = space_with(&[(0, 1), (3, 1)]);
        let mut dst = VirtualMemorySpace::new(VirtualAddress::new(BASE), PAGE_SIZE).unwrap();
        dst.copy_from(&src).unwrap();
        assert_eq!(dst.len(), 2);
        assert_eq!(dst.end(), src.end());
        assert_eq!(dst.copy_from(&src), Err(VmsError::NotEmpty));
    }
}
