//! # Extended page table
//!
//! A hardware page table paired with a parallel table of software
//! bookkeeping, allocated together as one order-1 block:
//!
//! ```text
//!  base                      base + 4 KiB                 base + 8 KiB
//!  | 512 × PageEntryBits      | 512 × ExtraEntry (4 B each) ... unused |
//!    ▲ what CR3 / parent
//!      entries point to
//! ```
//!
//! Because the extra table sits at a fixed offset from the hardware table,
//! walking the hardware entries is enough to reach the bookkeeping of every
//! level.

use crate::level::PagingLevel;
use crate::page_entry_bits::PageEntryBits;
use crate::policy::MappingPolicy;
use kernel_frames::{FrameError, FrameOwner, PhysMapper, PhysicalMemory};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use log::trace;

/// Entries per table.
pub const ENTRIES: usize = 512;

/// Software side of one page table entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ExtraEntry {
    /// Occupied entries in the child table (zero for leaves).
    pub child_count: u16,
    policy: u8,
    reserved: u8,
}

const _: () = assert!(size_of::<ExtraEntry>() * ENTRIES <= PAGE_SIZE as usize);

impl ExtraEntry {
    #[must_use]
    pub const fn new(child_count: u16, policy: MappingPolicy) -> Self {
        Self {
            child_count,
            policy: policy.slot(),
            reserved: 0,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> Option<MappingPolicy> {
        MappingPolicy::from_slot(self.policy)
    }
}

/// Handle to an extended page table in physical memory.
///
/// Handles are plain values; copying one does not copy the table. The
/// accessors read and write the table through the physical mapper, so the
/// table must stay allocated for as long as a handle is used.
#[derive(Copy, Clone, Debug)]
pub struct ExtendedPageTable<M: PhysMapper> {
    base: PhysicalAddress,
    mapper: M,
}

impl<M: PhysMapper> ExtendedPageTable<M> {
    /// Frames occupied by one extended table.
    pub const FRAMES: usize = 2;

    /// Allocate a zeroed (all vacant) table.
    ///
    /// # Errors
    /// Whatever the frame pool reports.
    pub fn allocate(pool: &mut PhysicalMemory<M>) -> Result<Self, FrameError> {
        let base = pool.allocate_zeroed(Self::FRAMES, FrameOwner::Frames)?;
        trace!("extended page table allocated at {base:?}");
        Ok(Self {
            base,
            mapper: pool.mapper(),
        })
    }

    /// Return the table's frames to the pool. Entries are not looked at.
    ///
    /// # Errors
    /// Whatever the frame pool reports.
    pub fn free(self, pool: &mut PhysicalMemory<M>) -> Result<(), FrameError> {
        trace!("extended page table freed at {:?}", self.base);
        pool.free(self.base, Self::FRAMES, FrameOwner::Frames)
    }

    /// # Safety
    /// `base` must be the hardware half of a live extended table.
    pub(crate) const unsafe fn from_phys(base: PhysicalAddress, mapper: M) -> Self {
        Self { base, mapper }
    }

    /// Physical address of the hardware table.
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        self.base
    }

    fn entry_ptr(&self, i: usize) -> *mut PageEntryBits {
        assert!(i < ENTRIES);
        // SAFETY: in bounds of the 4 KiB hardware table.
        unsafe { self.mapper.phys_to_ptr::<PageEntryBits>(self.base).add(i) }
    }

    fn extra_ptr(&self, i: usize) -> *mut ExtraEntry {
        assert!(i < ENTRIES);
        // SAFETY: the extra table is the frame right after the hardware table.
        unsafe {
            self.mapper
                .phys_to_ptr::<ExtraEntry>(self.base + PAGE_SIZE)
                .add(i)
        }
    }

    /// Hardware entry and policy of slot `i`. The policy is `None` for
    /// vacant slots.
    #[must_use]
    pub fn get(&self, i: usize) -> (PageEntryBits, Option<MappingPolicy>) {
        (self.entry(i), self.extra(i).policy())
    }

    #[must_use]
    pub fn entry(&self, i: usize) -> PageEntryBits {
        // SAFETY: the table is live (see type docs).
        unsafe { self.entry_ptr(i).read_volatile() }
    }

    #[must_use]
    pub fn extra(&self, i: usize) -> ExtraEntry {
        // SAFETY: as above.
        unsafe { self.extra_ptr(i).read() }
    }

    /// Occupy slot `i`. The child count starts at zero.
    pub fn set(&self, i: usize, entry: PageEntryBits, policy: MappingPolicy) {
        self.set_raw(i, entry, ExtraEntry::new(0, policy));
    }

    /// Write both halves of slot `i` verbatim.
    pub fn set_raw(&self, i: usize, entry: PageEntryBits, extra: ExtraEntry) {
        // SAFETY: the table is live (see type docs).
        unsafe {
            self.extra_ptr(i).write(extra);
            self.entry_ptr(i).write_volatile(entry);
        }
    }

    /// Replace the hardware entry, keeping the bookkeeping.
    pub fn set_entry(&self, i: usize, entry: PageEntryBits) {
        // SAFETY: as above.
        unsafe { self.entry_ptr(i).write_volatile(entry) }
    }

    /// Record the child count and policy summary of a table entry.
    pub fn set_summary(&self, i: usize, child_count: u16, policy: MappingPolicy) {
        // SAFETY: as above.
        unsafe { self.extra_ptr(i).write(ExtraEntry::new(child_count, policy)) }
    }

    /// Make slot `i` vacant.
    pub fn clear(&self, i: usize) {
        self.set_raw(i, PageEntryBits::new(), ExtraEntry::default());
    }

    /// A slot is occupied when it carries a policy. Lazily drawn leaves are
    /// occupied without being present.
    #[must_use]
    pub fn is_occupied(&self, i: usize) -> bool {
        self.extra(i).policy().is_some()
    }

    /// The next-level table referenced by the table entry in slot `i`.
    #[must_use]
    pub fn child(&self, i: usize) -> Self {
        // SAFETY: occupied table entries always point at live extended
        // tables allocated through `allocate`.
        unsafe { Self::from_phys(self.entry(i).physical_address(), self.mapper) }
    }

    /// Occupied slots and the combined policy of this table: `None` when
    /// empty, the common policy when all slots agree, [`MappingPolicy::Mixed`]
    /// otherwise.
    #[must_use]
    pub fn summarize(&self) -> (u16, Option<MappingPolicy>) {
        let mut count = 0u16;
        let mut summary = None;
        for i in 0..ENTRIES {
            let Some(policy) = self.extra(i).policy() else {
                continue;
            };
            count += 1;
            summary = match summary {
                None => Some(policy),
                Some(p) if p == policy && p != MappingPolicy::Mixed => Some(p),
                Some(_) => Some(MappingPolicy::Mixed),
            };
        }
        (count, summary)
    }

    /// Whether the entry in slot `i` maps memory at `level`.
    #[must_use]
    pub fn is_leaf(&self, level: PagingLevel, i: usize) -> bool {
        self.entry(i).is_leaf(level)
    }
}
