//! # Paging levels
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```

use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress};

/// One of the four x86-64 translation levels, from the root down.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PagingLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl PagingLevel {
    /// Bit position of this level's 9-bit index.
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Index of the entry covering `va` in a table of this level.
    #[inline]
    #[must_use]
    pub const fn index(self, va: VirtualAddress) -> usize {
        va.table_index(self.shift())
    }

    /// Bytes covered by one entry (512 GiB, 1 GiB, 2 MiB, 4 KiB).
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    /// Base pages covered by one entry.
    #[inline]
    #[must_use]
    pub const fn pages(self) -> u64 {
        self.span() >> PAGE_SHIFT
    }

    /// Frames backing a leaf at this level.
    #[inline]
    #[must_use]
    pub const fn frames(self) -> usize {
        self.pages() as usize
    }

    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Levels whose entries can map a 1 GiB or 2 MiB page directly.
    #[must_use]
    pub const fn allows_huge(self) -> bool {
        matches!(self, Self::Pdpt | Self::Pd)
    }

    /// Base pages from `va` up to the end of the entry containing it.
    #[inline]
    #[must_use]
    pub const fn pages_to_boundary(self, va: VirtualAddress) -> u64 {
        (self.span() - (va.as_u64() & (self.span() - 1))) >> PAGE_SHIFT
    }
}
