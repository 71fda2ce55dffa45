use crate::memory_address::{MemoryAddress, typed_address};
use crate::page_size::{PageSize, Size4K};
use crate::physical_page::PhysicalPage;

/// Physical memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **physical** addresses
/// (RAM frames, page-table frames). Carries intent only; the kernel reaches the
/// bytes behind it through a physical mapper.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
/// assert_eq!(pa.page::<Size4K>().base().as_u64(), 0x0000_0010_2000_0000);
/// assert_eq!(pa.offset::<Size4K>(), 0x42);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(MemoryAddress);

typed_address!(PhysicalAddress, "PA");

impl PhysicalAddress {
    /// The page of size `S` that contains this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::containing(self)
    }

    /// Index of the 4 KiB frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.as_u64() >> Size4K::SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn from_frame_number(frame: u64) -> Self {
        Self::new(frame << Size4K::SHIFT)
    }
}
