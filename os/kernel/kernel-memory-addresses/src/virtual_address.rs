use crate::memory_address::{MemoryAddress, typed_address};
use crate::page_size::PageSize;
use crate::virtual_page::VirtualPage;

/// Virtual memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **virtual** addresses.
/// It does not validate canonicality on construction; use
/// [`is_canonical`](Self::is_canonical) where it matters.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
/// let page = va.page::<Size4K>();
/// assert_eq!(page.base() + va.offset::<Size4K>(), va);
/// assert!(va.is_canonical());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(MemoryAddress);

typed_address!(VirtualAddress, "VA");

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(MemoryAddress::from_ptr(ptr))
    }

    /// The page of size `S` that contains this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing(self)
    }

    /// 9-bit page-table index selected by the bits starting at `shift`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_index(self, shift: u32) -> usize {
        ((self.as_u64() >> shift) & 0x1FF) as usize
    }

    /// Bits 63..48 replicate bit 47.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn is_canonical(self) -> bool {
        let v = self.as_u64();
        (((v << 16) as i64) >> 16) as u64 == v
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.as_usize() as *const T
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.as_usize() as *mut T
    }
}
