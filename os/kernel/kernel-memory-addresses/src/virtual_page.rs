use crate::page_size::PageSize;
use crate::virtual_address::VirtualAddress;
use core::fmt;
use core::marker::PhantomData;

/// Virtual memory page base for size `S`.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0x0000_0040_0020_1000);
/// let vp = va.page::<Size2M>();
/// assert_eq!(vp.base().as_u64(), 0x0000_0040_0020_0000);
/// assert_eq!(vp.next().base().as_u64(), 0x0000_0040_0040_0000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    /// Page that contains `va` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtualAddress) -> Self {
        Self {
            base: va.align_down::<S>().as_u64(),
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    /// The page directly after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            base: self.base + S::SIZE,
            _size: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>({:#018X})", S::LABEL, self.base)
    }
}

impl<S: PageSize> fmt::Display for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.base, S::LABEL)
    }
}

impl<S: PageSize> From<VirtualPage<S>> for VirtualAddress {
    #[inline]
    fn from(page: VirtualPage<S>) -> Self {
        page.base()
    }
}
