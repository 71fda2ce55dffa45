//! # Physical memory access
//!
//! The allocators keep their bookkeeping (free-list links, frame metadata,
//! page tables) inside physical frames. Code can only dereference virtual
//! addresses, so every such access goes through a [`PhysMapper`].
//!
//! With a higher-half direct map (HHDM) every physical address is mapped at
//! `HHDM_BASE + pa`; [`HhdmPhysMapper`] simply adds that offset. Tests use
//! the same mapper with an offset that points into a host buffer standing in
//! for RAM, so the production code path is exercised unchanged.

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Converts physical addresses to usable pointers in the current address
/// space and back.
///
/// Mappers are plain values (`Copy`) so that every allocator can hold its own.
pub trait PhysMapper: Copy {
    /// Pointer through which the bytes at `pa` can be accessed.
    fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> *mut T;

    /// Inverse of [`phys_to_ptr`](Self::phys_to_ptr) for pointers inside the
    /// mapped window.
    fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress;

    /// Borrow the object at `pa`.
    ///
    /// # Safety
    /// - `pa` must be mapped, writable and hold a valid `T`.
    /// - The caller must ensure no other reference to the same bytes is live
    ///   for `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: forwarded to the caller.
        unsafe { &mut *self.phys_to_ptr::<T>(pa) }
    }
}

/// [`PhysMapper`] implementation for kernels with a higher-half direct map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::kernel()
    }
}

impl HhdmPhysMapper {
    /// The kernel's direct map at [`HHDM_BASE`].
    #[must_use]
    pub const fn kernel() -> Self {
        Self { offset: HHDM_BASE }
    }

    /// A direct map at an arbitrary offset. Addresses wrap around, which
    /// lets a low host buffer stand in for high physical addresses.
    #[must_use]
    pub const fn with_offset(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> *mut T {
        pa.as_u64().wrapping_add(self.offset) as usize as *mut T
    }

    #[inline]
    fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(va.as_u64().wrapping_sub(self.offset))
    }
}
