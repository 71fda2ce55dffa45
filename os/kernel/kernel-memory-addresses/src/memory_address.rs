use crate::page_size::PageSize;
use core::fmt;

/// Align `x` down to a multiple of `align` (power of two).
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Align `x` up to a multiple of `align` (power of two).
///
/// Returns `None` if the result does not fit into a `u64`.
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Whether `x` is a multiple of `align` (power of two).
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, align: u64) -> bool {
    x & (align - 1) == 0
}

/// Principal raw memory address
/// ([virtual](crate::VirtualAddress) or [physical](crate::PhysicalAddress)).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u64);

impl MemoryAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        const _: () = assert!(
            size_of::<*const ()>() == size_of::<u64>(),
            "pointer size mismatch"
        );
        Self(ptr.addr() as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Align down to page boundary `S`.
    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(align_down(self.0, S::SIZE))
    }

    /// Align up to page boundary `S`, `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Option<Self> {
        match align_up(self.0, S::SIZE) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        is_aligned(self.0, S::SIZE)
    }

    /// Offset within the `S` page containing this address.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// Implements the arithmetic and formatting shared by the typed wrappers.
macro_rules! typed_address {
    ($name:ident, $tag:literal) => {
        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self($crate::MemoryAddress::new(value))
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self::new(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0.as_u64()
            }

            #[inline]
            #[must_use]
            #[allow(clippy::cast_possible_truncation)]
            pub const fn as_usize(self) -> usize {
                self.0.as_u64() as usize
            }

            #[inline]
            #[must_use]
            pub const fn raw(self) -> $crate::MemoryAddress {
                self.0
            }

            #[inline]
            #[must_use]
            pub const fn align_down<S: $crate::PageSize>(self) -> Self {
                Self(self.0.align_down::<S>())
            }

            #[inline]
            #[must_use]
            pub const fn align_up<S: $crate::PageSize>(self) -> Option<Self> {
                match self.0.align_up::<S>() {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned<S: $crate::PageSize>(self) -> bool {
                self.0.is_aligned::<S>()
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned_to(self, align: u64) -> bool {
                $crate::is_aligned(self.0.as_u64(), align)
            }

            #[inline]
            #[must_use]
            pub const fn offset<S: $crate::PageSize>(self) -> u64 {
                self.0.offset::<S>()
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.as_u64())
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl core::ops::Add<u64> for $name {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u64) -> Self {
                Self::new(self.as_u64() + rhs)
            }
        }

        impl core::ops::AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                *self = *self + rhs;
            }
        }

        impl core::ops::Sub<u64> for $name {
            type Output = Self;
            #[inline]
            fn sub(self, rhs: u64) -> Self {
                Self::new(self.as_u64() - rhs)
            }
        }

        /// Distance in bytes between two addresses of the same kind.
        impl core::ops::Sub<$name> for $name {
            type Output = u64;
            #[inline]
            fn sub(self, rhs: Self) -> u64 {
                self.as_u64() - rhs.as_u64()
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self::new(v)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(a: $name) -> Self {
                a.as_u64()
            }
        }
    };
}

pub(crate) use typed_address;
