use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the x86-64 page granularities.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + Ord + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
    /// Number of 4 KiB frames backing one page of this size.
    const FRAMES: u64 = Self::SIZE >> 12;
    /// Short label used in diagnostics.
    const LABEL: &'static str;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const LABEL: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::LABEL)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }
    };
}

page_size!(
    /// 4 KiB page, mapped by a PT entry. Also the frame granularity.
    Size4K,
    12,
    "4K"
);

page_size!(
    /// 2 MiB page, mapped by a PD entry with `PS=1`.
    Size2M,
    21,
    "2M"
);

page_size!(
    /// 1 GiB page, mapped by a PDPT entry with `PS=1`.
    Size1G,
    30,
    "1G"
);

const _: () = {
    assert!(Size4K::SIZE == 4096);
    assert!(Size2M::FRAMES == 512);
    assert!(Size1G::FRAMES == 512 * 512);
};
