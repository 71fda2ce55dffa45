//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses handled by the memory
//! management crates: physical frame addresses handed out by the frame
//! allocator, and virtual addresses walked by the page table code.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`MemoryAddress`] | A raw 64-bit address with alignment helpers. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory (RAM frames, page tables). |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Page-table translated memory. |
//!
//! Page granularity is carried at the type level through [`PageSize`]
//! markers: [`Size4K`], [`Size2M`] and [`Size1G`].
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_7FFF_0020_1234);
//! assert_eq!(va.page::<Size4K>().base().as_u64(), 0x0000_7FFF_0020_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! assert_eq!(va.table_index(12), 0x001);
//!
//! let pa = PhysicalAddress::new(0x0040_0000);
//! assert!(pa.is_aligned::<Size2M>());
//! assert_eq!(pa.frame_number(), 0x400);
//! ```
//!
//! All types are `#[repr(transparent)]` over `u64`, `Copy`, ordered and
//! hashable, so they can be used as tree keys and stored inside page-table
//! bookkeeping without overhead.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use crate::memory_address::{MemoryAddress, align_down, align_up, is_aligned};
pub use crate::page_size::{PageSize, Size1G, Size2M, Size4K};
pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::PhysicalPage;
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;

/// Size of the base page (and of a physical frame) in bytes.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = Size4K::SHIFT;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_and_offset_round_trip() {
        let va = VirtualAddress::new(0x1234_5678_9ABC_DEF0);
        let page = va.page::<Size4K>();
        assert_eq!(page.base().as_u64() & 0xFFF, 0);
        assert_eq!(page.base() + va.offset::<Size4K>(), va);

        let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
        let big = pa.page::<Size2M>();
        assert_eq!(big.base().as_u64(), 0x0000_0008_1220_0000);
        assert_eq!(big.base() + pa.offset::<Size2M>(), pa);

        let giant = pa.page::<Size1G>();
        assert_eq!(giant.base().as_u64(), 0x0000_0008_0000_0000);
    }

    #[test]
    fn byte_alignment_helpers() {
        assert_eq!(align_down(0x12345, 0x1000), 0x12000);
        assert_eq!(align_up(0x12345, 0x1000), Some(0x13000));
        assert_eq!(align_up(0x13000, 0x1000), Some(0x13000));
        assert_eq!(align_up(u64::MAX - 3, 16), None);
        assert!(is_aligned(0x4000, 0x4000));
        assert!(!is_aligned(0x6000, 0x4000));
    }

    #[test]
    fn typed_alignment_helpers() {
        let va = VirtualAddress::new(0x20_1000);
        assert!(va.is_aligned::<Size4K>());
        assert!(!va.is_aligned::<Size2M>());
        assert_eq!(va.align_down::<Size2M>(), VirtualAddress::new(0x20_0000));
        assert_eq!(va.align_up::<Size2M>(), Some(VirtualAddress::new(0x40_0000)));
    }

    #[test]
    fn table_indices_follow_the_four_level_split() {
        // PML4 = 1, PDPT = 2, PD = 3, PT = 4, offset = 5
        let va = VirtualAddress::new((1 << 39) | (2 << 30) | (3 << 21) | (4 << 12) | 5);
        assert_eq!(va.table_index(39), 1);
        assert_eq!(va.table_index(30), 2);
        assert_eq!(va.table_index(21), 3);
        assert_eq!(va.table_index(12), 4);
    }

    #[test]
    fn distance_between_addresses() {
        let a = PhysicalAddress::new(0x10_0000);
        let b = a + 5 * PAGE_SIZE;
        assert_eq!(b - a, 5 * PAGE_SIZE);
        assert_eq!(b.frame_number() - a.frame_number(), 5);
        assert_eq!(PhysicalAddress::from_frame_number(b.frame_number()), b);
    }

    #[test]
    fn debug_formatting_marks_the_address_kind() {
        assert_eq!(
            format!("{:?}", PhysicalAddress::new(0x1000)),
            "PA(0x0000000000001000)"
        );
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x2000)),
            "VA(0x0000000000002000)"
        );
    }
}
