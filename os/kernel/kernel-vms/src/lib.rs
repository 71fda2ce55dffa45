//! # Virtual Memory Regions
//!
//! Per address space bookkeeping of which virtual ranges are in use.
//!
//! - [`VirtualMemoryRegion`]: a page-aligned range with [`RegionFlags`] and a
//!   [`MappingPolicy`](kernel_vmem::MappingPolicy).
//! - [`RegionTree`]: red-black tree of non-overlapping regions.
//! - [`VirtualMemorySpace`]: the regions of one address space inside a
//!   managed window, kept in step with its page tables.
//!
//! ## Example
//!
//! ```rust
//! # use kernel_frames::testing::PhysArena;
//! # use kernel_frames::PhysicalMemory;
//! # use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
//! # use kernel_vmem::{ExtendedPageTableRoot, MappingPolicy};
//! # use kernel_vms::{RegionFlags, VirtualMemorySpace};
//! let ram = PhysArena::new(PhysicalAddress::new(0x100_0000), 64);
//! let mut pool = PhysicalMemory::new(ram.mapper());
//! pool.add_range(ram.base(), 64).unwrap();
//! let mut root = ExtendedPageTableRoot::new(&mut pool).unwrap();
//!
//! let mut space = VirtualMemorySpace::new(VirtualAddress::new(0x40_0000), 0x10_0000).unwrap();
//! let at = space.get_first_fit(None, 4 * PAGE_SIZE).unwrap();
//! space
//!     .add_region(
//!         &mut root,
//!         &mut pool,
//!         at,
//!         4 * PAGE_SIZE,
//!         RegionFlags::USER_DATA,
//!         MappingPolicy::LazyAnonymous,
//!     )
//!     .unwrap();
//! assert!(space.get_region(at + 3 * PAGE_SIZE).is_some());
//!
//! space.clear(&mut root, &mut pool).unwrap();
//! root.release_table(&mut pool).unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod error;
mod rbtree;
mod region;
mod space;

pub use crate::error::VmsError;
pub use crate::rbtree::{Iter, NodeId, RegionTree};
pub use crate::region::{RegionFlags, VirtualMemoryRegion};
pub use crate::space::VirtualMemorySpace;
