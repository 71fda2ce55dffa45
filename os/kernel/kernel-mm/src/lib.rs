//! # Kernel Memory Manager
//!
//! Ties the memory crates together behind one [`MemoryManager`]:
//!
//! ```text
//!            MemoryManager
//!   ┌──────────┬────────┴──┬───────────────┐
//!   │ frames   │ heaps     │ kernel root   │  AddressSpace (per process)
//!   │ Physical │ Kernel-   │ ExtendedPage- │  ┌─────────────────────────┐
//!   │ Memory   │ Heap +    │ TableRoot     │  │ ExtendedPageTableRoot   │
//!   │          │ boot heap │               │  │ VirtualMemorySpace      │
//!   └──────────┴───────────┴───────────────┘  └─────────────────────────┘
//! ```
//!
//! The kernel keeps its instance in [`GLOBAL`]; host tests build their own
//! on simulated RAM.
//!
//! ## Example
//!
//! ```rust
//! # use kernel_frames::testing::PhysArena;
//! # use kernel_memory_addresses::{PhysicalAddress, PAGE_SIZE};
//! # use kernel_mm::{MemoryConfig, MemoryManager, PhysicalRange};
//! # use kernel_vmem::MappingPolicy;
//! # use kernel_vms::RegionFlags;
//! let ram = PhysArena::new(PhysicalAddress::new(0x100_0000), 256);
//! let ranges = [PhysicalRange::new(ram.base(), 256)];
//! let config = MemoryConfig::new(ram.mapper(), &ranges).with_boot_heap_size(0);
//! let mut mm = MemoryManager::new(config).unwrap();
//!
//! let mut space = mm.create_address_space().unwrap();
//! let region = mm
//!     .mmap(&mut space, None, 3 * PAGE_SIZE, RegionFlags::USER_DATA, MappingPolicy::LazyAnonymous)
//!     .unwrap();
//! assert_eq!(region.pages(), 3);
//! mm.release(space).unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

mod config;
mod error;
mod global;
mod manager;

pub use crate::config::{MemoryConfig, PhysicalRange};
pub use crate::error::{ErrorKind, MemError};
pub use crate::global::{
    GLOBAL, GlobalMemory, KernelMemoryManager, init_global, teardown_global, with_global,
};
pub use crate::manager::{AddressSpace, BOOT_HEAP_TAG, MemoryManager, MemoryStats};
