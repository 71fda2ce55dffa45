//! # Virtual Memory Support
//!
//! x86-64 four-level paging with per-mapping bookkeeping.
//!
//! ## What you get
//! - [`PageEntryBits`]: the raw 64-bit entry as a bitfield.
//! - [`PagingLevel`]: index/span arithmetic of the four levels.
//! - [`ExtendedPageTable`]: a hardware table plus a parallel table recording,
//!   per entry, the [`MappingPolicy`] and the number of occupied children.
//! - [`MappingPolicy`]: what forking, faulting and unmapping do to an entry
//!   (shared, private, copy-on-write, lazily backed).
//! - [`ExtendedPageTableRoot`]: one address space; draw, erase, translate,
//!   copy (fork), release and page fault dispatch.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! ## Occupied vs. present
//!
//! The MMU only sees the `present` bit. The extended table additionally
//! knows which slots are *occupied*: a lazily drawn mapping is occupied
//! (it has a policy) but not present until its first fault allocates a
//! frame. Erase, copy and release walk occupied slots; translation only
//! follows present ones.
//!
//! ## Example
//!
//! ```rust
//! # use kernel_frames::testing::PhysArena;
//! # use kernel_frames::PhysicalMemory;
//! # use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//! # use kernel_vmem::{DrawFlags, ExtendedPageTableRoot, MappingPolicy, Protection};
//! let arena = PhysArena::new(PhysicalAddress::new(0x100_0000), 64);
//! let mut pool = PhysicalMemory::new(arena.mapper());
//! pool.add_range(arena.base(), 64).unwrap();
//!
//! let mut root = ExtendedPageTableRoot::new(&mut pool).unwrap();
//! let v = VirtualAddress::new(0x40_0000);
//! let p = PhysicalAddress::new(0x100_0000);
//! let policy = MappingPolicy::SharedReadOnly;
//! root.draw(&mut pool, v, p, 1, policy, Protection::USER_RO, DrawFlags::new())
//!     .unwrap();
//! assert_eq!(root.translate(v + 0x10), Some(p + 0x10));
//! root.release_table(&mut pool).unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

mod error;
mod fault;
mod level;
mod page_entry_bits;
mod policy;
mod protection;
mod root;
mod table;

pub use crate::error::PagingError;
pub use crate::fault::{FaultKind, PageFaultError};
pub use crate::level::PagingLevel;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::policy::MappingPolicy;
pub use crate::protection::{DrawFlags, Protection};
pub use crate::root::ExtendedPageTableRoot;
pub use crate::table::{ENTRIES, ExtendedPageTable, ExtraEntry};

/// Re-export constants as info module.
pub use kernel_info::memory as info;
