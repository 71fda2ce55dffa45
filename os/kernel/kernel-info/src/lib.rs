//! # Kernel Memory Configuration
//!
//! System-wide constants shared by the memory management crates, and the
//! boot memory map contract between the loader and the memory manager.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **Address Space Layout**: user window and kernel half boundaries
//! * **Physical Memory Mapping**: HHDM (Higher Half Direct Mapping) base
//! * **Allocator Tuning**: buddy orders, tidy-up thresholds, slab classes
//!
//! ### Boot Memory Map ([`boot`])
//! * **Memory Map Entries**: `#[repr(C)]` records produced by the loader
//! * **Usable Frames**: shrinking entries to whole, page-aligned frames
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         (unmapped)              │
//! USERSPACE_START       ├─────────────────────────────────┤ 0x0000_0000_0040_0000
//!                       │         User Space              │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │    Non-canonical hole           │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All values are compile-time constants checked with `const` assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
