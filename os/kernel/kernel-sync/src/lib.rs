//! # Kernel synchronization primitives
//!
//! The memory core runs on a single CPU and relies on interrupt masking
//! ([`CriticalSection`]) rather than locks. [`SpinLock`] protects the one
//! global memory manager instance.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod critical;
pub mod irq;
mod spin_lock;

pub use critical::{CriticalGuard, CriticalSection, critical_depth, enter_critical};
pub use irq::IrqGuard;
pub use spin_lock::{CriticalSpinGuard, SpinLock, SpinLockGuard};
