//! # The kernel's memory manager instance
//!
//! A kernel has exactly one [`MemoryManager`]. It lives in [`GLOBAL`],
//! created by [`init_global`] once the boot memory map is known and reached
//! through [`with_global`]. The lock is taken inside the critical section,
//! so an interrupt never spins on a lock held by the code it interrupted.
//!
//! Closures passed to [`with_global`] must not allocate through the global
//! allocator while it is backed by [`GlobalMemory`]: the nested allocation
//! finds the manager busy and fails. Reserve region slots up front with
//! [`AddressSpace::reserve_regions`](crate::AddressSpace::reserve_regions).
//!
//! ```rust,ignore
//! #[global_allocator]
//! static HEAP: GlobalHeap<GlobalMemory> = GlobalHeap::new(&GlobalMemory);
//! ```

use crate::config::MemoryConfig;
use crate::error::MemError;
use crate::manager::MemoryManager;
use core::alloc::Layout;
use core::ptr::NonNull;
use kernel_alloc::{HeapBackend, HeapError};
use kernel_frames::HhdmPhysMapper;
use kernel_sync::{SpinLock, enter_critical};
use log::info;

pub type KernelMemoryManager = MemoryManager<HhdmPhysMapper>;

pub static GLOBAL: SpinLock<Option<KernelMemoryManager>> = SpinLock::new(None);

/// Build the global manager.
///
/// # Errors
/// [`MemError::AlreadyInitialized`] on a second call, or the failure of
/// [`MemoryManager::new`].
pub fn init_global(config: MemoryConfig<'_, HhdmPhysMapper>) -> Result<(), MemError> {
    let mut slot = GLOBAL.lock_critical();
    if slot.is_some() {
        return Err(MemError::AlreadyInitialized);
    }
    *slot = Some(MemoryManager::new(config)?);
    info!("global memory manager initialized");
    Ok(())
}

/// Run `f` on the global manager.
///
/// # Errors
/// [`MemError::Uninitialized`] before [`init_global`].
pub fn with_global<R>(f: impl FnOnce(&mut KernelMemoryManager) -> R) -> Result<R, MemError> {
    let mut slot = GLOBAL.lock_critical();
    slot.as_mut().map(f).ok_or(MemError::Uninitialized)
}

/// Take the global manager out again. Address spaces still alive keep
/// pointing at its frames; this is for shutdown and tests.
#[must_use]
pub fn teardown_global() -> Option<KernelMemoryManager> {
    GLOBAL.lock_critical().take()
}

/// [`HeapBackend`] serving the global allocator from the kernel heap of
/// [`GLOBAL`].
pub struct GlobalMemory;

impl GlobalMemory {
    fn try_with<R>(
        layout: Layout,
        f: impl FnOnce(&mut KernelMemoryManager) -> Result<R, MemError>,
    ) -> Result<R, HeapError> {
        let _critical = enter_critical();
        let busy = HeapError::OutOfMemory {
            requested: layout.size(),
        };
        let mut slot = GLOBAL.try_lock().ok_or(busy)?;
        let manager = slot.as_mut().ok_or(busy)?;
        f(manager).map_err(|e| match e {
            MemError::Heap(e) => e,
            MemError::Frame(e) => HeapError::Frame(e),
            _ => busy,
        })
    }
}

impl HeapBackend for GlobalMemory {
    fn heap_alloc(&self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        Self::try_with(layout, |mm| mm.allocate_layout(layout))
    }

    fn heap_free(&self, ptr: NonNull<u8>, layout: Layout) -> Result<(), HeapError> {
        Self::try_with(layout, |mm| mm.free(ptr))
    }
}
