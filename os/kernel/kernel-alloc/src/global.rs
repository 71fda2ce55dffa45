//! # Global allocator adapter
//!
//! `#[global_allocator]` needs a `static` implementing [`GlobalAlloc`]. The
//! kernel heap itself needs mutable access to the frame allocator, which is
//! owned elsewhere (by the memory manager), so the adapter only forwards to a
//! [`HeapBackend`] that knows how to lock both.
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL: GlobalHeap<GlobalMemory> = GlobalHeap::new(&GLOBAL_MEMORY);
//! ```

use crate::error::HeapError;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, null_mut};
use log::error;

/// A heap that can be used from `&self`, taking whatever locks it needs.
pub trait HeapBackend: Sync {
    /// # Errors
    /// Any [`HeapError`]; the adapter turns it into a null pointer.
    fn heap_alloc(&self, layout: Layout) -> Result<NonNull<u8>, HeapError>;

    /// # Errors
    /// Any [`HeapError`]; the adapter logs it.
    fn heap_free(&self, ptr: NonNull<u8>, layout: Layout) -> Result<(), HeapError>;
}

pub struct GlobalHeap<B: HeapBackend + 'static> {
    backend: &'static B,
}

impl<B: HeapBackend + 'static> GlobalHeap<B> {
    #[must_use]
    pub const fn new(backend: &'static B) -> Self {
        Self { backend }
    }
}

unsafe impl<B: HeapBackend + 'static> GlobalAlloc for GlobalHeap<B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.backend
            .heap_alloc(layout)
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if let Err(e) = self.backend.heap_free(ptr, layout) {
            error!("global heap: dealloc of {ptr:p} ({} bytes) failed: {e}", layout.size());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeapAllocator, KernelHeapAllocator};
    use kernel_frames::testing::PhysArena;
    use kernel_frames::{HhdmPhysMapper, PhysicalMemory};
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_sync::SpinLock;

    struct TestBackend {
        inner: SpinLock<(KernelHeapAllocator, PhysicalMemory<HhdmPhysMapper>)>,
    }

    impl HeapBackend for TestBackend {
        fn heap_alloc(&self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
            self.inner.with_lock(|(heap, pm)| heap.allocate_layout(pm, layout))
        }

        fn heap_free(&self, ptr: NonNull<u8>, _layout: Layout) -> Result<(), HeapError> {
            self.inner.with_lock(|(heap, pm)| heap.free(pm, ptr))
        }
    }

    #[test]
    fn global_alloc_round_trip() {
        let arena = Box::leak(Box::new(PhysArena::new(PhysicalAddress::new(0x200_0000), 64)));
        let mut pm = PhysicalMemory::new(arena.mapper());
        pm.add_range(arena.base(), 64).unwrap();
        let backend: &'static TestBackend = Box::leak(Box::new(TestBackend {
            inner: SpinLock::new((KernelHeapAllocator::new(), pm)),
        }));
        let global = GlobalHeap::new(backend);

        let layout = Layout::from_size_align(100, 8).unwrap();
        let p = unsafe { global.alloc(layout) };
        assert!(!p.is_null());
        unsafe { p.write_bytes(0x5A, 100) };

        let aligned = Layout::from_size_align(64, 256).unwrap();
        let q = unsafe { global.alloc(aligned) };
        assert_eq!(q.addr() % 256, 0);

        let huge = Layout::from_size_align(1 << 20, 8).unwrap();
        assert!(unsafe { global.alloc(huge) }.is_null());

        unsafe {
            global.dealloc(p, layout);
            global.dealloc(q, aligned);
        }
        backend.inner.with_lock(|(heap, _)| assert_eq!(heap.remaining(), heap.total()));
    }
}
