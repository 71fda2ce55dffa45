//! # Memory manager
//!
//! [`MemoryManager`] owns every piece of global memory state: the physical
//! frame pool, the kernel heap, the boot heap and the kernel's page table
//! root. Address spaces ([`AddressSpace`]) are owned by their users and
//! passed in by reference.
//!
//! Each mutating call runs inside the kernel-wide critical section, so an
//! interrupt handler never observes a half-spliced free list or a
//! half-drawn page table.

use crate::config::MemoryConfig;
use crate::error::MemError;
use core::alloc::Layout;
use core::ptr::NonNull;
use kernel_alloc::{FreeListAllocator, HeapAllocator, KERNEL_HEAP_TAG, KernelHeapAllocator};
use kernel_frames::{FrameOwner, PhysMapper, PhysicalMemory};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::enter_critical;
use kernel_vmem::{
    DrawFlags, ExtendedPageTableRoot, MappingPolicy, PageFaultError, PagingError, Protection,
};
use kernel_vms::{RegionFlags, VirtualMemoryRegion, VirtualMemorySpace};
use log::{debug, info, warn};

/// Heap tag of the boot heap's frames.
pub const BOOT_HEAP_TAG: u8 = 0;

const _: () = assert!(BOOT_HEAP_TAG < KERNEL_HEAP_TAG);

/// The page tables and regions of one user address space.
pub struct AddressSpace<M: PhysMapper> {
    root: ExtendedPageTableRoot<M>,
    space: VirtualMemorySpace,
}

impl<M: PhysMapper> AddressSpace<M> {
    #[must_use]
    pub const fn root(&self) -> &ExtendedPageTableRoot<M> {
        &self.root
    }

    /// Physical address of the top-level table, for CR3.
    #[must_use]
    pub const fn root_page(&self) -> PhysicalAddress {
        self.root.root_page()
    }

    #[must_use]
    pub const fn space(&self) -> &VirtualMemorySpace {
        &self.space
    }

    /// See [`VirtualMemorySpace::reserve`].
    pub fn reserve_regions(&mut self, additional: usize) {
        self.space.reserve(additional);
    }
}

/// Snapshot of the allocators' fill levels.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryStats {
    pub frames_total: u64,
    pub frames_free: u64,
    pub heap_total: usize,
    pub heap_free: usize,
    pub boot_heap_total: usize,
    pub boot_heap_free: usize,
    pub address_spaces: usize,
}

pub struct MemoryManager<M: PhysMapper> {
    pool: PhysicalMemory<M>,
    heap: KernelHeapAllocator,
    boot_heap: FreeListAllocator,
    kernel: ExtendedPageTableRoot<M>,
    user_base: VirtualAddress,
    user_length: u64,
    address_spaces: usize,
}

impl<M: PhysMapper> MemoryManager<M> {
    /// Register the configured RAM, carve out the boot heap and build the
    /// kernel page table root.
    ///
    /// # Errors
    /// - [`MemError::NoUsableMemory`] if no range contributes a frame.
    /// - Range errors from the frame pool, an invalid user window, or
    ///   exhaustion while placing the boot heap or the kernel root.
    pub fn new(config: MemoryConfig<'_, M>) -> Result<Self, MemError> {
        let _critical = enter_critical();
        VirtualMemorySpace::new(config.user_base, config.user_length)?;

        let mut pool = PhysicalMemory::new(config.mapper);
        for range in config.ranges {
            pool.add_range(range.base, range.frames)?;
        }
        if pool.total() == 0 {
            return Err(MemError::NoUsableMemory);
        }

        let mut boot_heap = FreeListAllocator::new();
        let boot_frames = config.boot_heap_size.div_ceil(PAGE_SIZE as usize);
        if boot_frames > 0 {
            let base = pool.allocate(boot_frames, FrameOwner::Heap(BOOT_HEAP_TAG))?;
            let start = config.mapper.phys_to_ptr::<u8>(base);
            // SAFETY: the frames were just allocated for the boot heap and are
            // never returned to the pool.
            unsafe { boot_heap.init(start, boot_frames * PAGE_SIZE as usize) };
        }

        let kernel = ExtendedPageTableRoot::new(&mut pool)?;
        info!(
            "memory manager: {} of {} frames free, boot heap {} KiB, kernel root at {:?}",
            pool.remaining(),
            pool.total(),
            boot_frames as u64 * PAGE_SIZE / 1024,
            kernel.root_page()
        );
        Ok(Self {
            pool,
            heap: KernelHeapAllocator::new(),
            boot_heap,
            kernel,
            user_base: config.user_base,
            user_length: config.user_length,
            address_spaces: 0,
        })
    }

    #[must_use]
    pub const fn pool(&self) -> &PhysicalMemory<M> {
        &self.pool
    }

    #[must_use]
    pub const fn kernel_root(&self) -> &ExtendedPageTableRoot<M> {
        &self.kernel
    }

    /// `n` contiguous frames for a caller that manages them itself.
    ///
    /// # Errors
    /// Frame exhaustion or a zero `n`.
    pub fn allocate_frames(&mut self, n: usize) -> Result<PhysicalAddress, MemError> {
        let _critical = enter_critical();
        Ok(self.pool.allocate(n, FrameOwner::Frames)?)
    }

    /// Return frames from [`allocate_frames`](Self::allocate_frames).
    ///
    /// # Errors
    /// Ownership violations; nothing is freed in that case.
    pub fn free_frames(&mut self, base: PhysicalAddress, n: usize) -> Result<(), MemError> {
        let _critical = enter_critical();
        Ok(self.pool.free(base, n, FrameOwner::Frames)?)
    }

    /// `n` bytes from the kernel heap, 16-byte aligned.
    ///
    /// # Errors
    /// See [`HeapAllocator::allocate`].
    pub fn allocate(&mut self, n: usize) -> Result<NonNull<u8>, MemError> {
        let _critical = enter_critical();
        Ok(self.heap.allocate(&mut self.pool, n)?)
    }

    /// Kernel heap allocation honouring `layout`'s alignment.
    ///
    /// # Errors
    /// See [`KernelHeapAllocator::allocate_layout`].
    pub fn allocate_layout(&mut self, layout: Layout) -> Result<NonNull<u8>, MemError> {
        let _critical = enter_critical();
        Ok(self.heap.allocate_layout(&mut self.pool, layout)?)
    }

    /// Return a kernel heap block.
    ///
    /// # Errors
    /// [`HeapError::ForeignPointer`](kernel_alloc::HeapError::ForeignPointer)
    /// or a failed verification.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), MemError> {
        let _critical = enter_critical();
        Ok(self.heap.free(&mut self.pool, ptr)?)
    }

    /// `n` bytes from the boot heap.
    ///
    /// # Errors
    /// Boot heap exhaustion, or a zero `n`.
    pub fn boot_allocate(&mut self, n: usize) -> Result<NonNull<u8>, MemError> {
        let _critical = enter_critical();
        Ok(self.boot_heap.allocate(&mut self.pool, n)?)
    }

    /// # Errors
    /// Pointers the boot heap did not hand out.
    pub fn boot_free(&mut self, ptr: NonNull<u8>) -> Result<(), MemError> {
        let _critical = enter_critical();
        Ok(self.boot_heap.free(&mut self.pool, ptr)?)
    }

    /// Map `pages` frames from `p` at `v` in the kernel half. Address spaces
    /// created afterwards see the mapping; for those created before, only
    /// if it lands below an already shared top-level entry.
    ///
    /// # Errors
    /// Range and exhaustion errors from the draw.
    pub fn map_kernel(
        &mut self,
        v: VirtualAddress,
        p: PhysicalAddress,
        pages: u64,
        prot: Protection,
    ) -> Result<(), MemError> {
        let _critical = enter_critical();
        let flags = DrawFlags::new().with_allow_huge(true);
        self.kernel
            .draw(&mut self.pool, v, p, pages, MappingPolicy::Kernel, prot, flags)?;
        Ok(())
    }

    /// # Errors
    /// See [`ExtendedPageTableRoot::erase`].
    pub fn unmap_kernel(&mut self, v: VirtualAddress, pages: u64) -> Result<(), MemError> {
        let _critical = enter_critical();
        Ok(self.kernel.erase(&mut self.pool, v, pages)?)
    }

    /// Physical address behind a kernel virtual address.
    #[must_use]
    pub fn translate_kernel(&self, v: VirtualAddress) -> Option<PhysicalAddress> {
        self.kernel.translate(v)
    }

    /// An empty user address space sharing the kernel half.
    ///
    /// # Errors
    /// Frame exhaustion for the top-level table.
    pub fn create_address_space(&mut self) -> Result<AddressSpace<M>, MemError> {
        let _critical = enter_critical();
        let space = VirtualMemorySpace::new(self.user_base, self.user_length)?;
        let mut root = ExtendedPageTableRoot::new(&mut self.pool)?;
        root.share_kernel_half(&self.kernel);
        self.address_spaces += 1;
        debug!("address space created at {:?}", root.root_page());
        Ok(AddressSpace { root, space })
    }

    /// A copy of `parent` for a forked process: the regions are duplicated
    /// and the page tables copied under their mapping policies.
    ///
    /// # Errors
    /// Exhaustion while copying; `parent` is unchanged apart from pages that
    /// became copy-on-write.
    pub fn fork(&mut self, parent: &mut AddressSpace<M>) -> Result<AddressSpace<M>, MemError> {
        let _critical = enter_critical();
        let mut space = VirtualMemorySpace::new(parent.space.base(), parent.space.length())?;
        space.copy_from(&parent.space)?;
        let root = parent.root.copy_table(&mut self.pool)?;
        self.address_spaces += 1;
        debug!(
            "address space {:?} forked into {:?} ({} regions)",
            parent.root.root_page(),
            root.root_page(),
            space.len()
        );
        Ok(AddressSpace { root, space })
    }

    /// Tear down an address space. Returns the number of frames freed.
    ///
    /// # Errors
    /// The first failure of the release; the space is gone regardless.
    pub fn release(&mut self, space: AddressSpace<M>) -> Result<u64, MemError> {
        let _critical = enter_critical();
        let page = space.root.root_page();
        self.address_spaces = self.address_spaces.saturating_sub(1);
        let freed = space.root.release_table(&mut self.pool)?;
        debug!("address space {page:?} released, {freed} frames freed");
        Ok(freed)
    }

    /// Place a new region of `length` bytes (rounded up to pages) in
    /// `space`, at `prefer` if it is free, else at the first gap that fits.
    /// The region is backed lazily on first touch.
    ///
    /// # Errors
    /// - [`MemError::NoSpace`] if no gap is large enough.
    /// - [`PagingError::InvalidPolicy`] for policies that cannot back
    ///   memory on demand.
    /// - Region and page table errors from the insertion.
    pub fn mmap(
        &mut self,
        space: &mut AddressSpace<M>,
        prefer: Option<VirtualAddress>,
        length: u64,
        flags: RegionFlags,
        policy: MappingPolicy,
    ) -> Result<VirtualMemoryRegion, MemError> {
        if !policy.owns_frames() {
            return Err(PagingError::InvalidPolicy(policy).into());
        }
        let length = length
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(MemError::NoSpace(length))?;
        let _critical = enter_critical();
        let begin = space
            .space
            .get_first_fit(prefer, length)
            .ok_or(MemError::NoSpace(length))?;
        let region = space
            .space
            .add_region(&mut space.root, &mut self.pool, begin, length, flags, policy)?;
        debug!("mmap: {region:?}");
        Ok(region)
    }

    /// Unmap `[begin, begin + length)`, trimming or splitting the regions it
    /// touches.
    ///
    /// # Errors
    /// Range errors, or the failure of the page table erase.
    pub fn munmap(
        &mut self,
        space: &mut AddressSpace<M>,
        begin: VirtualAddress,
        length: u64,
    ) -> Result<(), MemError> {
        let _critical = enter_critical();
        space.space.erase(&mut space.root, &mut self.pool, begin, length)?;
        Ok(())
    }

    /// Service a page fault at `v` in `space`.
    ///
    /// # Errors
    /// [`MemError::NoRegion`] for user addresses outside every region, and
    /// the fault handler's verdict otherwise. Callers turn these into a
    /// signal or a kernel panic as appropriate.
    pub fn handle_page_fault(
        &mut self,
        space: &mut AddressSpace<M>,
        v: VirtualAddress,
        error: PageFaultError,
    ) -> Result<(), MemError> {
        let _critical = enter_critical();
        let user = v >= space.space.base() && v < space.space.end();
        if user && space.space.get_region(v).is_none() {
            warn!("page fault at {v:?} outside any region ({:#x})", error.into_bits());
            return Err(MemError::NoRegion(v));
        }
        space.root.handle_page_fault(&mut self.pool, v, error)?;
        Ok(())
    }

    #[must_use]
    pub fn translate(&self, space: &AddressSpace<M>, v: VirtualAddress) -> Option<PhysicalAddress> {
        space.root.translate(v)
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            frames_total: self.pool.total(),
            frames_free: self.pool.remaining(),
            heap_total: self.heap.total(),
            heap_free: self.heap.remaining(),
            boot_heap_total: self.boot_heap.total(),
            boot_heap_free: self.boot_heap.remaining(),
            address_spaces: self.address_spaces,
        }
    }
}
