use kernel_frames::PhysMapper;
use kernel_info::boot::MemoryMapEntry;
use kernel_info::memory::{BOOT_HEAP_SIZE, USERSPACE_END, USERSPACE_START};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// A run of usable RAM from the boot memory map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysicalRange {
    pub base: PhysicalAddress,
    pub frames: u64,
}

impl PhysicalRange {
    #[must_use]
    pub const fn new(base: PhysicalAddress, frames: u64) -> Self {
        Self { base, frames }
    }

    /// The whole frames of a usable boot memory map entry.
    #[must_use]
    pub const fn from_entry(entry: &MemoryMapEntry) -> Option<Self> {
        match entry.usable_frames() {
            Some((base, frames)) => Some(Self::new(base, frames)),
            None => None,
        }
    }
}

/// Boot-time parameters of the [`MemoryManager`](crate::MemoryManager).
///
/// ```rust
/// # use kernel_frames::HhdmPhysMapper;
/// # use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
/// # use kernel_mm::{MemoryConfig, PhysicalRange};
/// let ranges = [PhysicalRange::new(PhysicalAddress::new(0x10_0000), 0x7F00)];
/// let config = MemoryConfig::new(HhdmPhysMapper::kernel(), &ranges)
///     .with_boot_heap_size(64 * 1024)
///     .with_user_window(VirtualAddress::new(0x40_0000), 0x1000_0000);
/// assert_eq!(config.boot_heap_size, 64 * 1024);
/// ```
#[derive(Copy, Clone, Debug)]
pub struct MemoryConfig<'a, M: PhysMapper> {
    /// How the kernel reaches physical memory.
    pub mapper: M,
    /// Usable RAM. Each range gives up its tail for frame metadata.
    pub ranges: &'a [PhysicalRange],
    /// Bytes reserved for the boot heap, rounded up to whole frames. Zero
    /// disables the boot heap.
    pub boot_heap_size: usize,
    /// Start of the window user regions are placed in.
    pub user_base: VirtualAddress,
    /// Length of the user window in bytes.
    pub user_length: u64,
}

impl<'a, M: PhysMapper> MemoryConfig<'a, M> {
    /// Defaults: [`BOOT_HEAP_SIZE`] bytes of boot heap and the whole lower
    /// half above [`USERSPACE_START`] as user window.
    #[must_use]
    pub const fn new(mapper: M, ranges: &'a [PhysicalRange]) -> Self {
        Self {
            mapper,
            ranges,
            boot_heap_size: BOOT_HEAP_SIZE,
            user_base: VirtualAddress::new(USERSPACE_START),
            user_length: USERSPACE_END - USERSPACE_START,
        }
    }

    #[must_use]
    pub const fn with_boot_heap_size(mut self, bytes: usize) -> Self {
        self.boot_heap_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_user_window(mut self, base: VirtualAddress, length: u64) -> Self {
        self.user_base = base;
        self.user_length = length;
        self
    }
}
