//! # Boot Memory Map
//!
//! The physical memory description handed to the memory manager at boot.
//! The loader translates the firmware memory map into [`MemoryMapEntry`]
//! records; only [`MemoryKind::Usable`] ranges are given to the frame
//! allocator.

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_down, align_up};

/// Classification of a physical memory range.
/// Kept `#[repr(u32)]` so the loader can pass it across the ABI boundary.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Free RAM, may be handed to the frame allocator.
    Usable = 0,
    /// Firmware or device owned, never touched.
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 2,
    /// Loader data that is dead once the kernel owns the machine.
    BootloaderReclaimable = 3,
    /// The loaded kernel image.
    KernelImage = 4,
}

/// One entry of the boot memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical start address in bytes.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// What lives in this range.
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: MemoryKind::Usable,
        }
    }

    /// The whole frames inside this entry, if it is usable.
    ///
    /// The range is shrunk inwards to page boundaries; entries that do not
    /// contain a single whole frame yield `None`.
    #[must_use]
    pub const fn usable_frames(&self) -> Option<(PhysicalAddress, u64)> {
        if !matches!(self.kind, MemoryKind::Usable) {
            return None;
        }
        let Some(start) = align_up(self.base, PAGE_SIZE) else {
            return None;
        };
        let Some(end) = self.base.checked_add(self.length) else {
            return None;
        };
        let end = align_down(end, PAGE_SIZE);
        if end <= start {
            return None;
        }
        Some((PhysicalAddress::new(start), (end - start) / PAGE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_entries_shrink_to_whole_frames() {
        let e = MemoryMapEntry::usable(0x1_0800, 0x3000);
        let (base, frames) = e.usable_frames().expect("usable");
        assert_eq!(base.as_u64(), 0x1_1000);
        assert_eq!(frames, 2);
    }

    #[test]
    fn tiny_or_reserved_entries_are_skipped() {
        assert!(MemoryMapEntry::usable(0x1_0800, 0x900).usable_frames().is_none());
        let reserved = MemoryMapEntry {
            base: 0,
            length: 0x10_0000,
            kind: MemoryKind::Reserved,
        };
        assert!(reserved.usable_frames().is_none());
    }
}
