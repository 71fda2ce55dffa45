use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress};
use kernel_vmem::{MappingPolicy, Protection};

/// Access rights requested for a region.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct RegionFlags {
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
    #[bits(5)]
    __: u8,
}

impl RegionFlags {
    /// Readable and writable user data.
    pub const USER_DATA: Self = Self::new().with_user(true).with_writable(true);

    /// Read-only, executable user code.
    pub const USER_CODE: Self = Self::new().with_user(true).with_executable(true);

    #[must_use]
    pub const fn protection(self) -> Protection {
        Protection::new(self.writable(), self.user(), self.executable())
    }
}

/// A page-aligned, non-empty stretch of an address space with uniform
/// rights and mapping policy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VirtualMemoryRegion {
    begin: VirtualAddress,
    length: u64,
    flags: RegionFlags,
    policy: MappingPolicy,
}

impl VirtualMemoryRegion {
    #[must_use]
    pub const fn new(
        begin: VirtualAddress,
        length: u64,
        flags: RegionFlags,
        policy: MappingPolicy,
    ) -> Self {
        Self {
            begin,
            length,
            flags,
            policy,
        }
    }

    #[must_use]
    pub const fn begin(&self) -> VirtualAddress {
        self.begin
    }

    /// Length in bytes.
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// First address past the region.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.begin.as_u64() + self.length)
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.length >> PAGE_SHIFT
    }

    #[must_use]
    pub const fn flags(&self) -> RegionFlags {
        self.flags
    }

    #[must_use]
    pub const fn policy(&self) -> MappingPolicy {
        self.policy
    }

    #[must_use]
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.begin <= addr && addr < self.end()
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.begin < other.end() && other.begin < self.end()
    }

    /// The same region moved to `[begin, begin + length)`.
    #[must_use]
    pub const fn with_range(self, begin: VirtualAddress, length: u64) -> Self {
        Self {
            begin,
            length,
            ..self
        }
    }

    /// Move the region in place. Callers keep it clear of its neighbours.
    pub(crate) const fn set_range(&mut self, begin: VirtualAddress, length: u64) {
        self.begin = begin;
        self.length = length;
    }
}
