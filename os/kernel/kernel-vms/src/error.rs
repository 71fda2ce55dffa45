use crate::region::VirtualMemoryRegion;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::PagingError;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmsError {
    #[error("range overlaps existing region {0:?}")]
    Overlap(VirtualMemoryRegion),
    #[error("{length:#x} bytes at {begin:?} leave the managed window")]
    OutOfBounds { begin: VirtualAddress, length: u64 },
    #[error("{0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("empty range")]
    ZeroLength,
    #[error("no region contains {0:?}")]
    NotFound(VirtualAddress),
    #[error("address space already has regions")]
    NotEmpty,
    #[error(transparent)]
    Paging(#[from] PagingError),
}
