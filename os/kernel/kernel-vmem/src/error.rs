use crate::policy::MappingPolicy;
use kernel_frames::FrameError;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Failures of the extended page table operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PagingError {
    #[error("out of memory for a page table while mapping {0:?}")]
    OutOfMemory(VirtualAddress),
    #[error("address {0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("range of {pages} pages at {start:?} leaves its canonical half")]
    NonCanonical { start: VirtualAddress, pages: u64 },
    #[error("{0:?} is already mapped")]
    NotBlank(VirtualAddress),
    #[error("nothing is mapped at {0:?}")]
    NotMapped(VirtualAddress),
    #[error("operation at {0:?} would split a huge page")]
    HugePageSplit(VirtualAddress),
    #[error("{policy:?} mapping at {address:?} cannot service fault code {code:#x}")]
    UnsupportedFault {
        address: VirtualAddress,
        policy: MappingPolicy,
        code: u64,
    },
    #[error("write to read-only {policy:?} mapping at {address:?}")]
    AccessViolation {
        address: VirtualAddress,
        policy: MappingPolicy,
    },
    #[error("{0:?} cannot be drawn directly")]
    InvalidPolicy(MappingPolicy),
    #[error("{0:?} lies in a kernel subtree shared with other address spaces")]
    KernelSubtree(VirtualAddress),
    #[error("extended page table at {0:?} is inconsistent")]
    Inconsistent(PhysicalAddress),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl PagingError {
    /// Table allocations report exhaustion with the address being mapped.
    pub(crate) const fn table_alloc(e: FrameError, at: VirtualAddress) -> Self {
        match e {
            FrameError::OutOfMemory { .. } => Self::OutOfMemory(at),
            other => Self::Frame(other),
        }
    }
}
