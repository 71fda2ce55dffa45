use kernel_alloc::HeapError;
use kernel_frames::FrameError;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::PagingError;
use kernel_vms::VmsError;

/// Failures of the [`MemoryManager`](crate::MemoryManager) API.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Paging(#[from] PagingError),
    #[error(transparent)]
    Region(#[from] VmsError),
    #[error("no usable physical memory was configured")]
    NoUsableMemory,
    #[error("no free range of {0:#x} bytes left in the address space")]
    NoSpace(u64),
    #[error("no region covers {0:?}")]
    NoRegion(VirtualAddress),
    #[error("the global memory manager is not initialized")]
    Uninitialized,
    #[error("the global memory manager is already initialized")]
    AlreadyInitialized,
}

/// Coarse classification of a [`MemError`], for callers that only need to
/// know what went wrong, not where.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    OutOfMemory,
    IllegalArguments,
    VerificationFailed,
    NotFound,
    StateError,
    NotSupported,
    AlreadyExists,
    OutOfBound,
    PermissionDenied,
}

impl MemError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Frame(e) => frame_kind(e),
            Self::Heap(e) => heap_kind(e),
            Self::Paging(e) => paging_kind(e),
            Self::Region(e) => region_kind(e),
            Self::NoUsableMemory | Self::NoSpace(_) => ErrorKind::OutOfMemory,
            Self::NoRegion(_) => ErrorKind::NotFound,
            Self::Uninitialized | Self::AlreadyInitialized => ErrorKind::StateError,
        }
    }
}

const fn frame_kind(e: &FrameError) -> ErrorKind {
    match e {
        FrameError::OutOfMemory { .. } | FrameError::RangeTableFull => ErrorKind::OutOfMemory,
        FrameError::ZeroLength | FrameError::Unaligned(_) | FrameError::RangeTooSmall(_) => {
            ErrorKind::IllegalArguments
        }
        FrameError::RangeOverlap(_) => ErrorKind::AlreadyExists,
        FrameError::UnknownFrame(_) => ErrorKind::NotFound,
        FrameError::OwnerMismatch { .. }
        | FrameError::AlreadyAllocated(_)
        | FrameError::DoubleFree(_) => ErrorKind::VerificationFailed,
        FrameError::Overfree { .. } | FrameError::CowOverflow(_) | FrameError::NotShared(_) => {
            ErrorKind::StateError
        }
    }
}

const fn heap_kind(e: &HeapError) -> ErrorKind {
    match e {
        HeapError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
        HeapError::ZeroSize | HeapError::TooLarge { .. } => ErrorKind::IllegalArguments,
        HeapError::VerificationFailed { .. } | HeapError::ForeignPointer(_) => {
            ErrorKind::VerificationFailed
        }
        HeapError::Frame(e) => frame_kind(e),
    }
}

const fn paging_kind(e: &PagingError) -> ErrorKind {
    match e {
        PagingError::OutOfMemory(_) => ErrorKind::OutOfMemory,
        PagingError::Unaligned(_)
        | PagingError::NonCanonical { .. }
        | PagingError::HugePageSplit(_)
        | PagingError::KernelSubtree(_) => ErrorKind::IllegalArguments,
        PagingError::NotBlank(_) => ErrorKind::AlreadyExists,
        PagingError::NotMapped(_) => ErrorKind::NotFound,
        PagingError::UnsupportedFault { .. } | PagingError::InvalidPolicy(_) => {
            ErrorKind::NotSupported
        }
        PagingError::AccessViolation { .. } => ErrorKind::PermissionDenied,
        PagingError::Inconsistent(_) => ErrorKind::StateError,
        PagingError::Frame(e) => frame_kind(e),
    }
}

const fn region_kind(e: &VmsError) -> ErrorKind {
    match e {
        VmsError::Overlap(_) => ErrorKind::AlreadyExists,
        VmsError::OutOfBounds { .. } => ErrorKind::OutOfBound,
        VmsError::Unaligned(_) | VmsError::ZeroLength => ErrorKind::IllegalArguments,
        VmsError::NotFound(_) => ErrorKind::NotFound,
        VmsError::NotEmpty => ErrorKind::StateError,
        VmsError::Paging(e) => paging_kind(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn nested_errors_keep_their_kind() {
        let oom = FrameError::OutOfMemory { requested: 4 };
        assert_eq!(MemError::from(oom).kind(), ErrorKind::OutOfMemory);
        assert_eq!(MemError::from(HeapError::Frame(oom)).kind(), ErrorKind::OutOfMemory);
        let region = VmsError::Paging(PagingError::Frame(oom));
        assert_eq!(MemError::from(region).kind(), ErrorKind::OutOfMemory);

        let double = FrameError::DoubleFree(PhysicalAddress::new(0x1000));
        assert_eq!(MemError::from(double).kind(), ErrorKind::VerificationFailed);
        assert_eq!(
            MemError::from(VmsError::NotFound(VirtualAddress::new(0x1000))).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(MemError::Uninitialized.kind(), ErrorKind::StateError);
    }
}
