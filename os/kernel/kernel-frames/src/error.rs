use crate::metadata::FrameOwner;
use kernel_memory_addresses::PhysicalAddress;

/// Failures of the frame allocator, the frame metadata and the reaper.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("out of physical memory ({requested} frames requested)")]
    OutOfMemory { requested: usize },
    #[error("zero-length frame request")]
    ZeroLength,
    #[error("frame address {0:?} is not page aligned")]
    Unaligned(PhysicalAddress),
    #[error("frame {0:?} is not tracked by the frame metadata")]
    UnknownFrame(PhysicalAddress),
    #[error("no free slot left in the physical range table")]
    RangeTableFull,
    #[error("physical range at {0:?} is too small to hold its own metadata")]
    RangeTooSmall(PhysicalAddress),
    #[error("physical range at {0:?} overlaps an already registered range")]
    RangeOverlap(PhysicalAddress),
    #[error("frame {frame:?} belongs to {actual:?}, not {expected:?}")]
    OwnerMismatch {
        frame: PhysicalAddress,
        expected: FrameOwner,
        actual: FrameOwner,
    },
    #[error("frame {0:?} is already allocated")]
    AlreadyAllocated(PhysicalAddress),
    #[error("frame {0:?} freed twice")]
    DoubleFree(PhysicalAddress),
    #[error("freeing {frames} frames would exceed the managed total")]
    Overfree { frames: u64 },
    #[error("copy-on-write count of frame {0:?} overflowed")]
    CowOverflow(PhysicalAddress),
    #[error("frame {0:?} is not shared")]
    NotShared(PhysicalAddress),
}
