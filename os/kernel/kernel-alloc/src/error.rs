use kernel_frames::FrameError;

/// Failures of the heap allocators.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted ({requested} bytes requested)")]
    OutOfMemory { requested: usize },
    #[error("zero-sized heap allocation")]
    ZeroSize,
    #[error("{requested} bytes exceed the allocator's limit of {limit} bytes")]
    TooLarge { requested: usize, limit: usize },
    #[error("heap block at {ptr:#x} failed verification: {what}")]
    VerificationFailed { ptr: usize, what: &'static str },
    #[error("pointer {0:#x} was not handed out by this heap")]
    ForeignPointer(usize),
    #[error(transparent)]
    Frame(#[from] FrameError),
}
