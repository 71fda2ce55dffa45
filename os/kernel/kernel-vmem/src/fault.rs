//! The hardware page-fault error code, reduced to the bits the fault
//! handlers dispatch on.

use bitfield_struct::bitfield;
use core::fmt;

/// x86-64 `#PF` error code. Only the low five bits matter to the policies;
/// protection keys and shadow stacks are never enabled.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// Set when the page was present and the access was refused.
    pub present: bool,
    pub write: bool,
    /// Access came from ring 3.
    pub user: bool,
    /// A reserved bit was set in some paging entry.
    pub reserved: bool,
    /// Instruction fetch.
    pub fetch: bool,
    #[bits(59)]
    __: u64,
}

/// What the handlers can do about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Nothing is installed yet; candidate for demand-zero.
    Missing,
    /// Write to a present read-only page; candidate for a copy-on-write break.
    WriteProtected,
    /// Anything else. No policy resolves these.
    Fatal,
}

impl PageFaultError {
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        if self.reserved() || self.fetch() {
            FaultKind::Fatal
        } else if !self.present() {
            FaultKind::Missing
        } else if self.write() {
            FaultKind::WriteProtected
        } else {
            FaultKind::Fatal
        }
    }

    /// Write to a present, read-only page.
    #[must_use]
    pub const fn is_write_protection(&self) -> bool {
        matches!(self.kind(), FaultKind::WriteProtected)
    }
}

impl fmt::Display for PageFaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = match (self.fetch(), self.write()) {
            (true, _) => "fetch",
            (false, true) => "write",
            (false, false) => "read",
        };
        let mode = if self.user() { "user" } else { "kernel" };
        let page = if self.present() { "present" } else { "missing" };
        write!(f, "{mode} {access}, {page} page")?;
        if self.reserved() {
            f.write_str(", reserved bit")?;
        }
        Ok(())
    }
}
