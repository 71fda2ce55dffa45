use crate::irq;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A re-entrant interrupt-masking section.
///
/// The outermost [`enter`](Self::enter) records whether interrupts were
/// enabled and disables them; nested enters only bump the depth. Interrupts
/// are restored when the outermost guard is dropped.
///
/// This is the only mutual exclusion the memory subsystem relies on on a
/// single core: buddy list splices, page-table edits and table allocation all
/// run inside one.
pub struct CriticalSection {
    depth: AtomicUsize,
    restore: AtomicBool,
}

/// The section shared by all kernel subsystems.
static KERNEL: CriticalSection = CriticalSection::new();

/// Enter the kernel-wide critical section.
#[inline]
#[must_use]
pub fn enter_critical() -> CriticalGuard<'static> {
    KERNEL.enter()
}

/// Nesting depth of the kernel-wide critical section.
#[inline]
#[must_use]
pub fn critical_depth() -> usize {
    KERNEL.depth()
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

impl CriticalSection {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            restore: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub fn enter(&self) -> CriticalGuard<'_> {
        let were_enabled = irq::interrupts_enabled();
        irq::disable_interrupts();
        if self.depth.fetch_add(1, Ordering::AcqRel) == 0 {
            self.restore.store(were_enabled, Ordering::Release);
        }
        CriticalGuard {
            section: self,
            _not_send: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }

    fn leave(&self) {
        let previous = self.depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "critical section left more often than entered");
        if previous == 1 && self.restore.swap(false, Ordering::AcqRel) {
            irq::enable_interrupts();
        }
    }
}

/// Proof of being inside a [`CriticalSection`]; leaves it on drop.
#[must_use = "the critical section ends when the guard is dropped"]
pub struct CriticalGuard<'a> {
    section: &'a CriticalSection,
    /// Interrupt state is per CPU; the guard must not migrate.
    _not_send: PhantomData<*const ()>,
}

impl CriticalGuard<'_> {
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.section.depth()
    }
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.section.leave();
    }
}
