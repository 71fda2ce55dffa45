//! Interrupt flag control.
//!
//! On bare-metal x86-64 the functions below execute `cli`/`sti` and read
//! `RFLAGS.IF`. Everywhere else (host builds running the test suites) they
//! act on a process-wide software flag so code using [`IrqGuard`] and
//! [`CriticalSection`](crate::CriticalSection) runs unchanged.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// Bit 9 of `RFLAGS`.
    const RFLAGS_IF: u64 = 1 << 9;

    /// Returns the current `RFLAGS` value (via `pushfq/pop`).
    #[inline]
    #[must_use]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }

    #[inline]
    #[must_use]
    pub fn interrupts_enabled() -> bool {
        rflags() & RFLAGS_IF != 0
    }

    /// Disables hardware interrupts (`cli`). Must run at CPL0.
    #[inline]
    pub fn disable_interrupts() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    /// Enables hardware interrupts (`sti`). Must run at CPL0.
    #[inline]
    pub fn enable_interrupts() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    use core::sync::atomic::{AtomicBool, Ordering};

    static SIMULATED_IF: AtomicBool = AtomicBool::new(true);

    #[inline]
    #[must_use]
    pub fn interrupts_enabled() -> bool {
        SIMULATED_IF.load(Ordering::Acquire)
    }

    #[inline]
    pub fn disable_interrupts() {
        SIMULATED_IF.store(false, Ordering::Release);
    }

    #[inline]
    pub fn enable_interrupts() {
        SIMULATED_IF.store(true, Ordering::Release);
    }
}

pub use arch::{disable_interrupts, enable_interrupts, interrupts_enabled};

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Not re-entrant on its own: nested guards each snapshot the flag, so the
/// innermost one sees "disabled" and leaves restoration to the outer one.
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = interrupts_enabled();
        if were_enabled {
            disable_interrupts();
        }
        Self { were_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}
