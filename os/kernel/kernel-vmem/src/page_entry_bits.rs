use crate::level::PagingLevel;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Represents a single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// This structure models the **common superset** of fields found in all
/// four paging levels (PML4E, PDPTE, PDE, PTE). Each bit corresponds to a
/// hardware-defined flag or address field as specified by the AMD64 and
/// Intel manuals.
///
/// ### Bit layout (canonical)
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`              | Large page flag |
/// | 8         | `G`               | Global (leaf only) |
/// | 9         | write intent      | OS bit: the mapping may become writable |
/// | 10–11     | OS avail low      | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–58     | OS avail high     | Reserved for OS use |
/// | 59–62     | `PKU` / OS use    | Protection key or OS use |
/// | 63        | `NX`              | Execute disable |
///
/// ### Notes
/// - `PS` must be 0 in L4 and L1 entries; valid in L3 (1 GiB) and L2 (2 MiB).
/// - An entry with `P = 0` is ignored by the MMU, so all other bits of a
///   not-present entry are free for software. Lazily drawn mappings keep
///   their final permission bits there until the first fault.
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let mut e = PageEntryBits::new();
/// e.set_present(true);
/// e.set_writable(true);
/// e.set_physical_address(PhysicalAddress::new(0x12345));
/// assert!(e.present());
/// assert_eq!(e.physical_address().as_u64(), 0x12000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Set if the entry points to a valid next-level table or a valid leaf
    /// mapping (depending on level/PS). Clear implies a not-present entry.
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Set to allow writes; clear for read-only. Copy-on-write sharing
    /// clears it while [`write_intent`](Self::write_intent) stays set.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6), **leaf only**. Set by the CPU on first write.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// For L3 (PDPTE) and L2 (PDE): when **set**, the entry is a **leaf**
    /// mapping to a 1 GiB (L3) or 2 MiB (L2) page. When **clear**, the entry
    /// points to the next-level table.
    pub large_page: bool,

    /// Global (G, bit 8), **leaf only**.
    ///
    /// When set on a leaf mapping, the TLB entry is not flushed on CR3 reload.
    pub global_translation: bool,

    /// Software bit: the mapping was drawn writable. Write faults on a
    /// read-only leaf are only resolved when this is set.
    pub write_intent: bool,

    /// OS-available (bits 10..=11).
    #[bits(2)]
    pub os_available_low: u8,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        // store bits [51:12]
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// Entry pointing at a next-level table.
    ///
    /// Table entries are permissive; the leaves decide the effective access.
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_physical_address(table)
    }

    /// Whether this entry maps memory at `level` rather than pointing to a
    /// table. Only meaningful for occupied entries.
    #[inline]
    #[must_use]
    pub const fn is_leaf(&self, level: PagingLevel) -> bool {
        matches!(level, PagingLevel::Pt) || self.large_page()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_bits_round_trip() {
        let pa = PhysicalAddress::new(0x000F_FFFF_FFFF_F000);
        let e = PageEntryBits::new()
            .with_present(true)
            .with_no_execute(true)
            .with_physical_address(pa);
        assert_eq!(e.physical_address(), pa);
        assert!(e.no_execute());
        assert_eq!(e.into_bits() & 0xFFF, 1);
    }

    #[test]
    fn leaf_detection_follows_ps_bit() {
        let table = PageEntryBits::table(PhysicalAddress::new(0x1000), false);
        assert!(!table.is_leaf(PagingLevel::Pd));
        assert!(table.is_leaf(PagingLevel::Pt));
        assert!(table.with_large_page(true).is_leaf(PagingLevel::Pdpt));
    }
}
