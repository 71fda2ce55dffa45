use crate::level::PagingLevel;
use crate::page_entry_bits::PageEntryBits;
use crate::policy::MappingPolicy;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Access rights of a mapping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Protection {
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
}

impl Protection {
    pub const KERNEL_RW: Self = Self::new(true, false, false);
    pub const KERNEL_RX: Self = Self::new(false, false, true);
    pub const USER_RW: Self = Self::new(true, true, false);
    pub const USER_RO: Self = Self::new(false, true, false);
    pub const USER_RX: Self = Self::new(false, true, true);

    #[must_use]
    pub const fn new(writable: bool, user: bool, executable: bool) -> Self {
        Self {
            writable,
            user,
            executable,
        }
    }

    /// Leaf entry for a mapping of `frame` at `level` under `policy`.
    ///
    /// Shared read-only mappings never get the writable bit; the drawn
    /// intent is kept in [`PageEntryBits::write_intent`] either way.
    #[must_use]
    pub const fn leaf(
        self,
        level: PagingLevel,
        frame: PhysicalAddress,
        policy: MappingPolicy,
        present: bool,
    ) -> PageEntryBits {
        let writable = self.writable && !matches!(policy, MappingPolicy::SharedReadOnly);
        PageEntryBits::new()
            .with_present(present)
            .with_writable(writable)
            .with_write_intent(writable)
            .with_user_access(self.user)
            .with_no_execute(!self.executable)
            .with_global_translation(matches!(policy, MappingPolicy::Kernel))
            .with_large_page(!matches!(level, PagingLevel::Pt))
            .with_physical_address(frame)
    }
}

/// Options of [`ExtendedPageTableRoot::draw`](crate::ExtendedPageTableRoot::draw).
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct DrawFlags {
    /// Occupy the entries without backing them; the first access faults.
    pub lazy: bool,
    /// Fail with `NotBlank` instead of replacing existing mappings.
    pub assert_blank: bool,
    /// Use 2 MiB / 1 GiB leaves where the range and frame are aligned.
    pub allow_huge: bool,
    #[bits(5)]
    __: u8,
}
