//! Simulated RAM for host-side tests.
//!
//! A [`PhysArena`] owns page-aligned host memory and pretends it lives at an
//! arbitrary physical base. Its [`mapper`](PhysArena::mapper) is a regular
//! [`HhdmPhysMapper`] whose offset points into the buffer.

use crate::phys_mapper::HhdmPhysMapper;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

pub struct PhysArena {
    frames: Vec<Frame>,
    base: PhysicalAddress,
}

impl PhysArena {
    /// `frames` zeroed frames standing in for RAM at `base`.
    ///
    /// # Panics
    /// If `base` is not page aligned.
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        assert!(base.is_aligned_to(PAGE_SIZE), "arena base must be page aligned");
        let frames = (0..frames).map(|_| Frame([0; PAGE_SIZE as usize])).collect();
        Self { frames, base }
    }

    #[must_use]
    pub fn mapper(&self) -> HhdmPhysMapper {
        let host = self.frames.as_ptr() as u64;
        HhdmPhysMapper::with_offset(host.wrapping_sub(self.base.as_u64()))
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// First physical address past the arena.
    #[must_use]
    pub fn end(&self) -> PhysicalAddress {
        self.base + self.frames.len() as u64 * PAGE_SIZE
    }

    #[must_use]
    pub fn frames(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.base && pa < self.end()
    }
}
