//! Deterministic entity id allocation.
//!
//! Every compartment owns an [`IdAllocator`] with its own residue class:
//! `id = base + seq * stride + offset`. With `stride` larger than the
//! number of allocators and distinct offsets, allocators never collide, and
//! the ids a compartment hands out depend only on its own allocation order.

use protocell_types::EntityId;

use crate::error::WorldError;

/// Strided id allocator for one compartment (or the external control path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdAllocator {
    base: u64,
    stride: u64,
    offset: u64,
    next_seq: u64,
}

impl IdAllocator {
    /// Create an allocator starting at `base`.
    ///
    /// `offset` is reduced modulo `stride`; a zero stride is treated as one.
    pub fn new(base: u64, stride: u64, offset: u64) -> Self {
        let stride = stride.max(1);
        Self {
            base,
            stride,
            offset: offset.checked_rem(stride).unwrap_or(0),
            next_seq: 0,
        }
    }

    /// Allocator layout for `allocators` participants, the last slot being
    /// reserved for external inserts.
    pub fn for_slot(base: u64, allocators: usize, slot: usize) -> Self {
        let stride = u64::try_from(allocators).unwrap_or(u64::MAX);
        let offset = u64::try_from(slot).unwrap_or(0);
        Self::new(base, stride, offset)
    }

    /// Hand out the next id.
    pub fn next_id(&mut self) -> Result<EntityId, WorldError> {
        let id = self
            .next_seq
            .checked_mul(self.stride)
            .and_then(|v| v.checked_add(self.offset))
            .and_then(|v| v.checked_add(self.base))
            .ok_or(WorldError::IdExhausted)?;
        self.next_seq = self.next_seq.checked_add(1).ok_or(WorldError::IdExhausted)?;
        Ok(EntityId(id))
    }

    /// Number of ids handed out so far.
    pub const fn allocated(&self) -> u64 {
        self.next_seq
    }
}
