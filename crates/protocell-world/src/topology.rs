//! Toroidal world geometry.
//!
//! [`WorldTopology`] is pure geometry with no mutable state: it wraps
//! positions into the world rectangle and measures shortest displacements
//! across the wraparound seams.

use protocell_types::{IntVec2, Vec2};

use crate::error::WorldError;

/// Extent of the wraparound world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldTopology {
    size: IntVec2,
}

impl WorldTopology {
    /// Create a topology for a world of the given extent.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::InvalidWorldSize`] if either extent is zero.
    pub const fn new(size: IntVec2) -> Result<Self, WorldError> {
        if size.x == 0 || size.y == 0 {
            return Err(WorldError::InvalidWorldSize { size });
        }
        Ok(Self { size })
    }

    /// World extent.
    pub const fn size(&self) -> IntVec2 {
        self.size
    }

    /// World extent as a real vector.
    pub fn extent(&self) -> Vec2 {
        Vec2::from(self.size)
    }

    /// Map a position into `[0, width) x [0, height)`.
    pub fn wrap(&self, pos: Vec2) -> Vec2 {
        let extent = self.extent();
        Vec2::new(wrap_axis(pos.x, extent.x), wrap_axis(pos.y, extent.y))
    }

    /// Shortest vector from `from` to `to` across the wraparound seams.
    pub fn displacement(&self, from: Vec2, to: Vec2) -> Vec2 {
        let extent = self.extent();
        let raw = to - from;
        Vec2::new(shortest_axis(raw.x, extent.x), shortest_axis(raw.y, extent.y))
    }

    /// Shortest distance between two positions.
    pub fn distance(&self, a: Vec2, b: Vec2) -> f64 {
        self.displacement(a, b).length()
    }
}

fn wrap_axis(value: f64, extent: f64) -> f64 {
    let wrapped = value.rem_euclid(extent);
    // rem_euclid can round up to `extent` for tiny negative inputs.
    if wrapped >= extent { 0.0 } else { wrapped }
}

fn shortest_axis(delta: f64, extent: f64) -> f64 {
    let half = extent / 2.0;
    let wrapped = (delta + half).rem_euclid(extent) - half;
    if wrapped < -half { wrapped + extent } else { wrapped }
}
