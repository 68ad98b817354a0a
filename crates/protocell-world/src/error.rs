//! Error types for the `protocell-world` crate.
//!
//! All fallible operations in this crate return [`WorldError`]. Invalid
//! dimensions are configuration errors and are rejected before a run starts.

use protocell_types::{CompartmentId, EntityId, IntVec2};

/// Errors that can occur while building or populating the compartment graph.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// The world extent is zero along at least one axis.
    #[error("invalid world size {}x{}: both extents must be non-zero", size.x, size.y)]
    InvalidWorldSize {
        /// The rejected extent.
        size: IntVec2,
    },

    /// The compartment grid does not evenly divide the world.
    #[error(
        "invalid compartment grid {}x{} for world {}x{}: grid must be non-zero and divide the world size",
        grid.x, grid.y, world.x, world.y
    )]
    InvalidGrid {
        /// World extent.
        world: IntVec2,
        /// Requested grid dimensions.
        grid: IntVec2,
    },

    /// A compartment id outside the graph was used.
    #[error("compartment not found: {0}")]
    CompartmentNotFound(CompartmentId),

    /// An entity id was not found in any compartment.
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    /// An inserted entity has a non-finite position or energy.
    #[error("entity {0} has a non-finite position, velocity or energy")]
    NonFiniteEntity(EntityId),

    /// An inserted cluster violates bond symmetry.
    #[error("cluster {0} has asymmetric or dangling bonds")]
    AsymmetricBonds(EntityId),

    /// The identifier space is exhausted.
    #[error("entity identifier space exhausted")]
    IdExhausted,
}
