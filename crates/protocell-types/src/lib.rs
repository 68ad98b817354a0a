//! Shared type definitions for the Protocell simulation.
//!
//! This crate is the single source of truth for the data model used across
//! the Protocell workspace: identifiers, geometry, entities, settings, bulk
//! data descriptions and monitoring snapshots.
//!
//! # Modules
//!
//! - [`ids`] -- Typed identifiers for entities, compartments and runs
//! - [`geometry`] -- Real and integer 2D vectors
//! - [`entities`] -- Particles, tokens, cells and clusters
//! - [`parameters`] -- General settings and per-step simulation parameters
//! - [`description`] -- Detached bulk data and selections
//! - [`monitor`] -- Aggregated statistics snapshot

pub mod description;
pub mod entities;
pub mod geometry;
pub mod ids;
pub mod monitor;
pub mod parameters;

// Re-export all public types at crate root for convenience.
pub use description::{DataDescription, Selection};
pub use entities::{Cell, Cluster, Entity, Particle, Token};
pub use geometry::{IntVec2, Vec2};
pub use ids::{CompartmentId, EntityId, SimulationId};
pub use monitor::MonitorData;
pub use parameters::{
    GeneralSettings, InvalidParameter, MutationRates, MutationType, RadiationSource, Settings,
    SimulationParameters,
};
