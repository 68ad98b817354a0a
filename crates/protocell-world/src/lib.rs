//! World geometry and per-compartment simulation for Protocell.
//!
//! The world is a wraparound rectangle partitioned into a regular grid of
//! compartments. Each compartment owns the particles and clusters whose
//! reference point lies in its rectangle and advances them independently of
//! every other compartment; cross-boundary movement goes through migration
//! queues that are exchanged after a barrier.
//!
//! # Modules
//!
//! - [`topology`] -- Wraparound positions and shortest displacements
//! - [`graph`] -- Grid partition, eight-way adjacency and single-hop resolution
//! - [`compartment`] -- Entity storage and the two step phases
//! - [`migration`] -- Migration records and single-writer mailboxes
//! - [`physics`] -- Kinematics, collisions and particle absorption
//! - [`structure`] -- Bond edits, new cells, token copies, death and splitting
//! - [`radiation`] -- Particle emission and mutation pressure
//! - [`population`] -- Seeded initial populations
//! - [`allocator`] -- Deterministic strided entity ids
//! - [`error`] -- Error types

pub mod allocator;
pub mod compartment;
pub mod error;
pub mod graph;
pub mod migration;
pub mod physics;
pub mod population;
pub mod radiation;
pub mod structure;
pub mod topology;

pub use allocator::IdAllocator;
pub use compartment::{Census, Compartment, StepContext, StepReport, validate_entity};
pub use error::WorldError;
pub use graph::{CompartmentGraph, Direction, Hop, Rect};
pub use migration::{Mailboxes, MigrationRecord};
pub use population::{PopulationRecipe, populate, random_token};
pub use topology::WorldTopology;
