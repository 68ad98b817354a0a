//! Aggregated statistics snapshot consumed by external monitoring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable per-step statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorData {
    /// Timestep the snapshot describes.
    pub timestep: u64,
    /// Live free particles.
    pub particle_count: u64,
    /// Live clusters.
    pub cluster_count: u64,
    /// Live cells.
    pub cell_count: u64,
    /// Live tokens.
    pub token_count: u64,
    /// Energy held by all live entities.
    pub total_energy: f64,
    /// Mean energy per live particle, cell and token (0 when empty).
    pub average_energy: f64,
    /// Entities (particles, clusters, cells, tokens) created during the step.
    pub created_last_step: u64,
    /// Entities destroyed during the step.
    pub destroyed_last_step: u64,
    /// Top-level entities that changed compartment during the step.
    pub migrations_last_step: u64,
    /// Migrations that had to be clamped to a single hop.
    pub migration_overflows_last_step: u64,
    /// Energy injected by radiation during the step.
    pub radiation_energy_last_step: f64,
    /// Steps per second measured over recent step completions (0 until two
    /// steps have been recorded).
    #[serde(default)]
    pub measured_tps: f64,
    /// Wall-clock time the snapshot was taken.
    pub captured_at: DateTime<Utc>,
}

impl MonitorData {
    /// Snapshot of an empty world at the given timestep.
    pub fn empty(timestep: u64) -> Self {
        Self {
            timestep,
            particle_count: 0,
            cluster_count: 0,
            cell_count: 0,
            token_count: 0,
            total_energy: 0.0,
            average_energy: 0.0,
            created_last_step: 0,
            destroyed_last_step: 0,
            migrations_last_step: 0,
            migration_overflows_last_step: 0,
            radiation_energy_last_step: 0.0,
            measured_tps: 0.0,
            captured_at: Utc::now(),
        }
    }

    /// Number of live particles, cells and tokens.
    pub const fn energy_bearing_count(&self) -> u64 {
        self.particle_count
            .saturating_add(self.cell_count)
            .saturating_add(self.token_count)
    }
}
