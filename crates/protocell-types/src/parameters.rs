//! Simulation settings: general world layout and per-step parameters.
//!
//! [`SimulationParameters`] is immutable during a step. The controller may
//! replace it only between steps. Every field has a named default so that
//! decoding an older settings tree fills in missing values.

use serde::{Deserialize, Serialize};

use crate::geometry::{IntVec2, Vec2};

/// A parameter value outside of its valid domain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid parameter `{name}`: {reason}")]
pub struct InvalidParameter {
    /// Name of the offending field.
    pub name: &'static str,
    /// Explanation of the valid domain.
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Mutation configuration
// ---------------------------------------------------------------------------

/// The kinds of genome alteration the mutation engine can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MutationType {
    /// Replace one memory byte with a different value.
    PointMutation,
    /// Remove one byte, shifting the tail left and zero-filling the end.
    Deletion,
    /// Copy a segment over another position.
    Duplication,
    /// Swap two non-overlapping segments.
    Translocation,
    /// Insert a random byte, shifting the tail right and dropping the last.
    Insertion,
    /// Add or remove one bond of a cell inside its cluster.
    BondRewire,
}

impl MutationType {
    /// All mutation types in their fixed evaluation order.
    pub const ALL: [Self; 6] = [
        Self::PointMutation,
        Self::Deletion,
        Self::Duplication,
        Self::Translocation,
        Self::Insertion,
        Self::BondRewire,
    ];
}

/// Per-execution probability of each mutation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRates {
    /// Probability of a point mutation.
    #[serde(default = "default_point_rate")]
    pub point: f64,
    /// Probability of a deletion.
    #[serde(default = "default_structural_rate")]
    pub deletion: f64,
    /// Probability of a segment duplication.
    #[serde(default = "default_structural_rate")]
    pub duplication: f64,
    /// Probability of a translocation.
    #[serde(default = "default_structural_rate")]
    pub translocation: f64,
    /// Probability of an insertion.
    #[serde(default = "default_structural_rate")]
    pub insertion: f64,
    /// Probability of a bond rewire on the executing cell.
    #[serde(default = "default_structural_rate")]
    pub bond_rewire: f64,
}

impl MutationRates {
    /// No mutation at all.
    pub const NONE: Self = Self {
        point: 0.0,
        deletion: 0.0,
        duplication: 0.0,
        translocation: 0.0,
        insertion: 0.0,
        bond_rewire: 0.0,
    };

    /// Probability configured for the given type.
    pub const fn rate(&self, mutation: MutationType) -> f64 {
        match mutation {
            MutationType::PointMutation => self.point,
            MutationType::Deletion => self.deletion,
            MutationType::Duplication => self.duplication,
            MutationType::Translocation => self.translocation,
            MutationType::Insertion => self.insertion,
            MutationType::BondRewire => self.bond_rewire,
        }
    }
}

impl Default for MutationRates {
    fn default() -> Self {
        Self {
            point: default_point_rate(),
            deletion: default_structural_rate(),
            duplication: default_structural_rate(),
            translocation: default_structural_rate(),
            insertion: default_structural_rate(),
            bond_rewire: default_structural_rate(),
        }
    }
}

/// A world region that emits energy particles and applies mutation pressure
/// to tokens of cells inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadiationSource {
    /// Centre of the region.
    pub position: Vec2,
    /// Radius of the region.
    #[serde(default = "default_radiation_radius")]
    pub radius: f64,
    /// Chance per step that one particle is emitted.
    #[serde(default = "default_emission_probability")]
    pub emission_probability: f64,
    /// Energy of each emitted particle.
    #[serde(default = "default_emission_energy")]
    pub particle_energy: f64,
    /// Extra point-mutation probability for each token inside the region.
    #[serde(default = "default_radiation_mutation")]
    pub mutation_probability: f64,
}

// ---------------------------------------------------------------------------
// SimulationParameters
// ---------------------------------------------------------------------------

/// Process-wide parameters, read-only during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationParameters {
    /// Length of every token's memory in bytes.
    #[serde(default = "default_token_memory_size")]
    pub token_memory_size: usize,
    /// Number of branches the access selector is reduced modulo.
    #[serde(default = "default_branch_number")]
    pub cell_max_token_branch_number: u8,
    /// Maximum instructions a single token executes per step.
    #[serde(default = "default_instruction_budget")]
    pub instruction_budget: u32,
    /// Energy a token pays to its cell for every executed instruction.
    #[serde(default = "default_instruction_energy_cost")]
    pub instruction_energy_cost: f64,
    /// Energy moved per unit of an energy-transfer operand.
    #[serde(default = "default_energy_transfer_unit")]
    pub energy_transfer_unit: f64,
    /// Fraction of a token's energy given to a duplicate.
    #[serde(default = "default_token_duplication_fraction")]
    pub token_duplication_energy_fraction: f64,
    /// Tokens at or below this energy are consumed into their cell.
    #[serde(default)]
    pub token_min_energy: f64,
    /// Maximum bonds per cell.
    #[serde(default = "default_cell_max_bonds")]
    pub cell_max_bonds: u8,
    /// Maximum tokens resident on one cell.
    #[serde(default = "default_cell_max_tokens")]
    pub cell_max_tokens: u8,
    /// Cells at or below this energy dissolve into a particle.
    #[serde(default = "default_cell_min_energy")]
    pub cell_min_energy: f64,
    /// Energy a parent cell spends to construct a new cell.
    #[serde(default = "default_cell_creation_energy")]
    pub cell_creation_energy: f64,
    /// Maximum distance between two cells for a new bond.
    #[serde(default = "default_cell_bond_distance")]
    pub cell_bond_distance: f64,
    /// Distance below which a cell absorbs a particle.
    #[serde(default = "default_cell_fusion_distance")]
    pub cell_fusion_distance: f64,
    /// Fraction of velocity lost per step.
    #[serde(default = "default_friction")]
    pub friction: f64,
    /// Mutation probabilities per token execution.
    #[serde(default)]
    pub mutation_rates: MutationRates,
    /// Configured radiation sources.
    #[serde(default)]
    pub radiation_sources: Vec<RadiationSource>,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            token_memory_size: default_token_memory_size(),
            cell_max_token_branch_number: default_branch_number(),
            instruction_budget: default_instruction_budget(),
            instruction_energy_cost: default_instruction_energy_cost(),
            energy_transfer_unit: default_energy_transfer_unit(),
            token_duplication_energy_fraction: default_token_duplication_fraction(),
            token_min_energy: 0.0,
            cell_max_bonds: default_cell_max_bonds(),
            cell_max_tokens: default_cell_max_tokens(),
            cell_min_energy: default_cell_min_energy(),
            cell_creation_energy: default_cell_creation_energy(),
            cell_bond_distance: default_cell_bond_distance(),
            cell_fusion_distance: default_cell_fusion_distance(),
            friction: default_friction(),
            mutation_rates: MutationRates::default(),
            radiation_sources: Vec::new(),
        }
    }
}

impl SimulationParameters {
    /// Reject values outside their valid domain.
    pub fn validate(&self) -> Result<(), InvalidParameter> {
        if self.token_memory_size == 0 {
            return Err(invalid("token_memory_size", "must be at least 1"));
        }
        if self.cell_max_token_branch_number == 0 {
            return Err(invalid("cell_max_token_branch_number", "must be at least 1"));
        }
        if self.instruction_budget == 0 {
            return Err(invalid("instruction_budget", "must be at least 1"));
        }
        for (name, value) in [
            ("instruction_energy_cost", self.instruction_energy_cost),
            ("energy_transfer_unit", self.energy_transfer_unit),
            ("token_min_energy", self.token_min_energy),
            ("cell_min_energy", self.cell_min_energy),
            ("cell_creation_energy", self.cell_creation_energy),
            ("cell_bond_distance", self.cell_bond_distance),
            ("cell_fusion_distance", self.cell_fusion_distance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(name, "must be a finite non-negative number"));
            }
        }
        for (name, value) in [
            (
                "token_duplication_energy_fraction",
                self.token_duplication_energy_fraction,
            ),
            ("friction", self.friction),
        ] {
            check_unit_interval(name, value)?;
        }
        for mutation in MutationType::ALL {
            check_unit_interval("mutation_rates", self.mutation_rates.rate(mutation))?;
        }
        for source in &self.radiation_sources {
            if !source.position.is_finite() || !source.radius.is_finite() || source.radius < 0.0 {
                return Err(invalid("radiation_sources", "region must be finite"));
            }
            if !source.particle_energy.is_finite() || source.particle_energy < 0.0 {
                return Err(invalid(
                    "radiation_sources",
                    "particle energy must be non-negative",
                ));
            }
            check_unit_interval("radiation_sources", source.emission_probability)?;
            check_unit_interval("radiation_sources", source.mutation_probability)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// General settings
// ---------------------------------------------------------------------------

/// World layout and execution resources. Changing these rebuilds the
/// compartment graph and is only allowed while the simulation is stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// World extent in world units.
    #[serde(default = "default_world_size")]
    pub world_size: IntVec2,
    /// Number of compartments along each axis.
    #[serde(default = "default_grid_dims")]
    pub grid_dims: IntVec2,
    /// Worker threads in the scheduler pool.
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    /// Seed for every pseudo-random stream.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            world_size: default_world_size(),
            grid_dims: default_grid_dims(),
            thread_count: default_thread_count(),
            seed: default_seed(),
        }
    }
}

/// Everything needed to construct a simulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// World layout and execution resources.
    #[serde(default)]
    pub general: GeneralSettings,
    /// Per-step simulation parameters.
    #[serde(default)]
    pub parameters: SimulationParameters,
}

fn invalid(name: &'static str, reason: &str) -> InvalidParameter {
    InvalidParameter {
        name,
        reason: reason.to_owned(),
    }
}

fn check_unit_interval(name: &'static str, value: f64) -> Result<(), InvalidParameter> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(name, "must lie in [0, 1]"))
    }
}

const fn default_token_memory_size() -> usize {
    256
}
const fn default_branch_number() -> u8 {
    6
}
const fn default_instruction_budget() -> u32 {
    64
}
const fn default_instruction_energy_cost() -> f64 {
    0.05
}
const fn default_energy_transfer_unit() -> f64 {
    0.1
}
const fn default_token_duplication_fraction() -> f64 {
    0.5
}
const fn default_cell_max_bonds() -> u8 {
    6
}
const fn default_cell_max_tokens() -> u8 {
    3
}
const fn default_cell_min_energy() -> f64 {
    0.5
}
const fn default_cell_creation_energy() -> f64 {
    20.0
}
const fn default_cell_bond_distance() -> f64 {
    1.5
}
const fn default_cell_fusion_distance() -> f64 {
    1.0
}
const fn default_friction() -> f64 {
    0.001
}
const fn default_point_rate() -> f64 {
    0.001
}
const fn default_structural_rate() -> f64 {
    0.0002
}
const fn default_radiation_radius() -> f64 {
    10.0
}
const fn default_emission_probability() -> f64 {
    0.1
}
const fn default_emission_energy() -> f64 {
    5.0
}
const fn default_radiation_mutation() -> f64 {
    0.01
}
const fn default_world_size() -> IntVec2 {
    IntVec2::new(200, 100)
}
const fn default_grid_dims() -> IntVec2 {
    IntVec2::new(4, 2)
}
const fn default_thread_count() -> usize {
    1
}
const fn default_seed() -> u64 {
    0x5EED_CE11
}
