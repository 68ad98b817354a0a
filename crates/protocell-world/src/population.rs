//! Seeded initial populations.
//!
//! A [`PopulationRecipe`] describes how many bonded chains and free
//! particles to scatter over the world. Generation draws from the caller's
//! generator and allocator, so a seed fully determines the result.

use rand::Rng;
use serde::{Deserialize, Serialize};

use protocell_types::{
    Cell, Cluster, DataDescription, EntityId, Particle, SimulationParameters, Token, Vec2,
};

use crate::allocator::IdAllocator;
use crate::error::WorldError;
use crate::topology::WorldTopology;

/// Spacing between neighbouring cells of a generated chain.
const CHAIN_SPACING: f64 = 1.0;

/// What to scatter over a fresh world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationRecipe {
    /// Number of clusters.
    #[serde(default = "default_clusters")]
    pub clusters: usize,
    /// Cells per cluster, bonded as a chain.
    #[serde(default = "default_cells_per_cluster")]
    pub cells_per_cluster: usize,
    /// Energy of each cell.
    #[serde(default = "default_cell_energy")]
    pub cell_energy: f64,
    /// Tokens with random memory placed on each cell.
    #[serde(default = "default_tokens_per_cell")]
    pub tokens_per_cell: usize,
    /// Energy of each token.
    #[serde(default = "default_token_energy")]
    pub token_energy: f64,
    /// Number of free particles.
    #[serde(default = "default_particles")]
    pub particles: usize,
    /// Energy of each particle.
    #[serde(default = "default_particle_energy")]
    pub particle_energy: f64,
    /// Upper bound of initial speeds.
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
}

fn default_clusters() -> usize {
    20
}

fn default_cells_per_cluster() -> usize {
    4
}

fn default_cell_energy() -> f64 {
    50.0
}

fn default_tokens_per_cell() -> usize {
    1
}

fn default_token_energy() -> f64 {
    10.0
}

fn default_particles() -> usize {
    100
}

fn default_particle_energy() -> f64 {
    5.0
}

fn default_max_speed() -> f64 {
    0.3
}

impl Default for PopulationRecipe {
    fn default() -> Self {
        Self {
            clusters: default_clusters(),
            cells_per_cluster: default_cells_per_cluster(),
            cell_energy: default_cell_energy(),
            tokens_per_cell: default_tokens_per_cell(),
            token_energy: default_token_energy(),
            particles: default_particles(),
            particle_energy: default_particle_energy(),
            max_speed: default_max_speed(),
        }
    }
}

/// A token whose memory is filled with random bytes.
pub fn random_token<R: Rng + ?Sized>(
    id: EntityId,
    energy: f64,
    memory_size: usize,
    rng: &mut R,
) -> Token {
    let mut token = Token::zeroed(id, memory_size, energy);
    rng.fill(token.memory.as_mut_slice());
    token
}

/// Generate the population described by `recipe`.
pub fn populate<R: Rng + ?Sized>(
    recipe: &PopulationRecipe,
    topology: &WorldTopology,
    params: &SimulationParameters,
    ids: &mut IdAllocator,
    rng: &mut R,
) -> Result<DataDescription, WorldError> {
    let extent = topology.extent();
    let mut data = DataDescription::default();

    for _ in 0..recipe.clusters {
        let cluster_id = ids.next_id()?;
        let mut cells: Vec<Cell> = Vec::with_capacity(recipe.cells_per_cluster);
        for i in 0..recipe.cells_per_cluster {
            let offset = Vec2::new(i as f64 * CHAIN_SPACING, 0.0);
            let mut cell = Cell::new(ids.next_id()?, offset, recipe.cell_energy, params.cell_max_bonds);
            for _ in 0..recipe.tokens_per_cell.min(usize::from(params.cell_max_tokens)) {
                cell.tokens.push(random_token(
                    ids.next_id()?,
                    recipe.token_energy,
                    params.token_memory_size,
                    rng,
                ));
            }
            if let Some(previous) = cells.last_mut() {
                if previous.has_free_bond_slot() && cell.has_free_bond_slot() {
                    previous.bonds.push(cell.id);
                    cell.bonds.push(previous.id);
                }
            }
            cells.push(cell);
        }
        let mut cluster = Cluster {
            id: cluster_id,
            pos: random_position(extent, rng),
            vel: random_velocity(recipe.max_speed, rng),
            angle: rng.random_range(0.0..core::f64::consts::TAU),
            angular_vel: 0.0,
            cells,
        };
        cluster.recenter();
        cluster.pos = topology.wrap(cluster.pos);
        data.clusters.push(cluster);
    }

    for _ in 0..recipe.particles {
        data.particles.push(Particle {
            id: ids.next_id()?,
            pos: random_position(extent, rng),
            vel: random_velocity(recipe.max_speed, rng),
            energy: recipe.particle_energy,
        });
    }
    Ok(data)
}

fn random_position<R: Rng + ?Sized>(extent: Vec2, rng: &mut R) -> Vec2 {
    Vec2::new(rng.random::<f64>() * extent.x, rng.random::<f64>() * extent.y)
}

fn random_velocity<R: Rng + ?Sized>(max_speed: f64, rng: &mut R) -> Vec2 {
    if max_speed <= 0.0 {
        return Vec2::ZERO;
    }
    Vec2::from_angle(rng.random_range(0.0..core::f64::consts::TAU))
        * rng.random_range(0.0..=max_speed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use protocell_types::IntVec2;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn generate(seed: u64) -> DataDescription {
        let topology = WorldTopology::new(IntVec2::new(100, 100)).unwrap();
        let mut ids = IdAllocator::new(1, 1, 0);
        let mut rng = SmallRng::seed_from_u64(seed);
        let recipe = PopulationRecipe {
            clusters: 5,
            particles: 7,
            ..PopulationRecipe::default()
        };
        populate(&recipe, &topology, &SimulationParameters::default(), &mut ids, &mut rng).unwrap()
    }

    #[test]
    fn recipe_counts_are_honoured() {
        let data = generate(1);
        assert_eq!(data.clusters.len(), 5);
        assert_eq!(data.particles.len(), 7);
        assert_eq!(data.cell_count(), 20);
        assert!(data.clusters.iter().all(Cluster::bonds_are_symmetric));
        assert!(
            data.clusters
                .iter()
                .flat_map(|c| c.cells.iter())
                .flat_map(|c| c.tokens.iter())
                .all(|t| t.memory.len() == SimulationParameters::default().token_memory_size)
        );
    }

    #[test]
    fn same_seed_same_population() {
        assert_eq!(generate(3), generate(3));
        assert_ne!(generate(3), generate(4));
    }

    #[test]
    fn missing_recipe_fields_take_defaults() {
        let recipe: PopulationRecipe = serde_json::from_str(r#"{"clusters": 2}"#).unwrap();
        assert_eq!(recipe.clusters, 2);
        assert_eq!(recipe.cells_per_cluster, default_cells_per_cluster());
    }
}
