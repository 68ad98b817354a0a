//! Bulk data exchanged with external collaborators between steps.
//!
//! A [`DataDescription`] is a detached copy of entities. Reading never
//! exposes live compartment storage and writing always goes through the
//! controller at a step boundary.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entities::{Cluster, Entity, Particle};
use crate::geometry::Vec2;
use crate::ids::EntityId;

/// A detached set of clusters and particles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataDescription {
    /// Clusters with their cells and tokens.
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    /// Free particles.
    #[serde(default)]
    pub particles: Vec<Particle>,
}

impl DataDescription {
    /// Whether the description holds no entity.
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty() && self.particles.is_empty()
    }

    /// Add a cluster, builder style.
    #[must_use]
    pub fn with_cluster(mut self, cluster: Cluster) -> Self {
        self.clusters.push(cluster);
        self
    }

    /// Add a particle, builder style.
    #[must_use]
    pub fn with_particle(mut self, particle: Particle) -> Self {
        self.particles.push(particle);
        self
    }

    /// Number of cells across all clusters.
    pub fn cell_count(&self) -> usize {
        self.clusters.iter().map(|c| c.cells.len()).sum()
    }

    /// Number of tokens across all cells.
    pub fn token_count(&self) -> usize {
        self.clusters.iter().map(Cluster::token_count).sum()
    }

    /// Total energy of every described entity.
    pub fn total_energy(&self) -> f64 {
        self.clusters.iter().map(Cluster::total_energy).sum::<f64>()
            + self.particles.iter().map(|p| p.energy).sum::<f64>()
    }

    /// Every entity id appearing in this description (clusters, cells,
    /// tokens and particles).
    pub fn entity_ids(&self) -> BTreeSet<EntityId> {
        let mut ids = BTreeSet::new();
        for cluster in &self.clusters {
            ids.insert(cluster.id);
            for cell in &cluster.cells {
                ids.insert(cell.id);
                ids.extend(cell.tokens.iter().map(|t| t.id));
            }
        }
        ids.extend(self.particles.iter().map(|p| p.id));
        ids
    }

    /// Flatten into top-level entities, clusters first.
    pub fn into_entities(self) -> Vec<Entity> {
        self.clusters
            .into_iter()
            .map(Entity::Cluster)
            .chain(self.particles.into_iter().map(Entity::Particle))
            .collect()
    }

    /// Append another description.
    pub fn extend(&mut self, other: Self) {
        self.clusters.extend(other.clusters);
        self.particles.extend(other.particles);
    }

    /// Sort clusters and particles by id so descriptions compare
    /// independently of compartment iteration order.
    pub fn sort_by_id(&mut self) {
        self.clusters.sort_by_key(|c| c.id);
        self.particles.sort_by_key(|p| p.id);
    }
}

/// Which entities a bulk read or removal applies to.
///
/// Selection works on top-level entities: a cluster is selected as a whole
/// when any of its cells matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selection {
    /// Every entity.
    All,
    /// Entities with a reference point or cell inside the axis-aligned
    /// rectangle spanned by the two corners (unwrapped world coordinates).
    Region {
        /// First corner.
        from: Vec2,
        /// Opposite corner.
        to: Vec2,
    },
    /// Entities whose own id, or the id of any cell or token they contain,
    /// is listed.
    Ids(BTreeSet<EntityId>),
}

impl Selection {
    /// Whether a point lies within a region selection.
    fn region_contains(from: Vec2, to: Vec2, pos: Vec2) -> bool {
        let (min_x, max_x) = (from.x.min(to.x), from.x.max(to.x));
        let (min_y, max_y) = (from.y.min(to.y), from.y.max(to.y));
        (min_x..=max_x).contains(&pos.x) && (min_y..=max_y).contains(&pos.y)
    }

    /// Whether this selection matches a particle.
    pub fn matches_particle(&self, particle: &Particle) -> bool {
        match self {
            Self::All => true,
            Self::Region { from, to } => Self::region_contains(*from, *to, particle.pos),
            Self::Ids(ids) => ids.contains(&particle.id),
        }
    }

    /// Whether this selection matches a cluster (as a whole).
    pub fn matches_cluster(&self, cluster: &Cluster) -> bool {
        match self {
            Self::All => true,
            Self::Region { from, to } => {
                Self::region_contains(*from, *to, cluster.pos)
                    || cluster
                        .cells
                        .iter()
                        .any(|c| Self::region_contains(*from, *to, cluster.cell_position(c)))
            }
            Self::Ids(ids) => {
                ids.contains(&cluster.id)
                    || cluster.cells.iter().any(|c| {
                        ids.contains(&c.id) || c.tokens.iter().any(|t| ids.contains(&t.id))
                    })
            }
        }
    }
}
