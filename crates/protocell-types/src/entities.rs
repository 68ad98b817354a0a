//! Entity structs: particles, tokens, cells and clusters.
//!
//! Ownership is strictly hierarchical. A [`Cluster`] owns its [`Cell`]s, a
//! cell owns its [`Token`]s, and every particle or cluster is owned by exactly
//! one compartment. Cells inside a cluster store positions relative to the
//! cluster's reference point (its centre of mass) in the cluster's unrotated
//! frame; absolute positions are derived on demand.

use serde::{Deserialize, Serialize};

use crate::geometry::Vec2;
use crate::ids::EntityId;

// ---------------------------------------------------------------------------
// Particle
// ---------------------------------------------------------------------------

/// A free-floating energy packet with a velocity and no program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Stable identifier.
    pub id: EntityId,
    /// Absolute world position.
    pub pos: Vec2,
    /// Displacement per step.
    pub vel: Vec2,
    /// Carried energy.
    pub energy: f64,
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// A genetic program: a fixed-size byte memory plus an energy value.
///
/// The memory length always equals the configured token memory size. Byte 0
/// is the access selector used for branch selection among the owning cell's
/// bonds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Stable identifier.
    pub id: EntityId,
    /// Program and data memory.
    pub memory: Vec<u8>,
    /// Energy available for execution.
    pub energy: f64,
}

impl Token {
    /// Create a token with zeroed memory of `memory_size` bytes.
    pub fn zeroed(id: EntityId, memory_size: usize, energy: f64) -> Self {
        Self {
            id,
            memory: vec![0; memory_size],
            energy,
        }
    }

    /// Create a token from existing memory, truncated or zero-padded to
    /// `memory_size`.
    pub fn with_memory(id: EntityId, energy: f64, memory: &[u8], memory_size: usize) -> Self {
        let mut token = Self {
            id,
            memory: memory.to_vec(),
            energy,
        };
        token.resize_memory(memory_size);
        token
    }

    /// Copy memory and energy into a new token with the given id.
    pub fn duplicate(&self, id: EntityId) -> Self {
        Self {
            id,
            memory: self.memory.clone(),
            energy: self.energy,
        }
    }

    /// Truncate or zero-pad the memory to exactly `memory_size` bytes.
    pub fn resize_memory(&mut self, memory_size: usize) {
        self.memory.resize(memory_size, 0);
    }

    /// Branch selector: byte 0 taken modulo `branch_count`.
    ///
    /// Any byte value is valid. A zero branch count or empty memory yields 0.
    pub fn access_number(&self, branch_count: u8) -> u8 {
        let selector = self.memory.first().copied().unwrap_or(0);
        selector.checked_rem(branch_count).unwrap_or(0)
    }

    /// Overwrite the access selector byte.
    pub fn set_access_number(&mut self, value: u8) {
        if let Some(first) = self.memory.first_mut() {
            *first = value;
        }
    }
}

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

/// A bonded member of a [`Cluster`] carrying zero or more tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Stable identifier.
    pub id: EntityId,
    /// Position relative to the cluster reference point (unrotated frame).
    pub rel_pos: Vec2,
    /// Cell energy.
    pub energy: f64,
    /// Ids of bonded cells in the same cluster. Always symmetric.
    pub bonds: Vec<EntityId>,
    /// Maximum number of bonds this cell accepts.
    pub max_bonds: u8,
    /// Tokens currently residing on this cell.
    pub tokens: Vec<Token>,
}

impl Cell {
    /// Create an unbonded cell without tokens.
    pub const fn new(id: EntityId, rel_pos: Vec2, energy: f64, max_bonds: u8) -> Self {
        Self {
            id,
            rel_pos,
            energy,
            bonds: Vec::new(),
            max_bonds,
            tokens: Vec::new(),
        }
    }

    /// Whether this cell is bonded to `other`.
    pub fn is_bonded_to(&self, other: EntityId) -> bool {
        self.bonds.contains(&other)
    }

    /// Whether another bond can be attached.
    pub fn has_free_bond_slot(&self) -> bool {
        self.bonds.len() < usize::from(self.max_bonds)
    }

    /// Energy held by the cell plus all of its tokens.
    pub fn total_energy(&self) -> f64 {
        self.energy + self.tokens.iter().map(|t| t.energy).sum::<f64>()
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// A bonded graph of cells moving as one kinematic body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Stable identifier.
    pub id: EntityId,
    /// Reference point (centre of mass) in absolute world coordinates.
    pub pos: Vec2,
    /// Linear displacement per step.
    pub vel: Vec2,
    /// Orientation in radians.
    pub angle: f64,
    /// Angular displacement per step in radians.
    pub angular_vel: f64,
    /// Member cells.
    pub cells: Vec<Cell>,
}

impl Cluster {
    /// Absolute (unwrapped) position of a member cell.
    pub fn cell_position(&self, cell: &Cell) -> Vec2 {
        self.pos + cell.rel_pos.rotated(self.angle)
    }

    /// Index of the cell with the given id.
    pub fn cell_index(&self, id: EntityId) -> Option<usize> {
        self.cells.iter().position(|c| c.id == id)
    }

    /// Number of tokens across all member cells.
    pub fn token_count(&self) -> usize {
        self.cells.iter().map(|c| c.tokens.len()).sum()
    }

    /// Energy held by all cells and tokens of this cluster.
    pub fn total_energy(&self) -> f64 {
        self.cells.iter().map(Cell::total_energy).sum()
    }

    /// Radius of the smallest circle around the reference point containing
    /// every cell centre.
    pub fn radius(&self) -> f64 {
        self.cells
            .iter()
            .map(|c| c.rel_pos.length())
            .fold(0.0, f64::max)
    }

    /// Shift the reference point onto the centre of mass of the member cells
    /// without moving any cell in world space.
    pub fn recenter(&mut self) {
        if self.cells.is_empty() {
            return;
        }
        let count = self.cells.len() as f64;
        let mut sum = Vec2::ZERO;
        for cell in &self.cells {
            sum += cell.rel_pos;
        }
        let center = sum * (1.0 / count);
        for cell in &mut self.cells {
            cell.rel_pos -= center;
        }
        self.pos += center.rotated(self.angle);
    }

    /// Check that every bond is listed by both endpoints and points at a
    /// member of this cluster.
    pub fn bonds_are_symmetric(&self) -> bool {
        self.cells.iter().all(|cell| {
            cell.bonds.iter().all(|other| {
                self.cells
                    .iter()
                    .find(|c| c.id == *other)
                    .is_some_and(|c| c.is_bonded_to(cell.id))
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A top-level unit of compartment ownership.
///
/// Cells and tokens never move between compartments on their own: they travel
/// inside their cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    /// A free particle.
    Particle(Particle),
    /// A bonded cluster with its cells and tokens.
    Cluster(Cluster),
}

impl Entity {
    /// Identifier of the top-level entity.
    pub const fn id(&self) -> EntityId {
        match self {
            Self::Particle(p) => p.id,
            Self::Cluster(c) => c.id,
        }
    }

    /// Reference position used to resolve the owning compartment.
    pub const fn position(&self) -> Vec2 {
        match self {
            Self::Particle(p) => p.pos,
            Self::Cluster(c) => c.pos,
        }
    }

    /// Total energy carried by this entity and everything it owns.
    pub fn total_energy(&self) -> f64 {
        match self {
            Self::Particle(p) => p.energy,
            Self::Cluster(c) => c.total_energy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bonded_pair() -> Cluster {
        let mut a = Cell::new(EntityId(1), Vec2::new(-0.5, 0.0), 10.0, 4);
        let mut b = Cell::new(EntityId(2), Vec2::new(0.5, 0.0), 10.0, 4);
        a.bonds.push(b.id);
        b.bonds.push(a.id);
        Cluster {
            id: EntityId(3),
            pos: Vec2::new(10.0, 10.0),
            vel: Vec2::ZERO,
            angle: 0.0,
            angular_vel: 0.0,
            cells: vec![a, b],
        }
    }

    #[test]
    fn access_number_wraps_any_byte() {
        let mut token = Token::zeroed(EntityId(1), 8, 1.0);
        token.set_access_number(255);
        assert_eq!(token.access_number(6), 255 % 6);
        assert_eq!(token.access_number(0), 0);
    }

    #[test]
    fn with_memory_truncates_and_pads() {
        let long = Token::with_memory(EntityId(1), 0.0, &[1, 2, 3, 4], 2);
        assert_eq!(long.memory, vec![1, 2]);
        let short = Token::with_memory(EntityId(2), 0.0, &[9], 3);
        assert_eq!(short.memory, vec![9, 0, 0]);
    }

    #[test]
    fn duplicate_copies_memory_and_energy() {
        let original = Token::with_memory(EntityId(1), 5.0, &[7, 7], 2);
        let copy = original.duplicate(EntityId(2));
        assert_eq!(copy.memory, original.memory);
        assert!((copy.energy - 5.0).abs() < f64::EPSILON);
        assert_eq!(copy.id, EntityId(2));
    }

    #[test]
    fn recenter_keeps_world_positions() {
        let mut cluster = bonded_pair();
        if let Some(cell) = cluster.cells.get_mut(0) {
            cell.rel_pos = Vec2::new(0.0, 0.0);
        }
        let before: Vec<Vec2> = cluster.cells.iter().map(|c| cluster.cell_position(c)).collect();
        cluster.recenter();
        let after: Vec<Vec2> = cluster.cells.iter().map(|c| cluster.cell_position(c)).collect();
        for (a, b) in before.iter().zip(&after) {
            assert!((*a - *b).length() < 1e-9);
        }
    }

    #[test]
    fn symmetric_bonds_detected() {
        let mut cluster = bonded_pair();
        assert!(cluster.bonds_are_symmetric());
        if let Some(cell) = cluster.cells.get_mut(1) {
            cell.bonds.clear();
        }
        assert!(!cluster.bonds_are_symmetric());
    }

    #[test]
    fn cluster_energy_includes_tokens() {
        let mut cluster = bonded_pair();
        if let Some(cell) = cluster.cells.get_mut(0) {
            cell.tokens.push(Token::zeroed(EntityId(9), 4, 2.5));
        }
        assert!((cluster.total_energy() - 22.5).abs() < 1e-9);
        assert_eq!(cluster.token_count(), 1);
    }
}
