//! Compartment graph: a regular grid partition of the toroidal world.
//!
//! Compartments live in an arena indexed by [`CompartmentId`]; neighbour
//! relations are lookups by id rather than references, so compartments can
//! be moved between worker threads without invalidating adjacency.
//!
//! Ids are assigned row by row: `id = gy * grid.x + gx`.

use serde::{Deserialize, Serialize};

use protocell_types::{CompartmentId, IntVec2, Vec2};

use crate::error::WorldError;
use crate::topology::WorldTopology;

/// Keeps clamped positions strictly inside a compartment's half-open rectangle.
const BOUNDARY_EPSILON: f64 = 1e-6;

/// The eight neighbour directions. `Upper` points towards smaller `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// `(-1, -1)`
    UpperLeft,
    /// `(0, -1)`
    Upper,
    /// `(+1, -1)`
    UpperRight,
    /// `(-1, 0)`
    Left,
    /// `(+1, 0)`
    Right,
    /// `(-1, +1)`
    LowerLeft,
    /// `(0, +1)`
    Lower,
    /// `(+1, +1)`
    LowerRight,
}

impl Direction {
    /// All directions in their fixed drain order.
    pub const ALL: [Self; 8] = [
        Self::UpperLeft,
        Self::Upper,
        Self::UpperRight,
        Self::Left,
        Self::Right,
        Self::LowerLeft,
        Self::Lower,
        Self::LowerRight,
    ];

    /// Grid offset `(dx, dy)` of this direction.
    pub const fn offset(self) -> (i8, i8) {
        match self {
            Self::UpperLeft => (-1, -1),
            Self::Upper => (0, -1),
            Self::UpperRight => (1, -1),
            Self::Left => (-1, 0),
            Self::Right => (1, 0),
            Self::LowerLeft => (-1, 1),
            Self::Lower => (0, 1),
            Self::LowerRight => (1, 1),
        }
    }

    /// Direction with the given offset, if it is a neighbour offset.
    pub const fn from_offset(dx: i8, dy: i8) -> Option<Self> {
        match (dx, dy) {
            (-1, -1) => Some(Self::UpperLeft),
            (0, -1) => Some(Self::Upper),
            (1, -1) => Some(Self::UpperRight),
            (-1, 0) => Some(Self::Left),
            (1, 0) => Some(Self::Right),
            (-1, 1) => Some(Self::LowerLeft),
            (0, 1) => Some(Self::Lower),
            (1, 1) => Some(Self::LowerRight),
            _ => None,
        }
    }

    /// The opposite direction.
    pub const fn reciprocal(self) -> Self {
        match self {
            Self::UpperLeft => Self::LowerRight,
            Self::Upper => Self::Lower,
            Self::UpperRight => Self::LowerLeft,
            Self::Left => Self::Right,
            Self::Right => Self::Left,
            Self::LowerLeft => Self::UpperRight,
            Self::Lower => Self::Upper,
            Self::LowerRight => Self::UpperLeft,
        }
    }

    /// Position of this direction in [`Direction::ALL`].
    pub const fn index(self) -> usize {
        match self {
            Self::UpperLeft => 0,
            Self::Upper => 1,
            Self::UpperRight => 2,
            Self::Left => 3,
            Self::Right => 4,
            Self::LowerLeft => 5,
            Self::Lower => 6,
            Self::LowerRight => 7,
        }
    }
}

/// A half-open axis-aligned rectangle `[min, min + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Lower corner.
    pub min: Vec2,
    /// Extent.
    pub size: Vec2,
}

impl Rect {
    /// Whether `pos` lies inside the rectangle.
    pub fn contains(&self, pos: Vec2) -> bool {
        pos.x >= self.min.x
            && pos.y >= self.min.y
            && pos.x < self.min.x + self.size.x
            && pos.y < self.min.y + self.size.y
    }

    /// Upper corner (exclusive).
    pub fn max(&self) -> Vec2 {
        self.min + self.size
    }
}

/// Where an entity goes at the end of a step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Hop {
    /// Still inside the current compartment.
    Stay,
    /// Moves to the adjacent compartment in `direction`.
    Move {
        /// Direction of travel.
        direction: Direction,
        /// Receiving compartment.
        target: CompartmentId,
    },
    /// Would skip over compartments; clamped into the adjacent one.
    Overflow {
        /// Direction of travel.
        direction: Direction,
        /// Receiving compartment.
        target: CompartmentId,
        /// Position clamped into the receiving compartment.
        clamped: Vec2,
    },
}

/// The partition of the world into a grid of compartments.
#[derive(Debug, Clone, PartialEq)]
pub struct CompartmentGraph {
    topology: WorldTopology,
    grid: IntVec2,
    cell_size: Vec2,
}

impl CompartmentGraph {
    /// Partition a world of `world_size` into `grid` compartments.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::InvalidWorldSize`] for a zero extent and
    /// [`WorldError::InvalidGrid`] if the grid is zero along an axis or does
    /// not evenly divide the world.
    pub fn build(world_size: IntVec2, grid: IntVec2) -> Result<Self, WorldError> {
        let topology = WorldTopology::new(world_size)?;
        let divides = |world: u32, cells: u32| cells != 0 && world.checked_rem(cells) == Some(0);
        if !divides(world_size.x, grid.x) || !divides(world_size.y, grid.y) {
            return Err(WorldError::InvalidGrid {
                world: world_size,
                grid,
            });
        }
        let cell_size = Vec2::new(
            f64::from(world_size.x) / f64::from(grid.x),
            f64::from(world_size.y) / f64::from(grid.y),
        );
        Ok(Self {
            topology,
            grid,
            cell_size,
        })
    }

    /// The underlying world geometry.
    pub const fn topology(&self) -> &WorldTopology {
        &self.topology
    }

    /// Grid dimensions.
    pub const fn grid(&self) -> IntVec2 {
        self.grid
    }

    /// Extent of a single compartment.
    pub const fn compartment_size(&self) -> Vec2 {
        self.cell_size
    }

    /// Number of compartments.
    pub fn compartment_count(&self) -> usize {
        usize::try_from(self.grid.area()).unwrap_or(usize::MAX)
    }

    /// All compartment ids in arena order.
    pub fn compartment_ids(&self) -> impl Iterator<Item = CompartmentId> + use<> {
        (0..self.compartment_count()).map(CompartmentId)
    }

    /// Grid coordinates `(gx, gy)` of a compartment.
    pub fn coords(&self, id: CompartmentId) -> Option<(u32, u32)> {
        if id.0 >= self.compartment_count() {
            return None;
        }
        let width = usize::try_from(self.grid.x).ok()?;
        let gx = u32::try_from(id.0.checked_rem(width)?).ok()?;
        let gy = u32::try_from(id.0.checked_div(width)?).ok()?;
        Some((gx, gy))
    }

    fn id_at(&self, gx: u32, gy: u32) -> CompartmentId {
        let index = u64::from(gy)
            .saturating_mul(u64::from(self.grid.x))
            .saturating_add(u64::from(gx));
        CompartmentId(usize::try_from(index).unwrap_or(usize::MAX))
    }

    /// Rectangle covered by a compartment.
    pub fn rect(&self, id: CompartmentId) -> Option<Rect> {
        let (gx, gy) = self.coords(id)?;
        Some(Rect {
            min: Vec2::new(
                f64::from(gx) * self.cell_size.x,
                f64::from(gy) * self.cell_size.y,
            ),
            size: self.cell_size,
        })
    }

    /// Neighbour of `id` in `direction`, with wraparound.
    pub fn neighbor(&self, id: CompartmentId, direction: Direction) -> Option<CompartmentId> {
        let (gx, gy) = self.coords(id)?;
        let (dx, dy) = direction.offset();
        Some(self.id_at(
            wrap_index(gx, dx, self.grid.x),
            wrap_index(gy, dy, self.grid.y),
        ))
    }

    /// Up to eight `(direction, neighbour)` pairs of a compartment.
    ///
    /// Directions that wrap back onto the compartment itself (grids one
    /// compartment wide) are omitted.
    pub fn neighbors_of(&self, id: CompartmentId) -> Vec<(Direction, CompartmentId)> {
        Direction::ALL
            .iter()
            .filter_map(|&d| self.neighbor(id, d).map(|n| (d, n)))
            .filter(|&(_, n)| n != id)
            .collect()
    }

    /// Compartment owning a (possibly unwrapped) world position.
    pub fn compartment_containing(&self, pos: Vec2) -> CompartmentId {
        let (gx, gy) = self.grid_position(pos);
        self.id_at(gx, gy)
    }

    fn grid_position(&self, pos: Vec2) -> (u32, u32) {
        let wrapped = self.topology.wrap(pos);
        let axis = |value: f64, size: f64, cells: u32| -> u32 {
            let raw = (value / size).floor();
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let index = raw.max(0.0) as u32;
            index.min(cells.saturating_sub(1))
        };
        (
            axis(wrapped.x, self.cell_size.x, self.grid.x),
            axis(wrapped.y, self.cell_size.y, self.grid.y),
        )
    }

    /// Resolve the single hop an entity at `pos` (owned by `from`) makes.
    ///
    /// Positions more than one compartment away along an axis are clamped
    /// into the adjacent compartment in that direction, at its far edge.
    pub fn single_hop(&self, from: CompartmentId, pos: Vec2) -> Hop {
        let Some((fx, fy)) = self.coords(from) else {
            return Hop::Stay;
        };
        let pos = self.topology.wrap(pos);
        let (tx, ty) = self.grid_position(pos);
        let dx = signed_grid_delta(fx, tx, self.grid.x);
        let dy = signed_grid_delta(fy, ty, self.grid.y);
        if dx == 0 && dy == 0 {
            return Hop::Stay;
        }
        let step_x = clamp_step(dx);
        let step_y = clamp_step(dy);
        let Some(direction) = Direction::from_offset(step_x, step_y) else {
            return Hop::Stay;
        };
        let Some(target) = self.neighbor(from, direction) else {
            return Hop::Stay;
        };
        if dx.abs() <= 1 && dy.abs() <= 1 {
            return Hop::Move { direction, target };
        }
        let Some(rect) = self.rect(target) else {
            return Hop::Stay;
        };
        let clamp_axis = |value: f64, step: i8, delta: i64, min: f64, max: f64| -> f64 {
            if delta.abs() <= 1 {
                value
            } else if step > 0 {
                max - BOUNDARY_EPSILON
            } else {
                min
            }
        };
        let clamped = Vec2::new(
            clamp_axis(pos.x, step_x, dx, rect.min.x, rect.max().x),
            clamp_axis(pos.y, step_y, dy, rect.min.y, rect.max().y),
        );
        Hop::Overflow {
            direction,
            target,
            clamped,
        }
    }
}

fn wrap_index(index: u32, delta: i8, cells: u32) -> u32 {
    let cells = i64::from(cells.max(1));
    let wrapped = i64::from(index)
        .saturating_add(i64::from(delta))
        .rem_euclid(cells);
    u32::try_from(wrapped).unwrap_or(0)
}

/// Signed minimal grid distance from `from` to `to` on a ring of `cells`.
/// Ties on even rings resolve to the positive direction.
fn signed_grid_delta(from: u32, to: u32, cells: u32) -> i64 {
    let n = i64::from(cells.max(1));
    let d = i64::from(to).saturating_sub(i64::from(from)).rem_euclid(n);
    if d.saturating_mul(2) > n {
        d.saturating_sub(n)
    } else {
        d
    }
}

const fn clamp_step(delta: i64) -> i8 {
    if delta > 0 {
        1
    } else if delta < 0 {
        -1
    } else {
        0
    }
}
