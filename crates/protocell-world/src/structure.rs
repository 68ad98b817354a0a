//! Structural changes to clusters: bond edits, token copies, new cells,
//! token consumption, cell death and splitting.
//!
//! Requests from token execution arrive in execution order and are applied
//! in that order, so id allocation is reproducible. Energy carved out for a
//! request that cannot be honoured is refunded to the requesting cell.

use std::collections::VecDeque;

use tracing::warn;

use protocell_genome::StructuralRequest;
use protocell_types::{Cell, Cluster, EntityId, Particle, SimulationParameters, Token, Vec2};

use crate::allocator::IdAllocator;
use crate::error::WorldError;

/// What happened to a structural request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A bond was created.
    Bonded,
    /// A bond was removed; the cluster may have fallen apart.
    Unbonded,
    /// A new token or cell was created.
    Created(EntityId),
    /// The request could not be honoured and its energy went back.
    Refunded,
    /// Nothing to do.
    Ignored,
}

/// Apply one request to the cluster that issued it.
pub fn apply_request(
    cluster: &mut Cluster,
    request: StructuralRequest,
    params: &SimulationParameters,
    ids: &mut IdAllocator,
) -> RequestOutcome {
    match request {
        StructuralRequest::CreateBond { cell } => create_bond(cluster, cell, params),
        StructuralRequest::RemoveBond { cell, other } => {
            if remove_bond(cluster, cell, other) {
                RequestOutcome::Unbonded
            } else {
                RequestOutcome::Ignored
            }
        }
        StructuralRequest::DuplicateToken {
            origin,
            target,
            memory,
            energy,
        } => {
            let room = cluster
                .cell_index(target)
                .and_then(|i| cluster.cells.get(i))
                .is_some_and(|c| c.tokens.len() < usize::from(params.cell_max_tokens));
            if room {
                match ids.next_id() {
                    Ok(id) => {
                        let token = Token::with_memory(id, energy, &memory, params.token_memory_size);
                        if let Some(cell) = cluster.cells.iter_mut().find(|c| c.id == target) {
                            cell.tokens.push(token);
                            return RequestOutcome::Created(id);
                        }
                    }
                    Err(err) => warn!(%err, cluster = %cluster.id, "Token copy dropped"),
                }
            }
            refund(cluster, origin, energy);
            RequestOutcome::Refunded
        }
        StructuralRequest::ConstructCell {
            parent,
            direction,
            energy,
        } => construct_cell(cluster, parent, direction, energy, params, ids),
    }
}

fn create_bond(cluster: &mut Cluster, cell: EntityId, params: &SimulationParameters) -> RequestOutcome {
    let Some(origin) = cluster.cells.iter().find(|c| c.id == cell) else {
        return RequestOutcome::Ignored;
    };
    if !origin.has_free_bond_slot() {
        return RequestOutcome::Ignored;
    }
    let partner = cluster
        .cells
        .iter()
        .filter(|c| c.id != cell && c.has_free_bond_slot() && !origin.is_bonded_to(c.id))
        .map(|c| ((c.rel_pos - origin.rel_pos).length(), c.id))
        .filter(|(distance, _)| *distance <= params.cell_bond_distance)
        .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
        .map(|(_, id)| id);
    let Some(partner) = partner else {
        return RequestOutcome::Ignored;
    };
    for c in &mut cluster.cells {
        if c.id == cell {
            c.bonds.push(partner);
        } else if c.id == partner {
            c.bonds.push(cell);
        }
    }
    RequestOutcome::Bonded
}

/// Remove the bond between two cells on both sides. Returns whether a bond
/// existed.
pub fn remove_bond(cluster: &mut Cluster, a: EntityId, b: EntityId) -> bool {
    let mut removed = false;
    for cell in &mut cluster.cells {
        let other = if cell.id == a {
            b
        } else if cell.id == b {
            a
        } else {
            continue;
        };
        let before = cell.bonds.len();
        cell.bonds.retain(|id| *id != other);
        removed |= cell.bonds.len() != before;
    }
    removed
}

fn construct_cell(
    cluster: &mut Cluster,
    parent: EntityId,
    direction: f64,
    energy: f64,
    params: &SimulationParameters,
    ids: &mut IdAllocator,
) -> RequestOutcome {
    let anchor = cluster
        .cells
        .iter()
        .find(|c| c.id == parent && c.has_free_bond_slot())
        .map(|c| c.rel_pos);
    let Some(anchor) = anchor else {
        refund(cluster, parent, energy);
        return RequestOutcome::Refunded;
    };
    let id = match ids.next_id() {
        Ok(id) => id,
        Err(err) => {
            warn!(%err, cluster = %cluster.id, "Cell construction dropped");
            refund(cluster, parent, energy);
            return RequestOutcome::Refunded;
        }
    };
    let offset = Vec2::from_angle(direction) * params.cell_bond_distance;
    let mut child = Cell::new(id, anchor + offset, energy, params.cell_max_bonds.max(1));
    child.bonds.push(parent);
    if let Some(p) = cluster.cells.iter_mut().find(|c| c.id == parent) {
        p.bonds.push(id);
    }
    cluster.cells.push(child);
    cluster.recenter();
    RequestOutcome::Created(id)
}

/// Return energy to `cell`, or to the first cell if it is gone.
fn refund(cluster: &mut Cluster, cell: EntityId, energy: f64) {
    let index = cluster.cell_index(cell).unwrap_or(0);
    if let Some(c) = cluster.cells.get_mut(index) {
        c.energy += energy;
    }
}

/// Fold tokens at or below `min_energy` into their cells. Returns how many
/// were consumed.
pub fn consume_weak_tokens(cluster: &mut Cluster, min_energy: f64) -> u64 {
    let mut consumed = 0_u64;
    for cell in &mut cluster.cells {
        let Cell { tokens, energy, .. } = cell;
        tokens.retain(|token| {
            if token.energy <= min_energy {
                *energy += token.energy;
                consumed = consumed.saturating_add(1);
                false
            } else {
                true
            }
        });
    }
    consumed
}

/// Entities removed by [`dissolve_dead_cells`].
#[derive(Debug, Default)]
pub struct Dissolution {
    /// Particles carrying the energy of the dead cells and their tokens.
    pub particles: Vec<Particle>,
    /// Cells and tokens destroyed.
    pub destroyed: u64,
}

/// Turn every cell at or below `min_energy` into a particle at its world
/// position, carrying the cell's and its tokens' energy.
pub fn dissolve_dead_cells(
    cluster: &mut Cluster,
    min_energy: f64,
    ids: &mut IdAllocator,
) -> Result<Dissolution, WorldError> {
    let mut out = Dissolution::default();
    let dead: Vec<EntityId> = cluster
        .cells
        .iter()
        .filter(|c| c.energy <= min_energy)
        .map(|c| c.id)
        .collect();
    for id in dead {
        let Some(index) = cluster.cell_index(id) else {
            continue;
        };
        let particle_id = ids.next_id()?;
        let cell = cluster.cells.remove(index);
        out.particles.push(Particle {
            id: particle_id,
            pos: cluster.cell_position(&cell),
            vel: cluster.vel,
            energy: cell.total_energy(),
        });
        let tokens = u64::try_from(cell.tokens.len()).unwrap_or(u64::MAX);
        out.destroyed = out.destroyed.saturating_add(1).saturating_add(tokens);
        for other in &mut cluster.cells {
            other.bonds.retain(|b| *b != id);
        }
    }
    Ok(out)
}

/// Split a cluster into its bond-connected components.
///
/// The component holding the first cell keeps the cluster's id; the others
/// become new clusters sharing its motion. Every part is recentred on its
/// own centre of mass.
pub fn split_disconnected(
    cluster: &mut Cluster,
    ids: &mut IdAllocator,
) -> Result<Vec<Cluster>, WorldError> {
    let components = components(&cluster.cells);
    if components.len() <= 1 {
        cluster.recenter();
        return Ok(Vec::new());
    }
    let mut remaining: Vec<Option<Cell>> = std::mem::take(&mut cluster.cells)
        .into_iter()
        .map(Some)
        .collect();
    let mut parts = Vec::with_capacity(components.len());
    for component in components {
        let cells: Vec<Cell> = component
            .iter()
            .filter_map(|&i| remaining.get_mut(i).and_then(Option::take))
            .collect();
        parts.push(cells);
    }
    let mut parts = parts.into_iter();
    cluster.cells = parts.next().unwrap_or_default();
    let mut detached = Vec::new();
    for cells in parts {
        let mut part = Cluster {
            id: ids.next_id()?,
            pos: cluster.pos,
            vel: cluster.vel,
            angle: cluster.angle,
            angular_vel: cluster.angular_vel,
            cells,
        };
        part.recenter();
        detached.push(part);
    }
    cluster.recenter();
    Ok(detached)
}

/// Connected components as lists of cell indices, ordered by their lowest
/// index.
fn components(cells: &[Cell]) -> Vec<Vec<usize>> {
    let mut seen = vec![false; cells.len()];
    let mut out = Vec::new();
    for start in 0..cells.len() {
        if seen.get(start).copied().unwrap_or(true) {
            continue;
        }
        let mut component = Vec::new();
        let mut queue = VecDeque::from([start]);
        if let Some(flag) = seen.get_mut(start) {
            *flag = true;
        }
        while let Some(i) = queue.pop_front() {
            component.push(i);
            let Some(cell) = cells.get(i) else {
                continue;
            };
            for bond in &cell.bonds {
                let Some(j) = cells.iter().position(|c| c.id == *bond) else {
                    continue;
                };
                if let Some(flag) = seen.get_mut(j) {
                    if !*flag {
                        *flag = true;
                        queue.push_back(j);
                    }
                }
            }
        }
        component.sort_unstable();
        out.push(component);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn params() -> SimulationParameters {
        SimulationParameters {
            token_memory_size: 8,
            cell_max_tokens: 1,
            cell_bond_distance: 1.5,
            cell_max_bonds: 4,
            ..SimulationParameters::default()
        }
    }

    /// Three cells in a row, bonded 1-2-3.
    fn chain() -> Cluster {
        let mut a = Cell::new(EntityId(1), Vec2::new(-1.0, 0.0), 10.0, 4);
        let mut b = Cell::new(EntityId(2), Vec2::ZERO, 10.0, 4);
        let mut c = Cell::new(EntityId(3), Vec2::new(1.0, 0.0), 10.0, 4);
        a.bonds.push(b.id);
        b.bonds.extend([a.id, c.id]);
        c.bonds.push(b.id);
        Cluster {
            id: EntityId(10),
            pos: Vec2::new(20.0, 20.0),
            vel: Vec2::new(0.1, 0.0),
            angle: 0.0,
            angular_vel: 0.0,
            cells: vec![a, b, c],
        }
    }

    fn ids() -> IdAllocator {
        IdAllocator::new(1000, 1, 0)
    }

    #[test]
    fn create_bond_picks_nearest_free_cell() {
        let mut cluster = chain();
        let outcome = create_bond(&mut cluster, EntityId(1), &params());
        // Cell 3 is 2.0 away, beyond the bond distance.
        assert_eq!(outcome, RequestOutcome::Ignored);
        let params = SimulationParameters {
            cell_bond_distance: 2.5,
            ..params()
        };
        assert_eq!(create_bond(&mut cluster, EntityId(1), &params), RequestOutcome::Bonded);
        assert!(cluster.bonds_are_symmetric());
        assert!(cluster.cells.first().unwrap().is_bonded_to(EntityId(3)));
    }

    #[test]
    fn duplicate_without_room_is_refunded() {
        let mut cluster = chain();
        let mut ids = ids();
        let request = |energy| StructuralRequest::DuplicateToken {
            origin: EntityId(1),
            target: EntityId(2),
            memory: vec![1, 2, 3],
            energy,
        };
        let first = apply_request(&mut cluster, request(2.0), &params(), &mut ids);
        assert_eq!(first, RequestOutcome::Created(EntityId(1000)));
        let token = cluster.cells.get(1).unwrap().tokens.first().unwrap();
        assert_eq!(token.memory.len(), 8);
        let second = apply_request(&mut cluster, request(3.0), &params(), &mut ids);
        assert_eq!(second, RequestOutcome::Refunded);
        assert!((cluster.cells.first().unwrap().energy - 13.0).abs() < 1e-9);
    }

    #[test]
    fn construct_cell_bonds_child_to_parent() {
        let mut cluster = chain();
        let mut ids = ids();
        let request = StructuralRequest::ConstructCell {
            parent: EntityId(2),
            direction: core::f64::consts::FRAC_PI_2,
            energy: 5.0,
        };
        let before: Vec<Vec2> = cluster.cells.iter().map(|c| cluster.cell_position(c)).collect();
        let outcome = apply_request(&mut cluster, request, &params(), &mut ids);
        assert_eq!(outcome, RequestOutcome::Created(EntityId(1000)));
        assert_eq!(cluster.cells.len(), 4);
        assert!(cluster.bonds_are_symmetric());

        // The reference point follows the centre of mass; nothing moves.
        let mut sum = Vec2::ZERO;
        for cell in &cluster.cells {
            sum += cell.rel_pos;
        }
        assert!(sum.length() < 1e-9);
        assert!((cluster.pos.y - 20.375).abs() < 1e-9);
        for (cell, old) in cluster.cells.iter().zip(&before) {
            assert!((cluster.cell_position(cell) - *old).length() < 1e-9);
        }
    }

    #[test]
    fn removing_middle_bond_splits_cluster() {
        let mut cluster = chain();
        let energy = cluster.total_energy();
        assert!(remove_bond(&mut cluster, EntityId(2), EntityId(3)));
        let detached = split_disconnected(&mut cluster, &mut ids()).unwrap();
        assert_eq!(detached.len(), 1);
        assert_eq!(cluster.cells.len(), 2);
        let part = detached.first().unwrap();
        assert_eq!(part.cells.len(), 1);
        assert!((part.pos.x - 21.0).abs() < 1e-9);
        assert!((cluster.pos.x - 19.5).abs() < 1e-9);
        let after = cluster.total_energy() + part.total_energy();
        assert!((after - energy).abs() < 1e-9);
    }

    #[test]
    fn dead_cell_becomes_particle_with_all_energy() {
        let mut cluster = chain();
        if let Some(cell) = cluster.cells.get_mut(1) {
            cell.energy = 0.2;
            cell.tokens.push(Token::zeroed(EntityId(50), 8, 1.0));
        }
        let dissolution = dissolve_dead_cells(&mut cluster, 0.5, &mut ids()).unwrap();
        assert_eq!(dissolution.destroyed, 2);
        let particle = dissolution.particles.first().unwrap();
        assert!((particle.energy - 1.2).abs() < 1e-9);
        assert!((particle.pos.x - 20.0).abs() < 1e-9);
        assert!(cluster.cells.iter().all(|c| c.bonds.is_empty()));
    }

    #[test]
    fn weak_tokens_fold_into_cell() {
        let mut cluster = chain();
        if let Some(cell) = cluster.cells.get_mut(0) {
            cell.tokens.push(Token::zeroed(EntityId(60), 8, 0.01));
            cell.tokens.push(Token::zeroed(EntityId(61), 8, 2.0));
        }
        let before = cluster.total_energy();
        assert_eq!(consume_weak_tokens(&mut cluster, 0.05), 1);
        assert!((cluster.total_energy() - before).abs() < 1e-12);
        assert_eq!(cluster.token_count(), 1);
    }

    #[test]
    fn token_at_exactly_min_energy_is_consumed() {
        let mut cluster = chain();
        if let Some(cell) = cluster.cells.get_mut(2) {
            cell.tokens.push(Token::zeroed(EntityId(70), 8, 0.0));
            cell.tokens.push(Token::zeroed(EntityId(71), 8, 0.5));
        }
        assert_eq!(consume_weak_tokens(&mut cluster, 0.0), 1);
        let tokens = &cluster.cells.get(2).unwrap().tokens;
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens.first().unwrap().id, EntityId(71));
    }
}
