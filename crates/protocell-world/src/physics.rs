//! Kinematics, collisions and particle absorption inside one compartment.
//!
//! Clusters move as rigid bodies: the reference point advances by the
//! velocity and the orientation by the angular velocity. Cells are discs of
//! radius [`CELL_RADIUS`]. None of this touches the energy budget; kinetic
//! state is not part of the energy ledger.

use protocell_types::{Cluster, EntityId, Particle, Vec2};

use crate::topology::WorldTopology;

/// Radius of a single cell disc.
pub const CELL_RADIUS: f64 = 0.5;

/// Advance particles by one step, applying friction first.
pub fn integrate_particles(particles: &mut [Particle], friction: f64) {
    let damping = (1.0 - friction).clamp(0.0, 1.0);
    for particle in particles {
        particle.vel = particle.vel * damping;
        particle.pos += particle.vel;
    }
}

/// Advance clusters by one step, applying friction to both velocities.
pub fn integrate_clusters(clusters: &mut [Cluster], friction: f64) {
    let damping = (1.0 - friction).clamp(0.0, 1.0);
    for cluster in clusters {
        cluster.vel = cluster.vel * damping;
        cluster.angular_vel *= damping;
        cluster.pos += cluster.vel;
        cluster.angle = (cluster.angle + cluster.angular_vel).rem_euclid(core::f64::consts::TAU);
    }
}

/// Elastic collisions between approaching clusters, bounded by their
/// enclosing circles. Mass is the cell count. Returns the number of
/// collisions resolved.
pub fn resolve_cluster_collisions(clusters: &mut [Cluster], topology: &WorldTopology) -> usize {
    let mut collisions = 0_usize;
    for j in 1..clusters.len() {
        let (head, tail) = clusters.split_at_mut(j);
        let Some(b) = tail.first_mut() else {
            continue;
        };
        for a in head.iter_mut() {
            if a.cells.is_empty() || b.cells.is_empty() {
                continue;
            }
            let offset = topology.displacement(a.pos, b.pos);
            let reach = a.radius() + b.radius() + 2.0 * CELL_RADIUS;
            if offset.length_squared() >= reach * reach {
                continue;
            }
            let normal = offset.normalized();
            let approach = (b.vel - a.vel).dot(normal);
            if approach >= 0.0 {
                continue;
            }
            let ma = a.cells.len() as f64;
            let mb = b.cells.len() as f64;
            let total = ma + mb;
            a.vel += normal * (2.0 * mb / total * approach);
            b.vel -= normal * (2.0 * ma / total * approach);
            collisions = collisions.saturating_add(1);
        }
    }
    collisions
}

/// Fold every particle within `fusion_distance` of a cell into that cell's
/// energy. The first cell found in storage order wins. Returns the ids of
/// absorbed particles.
pub fn absorb_particles(
    particles: &mut Vec<Particle>,
    clusters: &mut [Cluster],
    topology: &WorldTopology,
    fusion_distance: f64,
) -> Vec<EntityId> {
    let mut absorbed = Vec::new();
    if fusion_distance <= 0.0 {
        return absorbed;
    }
    particles.retain(|particle| {
        for cluster in clusters.iter_mut() {
            if topology.distance(cluster.pos, particle.pos) > cluster.radius() + fusion_distance {
                continue;
            }
            let pos = cluster.pos;
            let angle = cluster.angle;
            let hit = cluster.cells.iter_mut().find(|cell| {
                topology.distance(pos + cell.rel_pos.rotated(angle), particle.pos)
                    <= fusion_distance
            });
            if let Some(cell) = hit {
                cell.energy += particle.energy;
                absorbed.push(particle.id);
                return false;
            }
        }
        true
    });
    absorbed
}

/// Add `force` to the velocity of every particle and cluster whose reference
/// point lies within `radius` of `center`.
pub fn apply_force(
    particles: &mut [Particle],
    clusters: &mut [Cluster],
    topology: &WorldTopology,
    center: Vec2,
    radius: f64,
    force: Vec2,
) -> usize {
    let mut touched = 0_usize;
    for particle in particles {
        if topology.distance(center, particle.pos) <= radius {
            particle.vel += force;
            touched = touched.saturating_add(1);
        }
    }
    for cluster in clusters {
        if topology.distance(center, cluster.pos) <= radius {
            cluster.vel += force;
            touched = touched.saturating_add(1);
        }
    }
    touched
}
