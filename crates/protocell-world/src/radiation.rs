//! Radiation sources: particle emission and mutation pressure.
//!
//! A source is handled by the compartment containing its centre, so each
//! source rolls exactly once per step no matter how the world is sharded.

use rand::Rng;

use protocell_types::{RadiationSource, Vec2};

use crate::topology::WorldTopology;

/// Speed bound for emitted particles.
const EMISSION_SPEED: f64 = 0.5;

/// Position and velocity of a freshly emitted particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Emission {
    /// Emission point inside the source disc (wrapped).
    pub pos: Vec2,
    /// Initial velocity.
    pub vel: Vec2,
    /// Energy carried by the particle.
    pub energy: f64,
}

/// Roll the per-step emission chance of `source`.
pub fn roll_emission<R: Rng + ?Sized>(
    source: &RadiationSource,
    topology: &WorldTopology,
    rng: &mut R,
) -> Option<Emission> {
    if source.emission_probability <= 0.0
        || source.particle_energy <= 0.0
        || rng.random::<f64>() >= source.emission_probability
    {
        return None;
    }
    let angle = rng.random_range(0.0..core::f64::consts::TAU);
    let distance = source.radius.max(0.0) * rng.random::<f64>().sqrt();
    let heading = rng.random_range(0.0..core::f64::consts::TAU);
    let speed = rng.random_range(0.0..=EMISSION_SPEED);
    Some(Emission {
        pos: topology.wrap(source.position + Vec2::from_angle(angle) * distance),
        vel: Vec2::from_angle(heading) * speed,
        energy: source.particle_energy,
    })
}

/// Whether `pos` lies inside the source disc.
pub fn covers(source: &RadiationSource, topology: &WorldTopology, pos: Vec2) -> bool {
    topology.distance(source.position, pos) <= source.radius
}

/// Combined extra mutation probability of all sources covering `pos`.
pub fn mutation_pressure(sources: &[RadiationSource], topology: &WorldTopology, pos: Vec2) -> f64 {
    let survive = sources
        .iter()
        .filter(|s| covers(s, topology, pos))
        .fold(1.0, |acc, s| acc * (1.0 - s.mutation_probability.clamp(0.0, 1.0)));
    1.0 - survive
}
