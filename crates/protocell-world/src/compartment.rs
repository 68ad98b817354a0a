//! A compartment: one rectangle of the world and everything inside it.
//!
//! A compartment is the unit of ownership and of concurrent execution. Each
//! step runs in two phases separated by a full barrier:
//!
//! 1. [`Compartment::local_phase`] advances every owned entity, runs every
//!    token once, applies structural requests, and stages entities that left
//!    the rectangle in per-direction outbound queues.
//! 2. After [`Compartment::post_outbound`] and the barrier,
//!    [`Compartment::exchange_phase`] takes in what the neighbours sent.
//!
//! A compartment never touches a neighbour directly. All randomness comes
//! from the compartment's own seeded generator and ids from its own
//! allocator, so its behaviour does not depend on which thread runs it.

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use protocell_genome::{
    ExecutionContext, InstructionTable, MutationEngine, StructuralRequest, execute, mutate_memory,
    rewire_bond,
};
use protocell_types::{
    Cell, Cluster, CompartmentId, DataDescription, Entity, EntityId, MutationType, Particle,
    Selection, SimulationParameters, Token, Vec2,
};

use crate::allocator::IdAllocator;
use crate::error::WorldError;
use crate::graph::{CompartmentGraph, Direction, Hop, Rect};
use crate::migration::{Mailboxes, MigrationRecord};
use crate::physics;
use crate::radiation;
use crate::structure::{self, RequestOutcome};
use crate::topology::WorldTopology;

/// Read-only inputs shared by every compartment during a step.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Partition of the world.
    pub graph: &'a CompartmentGraph,
    /// Parameters for this step.
    pub params: &'a SimulationParameters,
    /// Opcode table for token programs.
    pub table: &'a dyn InstructionTable,
}

/// Per-compartment counters for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Entities (particles, clusters, cells, tokens) created.
    pub created: u64,
    /// Entities destroyed.
    pub destroyed: u64,
    /// Entities sent to a neighbour.
    pub migrated_out: u64,
    /// Entities received from a neighbour.
    pub migrated_in: u64,
    /// Migrations clamped to a single hop.
    pub overflows: u64,
    /// Energy injected by radiation sources.
    pub radiation_energy: f64,
    /// Token instructions executed.
    pub instructions: u64,
    /// Mutations applied.
    pub mutations: u64,
    /// Cluster collisions resolved.
    pub collisions: u64,
}

impl StepReport {
    /// Add another report's counters to this one.
    pub fn merge(&mut self, other: &Self) {
        self.created = self.created.saturating_add(other.created);
        self.destroyed = self.destroyed.saturating_add(other.destroyed);
        self.migrated_out = self.migrated_out.saturating_add(other.migrated_out);
        self.migrated_in = self.migrated_in.saturating_add(other.migrated_in);
        self.overflows = self.overflows.saturating_add(other.overflows);
        self.radiation_energy += other.radiation_energy;
        self.instructions = self.instructions.saturating_add(other.instructions);
        self.mutations = self.mutations.saturating_add(other.mutations);
        self.collisions = self.collisions.saturating_add(other.collisions);
    }
}

/// Live entity counts and energy of a compartment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Census {
    /// Free particles.
    pub particles: u64,
    /// Clusters.
    pub clusters: u64,
    /// Cells across all clusters.
    pub cells: u64,
    /// Tokens across all cells.
    pub tokens: u64,
    /// Energy of particles, cells and tokens.
    pub energy: f64,
}

impl Census {
    /// Add another census to this one.
    pub fn merge(&mut self, other: &Self) {
        self.particles = self.particles.saturating_add(other.particles);
        self.clusters = self.clusters.saturating_add(other.clusters);
        self.cells = self.cells.saturating_add(other.cells);
        self.tokens = self.tokens.saturating_add(other.tokens);
        self.energy += other.energy;
    }
}

/// One partition of the world and the entities it owns.
#[derive(Debug)]
pub struct Compartment {
    id: CompartmentId,
    rect: Rect,
    particles: Vec<Particle>,
    clusters: Vec<Cluster>,
    ids: IdAllocator,
    rng: SmallRng,
    outbound: [Vec<MigrationRecord>; 8],
    report: StepReport,
}

impl Compartment {
    /// Create an empty compartment for `id` in `graph`.
    pub fn new(
        id: CompartmentId,
        graph: &CompartmentGraph,
        ids: IdAllocator,
        seed: u64,
    ) -> Result<Self, WorldError> {
        let rect = graph.rect(id).ok_or(WorldError::CompartmentNotFound(id))?;
        Ok(Self {
            id,
            rect,
            particles: Vec::new(),
            clusters: Vec::new(),
            ids,
            rng: SmallRng::seed_from_u64(seed),
            outbound: Default::default(),
            report: StepReport::default(),
        })
    }

    /// Seed of the generator for compartment `id` at `timestep`.
    pub const fn stream_seed(seed: u64, id: CompartmentId, timestep: u64) -> u64 {
        let index = id.0 as u64;
        seed ^ index.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ timestep.wrapping_mul(0xBF58_476D_1CE4_E5B9)
    }

    /// Compartment id.
    pub const fn id(&self) -> CompartmentId {
        self.id
    }

    /// Rectangle owned by this compartment.
    pub const fn rect(&self) -> Rect {
        self.rect
    }

    /// Owned particles in storage order.
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Owned clusters in storage order.
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Replace the id allocator, e.g. after a bulk load.
    pub fn set_id_allocator(&mut self, ids: IdAllocator) {
        self.ids = ids;
    }

    /// Restart the random stream.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    /// Take ownership of an entity.
    pub fn insert(&mut self, entity: Entity) -> Result<(), WorldError> {
        validate_entity(&entity)?;
        match entity {
            Entity::Particle(p) => self.particles.push(p),
            Entity::Cluster(c) => self.clusters.push(c),
        }
        Ok(())
    }

    /// Give up every entity.
    pub fn drain(&mut self) -> DataDescription {
        DataDescription {
            clusters: std::mem::take(&mut self.clusters),
            particles: std::mem::take(&mut self.particles),
        }
    }

    /// Copies of the entities matching `selection`.
    pub fn describe(&self, selection: &Selection) -> DataDescription {
        DataDescription {
            clusters: self
                .clusters
                .iter()
                .filter(|c| selection.matches_cluster(c))
                .cloned()
                .collect(),
            particles: self
                .particles
                .iter()
                .filter(|p| selection.matches_particle(p))
                .cloned()
                .collect(),
        }
    }

    /// Remove and return the entities matching `selection`.
    pub fn remove_selected(&mut self, selection: &Selection) -> DataDescription {
        let (clusters, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.clusters)
            .into_iter()
            .partition(|c| selection.matches_cluster(c));
        self.clusters = kept;
        let (particles, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.particles)
            .into_iter()
            .partition(|p| selection.matches_particle(p));
        self.particles = kept;
        DataDescription {
            clusters,
            particles,
        }
    }

    /// The cell with `id`, if owned here.
    pub fn cell_mut(&mut self, id: EntityId) -> Option<&mut Cell> {
        self.clusters
            .iter_mut()
            .flat_map(|c| c.cells.iter_mut())
            .find(|c| c.id == id)
    }

    /// The particle with `id`, if owned here.
    pub fn particle_mut(&mut self, id: EntityId) -> Option<&mut Particle> {
        self.particles.iter_mut().find(|p| p.id == id)
    }

    /// Highest entity id owned here, nested ids included.
    pub fn max_entity_id(&self) -> Option<EntityId> {
        let particles = self.particles.iter().map(|p| p.id);
        let clusters = self.clusters.iter().flat_map(|c| {
            std::iter::once(c.id).chain(
                c.cells
                    .iter()
                    .flat_map(|cell| std::iter::once(cell.id).chain(cell.tokens.iter().map(|t| t.id))),
            )
        });
        particles.chain(clusters).max()
    }

    /// Add `force` to everything within `radius` of `center`.
    pub fn apply_force(
        &mut self,
        graph: &CompartmentGraph,
        center: Vec2,
        radius: f64,
        force: Vec2,
    ) -> usize {
        physics::apply_force(
            &mut self.particles,
            &mut self.clusters,
            graph.topology(),
            center,
            radius,
            force,
        )
    }

    /// Truncate or zero-pad every token's memory to `size`.
    pub fn resize_token_memory(&mut self, size: usize) {
        for token in self
            .clusters
            .iter_mut()
            .flat_map(|c| c.cells.iter_mut())
            .flat_map(|c| c.tokens.iter_mut())
        {
            token.resize_memory(size);
        }
    }

    /// Apply `mutation` to the cell with `id` using this compartment's
    /// stream. Memory mutations hit every token on the cell.
    pub fn mutate_cell(
        &mut self,
        id: EntityId,
        mutation: MutationType,
        params: &SimulationParameters,
    ) -> Result<bool, WorldError> {
        let Some(cluster) = self
            .clusters
            .iter_mut()
            .find(|c| c.cell_index(id).is_some())
        else {
            return Err(WorldError::EntityNotFound(id));
        };
        if mutation == MutationType::BondRewire {
            let request = cluster
                .cells
                .iter()
                .find(|c| c.id == id)
                .and_then(|cell| rewire_bond(cell, &mut self.rng));
            let Some(request) = request else {
                return Ok(false);
            };
            let outcome = structure::apply_request(cluster, request, params, &mut self.ids);
            if outcome == RequestOutcome::Unbonded {
                let detached = structure::split_disconnected(cluster, &mut self.ids)?;
                self.clusters.extend(detached);
            }
            return Ok(matches!(
                outcome,
                RequestOutcome::Bonded | RequestOutcome::Unbonded
            ));
        }
        let mut applied = false;
        if let Some(cell) = cluster.cells.iter_mut().find(|c| c.id == id) {
            for token in &mut cell.tokens {
                applied |= mutate_memory(&mut token.memory, mutation, &mut self.rng);
            }
        }
        Ok(applied)
    }

    /// Counts and energy of everything owned here.
    pub fn census(&self) -> Census {
        let count = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
        Census {
            particles: count(self.particles.len()),
            clusters: count(self.clusters.len()),
            cells: count(self.clusters.iter().map(|c| c.cells.len()).sum()),
            tokens: count(self.clusters.iter().map(Cluster::token_count).sum()),
            energy: self.total_energy(),
        }
    }

    /// Energy of all particles, cells and tokens owned here.
    pub fn total_energy(&self) -> f64 {
        self.particles.iter().map(|p| p.energy).sum::<f64>()
            + self.clusters.iter().map(Cluster::total_energy).sum::<f64>()
    }

    /// Take the counters of the step that just finished.
    pub fn take_report(&mut self) -> StepReport {
        std::mem::take(&mut self.report)
    }

    /// Phase 1: advance everything owned here by one step and stage
    /// departures.
    pub fn local_phase(&mut self, ctx: &StepContext<'_>) -> Result<(), WorldError> {
        let params = ctx.params;
        let topology = ctx.graph.topology();

        physics::integrate_particles(&mut self.particles, params.friction);
        physics::integrate_clusters(&mut self.clusters, params.friction);

        let collisions = physics::resolve_cluster_collisions(&mut self.clusters, topology);
        self.report.collisions = self.report.collisions.saturating_add(count(collisions));
        let absorbed = physics::absorb_particles(
            &mut self.particles,
            &mut self.clusters,
            topology,
            params.cell_fusion_distance,
        );
        self.report.destroyed = self.report.destroyed.saturating_add(count(absorbed.len()));

        self.emit_radiation(ctx)?;
        let requests = self.run_tokens(ctx);
        let dirty = self.apply_requests(requests, params);
        self.cleanup(params, &dirty)?;
        self.stage_migrations(ctx.graph);

        debug!(
            compartment = %self.id,
            particles = self.particles.len(),
            clusters = self.clusters.len(),
            instructions = self.report.instructions,
            "Local phase complete"
        );
        Ok(())
    }

    fn emit_radiation(&mut self, ctx: &StepContext<'_>) -> Result<(), WorldError> {
        let topology = ctx.graph.topology();
        for source in &ctx.params.radiation_sources {
            if ctx.graph.compartment_containing(source.position) != self.id {
                continue;
            }
            let Some(emission) = radiation::roll_emission(source, topology, &mut self.rng) else {
                continue;
            };
            self.particles.push(Particle {
                id: self.ids.next_id()?,
                pos: emission.pos,
                vel: emission.vel,
                energy: emission.energy,
            });
            self.report.created = self.report.created.saturating_add(1);
            self.report.radiation_energy += emission.energy;
        }
        Ok(())
    }

    /// Run every token once, in cluster, cell and token storage order.
    /// Returns structural requests tagged with the index of their cluster.
    fn run_tokens(&mut self, ctx: &StepContext<'_>) -> Vec<(usize, StructuralRequest)> {
        let params = ctx.params;
        let topology = ctx.graph.topology();
        let engine = MutationEngine::new(&params.mutation_rates);
        let max_tokens = usize::from(params.cell_max_tokens);
        let mut requests = Vec::new();

        for (ci, cluster) in self.clusters.iter_mut().enumerate() {
            let mut placements: Vec<(usize, Option<EntityId>, Token)> = Vec::new();
            for k in 0..cluster.cells.len() {
                let tokens = match cluster.cells.get_mut(k) {
                    Some(cell) => std::mem::take(&mut cell.tokens),
                    None => continue,
                };
                if tokens.is_empty() {
                    continue;
                }
                let nearby = cluster
                    .cells
                    .get(k)
                    .map(|cell| {
                        nearby_particles(
                            &self.particles,
                            topology,
                            cluster.cell_position(cell),
                            params.cell_bond_distance,
                        )
                    })
                    .unwrap_or_default();
                for mut token in tokens {
                    let execution = {
                        let mut exec = ExecutionContext {
                            cells: &mut cluster.cells,
                            cell_index: k,
                            particles: &nearby,
                            params,
                            table: ctx.table,
                        };
                        execute(&mut token, &mut exec)
                    };
                    self.report.instructions = self
                        .report
                        .instructions
                        .saturating_add(u64::from(execution.instructions));
                    requests.extend(execution.requests.into_iter().map(|r| (ci, r)));

                    if let Some(cell) = cluster.cells.get(k) {
                        let outcome = engine.on_token_executed(&mut token, cell, &mut self.rng);
                        self.report.mutations = self
                            .report
                            .mutations
                            .saturating_add(count(outcome.applied.len()));
                        requests.extend(outcome.requests.into_iter().map(|r| (ci, r)));

                        let pressure = radiation::mutation_pressure(
                            &params.radiation_sources,
                            topology,
                            cluster.cell_position(cell),
                        );
                        if MutationEngine::radiate(&mut token, pressure, &mut self.rng) {
                            self.report.mutations = self.report.mutations.saturating_add(1);
                        }
                    }
                    placements.push((k, execution.forward_to, token));
                }
            }

            for (origin, forward, token) in placements {
                let target = forward
                    .and_then(|id| cluster.cell_index(id))
                    .filter(|&i| {
                        cluster
                            .cells
                            .get(i)
                            .is_some_and(|c| c.tokens.len() < max_tokens)
                    })
                    .unwrap_or(origin);
                if let Some(cell) = cluster.cells.get_mut(target) {
                    cell.tokens.push(token);
                }
            }
        }
        requests
    }

    /// Apply requests in order. Returns which clusters lost a bond.
    fn apply_requests(
        &mut self,
        requests: Vec<(usize, StructuralRequest)>,
        params: &SimulationParameters,
    ) -> Vec<bool> {
        let mut dirty = vec![false; self.clusters.len()];
        for (ci, request) in requests {
            let Some(cluster) = self.clusters.get_mut(ci) else {
                continue;
            };
            match structure::apply_request(cluster, request, params, &mut self.ids) {
                RequestOutcome::Created(_) => {
                    self.report.created = self.report.created.saturating_add(1);
                }
                RequestOutcome::Unbonded => {
                    if let Some(flag) = dirty.get_mut(ci) {
                        *flag = true;
                    }
                }
                RequestOutcome::Bonded | RequestOutcome::Refunded | RequestOutcome::Ignored => {}
            }
        }
        dirty
    }

    /// Consume weak tokens, dissolve dead cells, split broken clusters and
    /// drop empty ones.
    fn cleanup(&mut self, params: &SimulationParameters, dirty: &[bool]) -> Result<(), WorldError> {
        let mut detached = Vec::new();
        for (ci, cluster) in self.clusters.iter_mut().enumerate() {
            let consumed = structure::consume_weak_tokens(cluster, params.token_min_energy);
            self.report.destroyed = self.report.destroyed.saturating_add(consumed);

            let dissolution =
                structure::dissolve_dead_cells(cluster, params.cell_min_energy, &mut self.ids)?;
            let died = !dissolution.particles.is_empty();
            self.report.destroyed = self.report.destroyed.saturating_add(dissolution.destroyed);
            self.report.created = self
                .report
                .created
                .saturating_add(count(dissolution.particles.len()));
            self.particles.extend(dissolution.particles);

            if died || dirty.get(ci).copied().unwrap_or(false) {
                let parts = structure::split_disconnected(cluster, &mut self.ids)?;
                self.report.created = self.report.created.saturating_add(count(parts.len()));
                detached.extend(parts);
            }
        }
        self.clusters.extend(detached);

        let before = self.clusters.len();
        self.clusters.retain(|c| !c.cells.is_empty());
        let removed = before.saturating_sub(self.clusters.len());
        self.report.destroyed = self.report.destroyed.saturating_add(count(removed));
        Ok(())
    }

    /// Wrap positions and move departing entities to the outbound queues.
    fn stage_migrations(&mut self, graph: &CompartmentGraph) {
        let topology = graph.topology();
        for mut particle in std::mem::take(&mut self.particles) {
            particle.pos = topology.wrap(particle.pos);
            match graph.single_hop(self.id, particle.pos) {
                Hop::Stay => self.particles.push(particle),
                Hop::Move { direction, target } => {
                    self.stage(Entity::Particle(particle), direction, target, false);
                }
                Hop::Overflow {
                    direction,
                    target,
                    clamped,
                } => {
                    particle.pos = clamped;
                    self.stage(Entity::Particle(particle), direction, target, true);
                }
            }
        }
        for mut cluster in std::mem::take(&mut self.clusters) {
            cluster.pos = topology.wrap(cluster.pos);
            match graph.single_hop(self.id, cluster.pos) {
                Hop::Stay => self.clusters.push(cluster),
                Hop::Move { direction, target } => {
                    self.stage(Entity::Cluster(cluster), direction, target, false);
                }
                Hop::Overflow {
                    direction,
                    target,
                    clamped,
                } => {
                    cluster.pos = clamped;
                    self.stage(Entity::Cluster(cluster), direction, target, true);
                }
            }
        }
    }

    fn stage(&mut self, entity: Entity, direction: Direction, to: CompartmentId, overflow: bool) {
        if overflow {
            warn!(
                compartment = %self.id,
                entity = %entity.id(),
                ?direction,
                target = %to,
                "Migration overflow clamped to a single hop"
            );
            self.report.overflows = self.report.overflows.saturating_add(1);
        }
        self.report.migrated_out = self.report.migrated_out.saturating_add(1);
        if let Some(queue) = self.outbound.get_mut(direction.index()) {
            queue.push(MigrationRecord {
                entity,
                from: self.id,
                to,
                direction,
                overflow,
            });
        }
    }

    /// Hand the staged departures to the mailboxes. Must be called before
    /// the barrier that separates the phases.
    pub fn post_outbound(&mut self, mailboxes: &Mailboxes) {
        for direction in Direction::ALL {
            let Some(queue) = self.outbound.get_mut(direction.index()) else {
                continue;
            };
            let records = std::mem::take(queue);
            let Some(to) = records.first().map(|r| r.to) else {
                continue;
            };
            for record in mailboxes.post(to, direction, records) {
                warn!(compartment = %self.id, target = %to, "Undeliverable migration kept locally");
                self.keep(record.entity);
            }
        }
    }

    fn keep(&mut self, entity: Entity) {
        match entity {
            Entity::Particle(p) => self.particles.push(p),
            Entity::Cluster(c) => self.clusters.push(c),
        }
    }

    /// Phase 2: take ownership of everything the neighbours sent, in
    /// [`Direction::ALL`] order.
    pub fn exchange_phase(&mut self, mailboxes: &Mailboxes) {
        for record in mailboxes.drain(self.id) {
            self.report.migrated_in = self.report.migrated_in.saturating_add(1);
            self.keep(record.entity);
        }
    }
}

/// Free particles within `radius` of `pos`, in storage order.
fn nearby_particles(
    particles: &[Particle],
    topology: &WorldTopology,
    pos: Vec2,
    radius: f64,
) -> Vec<Particle> {
    particles
        .iter()
        .filter(|p| topology.distance(pos, p.pos) <= radius)
        .cloned()
        .collect()
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Reject entities with non-finite state or broken bonds.
pub fn validate_entity(entity: &Entity) -> Result<(), WorldError> {
    let finite = match entity {
        Entity::Particle(p) => p.pos.is_finite() && p.vel.is_finite() && p.energy.is_finite(),
        Entity::Cluster(c) => {
            c.pos.is_finite()
                && c.vel.is_finite()
                && c.angle.is_finite()
                && c.angular_vel.is_finite()
                && c.cells.iter().all(|cell| {
                    cell.rel_pos.is_finite()
                        && cell.energy.is_finite()
                        && cell.tokens.iter().all(|t| t.energy.is_finite())
                })
        }
    };
    if !finite {
        return Err(WorldError::NonFiniteEntity(entity.id()));
    }
    if let Entity::Cluster(c) = entity {
        if !c.bonds_are_symmetric() {
            return Err(WorldError::AsymmetricBonds(c.id));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use protocell_genome::{Instruction, InstructionSetV1, assemble};
    use protocell_types::{IntVec2, MutationRates};

    fn graph() -> CompartmentGraph {
        CompartmentGraph::build(IntVec2::new(100, 100), IntVec2::new(2, 2)).unwrap()
    }

    fn compartment(graph: &CompartmentGraph, id: usize) -> Compartment {
        let ids = IdAllocator::for_slot(1000, 5, id);
        Compartment::new(CompartmentId(id), graph, ids, 7).unwrap()
    }

    fn quiet_params() -> SimulationParameters {
        SimulationParameters {
            token_memory_size: 16,
            friction: 0.0,
            mutation_rates: MutationRates::NONE,
            ..SimulationParameters::default()
        }
    }

    fn particle(id: u64, pos: Vec2, vel: Vec2) -> Entity {
        Entity::Particle(Particle {
            id: EntityId(id),
            pos,
            vel,
            energy: 2.0,
        })
    }

    fn single_cell_cluster(id: u64, pos: Vec2, tokens: Vec<Token>) -> Cluster {
        let mut cell = Cell::new(EntityId(id + 1), Vec2::ZERO, 10.0, 4);
        cell.tokens = tokens;
        Cluster {
            id: EntityId(id),
            pos,
            vel: Vec2::ZERO,
            angle: 0.0,
            angular_vel: 0.0,
            cells: vec![cell],
        }
    }

    #[test]
    fn departing_particle_is_staged_not_kept() {
        let graph = graph();
        let params = quiet_params();
        let ctx = StepContext {
            graph: &graph,
            params: &params,
            table: &InstructionSetV1,
        };
        let mailboxes = Mailboxes::new(graph.compartment_count());
        let mut left = compartment(&graph, 0);
        let mut right = compartment(&graph, 1);
        left.insert(particle(1, Vec2::new(49.5, 10.0), Vec2::new(1.0, 0.0))).unwrap();

        left.local_phase(&ctx).unwrap();
        right.local_phase(&ctx).unwrap();
        assert!(left.particles().is_empty());
        left.post_outbound(&mailboxes);
        right.post_outbound(&mailboxes);
        left.exchange_phase(&mailboxes);
        right.exchange_phase(&mailboxes);

        assert_eq!(right.particles().len(), 1);
        assert_eq!(left.take_report().migrated_out, 1);
        assert_eq!(right.take_report().migrated_in, 1);
        assert!(mailboxes.is_empty());
    }

    #[test]
    fn tokens_run_and_conserve_energy() {
        let graph = graph();
        let params = quiet_params();
        let ctx = StepContext {
            graph: &graph,
            params: &params,
            table: &InstructionSetV1,
        };
        let program = assemble(
            &InstructionSetV1,
            0,
            &[
                Instruction::Set { dst: 15, value: 5 },
                Instruction::TakeFromCell { amount: 15 },
                Instruction::Halt,
            ],
            16,
        );
        let token = Token::with_memory(EntityId(500), 3.0, &program, 16);
        let mut c = compartment(&graph, 0);
        c.insert(Entity::Cluster(single_cell_cluster(10, Vec2::new(20.0, 20.0), vec![token])))
            .unwrap();
        let before = c.total_energy();
        c.local_phase(&ctx).unwrap();
        assert!((c.total_energy() - before).abs() < 1e-9);
        let report = c.take_report();
        assert_eq!(report.instructions, 3);
        assert_eq!(c.census().tokens, 1);
    }

    #[test]
    fn tokens_sense_only_nearby_particles() {
        let graph = graph();
        let params = SimulationParameters {
            cell_fusion_distance: 0.0,
            cell_bond_distance: 3.0,
            instruction_energy_cost: 0.0,
            ..quiet_params()
        };
        let ctx = StepContext {
            graph: &graph,
            params: &params,
            table: &InstructionSetV1,
        };
        let program = assemble(
            &InstructionSetV1,
            0,
            &[Instruction::SenseParticles { dst: 15 }, Instruction::Halt],
            16,
        );
        let token = Token::with_memory(EntityId(500), 3.0, &program, 16);
        let mut c = compartment(&graph, 0);
        c.insert(Entity::Cluster(single_cell_cluster(10, Vec2::new(20.0, 20.0), vec![token])))
            .unwrap();
        c.insert(particle(1, Vec2::new(22.0, 20.0), Vec2::ZERO)).unwrap();
        c.insert(particle(2, Vec2::new(20.0, 18.5), Vec2::ZERO)).unwrap();
        c.insert(particle(3, Vec2::new(30.0, 20.0), Vec2::ZERO)).unwrap();

        c.local_phase(&ctx).unwrap();
        let sensed = c
            .clusters()
            .first()
            .and_then(|cluster| cluster.cells.first())
            .and_then(|cell| cell.tokens.first())
            .and_then(|token| token.memory.get(15).copied());
        assert_eq!(sensed, Some(2));
        assert_eq!(c.particles().len(), 3);
    }

    #[test]
    fn radiation_emits_into_owning_compartment() {
        let graph = graph();
        let params = SimulationParameters {
            radiation_sources: vec![protocell_types::RadiationSource {
                position: Vec2::new(75.0, 25.0),
                radius: 2.0,
                emission_probability: 1.0,
                particle_energy: 4.0,
                mutation_probability: 0.0,
            }],
            ..quiet_params()
        };
        let ctx = StepContext {
            graph: &graph,
            params: &params,
            table: &InstructionSetV1,
        };
        let mut owner = compartment(&graph, 1);
        let mut other = compartment(&graph, 0);
        owner.local_phase(&ctx).unwrap();
        other.local_phase(&ctx).unwrap();
        assert_eq!(owner.particles().len(), 1);
        assert!(other.particles().is_empty());
        let report = owner.take_report();
        assert!((report.radiation_energy - 4.0).abs() < 1e-12);
        assert_eq!(report.created, 1);
    }

    #[test]
    fn resize_applies_to_every_token() {
        let graph = graph();
        let mut c = compartment(&graph, 0);
        let tokens = vec![
            Token::zeroed(EntityId(2), 16, 1.0),
            Token::zeroed(EntityId(3), 16, 1.0),
        ];
        c.insert(Entity::Cluster(single_cell_cluster(10, Vec2::new(5.0, 5.0), tokens)))
            .unwrap();
        c.resize_token_memory(40);
        assert!(
            c.clusters()
                .iter()
                .flat_map(|cl| cl.cells.iter())
                .flat_map(|cell| cell.tokens.iter())
                .all(|t| t.memory.len() == 40)
        );
    }

    #[test]
    fn asymmetric_cluster_rejected() {
        let graph = graph();
        let mut c = compartment(&graph, 0);
        let mut cluster = single_cell_cluster(10, Vec2::new(5.0, 5.0), Vec::new());
        if let Some(cell) = cluster.cells.first_mut() {
            cell.bonds.push(EntityId(99));
        }
        assert!(matches!(
            c.insert(Entity::Cluster(cluster)),
            Err(WorldError::AsymmetricBonds(_))
        ));
    }

    #[test]
    fn remove_selected_by_region() {
        let graph = graph();
        let mut c = compartment(&graph, 0);
        c.insert(particle(1, Vec2::new(5.0, 5.0), Vec2::ZERO)).unwrap();
        c.insert(particle(2, Vec2::new(40.0, 40.0), Vec2::ZERO)).unwrap();
        let removed = c.remove_selected(&Selection::Region {
            from: Vec2::new(0.0, 0.0),
            to: Vec2::new(10.0, 10.0),
        });
        assert_eq!(removed.particles.len(), 1);
        assert_eq!(c.particles().len(), 1);
        assert_eq!(c.max_entity_id(), Some(EntityId(2)));
    }
}
