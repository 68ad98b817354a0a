//! The control surface external collaborators drive the simulation through.
//!
//! Every operation runs on the caller's thread and only touches the world at
//! a step boundary. A step holds the engine lock for its whole duration:
//!
//! - writes use `try_lock` and fail with [`ControlError::NotAtBoundary`]
//!   while a step is in flight, so callers can retry after it completes;
//! - reads block until the current step has finished;
//! - parameter changes and forces requested mid-step are queued and applied
//!   as soon as that step completes, before the lock is released.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LockResult, Mutex, MutexGuard, PoisonError, TryLockError};

use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{debug, info};

use protocell_genome::{InstructionTable, instruction_set};
use protocell_ledger::{EnergyLedger, StatisticsCollector, StepBalance};
use protocell_types::{
    Cell, CompartmentId, DataDescription, Entity, EntityId, GeneralSettings, IntVec2,
    InvalidParameter, MonitorData, MutationType, Particle, Selection, Settings, SimulationId,
    SimulationParameters, Vec2,
};
use protocell_world::{
    Census, Compartment, CompartmentGraph, IdAllocator, PopulationRecipe, WorldError, populate,
    validate_entity,
};

use crate::error::ControlError;
use crate::runner::{ContinuousRun, RunOutcome};
use crate::scheduler::{StepInput, ThreadScheduler, block_owner};

/// Version of the instruction table new simulations run.
const INSTRUCTION_SET_VERSION: u32 = 1;

/// A velocity change requested for a region of the world.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Force {
    center: Vec2,
    radius: f64,
    force: Vec2,
}

/// Changes requested while a step was in flight.
#[derive(Debug, Default)]
struct Pending {
    parameters: Option<SimulationParameters>,
    forces: Vec<Force>,
}

/// One loaded simulation.
#[derive(Debug)]
struct Engine {
    id: SimulationId,
    settings: Settings,
    graph: CompartmentGraph,
    table: Arc<dyn InstructionTable>,
    input: Arc<StepInput>,
    scheduler: ThreadScheduler,
    ledger: EnergyLedger,
    statistics: StatisticsCollector,
    external_ids: IdAllocator,
    timestep: u64,
}

#[derive(Debug, Default)]
struct Shared {
    engine: Mutex<Option<Engine>>,
    pending: Mutex<Pending>,
}

/// Thread-safe handle to the simulation.
#[derive(Debug, Default)]
pub struct SimulationController {
    shared: Arc<Shared>,
    run: Mutex<Option<ContinuousRun>>,
    tps_restriction: Arc<AtomicU32>,
}

fn recover<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<Engine>> {
        recover(self.engine.lock())
    }

    fn try_lock(&self) -> Result<MutexGuard<'_, Option<Engine>>, ControlError> {
        match self.engine.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(ControlError::NotAtBoundary),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        recover(self.pending.lock())
    }

    /// Queue a change for the in-flight step, then apply it directly if
    /// that step finished in the meantime.
    fn queue(&self, change: impl FnOnce(&mut Pending)) {
        change(&mut self.pending());
        let Ok(mut guard) = self.try_lock() else {
            return;
        };
        if let Some(engine) = guard.as_mut() {
            std::mem::take(&mut *self.pending()).apply_to(engine);
        }
    }

    fn step(&self) -> Result<u64, ControlError> {
        let mut guard = self.lock();
        let engine = guard.as_mut().ok_or(ControlError::NoSimulation)?;
        std::mem::take(&mut *self.pending()).apply_to(engine);
        let result = engine.step();
        // Hold the queue until the engine is released so nothing queued
        // during the step is left behind.
        let mut pending = self.pending();
        std::mem::take(&mut *pending).apply_to(engine);
        drop(guard);
        drop(pending);
        result
    }
}

impl Pending {
    fn apply_to(self, engine: &mut Engine) {
        if let Some(parameters) = self.parameters {
            engine.apply_parameters(parameters);
        }
        for force in self.forces {
            engine.apply_force(force);
        }
    }
}

impl Engine {
    /// Build an engine and distribute `data` over its compartments.
    fn build(
        id: SimulationId,
        settings: Settings,
        timestep: u64,
        data: DataDescription,
    ) -> Result<Self, ControlError> {
        settings.parameters.validate()?;
        let general = &settings.general;
        let graph = CompartmentGraph::build(general.world_size, general.grid_dims)?;
        let table = instruction_set(INSTRUCTION_SET_VERSION)?;
        let base = next_free_id(&data)?;

        let count = graph.compartment_count();
        let slots = count.saturating_add(1);
        let mut compartments = Vec::with_capacity(count);
        for compartment in graph.compartment_ids() {
            let ids = IdAllocator::for_slot(base, slots, compartment.0);
            let seed = Compartment::stream_seed(general.seed, compartment, timestep);
            compartments.push(Compartment::new(compartment, &graph, ids, seed)?);
        }
        for mut entity in data.into_entities() {
            normalize(&mut entity, &graph, settings.parameters.token_memory_size);
            let target = graph.compartment_containing(entity.position());
            compartments
                .get_mut(target.0)
                .ok_or(WorldError::CompartmentNotFound(target))?
                .insert(entity)?;
        }

        let mut scheduler = ThreadScheduler::new(general.thread_count)?;
        for compartment in compartments {
            let owner = block_owner(compartment.id().0, count, general.thread_count);
            scheduler.register_compartment(compartment, owner)?;
        }
        scheduler.launch()?;

        let input = Arc::new(StepInput {
            graph: graph.clone(),
            params: settings.parameters.clone(),
            table: Arc::clone(&table),
        });
        let mut engine = Self {
            id,
            external_ids: IdAllocator::for_slot(base, slots, count),
            settings,
            graph,
            table,
            input,
            scheduler,
            ledger: EnergyLedger::default(),
            statistics: StatisticsCollector::new(timestep),
            timestep,
        };
        engine.rebase();
        Ok(engine)
    }

    /// Forget recorded flows and restart counting from the current state.
    fn rebase(&mut self) {
        let censuses = self.scheduler.map(Compartment::census);
        self.ledger.rebase(censuses.iter().map(|c| c.energy).collect());
        self.refresh_statistics_from(&censuses);
    }

    fn refresh_statistics(&mut self) {
        let censuses = self.scheduler.map(Compartment::census);
        self.refresh_statistics_from(&censuses);
    }

    fn refresh_statistics_from(&mut self, censuses: &[Census]) {
        let mut total = Census::default();
        for census in censuses {
            total.merge(census);
        }
        self.statistics.refresh(self.timestep, &total);
    }

    fn apply_parameters(&mut self, parameters: SimulationParameters) {
        let size = parameters.token_memory_size;
        if size != self.settings.parameters.token_memory_size {
            self.scheduler.for_each_mut(|c| c.resize_token_memory(size));
        }
        info!(simulation = %self.id, token_memory_size = size, "Simulation parameters applied");
        self.settings.parameters = parameters;
        self.input = Arc::new(StepInput {
            graph: self.graph.clone(),
            params: self.settings.parameters.clone(),
            table: Arc::clone(&self.table),
        });
    }

    fn apply_force(&mut self, force: Force) {
        let graph = &self.graph;
        let mut touched: usize = 0;
        self.scheduler.for_each_mut(|c| {
            touched = touched.saturating_add(c.apply_force(graph, force.center, force.radius, force.force));
        });
        debug!(touched, "Force applied");
    }

    fn step(&mut self) -> Result<u64, ControlError> {
        let seed = self.settings.general.seed;
        let timestep = self.timestep;
        self.scheduler
            .for_each_mut(|c| c.reseed(Compartment::stream_seed(seed, c.id(), timestep)));

        let reports = self.scheduler.run_step(&self.input)?;
        let next = self.timestep.saturating_add(1);

        let censuses = self.scheduler.map(Compartment::census);
        let injected: f64 = reports.iter().map(|(_, r)| r.radiation_energy).sum();
        let result = self.ledger.close_step(
            next,
            censuses.iter().map(|c| c.energy).collect(),
            injected,
        )?;
        self.timestep = next;
        let stats = self
            .statistics
            .record_step(self.timestep, &censuses, reports.iter().map(|(_, r)| r));
        debug!(
            simulation = %self.id,
            timestep = self.timestep,
            particles = stats.particle_count,
            cells = stats.cell_count,
            tokens = stats.token_count,
            total_energy = stats.total_energy,
            balanced = result.is_balanced(),
            "Step completed"
        );
        Ok(self.timestep)
    }

    fn describe(&self, selection: &Selection) -> DataDescription {
        let mut data = DataDescription::default();
        for part in self.scheduler.map(|c| c.describe(selection)) {
            data.extend(part);
        }
        data.sort_by_id();
        data
    }

    /// Insert entities that already carry fresh ids.
    fn insert_all(&mut self, data: DataDescription) -> Result<(), ControlError> {
        let memory_size = self.settings.parameters.token_memory_size;
        let mut entities = data.into_entities();
        for entity in &mut entities {
            normalize(entity, &self.graph, memory_size);
            validate_entity(entity)?;
        }
        let energy: f64 = entities.iter().map(Entity::total_energy).sum();
        self.ledger.record_external_add(energy)?;
        for entity in entities {
            let target = self.graph.compartment_containing(entity.position());
            self.scheduler
                .with_compartment(target, |c| c.insert(entity))
                .ok_or(WorldError::CompartmentNotFound(target))??;
        }
        self.refresh_statistics();
        Ok(())
    }
}

/// First id above every id in `data`.
fn next_free_id(data: &DataDescription) -> Result<u64, ControlError> {
    let mut seen = BTreeSet::new();
    let mut check = |id: EntityId| {
        if seen.insert(id) {
            Ok(())
        } else {
            Err(ControlError::DuplicateId(id))
        }
    };
    for cluster in &data.clusters {
        check(cluster.id)?;
        for cell in &cluster.cells {
            check(cell.id)?;
            for token in &cell.tokens {
                check(token.id)?;
            }
        }
    }
    for particle in &data.particles {
        check(particle.id)?;
    }
    match seen.last() {
        Some(max) => Ok(max.0.checked_add(1).ok_or(WorldError::IdExhausted)?),
        None => Ok(1),
    }
}

/// Wrap positions into the world and fit token memory to `memory_size`.
fn normalize(entity: &mut Entity, graph: &CompartmentGraph, memory_size: usize) {
    let topology = graph.topology();
    match entity {
        Entity::Particle(p) => p.pos = topology.wrap(p.pos),
        Entity::Cluster(c) => {
            c.pos = topology.wrap(c.pos);
            for token in c.cells.iter_mut().flat_map(|cell| cell.tokens.iter_mut()) {
                token.resize_memory(memory_size);
            }
        }
    }
}

/// Give every entity in `data` a fresh id, remapping bonds.
fn reassign_ids(data: DataDescription, ids: &mut IdAllocator) -> Result<DataDescription, WorldError> {
    let mut out = DataDescription::default();
    for mut cluster in data.clusters {
        cluster.id = ids.next_id()?;
        let mut mapping = BTreeMap::new();
        for cell in &mut cluster.cells {
            let fresh = ids.next_id()?;
            mapping.insert(cell.id, fresh);
            cell.id = fresh;
            for token in &mut cell.tokens {
                token.id = ids.next_id()?;
            }
        }
        for cell in &mut cluster.cells {
            cell.bonds = cell
                .bonds
                .iter()
                .filter_map(|bond| mapping.get(bond).copied())
                .collect();
        }
        out.clusters.push(cluster);
    }
    for mut particle in data.particles {
        particle.id = ids.next_id()?;
        out.particles.push(particle);
    }
    Ok(out)
}

fn flow(delta: f64, ledger: &mut EnergyLedger) -> Result<(), ControlError> {
    if delta >= 0.0 {
        ledger.record_external_add(delta)?;
    } else {
        ledger.record_external_remove(-delta)?;
    }
    Ok(())
}

impl SimulationController {
    /// A controller with no simulation loaded.
    pub fn new() -> Self {
        Self::default()
    }

    fn run_slot(&self) -> MutexGuard<'_, Option<ContinuousRun>> {
        recover(self.run.lock())
    }

    fn with_engine<T>(
        &self,
        f: impl FnOnce(&Engine) -> T,
    ) -> Result<T, ControlError> {
        let guard = self.shared.lock();
        guard.as_ref().map(f).ok_or(ControlError::NoSimulation)
    }

    fn with_engine_mut<T>(
        &self,
        f: impl FnOnce(&mut Engine) -> Result<T, ControlError>,
    ) -> Result<T, ControlError> {
        let mut guard = self.shared.try_lock()?;
        let engine = guard.as_mut().ok_or(ControlError::NoSimulation)?;
        f(engine)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Replace any loaded simulation with an empty world.
    pub fn new_simulation(
        &self,
        timestep: u64,
        settings: Settings,
    ) -> Result<SimulationId, ControlError> {
        self.pause_simulation();
        let id = SimulationId::new();
        let world = settings.general.world_size;
        let grid = settings.general.grid_dims;
        let threads = settings.general.thread_count;
        let engine = Engine::build(id, settings, timestep, DataDescription::default())?;
        *self.shared.try_lock()? = Some(engine);
        *self.shared.pending() = Pending::default();
        info!(
            simulation = %id,
            world_x = world.x,
            world_y = world.y,
            grid_x = grid.x,
            grid_y = grid.y,
            threads,
            timestep,
            "Simulation created"
        );
        Ok(id)
    }

    /// Stop and unload the simulation, shutting its workers down.
    pub fn close_simulation(&self) {
        self.pause_simulation();
        let engine = self.shared.lock().take();
        if let Some(engine) = engine {
            info!(simulation = %engine.id, timestep = engine.timestep, "Simulation closed");
        }
    }

    /// Remove every entity. Settings and timestep are kept.
    pub fn clear(&self) -> Result<(), ControlError> {
        self.with_engine_mut(|engine| {
            engine.scheduler.for_each_mut(|c| {
                c.drain();
            });
            engine.rebase();
            info!(simulation = %engine.id, "Simulation cleared");
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Advance by exactly one step and return the new timestep.
    pub fn calc_single_timestep(&self) -> Result<u64, ControlError> {
        if self.is_simulation_running() {
            return Err(ControlError::Running);
        }
        self.shared.step()
    }

    /// Step continuously on a driver thread until paused.
    pub fn run_simulation(&self) -> Result<(), ControlError> {
        self.run_for(0)
    }

    /// Step continuously until paused or `max_steps` steps have run
    /// (0 = unbounded).
    pub fn run_for(&self, max_steps: u64) -> Result<(), ControlError> {
        let mut slot = self.run_slot();
        if slot.as_ref().is_some_and(ContinuousRun::is_running) {
            return Ok(());
        }
        match self.shared.lock().as_mut() {
            Some(engine) => engine.statistics.reset_rate(),
            None => return Err(ControlError::NoSimulation),
        }
        let shared = Arc::clone(&self.shared);
        let run = ContinuousRun::start(
            move || shared.step(),
            max_steps,
            Arc::clone(&self.tps_restriction),
        )?;
        *slot = Some(run);
        info!(max_steps, "Simulation running");
        Ok(())
    }

    /// Stop continuous stepping after the current step. Returns how the run
    /// ended, or `None` if no run was active.
    pub fn pause_simulation(&self) -> Option<RunOutcome> {
        let run = self.run_slot().take()?;
        let outcome = run.stop();
        info!(steps = outcome.steps, "Simulation paused");
        Some(outcome)
    }

    /// Block until a bounded continuous run ends on its own.
    pub fn wait_for_run(&self) -> Option<RunOutcome> {
        let run = self.run_slot().take()?;
        Some(run.wait())
    }

    /// Whether continuous stepping is active.
    pub fn is_simulation_running(&self) -> bool {
        self.run_slot().as_ref().is_some_and(ContinuousRun::is_running)
    }

    /// Cap continuous stepping at `tps` steps per second (0 = unrestricted).
    pub fn set_tps_restriction(&self, tps: u32) {
        self.tps_restriction.store(tps, Ordering::Relaxed);
    }

    /// Current steps-per-second cap.
    pub fn tps_restriction(&self) -> u32 {
        self.tps_restriction.load(Ordering::Relaxed)
    }

    /// Current timestep.
    pub fn current_timestep(&self) -> Result<u64, ControlError> {
        self.with_engine(|e| e.timestep)
    }

    /// Overwrite the timestep counter.
    pub fn set_current_timestep(&self, timestep: u64) -> Result<(), ControlError> {
        self.with_engine_mut(|engine| {
            engine.timestep = timestep;
            engine.refresh_statistics();
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Bulk data
    // -----------------------------------------------------------------------

    /// A copy of every entity, sorted by id.
    pub fn get_simulation_data(&self) -> Result<DataDescription, ControlError> {
        self.with_engine(|e| e.describe(&Selection::All))
    }

    /// Replace every entity with `data`, keeping its ids.
    pub fn set_simulation_data(&self, data: DataDescription) -> Result<(), ControlError> {
        self.with_engine_mut(|engine| {
            let rebuilt = Engine::build(engine.id, engine.settings.clone(), engine.timestep, data)?;
            info!(simulation = %engine.id, "Simulation data replaced");
            *engine = rebuilt;
            Ok(())
        })
    }

    /// A copy of the entities matching `selection`.
    pub fn get_selected_data(&self, selection: &Selection) -> Result<DataDescription, ControlError> {
        self.with_engine(|e| e.describe(selection))
    }

    /// A copy of the top-level entities containing any of `ids`.
    pub fn get_inspected_data(&self, ids: &BTreeSet<EntityId>) -> Result<DataDescription, ControlError> {
        self.get_selected_data(&Selection::Ids(ids.clone()))
    }

    /// Insert `data` with freshly assigned ids and return what was inserted.
    pub fn add_data(&self, data: DataDescription) -> Result<DataDescription, ControlError> {
        self.with_engine_mut(|engine| {
            let mut ids = engine.external_ids.clone();
            let data = reassign_ids(data, &mut ids)?;
            engine.insert_all(data.clone())?;
            engine.external_ids = ids;
            debug!(
                clusters = data.clusters.len(),
                particles = data.particles.len(),
                "Data added"
            );
            Ok(data)
        })
    }

    /// Remove and return the entities matching `selection`.
    pub fn remove_selected_objects(&self, selection: &Selection) -> Result<DataDescription, ControlError> {
        self.with_engine_mut(|engine| {
            let mut removed = DataDescription::default();
            engine
                .scheduler
                .for_each_mut(|c| removed.extend(c.remove_selected(selection)));
            engine.ledger.record_external_remove(removed.total_energy())?;
            engine.refresh_statistics();
            removed.sort_by_id();
            Ok(removed)
        })
    }

    /// Seed a generated population into the world.
    pub fn add_population(&self, recipe: &PopulationRecipe) -> Result<DataDescription, ControlError> {
        self.with_engine_mut(|engine| {
            let external = CompartmentId(engine.graph.compartment_count());
            let seed = Compartment::stream_seed(engine.settings.general.seed, external, engine.timestep);
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut ids = engine.external_ids.clone();
            let data = populate(
                recipe,
                engine.graph.topology(),
                &engine.settings.parameters,
                &mut ids,
                &mut rng,
            )?;
            engine.insert_all(data.clone())?;
            engine.external_ids = ids;
            info!(
                clusters = data.clusters.len(),
                cells = data.cell_count(),
                particles = data.particles.len(),
                energy = data.total_energy(),
                "Population seeded"
            );
            Ok(data)
        })
    }

    /// Replace a cell's energy, bond capacity and tokens. Its bonds and
    /// position inside the cluster are kept.
    pub fn change_cell(&self, cell: Cell) -> Result<(), ControlError> {
        self.with_engine_mut(|engine| {
            let memory_size = engine.settings.parameters.token_memory_size;
            let mut fresh = engine.external_ids.clone();
            let mut outcome = None;
            for compartment in engine.graph.compartment_ids() {
                outcome = engine
                    .scheduler
                    .with_compartment(compartment, |c| {
                        let existing = c.cell_mut(cell.id)?;
                        Some(replace_cell(existing, &cell, memory_size, &mut fresh))
                    })
                    .flatten();
                if outcome.is_some() {
                    break;
                }
            }
            let delta = outcome.ok_or(WorldError::EntityNotFound(cell.id))??;
            engine.external_ids = fresh;
            flow(delta, &mut engine.ledger)?;
            engine.refresh_statistics();
            Ok(())
        })
    }

    /// Replace a particle's position, velocity and energy. A particle moved
    /// into another compartment changes owner.
    pub fn change_particle(&self, mut particle: Particle) -> Result<(), ControlError> {
        validate_entity(&Entity::Particle(particle.clone()))?;
        let id = particle.id;
        self.with_engine_mut(|engine| {
            particle.pos = engine.graph.topology().wrap(particle.pos);
            let target = engine.graph.compartment_containing(particle.pos);
            let selection = Selection::Ids(BTreeSet::from([id]));
            let mut previous = None;
            for compartment in engine.graph.compartment_ids() {
                let found = engine
                    .scheduler
                    .with_compartment(compartment, |c| c.particle_mut(id).map(|p| p.energy))
                    .flatten();
                if let Some(energy) = found {
                    previous = Some((compartment, energy));
                    break;
                }
            }
            let (owner, old_energy) = previous.ok_or(WorldError::EntityNotFound(id))?;
            let new_energy = particle.energy;
            if owner == target {
                engine.scheduler.with_compartment(owner, |c| {
                    if let Some(p) = c.particle_mut(id) {
                        *p = particle;
                    }
                });
            } else {
                engine.scheduler.with_compartment(owner, |c| c.remove_selected(&selection));
                engine
                    .scheduler
                    .with_compartment(target, |c| c.insert(Entity::Particle(particle)))
                    .ok_or(WorldError::CompartmentNotFound(target))??;
            }
            flow(new_energy - old_energy, &mut engine.ledger)?;
            engine.refresh_statistics();
            Ok(())
        })
    }

    /// Add `force` to the velocity of everything within `radius` of
    /// `center`. Queued if a step is in flight.
    pub fn apply_force(&self, center: Vec2, radius: f64, force: Vec2) -> Result<(), ControlError> {
        if !center.is_finite() || !force.is_finite() || !radius.is_finite() || radius < 0.0 {
            return Err(ControlError::InvalidParameters(InvalidParameter {
                name: "force",
                reason: "centre, radius and force must be finite".to_owned(),
            }));
        }
        let force = Force {
            center,
            radius,
            force,
        };
        match self.shared.try_lock() {
            Ok(mut guard) => {
                let engine = guard.as_mut().ok_or(ControlError::NoSimulation)?;
                engine.apply_force(force);
            }
            Err(_) => self.shared.queue(|pending| pending.forces.push(force)),
        }
        Ok(())
    }

    /// Apply one mutation to a cell with its compartment's random stream.
    /// Returns whether anything changed.
    pub fn mutate_cell(&self, id: EntityId, mutation: MutationType) -> Result<bool, ControlError> {
        self.with_engine_mut(|engine| {
            let params = &engine.settings.parameters;
            for compartment in engine.graph.compartment_ids() {
                let result = engine
                    .scheduler
                    .with_compartment(compartment, |c| {
                        c.cell_mut(id)?;
                        Some(c.mutate_cell(id, mutation, params))
                    })
                    .flatten();
                if let Some(result) = result {
                    let applied = result?;
                    engine.refresh_statistics();
                    return Ok(applied);
                }
            }
            Err(WorldError::EntityNotFound(id).into())
        })
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Parameters in effect for the next step.
    pub fn get_simulation_parameters(&self) -> Result<SimulationParameters, ControlError> {
        if let Some(pending) = self.shared.pending().parameters.clone() {
            return Ok(pending);
        }
        self.with_engine(|e| e.settings.parameters.clone())
    }

    /// Replace the parameters. Applied immediately at a boundary, otherwise
    /// as soon as the running step completes.
    pub fn set_simulation_parameters(&self, parameters: SimulationParameters) -> Result<(), ControlError> {
        parameters.validate()?;
        match self.shared.try_lock() {
            Ok(mut guard) => {
                let engine = guard.as_mut().ok_or(ControlError::NoSimulation)?;
                self.shared.pending().parameters = None;
                engine.apply_parameters(parameters);
            }
            Err(_) => self.shared.queue(|pending| pending.parameters = Some(parameters)),
        }
        Ok(())
    }

    /// World layout and execution resources.
    pub fn get_general_settings(&self) -> Result<GeneralSettings, ControlError> {
        self.with_engine(|e| e.settings.general.clone())
    }

    /// Rebuild the compartment grid and worker pool. Every entity moves to
    /// its new owner exactly once. Only allowed while stopped.
    pub fn set_general_settings(&self, general: GeneralSettings) -> Result<(), ControlError> {
        if self.is_simulation_running() {
            return Err(ControlError::Running);
        }
        self.with_engine_mut(|engine| {
            let data = engine.describe(&Selection::All);
            let settings = Settings {
                general,
                parameters: engine.settings.parameters.clone(),
            };
            let rebuilt = Engine::build(engine.id, settings, engine.timestep, data)?;
            info!(
                simulation = %engine.id,
                compartments = rebuilt.graph.compartment_count(),
                threads = rebuilt.scheduler.thread_count(),
                "Simulation resharded"
            );
            *engine = rebuilt;
            Ok(())
        })
    }

    /// World extent.
    pub fn get_world_size(&self) -> Result<IntVec2, ControlError> {
        self.with_engine(|e| e.settings.general.world_size)
    }

    /// General settings and current parameters.
    pub fn get_settings(&self) -> Result<Settings, ControlError> {
        self.with_engine(|e| e.settings.clone())
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    /// Snapshot of the last completed step.
    pub fn get_statistics(&self) -> Result<MonitorData, ControlError> {
        self.with_engine(|e| e.statistics.latest().clone())
    }

    /// Energy balance of the last completed step.
    pub fn get_energy_balance(&self) -> Result<Option<StepBalance>, ControlError> {
        self.with_engine(|e| e.ledger.last_balance().cloned())
    }

    /// Energy owned by each compartment, in compartment id order.
    pub fn get_compartment_energies(&self) -> Result<Vec<f64>, ControlError> {
        self.with_engine(|e| e.scheduler.map(Compartment::total_energy))
    }

    /// Conservation violations seen since the simulation was built.
    pub fn conservation_violations(&self) -> Result<u64, ControlError> {
        self.with_engine(|e| e.ledger.violations())
    }

    /// Id of the loaded simulation.
    pub fn simulation_id(&self) -> Result<SimulationId, ControlError> {
        self.with_engine(|e| e.id)
    }
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        self.pause_simulation();
    }
}

/// Copy the editable state of `update` onto `existing` and return the
/// energy change.
fn replace_cell(
    existing: &mut Cell,
    update: &Cell,
    memory_size: usize,
    ids: &mut IdAllocator,
) -> Result<f64, ControlError> {
    if existing.bonds.len() > usize::from(update.max_bonds) {
        return Err(ControlError::BondLimit {
            id: existing.id,
            bonds: existing.bonds.len(),
            max_bonds: update.max_bonds,
        });
    }
    if !update.energy.is_finite() || update.tokens.iter().any(|t| !t.energy.is_finite()) {
        return Err(WorldError::NonFiniteEntity(existing.id).into());
    }
    let known: BTreeSet<EntityId> = existing.tokens.iter().map(|t| t.id).collect();
    let mut tokens = update.tokens.clone();
    for token in &mut tokens {
        token.resize_memory(memory_size);
        if !known.contains(&token.id) {
            token.id = ids.next_id()?;
        }
    }
    let before = existing.total_energy();
    existing.energy = update.energy;
    existing.max_bonds = update.max_bonds;
    existing.tokens = tokens;
    Ok(existing.total_energy() - before)
}
