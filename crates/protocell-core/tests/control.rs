//! Control surface behaviour: lifecycle, bulk edits, parameter exchange,
//! continuous runs and resharding.

// Integration tests use expect/unwrap extensively for clarity -- panicking
// on failure is the correct behavior in test code.
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::too_many_lines
)]

use std::collections::BTreeSet;
use std::time::Duration;

use protocell_core::{ControlError, RunEndReason, SimulationController, decode, encode};
use protocell_types::{
    Cell, Cluster, DataDescription, EntityId, GeneralSettings, IntVec2, MutationRates,
    MutationType, Particle, Selection, Settings, SimulationParameters, Token, Vec2,
};
use protocell_world::{CompartmentGraph, PopulationRecipe, WorldError};

fn settings(threads: usize) -> Settings {
    Settings {
        general: GeneralSettings {
            world_size: IntVec2::new(100, 100),
            grid_dims: IntVec2::new(2, 2),
            thread_count: threads,
            seed: 5,
        },
        parameters: SimulationParameters {
            mutation_rates: MutationRates::NONE,
            ..SimulationParameters::default()
        },
    }
}

fn particle(id: u64, x: f64, y: f64, energy: f64) -> Particle {
    Particle {
        id: EntityId(id),
        pos: Vec2::new(x, y),
        vel: Vec2::ZERO,
        energy,
    }
}

fn pair_cluster(id: u64, pos: Vec2) -> Cluster {
    let mut a = Cell::new(EntityId(id + 1), Vec2::new(-0.5, 0.0), 8.0, 2);
    let mut b = Cell::new(EntityId(id + 2), Vec2::new(0.5, 0.0), 8.0, 2);
    a.bonds.push(b.id);
    b.bonds.push(a.id);
    a.tokens.push(Token::zeroed(EntityId(id + 3), 16, 2.0));
    Cluster {
        id: EntityId(id),
        pos,
        vel: Vec2::ZERO,
        angle: 0.0,
        angular_vel: 0.0,
        cells: vec![a, b],
    }
}

fn loaded(threads: usize) -> SimulationController {
    let controller = SimulationController::new();
    controller.new_simulation(0, settings(threads)).unwrap();
    let data = DataDescription::default()
        .with_cluster(pair_cluster(100, Vec2::new(20.0, 20.0)))
        .with_particle(particle(1, 10.0, 10.0, 3.0))
        .with_particle(particle(2, 80.0, 80.0, 4.0));
    controller.set_simulation_data(data).unwrap();
    controller
}

#[test]
fn operations_without_simulation_fail() {
    let controller = SimulationController::new();
    assert!(matches!(controller.get_statistics(), Err(ControlError::NoSimulation)));
    assert!(matches!(controller.calc_single_timestep(), Err(ControlError::NoSimulation)));
    assert!(matches!(controller.run_simulation(), Err(ControlError::NoSimulation)));
    assert!(!controller.is_simulation_running());
}

#[test]
fn invalid_settings_are_rejected_before_start() {
    let controller = SimulationController::new();
    let mut bad = settings(1);
    bad.general.world_size = IntVec2::new(101, 100);
    assert!(matches!(
        controller.new_simulation(0, bad),
        Err(ControlError::World(WorldError::InvalidGrid { .. }))
    ));

    let mut bad = settings(1);
    bad.parameters.token_memory_size = 0;
    assert!(matches!(
        controller.new_simulation(0, bad),
        Err(ControlError::InvalidParameters(_))
    ));

    assert!(matches!(
        controller.new_simulation(0, settings(0)),
        Err(ControlError::Scheduler(_))
    ));
}

#[test]
fn lifecycle_and_settings_accessors() {
    let controller = SimulationController::new();
    controller.new_simulation(17, settings(2)).unwrap();
    assert_eq!(controller.current_timestep().unwrap(), 17);
    assert_eq!(controller.get_world_size().unwrap(), IntVec2::new(100, 100));
    assert_eq!(controller.get_general_settings().unwrap().thread_count, 2);
    assert_eq!(controller.get_settings().unwrap(), settings(2));

    assert_eq!(controller.calc_single_timestep().unwrap(), 18);
    controller.set_current_timestep(3).unwrap();
    assert_eq!(controller.get_statistics().unwrap().timestep, 3);

    controller.close_simulation();
    assert!(matches!(controller.current_timestep(), Err(ControlError::NoSimulation)));
}

#[test]
fn bulk_data_round_trips_and_clear_empties() {
    let controller = loaded(2);
    let data = controller.get_simulation_data().unwrap();
    assert_eq!(data.particles.len(), 2);
    assert_eq!(data.clusters.len(), 1);
    assert_eq!(data.token_count(), 1);
    // Memory is fitted to the configured size on load.
    assert_eq!(
        data.clusters[0].cells[0].tokens[0].memory.len(),
        SimulationParameters::default().token_memory_size
    );

    let stats = controller.get_statistics().unwrap();
    assert_eq!(stats.particle_count, 2);
    assert_eq!(stats.cell_count, 2);
    assert!((stats.total_energy - 25.0).abs() < 1e-9);

    controller.clear().unwrap();
    assert!(controller.get_simulation_data().unwrap().is_empty());
    assert_eq!(controller.get_statistics().unwrap().energy_bearing_count(), 0);
}

#[test]
fn duplicate_ids_are_rejected_on_load() {
    let controller = SimulationController::new();
    controller.new_simulation(0, settings(1)).unwrap();
    let data = DataDescription::default()
        .with_particle(particle(7, 1.0, 1.0, 1.0))
        .with_particle(particle(7, 2.0, 2.0, 1.0));
    assert!(matches!(
        controller.set_simulation_data(data),
        Err(ControlError::DuplicateId(EntityId(7)))
    ));
}

#[test]
fn selections_and_inspection() {
    let controller = loaded(1);
    let region = Selection::Region {
        from: Vec2::new(0.0, 0.0),
        to: Vec2::new(30.0, 30.0),
    };
    let selected = controller.get_selected_data(&region).unwrap();
    assert_eq!(selected.particles.len(), 1);
    assert_eq!(selected.clusters.len(), 1);

    // A token id selects its whole cluster.
    let inspected = controller
        .get_inspected_data(&BTreeSet::from([EntityId(103)]))
        .unwrap();
    assert_eq!(inspected.clusters.len(), 1);
    assert!(inspected.particles.is_empty());
}

#[test]
fn added_data_gets_fresh_ids_and_balances() {
    let controller = loaded(2);
    let added = controller
        .add_data(
            DataDescription::default()
                .with_cluster(pair_cluster(100, Vec2::new(70.0, 30.0)))
                .with_particle(particle(1, 60.0, 60.0, 5.0)),
        )
        .unwrap();

    let existing = controller.get_simulation_data().unwrap().entity_ids();
    assert_eq!(existing.len(), 4 + 1 + 1 + 4 + 1);
    let fresh = added.entity_ids();
    assert!(fresh.iter().all(|id| id.0 > 103));
    assert!(added.clusters[0].bonds_are_symmetric());

    controller.calc_single_timestep().unwrap();
    assert_eq!(controller.conservation_violations().unwrap(), 0);
    let balance = controller.get_energy_balance().unwrap().unwrap();
    assert!((balance.added - 23.0).abs() < 1e-9);
}

#[test]
fn removal_is_recorded_as_an_external_flow() {
    let controller = loaded(1);
    let removed = controller
        .remove_selected_objects(&Selection::Ids(BTreeSet::from([EntityId(2)])))
        .unwrap();
    assert_eq!(removed.particles.len(), 1);
    assert_eq!(controller.get_statistics().unwrap().particle_count, 1);

    controller.calc_single_timestep().unwrap();
    assert_eq!(controller.conservation_violations().unwrap(), 0);
    let balance = controller.get_energy_balance().unwrap().unwrap();
    assert!((balance.removed - 4.0).abs() < 1e-9);
}

#[test]
fn change_cell_keeps_bonds_and_checks_capacity() {
    let controller = loaded(1);
    let mut cell = controller.get_simulation_data().unwrap().clusters[0].cells[0].clone();

    cell.max_bonds = 0;
    assert!(matches!(
        controller.change_cell(cell.clone()),
        Err(ControlError::BondLimit { bonds: 1, max_bonds: 0, .. })
    ));

    cell.max_bonds = 3;
    cell.energy = 12.0;
    cell.bonds.clear();
    cell.tokens.push(Token::zeroed(EntityId(1), 4, 1.0));
    controller.change_cell(cell).unwrap();

    let changed = controller.get_simulation_data().unwrap().clusters[0].cells[0].clone();
    assert_eq!(changed.bonds, vec![EntityId(102)]);
    assert_eq!(changed.max_bonds, 3);
    assert_eq!(changed.tokens.len(), 2);
    assert_ne!(changed.tokens[1].id, EntityId(1));
    assert_eq!(changed.tokens[1].memory.len(), SimulationParameters::default().token_memory_size);

    controller.calc_single_timestep().unwrap();
    assert_eq!(controller.conservation_violations().unwrap(), 0);
}

#[test]
fn moved_particle_changes_owner() {
    let graph = CompartmentGraph::build(IntVec2::new(100, 100), IntVec2::new(2, 2)).unwrap();
    let controller = loaded(2);
    controller.change_particle(particle(1, 90.0, 10.0, 6.0)).unwrap();

    let energies = controller.get_compartment_energies().unwrap();
    let owner = graph.compartment_containing(Vec2::new(90.0, 10.0));
    assert!((energies[owner.0] - 6.0).abs() < 1e-9);

    assert!(matches!(
        controller.change_particle(particle(999, 1.0, 1.0, 1.0)),
        Err(ControlError::World(WorldError::EntityNotFound(EntityId(999))))
    ));

    controller.calc_single_timestep().unwrap();
    assert_eq!(controller.conservation_violations().unwrap(), 0);
}

#[test]
fn forces_change_velocity() {
    let controller = loaded(1);
    controller
        .apply_force(Vec2::new(10.0, 10.0), 2.0, Vec2::new(0.5, 0.0))
        .unwrap();
    let data = controller.get_simulation_data().unwrap();
    let pushed = data.particles.iter().find(|p| p.id == EntityId(1)).unwrap();
    let untouched = data.particles.iter().find(|p| p.id == EntityId(2)).unwrap();
    assert!((pushed.vel.x - 0.5).abs() < 1e-12);
    assert!(untouched.vel.x.abs() < 1e-12);

    assert!(matches!(
        controller.apply_force(Vec2::new(f64::NAN, 0.0), 1.0, Vec2::ZERO),
        Err(ControlError::InvalidParameters(_))
    ));
}

#[test]
fn mutate_cell_uses_the_owning_compartment() {
    let controller = loaded(1);
    let before = controller.get_simulation_data().unwrap().clusters[0].cells[0].tokens[0]
        .memory
        .clone();
    assert!(controller.mutate_cell(EntityId(101), MutationType::PointMutation).unwrap());
    let after = controller.get_simulation_data().unwrap().clusters[0].cells[0].tokens[0]
        .memory
        .clone();
    assert_eq!(before.iter().zip(&after).filter(|(a, b)| a != b).count(), 1);

    assert!(matches!(
        controller.mutate_cell(EntityId(5000), MutationType::Deletion),
        Err(ControlError::World(WorldError::EntityNotFound(_)))
    ));
}

#[test]
fn parameters_apply_at_the_boundary() {
    let controller = loaded(1);
    let mut params = controller.get_simulation_parameters().unwrap();
    params.token_memory_size = 24;
    params.instruction_budget = 9;
    controller.set_simulation_parameters(params.clone()).unwrap();
    assert_eq!(controller.get_simulation_parameters().unwrap(), params);
    assert_eq!(controller.get_settings().unwrap().parameters, params);

    let data = controller.get_simulation_data().unwrap();
    assert_eq!(data.clusters[0].cells[0].tokens[0].memory.len(), 24);

    params.friction = 3.0;
    assert!(matches!(
        controller.set_simulation_parameters(params),
        Err(ControlError::InvalidParameters(_))
    ));
}

#[test]
fn continuous_run_pauses_at_a_boundary() {
    let controller = SimulationController::new();
    controller.new_simulation(0, settings(2)).unwrap();
    controller.add_population(&PopulationRecipe::default()).unwrap();
    controller.set_tps_restriction(200);
    controller.run_simulation().unwrap();
    assert!(controller.is_simulation_running());

    assert!(matches!(controller.calc_single_timestep(), Err(ControlError::Running)));
    assert!(matches!(
        controller.set_general_settings(settings(1).general),
        Err(ControlError::Running)
    ));

    // Parameter changes are accepted while running and take effect by the
    // next step.
    let mut params = controller.get_simulation_parameters().unwrap();
    params.token_memory_size = 20;
    controller.set_simulation_parameters(params.clone()).unwrap();

    // Writes either land at a boundary or ask to be retried.
    let mut added = false;
    for _ in 0..2000 {
        match controller.add_data(DataDescription::default().with_particle(particle(1, 5.0, 5.0, 1.0))) {
            Ok(_) => {
                added = true;
                break;
            }
            Err(err) => {
                assert!(err.is_retryable());
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
    assert!(added);

    std::thread::sleep(Duration::from_millis(30));
    let outcome = controller.pause_simulation().unwrap();
    assert_eq!(outcome.end_reason, RunEndReason::Paused);
    assert!(outcome.steps > 0);
    assert!(!controller.is_simulation_running());
    assert_eq!(controller.current_timestep().unwrap(), outcome.last_timestep.unwrap());

    assert_eq!(controller.get_simulation_parameters().unwrap(), params);
    let data = controller.get_simulation_data().unwrap();
    for cell in data.clusters.iter().flat_map(|c| c.cells.iter()) {
        assert!(cell.tokens.iter().all(|t| t.memory.len() == 20));
    }
    assert_eq!(controller.conservation_violations().unwrap(), 0);
}

#[test]
fn changes_queued_during_a_run_land_before_pause_returns() {
    let controller = loaded(2);
    let mut params = controller.get_simulation_parameters().unwrap();
    params.friction = 0.0;
    controller.set_simulation_parameters(params.clone()).unwrap();
    controller.set_tps_restriction(0);
    let push = Vec2::new(1e-6, 0.0);

    for round in 0..25_usize {
        controller.run_simulation().unwrap();
        params.token_memory_size = 16 + round;
        controller.set_simulation_parameters(params.clone()).unwrap();
        controller.apply_force(Vec2::new(50.0, 50.0), 200.0, push).unwrap();
        controller.pause_simulation().unwrap();

        // Whatever was queued behind the last step is already in effect.
        let settings = controller.get_settings().unwrap();
        assert_eq!(settings.parameters, params);
        assert_eq!(controller.get_simulation_parameters().unwrap(), params);
        let data = controller.get_simulation_data().unwrap();
        for cell in data.clusters.iter().flat_map(|c| c.cells.iter()) {
            assert!(cell.tokens.iter().all(|t| t.memory.len() == params.token_memory_size));
        }
        let expected = push.x * (round + 1) as f64;
        for particle in &data.particles {
            assert!((particle.vel.x - expected).abs() < 1e-12, "round {round}");
        }
    }
    assert_eq!(controller.conservation_violations().unwrap(), 0);
}

#[test]
fn bounded_run_stops_by_itself() {
    let controller = loaded(2);
    controller.run_for(7).unwrap();
    let outcome = controller.wait_for_run().unwrap();
    assert_eq!(outcome.end_reason, RunEndReason::MaxStepsReached);
    assert_eq!(outcome.steps, 7);
    assert_eq!(controller.current_timestep().unwrap(), 7);
    let stats = controller.get_statistics().unwrap();
    assert!(stats.measured_tps.is_finite() && stats.measured_tps >= 0.0);
}

#[test]
fn throttled_run_reports_its_rate() {
    let controller = loaded(1);
    controller.set_tps_restriction(50);
    controller.run_for(6).unwrap();
    controller.wait_for_run().unwrap();
    let tps = controller.get_statistics().unwrap().measured_tps;
    // Sleep-based pacing only ever slows the run down.
    assert!(tps > 0.0 && tps <= 60.0, "measured {tps}");
}

#[test]
fn resharding_keeps_every_entity_once() {
    let controller = SimulationController::new();
    controller.new_simulation(0, settings(1)).unwrap();
    controller.add_population(&PopulationRecipe::default()).unwrap();
    controller.calc_single_timestep().unwrap();
    let before = controller.get_simulation_data().unwrap();

    controller
        .set_general_settings(GeneralSettings {
            world_size: IntVec2::new(100, 100),
            grid_dims: IntVec2::new(5, 4),
            thread_count: 3,
            seed: 5,
        })
        .unwrap();
    assert_eq!(controller.get_compartment_energies().unwrap().len(), 20);
    let after = controller.get_simulation_data().unwrap();
    assert_eq!(before, after);

    controller.calc_single_timestep().unwrap();
    assert_eq!(controller.conservation_violations().unwrap(), 0);
}

#[test]
fn settings_survive_the_codec() {
    let controller = loaded(3);
    controller.set_current_timestep(321).unwrap();
    let settings = controller.get_settings().unwrap();
    let timestep = controller.current_timestep().unwrap();

    let tree = encode(timestep, &settings).unwrap();
    let (decoded_timestep, decoded) = decode(&tree).unwrap();
    assert_eq!(decoded_timestep, 321);
    assert_eq!(decoded, settings);

    let restored = SimulationController::new();
    restored.new_simulation(decoded_timestep, decoded).unwrap();
    assert_eq!(restored.get_settings().unwrap(), settings);
}
