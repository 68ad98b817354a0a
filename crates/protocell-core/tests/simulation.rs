//! End-to-end properties of the stepped simulation: energy conservation,
//! single-hop migration, determinism and the token memory invariant.

// Integration tests use expect/unwrap extensively for clarity -- panicking
// on failure is the correct behavior in test code.
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::too_many_lines
)]

use std::collections::BTreeMap;

use protocell_core::SimulationController;
use protocell_genome::{Instruction, InstructionSetV1, assemble};
use protocell_types::{
    Cell, Cluster, DataDescription, EntityId, GeneralSettings, IntVec2, MutationRates,
    RadiationSource, Settings, SimulationParameters, Token, Vec2,
};
use protocell_world::{CompartmentGraph, PopulationRecipe};

fn settings(world: u32, grid: u32, threads: usize) -> Settings {
    Settings {
        general: GeneralSettings {
            world_size: IntVec2::new(world, world),
            grid_dims: IntVec2::new(grid, grid),
            thread_count: threads,
            seed: 2024,
        },
        parameters: SimulationParameters {
            mutation_rates: MutationRates::NONE,
            ..SimulationParameters::default()
        },
    }
}

fn recipe() -> PopulationRecipe {
    PopulationRecipe {
        clusters: 12,
        cells_per_cluster: 3,
        particles: 60,
        max_speed: 0.8,
        ..PopulationRecipe::default()
    }
}

fn start(settings: Settings) -> SimulationController {
    let controller = SimulationController::new();
    controller.new_simulation(0, settings).unwrap();
    controller.add_population(&recipe()).unwrap();
    controller
}

fn run(controller: &SimulationController, steps: u64) {
    for _ in 0..steps {
        controller.calc_single_timestep().unwrap();
    }
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

#[test]
fn energy_is_conserved_without_external_flows() {
    let controller = start(settings(100, 2, 2));
    let before = controller.get_simulation_data().unwrap().total_energy();
    run(&controller, 40);
    let after = controller.get_simulation_data().unwrap().total_energy();

    assert!(approx(before, after), "before {before}, after {after}");
    assert_eq!(controller.conservation_violations().unwrap(), 0);
    let balance = controller.get_energy_balance().unwrap().unwrap();
    assert_eq!(balance.step, 40);
    assert!(balance.injected.abs() < f64::EPSILON);
}

#[test]
fn radiation_injection_is_accounted_for() {
    let mut settings = settings(100, 2, 1);
    settings.parameters.radiation_sources = vec![RadiationSource {
        position: Vec2::new(25.0, 25.0),
        radius: 5.0,
        emission_probability: 1.0,
        particle_energy: 2.0,
        mutation_probability: 0.0,
    }];
    let controller = start(settings);
    let before = controller.get_statistics().unwrap().total_energy;
    run(&controller, 10);
    let after = controller.get_statistics().unwrap().total_energy;

    assert_eq!(controller.conservation_violations().unwrap(), 0);
    assert!(approx(after - before, 20.0), "injected {}", after - before);
}

#[test]
fn entities_move_at_most_one_compartment_per_step() {
    let graph = CompartmentGraph::build(IntVec2::new(100, 100), IntVec2::new(4, 4)).unwrap();
    let controller = SimulationController::new();
    controller.new_simulation(0, settings(100, 4, 3)).unwrap();
    // Speeds well above the compartment width force clamped overflows.
    controller
        .add_population(&PopulationRecipe {
            max_speed: 60.0,
            ..recipe()
        })
        .unwrap();

    let owners = |data: &DataDescription| -> BTreeMap<EntityId, (u32, u32)> {
        let clusters = data.clusters.iter().map(|c| (c.id, c.pos));
        let particles = data.particles.iter().map(|p| (p.id, p.pos));
        clusters
            .chain(particles)
            .map(|(id, pos)| (id, graph.coords(graph.compartment_containing(pos)).unwrap()))
            .collect()
    };
    let hop = |a: u32, b: u32| {
        let d = a.abs_diff(b);
        d.min(4 - d)
    };

    let mut previous = owners(&controller.get_simulation_data().unwrap());
    let mut overflows = 0;
    for _ in 0..10 {
        controller.calc_single_timestep().unwrap();
        overflows += controller.get_statistics().unwrap().migration_overflows_last_step;
        let current = owners(&controller.get_simulation_data().unwrap());
        for (id, (x, y)) in &current {
            if let Some((px, py)) = previous.get(id) {
                assert!(hop(*x, *px) <= 1 && hop(*y, *py) <= 1, "entity {id} skipped a compartment");
            }
        }
        previous = current;
    }
    assert!(overflows > 0);
}

#[test]
fn single_thread_runs_are_reproducible() {
    let mut settings = settings(100, 2, 1);
    settings.parameters.mutation_rates = MutationRates::default();
    settings.parameters.radiation_sources = vec![RadiationSource {
        position: Vec2::new(60.0, 60.0),
        radius: 20.0,
        emission_probability: 0.5,
        particle_energy: 3.0,
        mutation_probability: 0.2,
    }];

    let first = start(settings.clone());
    let second = start(settings);
    run(&first, 25);
    run(&second, 25);

    let a = first.get_simulation_data().unwrap();
    let b = second.get_simulation_data().unwrap();
    assert_eq!(a.entity_ids(), b.entity_ids());
    assert_eq!(a, b);
}

#[test]
fn aggregates_match_across_thread_counts() {
    let single = start(settings(120, 4, 1));
    let pooled = start(settings(120, 4, 4));
    run(&single, 20);
    run(&pooled, 20);

    let a = single.get_statistics().unwrap();
    let b = pooled.get_statistics().unwrap();
    assert_eq!(a.timestep, b.timestep);
    assert_eq!(a.particle_count, b.particle_count);
    assert_eq!(a.cluster_count, b.cluster_count);
    assert_eq!(a.cell_count, b.cell_count);
    assert_eq!(a.token_count, b.token_count);
    assert!(approx(a.total_energy, b.total_energy));
}

#[test]
fn token_memory_follows_parameter_changes() {
    let controller = start(settings(100, 2, 2));
    let mut params = controller.get_simulation_parameters().unwrap();

    for size in [40, 300, 7] {
        params.token_memory_size = size;
        controller.set_simulation_parameters(params.clone()).unwrap();
        run(&controller, 2);
        let data = controller.get_simulation_data().unwrap();
        assert!(data.token_count() > 0);
        for cell in data.clusters.iter().flat_map(|c| c.cells.iter()) {
            for token in &cell.tokens {
                assert_eq!(token.memory.len(), size);
            }
        }
    }
}

#[test]
fn token_that_gives_away_all_its_energy_disappears() {
    let mut settings = settings(100, 2, 1);
    settings.parameters.token_memory_size = 16;
    settings.parameters.instruction_energy_cost = 0.0;
    settings.parameters.energy_transfer_unit = 1.0;
    let controller = SimulationController::new();
    controller.new_simulation(0, settings).unwrap();

    let program = assemble(
        &InstructionSetV1,
        0,
        &[
            Instruction::Set { dst: 15, value: 5 },
            Instruction::GiveToCell { amount: 15 },
        ],
        16,
    );
    let mut cell = Cell::new(EntityId(2), Vec2::ZERO, 10.0, 4);
    cell.tokens.push(Token::with_memory(EntityId(3), 5.0, &program, 16));
    let cluster = Cluster {
        id: EntityId(1),
        pos: Vec2::new(20.0, 20.0),
        vel: Vec2::ZERO,
        angle: 0.0,
        angular_vel: 0.0,
        cells: vec![cell],
    };
    controller
        .set_simulation_data(DataDescription::default().with_cluster(cluster))
        .unwrap();

    run(&controller, 1);
    let stats = controller.get_statistics().unwrap();
    assert_eq!(stats.token_count, 0);
    assert_eq!(stats.cell_count, 1);
    assert_eq!(stats.destroyed_last_step, 1);
    let data = controller.get_simulation_data().unwrap();
    let cell = &data.clusters[0].cells[0];
    assert!(cell.tokens.is_empty());
    assert!(approx(cell.energy, 15.0));
    assert_eq!(controller.conservation_violations().unwrap(), 0);
}

fn three_cell_cluster(pos: Vec2, vel: Vec2) -> Cluster {
    let mut cells = vec![
        Cell::new(EntityId(2), Vec2::new(-1.0, 0.0), 10.0, 4),
        Cell::new(EntityId(3), Vec2::new(0.0, 0.0), 10.0, 4),
        Cell::new(EntityId(4), Vec2::new(1.0, 0.0), 10.0, 4),
    ];
    cells[0].bonds.push(EntityId(3));
    cells[1].bonds.extend([EntityId(2), EntityId(4)]);
    cells[2].bonds.push(EntityId(3));
    Cluster {
        id: EntityId(1),
        pos,
        vel,
        angle: 0.0,
        angular_vel: 0.0,
        cells,
    }
}

#[test]
fn cluster_crossing_a_boundary_moves_as_a_whole() {
    let mut settings = settings(100, 2, 2);
    settings.parameters.friction = 0.0;
    let graph = CompartmentGraph::build(IntVec2::new(100, 100), IntVec2::new(2, 2)).unwrap();
    let from = graph.compartment_containing(Vec2::new(25.0, 25.0));
    let to = graph.compartment_containing(Vec2::new(75.0, 25.0));

    let controller = SimulationController::new();
    controller.new_simulation(0, settings).unwrap();
    let cluster = three_cell_cluster(Vec2::new(49.8, 25.0), Vec2::new(0.5, 0.0));
    controller
        .set_simulation_data(DataDescription::default().with_cluster(cluster))
        .unwrap();
    let energies = controller.get_compartment_energies().unwrap();
    assert!(approx(energies[from.0], 30.0));

    controller.calc_single_timestep().unwrap();

    let energies = controller.get_compartment_energies().unwrap();
    assert!(energies[from.0].abs() < f64::EPSILON);
    assert!(approx(energies[to.0], 30.0));

    let data = controller.get_simulation_data().unwrap();
    assert_eq!(data.clusters.len(), 1);
    let moved = &data.clusters[0];
    assert_eq!(moved.id, EntityId(1));
    assert_eq!(graph.compartment_containing(moved.pos), to);
    let ids: Vec<_> = moved.cells.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![EntityId(2), EntityId(3), EntityId(4)]);
    assert!(moved.bonds_are_symmetric());
    assert_eq!(controller.get_statistics().unwrap().migrations_last_step, 1);
}

/// A token that can never afford an instruction, so only mutation touches
/// its memory.
fn point_mutation_run(seed: u64) -> Vec<Vec<u8>> {
    let mut settings = settings(100, 2, 1);
    settings.general.seed = seed;
    settings.parameters.token_memory_size = 32;
    settings.parameters.instruction_energy_cost = 5.0;
    settings.parameters.mutation_rates = MutationRates {
        point: 1.0,
        ..MutationRates::NONE
    };

    let mut cell = Cell::new(EntityId(11), Vec2::ZERO, 10.0, 2);
    cell.tokens.push(Token::zeroed(EntityId(12), 32, 1.0));
    let cluster = Cluster {
        id: EntityId(10),
        pos: Vec2::new(30.0, 30.0),
        vel: Vec2::ZERO,
        angle: 0.0,
        angular_vel: 0.0,
        cells: vec![cell],
    };

    let controller = SimulationController::new();
    controller.new_simulation(0, settings).unwrap();
    controller
        .set_simulation_data(DataDescription::default().with_cluster(cluster))
        .unwrap();

    let mut history = Vec::new();
    for _ in 0..10 {
        controller.calc_single_timestep().unwrap();
        let data = controller.get_simulation_data().unwrap();
        history.push(data.clusters[0].cells[0].tokens[0].memory.clone());
    }
    history
}

#[test]
fn point_mutation_is_one_byte_per_step_and_reproducible() {
    let first = point_mutation_run(99);
    let second = point_mutation_run(99);
    assert_eq!(first, second);

    let mut previous = vec![0_u8; 32];
    for memory in &first {
        let changed = memory.iter().zip(&previous).filter(|(a, b)| a != b).count();
        assert_eq!(changed, 1);
        previous.clone_from(memory);
    }
}
