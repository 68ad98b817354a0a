//! Headless runner for the Protocell simulation.
//!
//! Loads configuration, seeds a world and steps it until the configured
//! step bound is reached, logging statistics along the way.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load configuration from `protocell-config.yaml`
//! 3. Create the simulation and its worker pool
//! 4. Seed the initial population
//! 5. Run the step loop
//! 6. Log the result

mod reporter;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32};

use anyhow::Context as _;
use protocell_core::{EngineConfig, SimulationController, drive, log_run_end};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::reporter::StatisticsReporter;

const CONFIG_PATH: &str = "protocell-config.yaml";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("protocell-engine starting");

    let config = load_config()?;
    info!(
        world_x = config.general.world_size.x,
        world_y = config.general.world_size.y,
        grid_x = config.general.grid_dims.x,
        grid_y = config.general.grid_dims.y,
        threads = config.general.thread_count,
        seed = config.general.seed,
        max_steps = config.run.max_steps,
        "Configuration loaded"
    );

    let controller = SimulationController::new();
    let simulation = controller
        .new_simulation(0, config.settings())
        .context("failed to create simulation")?;
    let seeded = controller
        .add_population(&config.population)
        .context("failed to seed population")?;
    info!(
        simulation = %simulation,
        clusters = seeded.clusters.len(),
        particles = seeded.particles.len(),
        energy = seeded.total_energy(),
        "World seeded"
    );

    let mut reporter = StatisticsReporter::new(&controller, config.run.report_interval);
    let mut step = || controller.calc_single_timestep();
    let outcome = drive(
        &mut step,
        &mut reporter,
        config.run.max_steps,
        &AtomicBool::new(false),
        &AtomicU32::new(config.run.tps_restriction),
    );
    log_run_end(&outcome);

    let stats = controller.get_statistics()?;
    info!(
        timestep = stats.timestep,
        total_energy = stats.total_energy,
        violations = controller.conservation_violations()?,
        "protocell-engine shutdown complete"
    );
    controller.close_simulation();
    Ok(())
}

/// Load the run configuration from `protocell-config.yaml`, falling back to
/// defaults when the file is absent.
fn load_config() -> anyhow::Result<EngineConfig> {
    let path = Path::new(CONFIG_PATH);
    if path.exists() {
        EngineConfig::from_file(path).with_context(|| format!("failed to load {CONFIG_PATH}"))
    } else {
        info!("Config file not found, using defaults");
        Ok(EngineConfig::default())
    }
}
