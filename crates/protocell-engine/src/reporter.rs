//! Step observer that logs a statistics line at a fixed interval.

use protocell_core::{SimulationController, StepObserver};
use tracing::{info, warn};

/// Logs aggregated statistics every `interval` steps.
pub struct StatisticsReporter<'a> {
    controller: &'a SimulationController,
    interval: u64,
}

impl<'a> StatisticsReporter<'a> {
    /// An `interval` of 0 disables reporting.
    pub const fn new(controller: &'a SimulationController, interval: u64) -> Self {
        Self {
            controller,
            interval,
        }
    }
}

impl StepObserver for StatisticsReporter<'_> {
    fn on_step(&mut self, timestep: u64) {
        if self.interval == 0 || timestep.checked_rem(self.interval) != Some(0) {
            return;
        }
        match self.controller.get_statistics() {
            Ok(stats) => info!(
                timestep,
                particles = stats.particle_count,
                clusters = stats.cluster_count,
                cells = stats.cell_count,
                tokens = stats.token_count,
                total_energy = stats.total_energy,
                average_energy = stats.average_energy,
                migrations = stats.migrations_last_step,
                "Statistics"
            ),
            Err(err) => warn!(timestep, error = %err, "Statistics unavailable"),
        }
    }
}
