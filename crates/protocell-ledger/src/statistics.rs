//! Aggregated step statistics for external monitoring.
//!
//! The collector folds the census and step reports of all compartments into
//! an immutable [`MonitorData`] snapshot after each completed step. It also
//! keeps the completion times of recent steps to report a measured rate.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::debug;

use protocell_types::MonitorData;
use protocell_world::{Census, StepReport};

/// Number of step completions the measured rate is averaged over.
const TPS_WINDOW: usize = 16;

/// Builds [`MonitorData`] snapshots from per-compartment results.
#[derive(Debug, Clone)]
pub struct StatisticsCollector {
    latest: MonitorData,
    completions: VecDeque<DateTime<Utc>>,
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new(0)
    }
}

impl StatisticsCollector {
    /// Create a collector whose first snapshot describes an empty world.
    pub fn new(timestep: u64) -> Self {
        Self {
            latest: MonitorData::empty(timestep),
            completions: VecDeque::with_capacity(TPS_WINDOW),
        }
    }

    /// Record the outcome of a completed step.
    pub fn record_step<'a>(
        &mut self,
        timestep: u64,
        censuses: impl IntoIterator<Item = &'a Census>,
        reports: impl IntoIterator<Item = &'a StepReport>,
    ) -> &MonitorData {
        self.record_step_at(Utc::now(), timestep, censuses, reports)
    }

    fn record_step_at<'a>(
        &mut self,
        now: DateTime<Utc>,
        timestep: u64,
        censuses: impl IntoIterator<Item = &'a Census>,
        reports: impl IntoIterator<Item = &'a StepReport>,
    ) -> &MonitorData {
        if self.completions.len() >= TPS_WINDOW {
            self.completions.pop_front();
        }
        self.completions.push_back(now);
        let mut census = Census::default();
        for c in censuses {
            census.merge(c);
        }
        let mut report = StepReport::default();
        for r in reports {
            report.merge(r);
        }
        self.latest = snapshot(timestep, &census, &report, self.measured_tps(), now);
        debug!(
            timestep,
            tps = self.latest.measured_tps,
            particles = self.latest.particle_count,
            cells = self.latest.cell_count,
            tokens = self.latest.token_count,
            total_energy = self.latest.total_energy,
            "Statistics recorded"
        );
        &self.latest
    }

    /// Refresh counts without a step, e.g. after a bulk edit. Per-step
    /// counters are reset.
    pub fn refresh(&mut self, timestep: u64, census: &Census) -> &MonitorData {
        self.latest = snapshot(
            timestep,
            census,
            &StepReport::default(),
            self.measured_tps(),
            Utc::now(),
        );
        &self.latest
    }

    /// Forget recorded completion times, e.g. when a continuous run resumes
    /// after a pause.
    pub fn reset_rate(&mut self) {
        self.completions.clear();
        self.latest.measured_tps = 0.0;
    }

    /// Steps per second between the oldest and newest recorded completion.
    fn measured_tps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.completions.front(), self.completions.back()) else {
            return 0.0;
        };
        let Some(micros) = last.signed_duration_since(*first).num_microseconds() else {
            return 0.0;
        };
        if micros <= 0 {
            return 0.0;
        }
        let steps = self.completions.len().saturating_sub(1);
        steps as f64 * 1_000_000.0 / micros as f64
    }

    /// The most recent snapshot.
    pub const fn latest(&self) -> &MonitorData {
        &self.latest
    }
}

fn snapshot(
    timestep: u64,
    census: &Census,
    report: &StepReport,
    measured_tps: f64,
    captured_at: DateTime<Utc>,
) -> MonitorData {
    let bearing = census
        .particles
        .saturating_add(census.cells)
        .saturating_add(census.tokens);
    let average_energy = if bearing == 0 {
        0.0
    } else {
        census.energy / bearing as f64
    };
    MonitorData {
        timestep,
        particle_count: census.particles,
        cluster_count: census.clusters,
        cell_count: census.cells,
        token_count: census.tokens,
        total_energy: census.energy,
        average_energy,
        created_last_step: report.created,
        destroyed_last_step: report.destroyed,
        migrations_last_step: report.migrated_out,
        migration_overflows_last_step: report.overflows,
        radiation_energy_last_step: report.radiation_energy,
        measured_tps,
        captured_at,
    }
}
