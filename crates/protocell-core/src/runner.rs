//! Continuous run mode.
//!
//! [`drive`] is the step loop with its run controls:
//!
//! - **Bounded run**: stop after `max_steps` completed steps
//! - **Pause**: a stop flag checked at every step boundary; the current step
//!   always runs to completion
//! - **Step rate limit**: an optional steps-per-second cap, adjustable while
//!   running
//!
//! [`ContinuousRun`] runs the same loop on a dedicated driver thread so the
//! control thread stays free to read statistics and edit data between steps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ControlError;

/// Reason a continuous run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEndReason {
    /// The run was paused by the caller.
    Paused,
    /// The configured step bound was reached.
    MaxStepsReached,
    /// A step failed; the message describes the error.
    Failed(String),
}

/// Result of a continuous run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Why the run ended.
    pub end_reason: RunEndReason,
    /// Steps completed during the run.
    pub steps: u64,
    /// Timestep after the last completed step, if any.
    pub last_timestep: Option<u64>,
}

/// Called after every completed step of [`drive`].
pub trait StepObserver {
    /// `timestep` is the timestep reached by the step that just completed.
    fn on_step(&mut self, timestep: u64);
}

/// An observer that ignores every step.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl StepObserver for NoOpObserver {
    fn on_step(&mut self, _timestep: u64) {}
}

/// Run `step` until `stop` is set, `max_steps` steps completed (0 means
/// unbounded) or a step fails.
pub fn drive(
    step: &mut dyn FnMut() -> Result<u64, ControlError>,
    observer: &mut dyn StepObserver,
    max_steps: u64,
    stop: &AtomicBool,
    tps_restriction: &AtomicU32,
) -> RunOutcome {
    let mut steps: u64 = 0;
    let mut last_timestep = None;

    info!(
        max_steps,
        tps_restriction = tps_restriction.load(Ordering::Relaxed),
        "Continuous run starting"
    );

    loop {
        if stop.load(Ordering::Acquire) {
            return RunOutcome {
                end_reason: RunEndReason::Paused,
                steps,
                last_timestep,
            };
        }

        let started = Instant::now();
        match step() {
            Ok(timestep) => {
                steps = steps.saturating_add(1);
                last_timestep = Some(timestep);
                observer.on_step(timestep);
            }
            Err(err) => {
                warn!(error = %err, steps, "Step failed, stopping run");
                return RunOutcome {
                    end_reason: RunEndReason::Failed(err.to_string()),
                    steps,
                    last_timestep,
                };
            }
        }

        if max_steps > 0 && steps >= max_steps {
            info!(steps, max_steps, "Step limit reached");
            return RunOutcome {
                end_reason: RunEndReason::MaxStepsReached,
                steps,
                last_timestep,
            };
        }

        let tps = tps_restriction.load(Ordering::Relaxed);
        if let Some(period) = Duration::from_secs(1).checked_div(tps) {
            if let Some(remaining) = period.checked_sub(started.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
    }
}

/// A step loop running on its own driver thread.
#[derive(Debug)]
pub struct ContinuousRun {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<RunOutcome>>,
}

impl ContinuousRun {
    /// Spawn the driver thread.
    pub fn start<F>(
        mut step: F,
        max_steps: u64,
        tps_restriction: Arc<AtomicU32>,
    ) -> Result<Self, ControlError>
    where
        F: FnMut() -> Result<u64, ControlError> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("protocell-driver".to_owned())
            .spawn(move || drive(&mut step, &mut NoOpObserver, max_steps, &flag, &tps_restriction))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the driver is still stepping.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the driver to stop after the current step and wait for it.
    pub fn stop(mut self) -> RunOutcome {
        self.stop.store(true, Ordering::Release);
        self.join()
    }

    /// Wait for the driver to end on its own (step bound or failure).
    pub fn wait(mut self) -> RunOutcome {
        self.join()
    }

    fn join(&mut self) -> RunOutcome {
        let Some(handle) = self.handle.take() else {
            return RunOutcome {
                end_reason: RunEndReason::Paused,
                steps: 0,
                last_timestep: None,
            };
        };
        handle.join().unwrap_or_else(|_| RunOutcome {
            end_reason: RunEndReason::Failed("driver thread panicked".to_owned()),
            steps: 0,
            last_timestep: None,
        })
    }
}

impl Drop for ContinuousRun {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop.store(true, Ordering::Release);
            let _ = self.join();
        }
    }
}

/// Log the end of a continuous run.
pub fn log_run_end(outcome: &RunOutcome) {
    info!(
        reason = ?outcome.end_reason,
        steps = outcome.steps,
        last_timestep = outcome.last_timestep,
        "Continuous run ended"
    );
}
