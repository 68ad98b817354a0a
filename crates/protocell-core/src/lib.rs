//! Step scheduling and the control surface of the Protocell simulation.
//!
//! This crate turns the per-compartment simulation of `protocell-world` into
//! a running system: a fixed worker pool drives every compartment through
//! the two-phase step protocol, and [`SimulationController`] exposes the
//! operations external collaborators (front-ends, persistence, monitoring)
//! use between steps.
//!
//! # Modules
//!
//! - [`scheduler`] -- Worker pool, barrier-separated phases, compartment ownership
//! - [`controller`] -- Lifecycle, bulk data, parameter and statistics exchange
//! - [`runner`] -- Continuous run mode with step bounds and a rate limit
//! - [`config`] -- YAML configuration of a headless run
//! - [`parser`] -- Stable `(timestep, settings)` encoding
//! - [`error`] -- Scheduler and control errors

pub mod config;
pub mod controller;
pub mod error;
pub mod parser;
pub mod runner;
pub mod scheduler;

pub use config::{ConfigError, EngineConfig, RunConfig};
pub use controller::SimulationController;
pub use error::{ControlError, SchedulerError};
pub use parser::{FORMAT_VERSION, ParseError, decode, encode};
pub use runner::{ContinuousRun, NoOpObserver, RunEndReason, RunOutcome, StepObserver, drive, log_run_end};
pub use scheduler::{StepInput, ThreadScheduler, block_owner};
