//! Error types for scheduling and the control surface.

use protocell_genome::GenomeError;
use protocell_ledger::LedgerError;
use protocell_types::{CompartmentId, EntityId, InvalidParameter};
use protocell_world::WorldError;

/// Errors raised by the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A pool needs at least one worker.
    #[error("thread count must be at least 1")]
    NoThreads,

    /// The owner thread does not exist.
    #[error("thread {thread} out of range for a pool of {threads}")]
    InvalidThread {
        /// Requested owner.
        thread: usize,
        /// Pool size.
        threads: usize,
    },

    /// A compartment was registered twice.
    #[error("compartment {0} is already registered")]
    AlreadyRegistered(CompartmentId),

    /// Compartment ids must cover `0..count` without gaps.
    #[error("compartment {0} was never registered")]
    Unregistered(CompartmentId),

    /// Registration and resharding are only possible before launch.
    #[error("the worker pool is already running")]
    AlreadyLaunched,

    /// Steps can only run after launch.
    #[error("the worker pool has not been launched")]
    NotLaunched,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A worker thread stopped responding.
    #[error("worker thread {0} disconnected")]
    WorkerLost(usize),

    /// Every worker hung up before the step completed.
    #[error("worker pool disconnected during a step")]
    Disconnected,

    /// A compartment failed during a step.
    #[error("compartment {compartment} failed: {source}")]
    Compartment {
        /// The failing compartment.
        compartment: CompartmentId,
        /// What went wrong.
        source: WorldError,
    },
}

/// Errors returned by the simulation control surface.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The engine is in the middle of a step. Retry after the step
    /// completes.
    #[error("simulation is not at a step boundary; retry after the current step")]
    NotAtBoundary,

    /// The operation needs the simulation to be stopped.
    #[error("simulation is running; pause it first")]
    Running,

    /// No simulation has been created.
    #[error("no simulation loaded")]
    NoSimulation,

    /// A parameter is out of its domain.
    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] InvalidParameter),

    /// A bulk load contains the same id more than once.
    #[error("entity id {0} appears more than once")]
    DuplicateId(EntityId),

    /// A cell edit would break its bonds.
    #[error("cell {id} has {bonds} bonds, more than the requested maximum {max_bonds}")]
    BondLimit {
        /// The cell.
        id: EntityId,
        /// Current bonds.
        bonds: usize,
        /// Requested maximum.
        max_bonds: u8,
    },

    /// World construction or lookup failed.
    #[error(transparent)]
    World(#[from] WorldError),

    /// The worker pool failed.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Ledger bookkeeping failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The instruction table is unavailable.
    #[error(transparent)]
    Genome(#[from] GenomeError),

    /// The continuous-run driver thread could not be spawned.
    #[error("failed to spawn run driver: {source}")]
    Driver {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

impl ControlError {
    /// Whether retrying after the current step may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotAtBoundary)
    }
}
