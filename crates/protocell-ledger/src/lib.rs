//! Energy bookkeeping and statistics for the Protocell simulation.
//!
//! Energy lives in particles, cells and tokens. Inside a step it only moves
//! between them; it enters the world through radiation sources and external
//! inserts and leaves it through external removal. After every completed
//! step the ledger compares the new total against the previous one:
//!
//! ```text
//! total(N) == total(N-1) + injected(N) + added(N) - removed(N)
//! ```
//!
//! A mismatch is a [`ConservationViolation`]. It is reported and logged,
//! never raised as an error: it signals a bug for the test suite to catch,
//! not a runtime fault.
//!
//! # Modules
//!
//! - [`ledger`] -- The [`EnergyLedger`] with per-compartment and global totals.
//! - [`conservation`] -- The balance check itself.
//! - [`statistics`] -- The [`StatisticsCollector`] producing monitor snapshots.

pub mod conservation;
pub mod ledger;
pub mod statistics;

pub use conservation::ConservationResult;
pub use ledger::{EnergyLedger, StepBalance};
pub use statistics::StatisticsCollector;

use serde::{Deserialize, Serialize};

/// Errors that can occur when recording ledger flows.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Flow amounts must be finite and non-negative.
    #[error("invalid energy flow {amount}: must be finite and non-negative")]
    InvalidFlow {
        /// The rejected amount.
        amount: f64,
    },

    /// The per-compartment totals do not match the ledger's layout.
    #[error("expected {expected} compartment totals, got {actual}")]
    LayoutMismatch {
        /// Compartments the ledger tracks.
        expected: usize,
        /// Totals supplied.
        actual: usize,
    },
}

/// Unexplained change of the world's energy across one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConservationViolation {
    /// Step that produced the imbalance.
    pub step: u64,
    /// Total the flows account for.
    pub expected: f64,
    /// Total actually found.
    pub actual: f64,
    /// `actual - expected`.
    pub difference: f64,
}

impl core::fmt::Display for ConservationViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "energy not conserved at step {}: expected {:.6}, found {:.6} (difference {:+.6})",
            self.step, self.expected, self.actual, self.difference
        )
    }
}
