//! The energy ledger: per-compartment and global totals across steps.
//!
//! The ledger never sees individual entities. Callers hand it the energy
//! total of every compartment after each step, plus the flows that are
//! allowed to change the global total: radiation injection and external
//! inserts and removals.

use tracing::warn;

use crate::LedgerError;
use crate::conservation::{ConservationResult, DEFAULT_TOLERANCE, verify_balance};

/// Energy balance of one completed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepBalance {
    /// Step number.
    pub step: u64,
    /// Global total after the step.
    pub total: f64,
    /// Change since the previous balance.
    pub delta: f64,
    /// Energy injected by radiation during the step.
    pub injected: f64,
    /// Energy added by external inserts since the previous balance.
    pub added: f64,
    /// Energy removed externally since the previous balance.
    pub removed: f64,
}

/// Tracks energy totals and explains every change between steps.
#[derive(Debug, Clone)]
pub struct EnergyLedger {
    tolerance: f64,
    per_compartment: Vec<f64>,
    total: f64,
    added: f64,
    removed: f64,
    last: Option<StepBalance>,
    violations: u64,
}

impl Default for EnergyLedger {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl EnergyLedger {
    /// Create an empty ledger with a relative tolerance.
    pub const fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            per_compartment: Vec::new(),
            total: 0.0,
            added: 0.0,
            removed: 0.0,
            last: None,
            violations: 0,
        }
    }

    /// Start counting from the given totals without checking them, e.g.
    /// after a bulk load or a reshard. Pending external flows are dropped.
    pub fn rebase(&mut self, per_compartment: Vec<f64>) {
        self.total = per_compartment.iter().sum();
        self.per_compartment = per_compartment;
        self.added = 0.0;
        self.removed = 0.0;
    }

    /// Record energy inserted from outside the simulation.
    pub fn record_external_add(&mut self, amount: f64) -> Result<(), LedgerError> {
        check_flow(amount)?;
        self.added += amount;
        Ok(())
    }

    /// Record energy removed from outside the simulation.
    pub fn record_external_remove(&mut self, amount: f64) -> Result<(), LedgerError> {
        check_flow(amount)?;
        self.removed += amount;
        Ok(())
    }

    /// Close a step: check the new per-compartment totals against the
    /// previous total and the recorded flows.
    ///
    /// A violation is logged and returned, never raised.
    pub fn close_step(
        &mut self,
        step: u64,
        per_compartment: Vec<f64>,
        injected: f64,
    ) -> Result<ConservationResult, LedgerError> {
        if !self.per_compartment.is_empty() && per_compartment.len() != self.per_compartment.len() {
            return Err(LedgerError::LayoutMismatch {
                expected: self.per_compartment.len(),
                actual: per_compartment.len(),
            });
        }
        check_flow(injected)?;
        let actual: f64 = per_compartment.iter().sum();
        let expected = self.total + injected + self.added - self.removed;
        let result = verify_balance(step, expected, actual, self.tolerance);
        if let ConservationResult::Violation(violation) = &result {
            self.violations = self.violations.saturating_add(1);
            warn!(
                step,
                expected = violation.expected,
                actual = violation.actual,
                difference = violation.difference,
                "Energy conservation violated"
            );
        }
        self.last = Some(StepBalance {
            step,
            total: actual,
            delta: actual - self.total,
            injected,
            added: self.added,
            removed: self.removed,
        });
        self.total = actual;
        self.per_compartment = per_compartment;
        self.added = 0.0;
        self.removed = 0.0;
        Ok(result)
    }

    /// Global total after the last balance.
    pub const fn total(&self) -> f64 {
        self.total
    }

    /// Per-compartment totals after the last balance.
    pub fn per_compartment(&self) -> &[f64] {
        &self.per_compartment
    }

    /// The last closed step, if any.
    pub const fn last_balance(&self) -> Option<&StepBalance> {
        self.last.as_ref()
    }

    /// Change of the global total over the last closed step.
    pub fn last_delta(&self) -> f64 {
        self.last.as_ref().map_or(0.0, |b| b.delta)
    }

    /// Violations seen since the ledger was created.
    pub const fn violations(&self) -> u64 {
        self.violations
    }
}

fn check_flow(amount: f64) -> Result<(), LedgerError> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(())
    } else {
        Err(LedgerError::InvalidFlow { amount })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn internal_moves_balance() {
        let mut ledger = EnergyLedger::default();
        ledger.rebase(vec![10.0, 5.0]);
        let result = ledger.close_step(1, vec![7.0, 8.0], 0.0).unwrap();
        assert!(result.is_balanced());
        assert!(ledger.last_delta().abs() < 1e-12);
        assert_eq!(ledger.per_compartment(), &[7.0, 8.0]);
    }

    #[test]
    fn injection_and_external_flows_are_explained() {
        let mut ledger = EnergyLedger::default();
        ledger.rebase(vec![10.0]);
        ledger.record_external_add(4.0).unwrap();
        ledger.record_external_remove(1.0).unwrap();
        let result = ledger.close_step(1, vec![15.0], 2.0).unwrap();
        assert!(result.is_balanced());
        let balance = ledger.last_balance().unwrap();
        assert!((balance.delta - 5.0).abs() < 1e-12);
        assert!((balance.added - 4.0).abs() < 1e-12);
    }

    #[test]
    fn unexplained_loss_is_a_violation_not_an_error() {
        let mut ledger = EnergyLedger::default();
        ledger.rebase(vec![10.0]);
        let result = ledger.close_step(3, vec![9.0], 0.0).unwrap();
        assert!(matches!(result, ConservationResult::Violation(v) if v.step == 3));
        assert_eq!(ledger.violations(), 1);
        // The next step is measured from the new total.
        assert!(ledger.close_step(4, vec![9.0], 0.0).unwrap().is_balanced());
    }

    #[test]
    fn negative_flow_rejected() {
        let mut ledger = EnergyLedger::default();
        assert!(matches!(
            ledger.record_external_add(-1.0),
            Err(LedgerError::InvalidFlow { .. })
        ));
    }

    #[test]
    fn layout_change_requires_rebase() {
        let mut ledger = EnergyLedger::default();
        ledger.rebase(vec![1.0, 1.0]);
        assert!(matches!(
            ledger.close_step(1, vec![2.0], 0.0),
            Err(LedgerError::LayoutMismatch { expected: 2, actual: 1 })
        ));
    }
}
