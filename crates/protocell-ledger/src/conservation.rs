//! The energy balance check for one step.

use crate::ConservationViolation;

/// Default relative tolerance for floating-point summation error.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// Outcome of the balance check for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum ConservationResult {
    /// The change is fully explained by the recorded flows.
    Balanced,
    /// Energy appeared or vanished without a recorded flow.
    Violation(ConservationViolation),
}

impl ConservationResult {
    /// Whether the step balanced.
    pub const fn is_balanced(&self) -> bool {
        matches!(self, Self::Balanced)
    }
}

/// Check `actual` against `expected` within a tolerance relative to the
/// magnitude of the totals.
pub fn verify_balance(step: u64, expected: f64, actual: f64, tolerance: f64) -> ConservationResult {
    let difference = actual - expected;
    let scale = expected.abs().max(actual.abs()).max(1.0);
    if difference.is_finite() && difference.abs() <= tolerance * scale {
        ConservationResult::Balanced
    } else {
        ConservationResult::Violation(ConservationViolation {
            step,
            expected,
            actual,
            difference,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_noise_is_balanced() {
        let total: f64 = (0..1000).map(|_| 0.1).sum();
        assert!(verify_balance(1, 100.0, total, DEFAULT_TOLERANCE).is_balanced());
    }

    #[test]
    fn missing_energy_is_reported() {
        let result = verify_balance(4, 100.0, 99.0, DEFAULT_TOLERANCE);
        assert!(matches!(
            result,
            ConservationResult::Violation(ConservationViolation { step: 4, difference, .. })
                if (difference + 1.0).abs() < 1e-12
        ));
    }

    #[test]
    fn nan_never_balances() {
        assert!(!verify_balance(1, 1.0, f64::NAN, DEFAULT_TOLERANCE).is_balanced());
    }
}
