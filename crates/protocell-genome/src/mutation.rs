//! Mutation engine: probabilistic alteration of token memory and cell bonds.
//!
//! All randomness comes from the caller's seeded generator, so replaying a run
//! with the same seed and the same external inputs reproduces the same
//! sequence of mutations. Memory mutations never change the memory length.
//!
//! Two triggers exist:
//!
//! - **Execution**: after a token executes, every mutation type with a
//!   non-zero rate is rolled once, in [`MutationType::ALL`] order.
//! - **Radiation**: a token inside a radiation source receives an extra point
//!   mutation with the source's probability.

use rand::Rng;

use protocell_types::{Cell, MutationRates, MutationType, Token};

use crate::interpreter::StructuralRequest;

/// Upper bound for segment lengths in duplication and translocation.
const MAX_SEGMENT: usize = 8;

/// Mutations applied during one trigger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOutcome {
    /// Memory mutations that changed the token, in application order.
    pub applied: Vec<MutationType>,
    /// Bond changes to apply with the other structural requests.
    pub requests: Vec<StructuralRequest>,
}

/// Applies configured mutation rates using a caller-provided generator.
#[derive(Debug, Clone, Copy)]
pub struct MutationEngine<'a> {
    rates: &'a MutationRates,
}

impl<'a> MutationEngine<'a> {
    /// Create an engine for the given rates.
    pub const fn new(rates: &'a MutationRates) -> Self {
        Self { rates }
    }

    /// Roll every mutation type once for a token that just executed on `cell`.
    pub fn on_token_executed<R: Rng + ?Sized>(
        &self,
        token: &mut Token,
        cell: &Cell,
        rng: &mut R,
    ) -> MutationOutcome {
        let mut outcome = MutationOutcome::default();
        for mutation in MutationType::ALL {
            let rate = self.rates.rate(mutation);
            if rate <= 0.0 || rng.random::<f64>() >= rate {
                continue;
            }
            if mutation == MutationType::BondRewire {
                outcome.requests.extend(rewire_bond(cell, rng));
            } else if mutate_memory(&mut token.memory, mutation, rng) {
                outcome.applied.push(mutation);
            }
        }
        outcome
    }

    /// Radiation trigger: a point mutation with probability `probability`.
    pub fn radiate<R: Rng + ?Sized>(token: &mut Token, probability: f64, rng: &mut R) -> bool {
        probability > 0.0
            && rng.random::<f64>() < probability
            && mutate_memory(&mut token.memory, MutationType::PointMutation, rng)
    }
}

/// Apply one memory mutation in place. Returns whether memory was touched.
///
/// `BondRewire` is not a memory mutation and returns `false`.
pub fn mutate_memory<R: Rng + ?Sized>(
    memory: &mut [u8],
    mutation: MutationType,
    rng: &mut R,
) -> bool {
    let len = memory.len();
    if len == 0 {
        return false;
    }
    match mutation {
        MutationType::PointMutation => {
            let index = rng.random_range(0..len);
            let flip: u8 = rng.random_range(1..=u8::MAX);
            if let Some(byte) = memory.get_mut(index) {
                *byte ^= flip;
            }
            true
        }
        MutationType::Deletion => {
            let index = rng.random_range(0..len);
            if let Some(tail) = memory.get_mut(index..) {
                tail.rotate_left(1);
            }
            if let Some(last) = memory.last_mut() {
                *last = 0;
            }
            true
        }
        MutationType::Insertion => {
            let index = rng.random_range(0..len);
            let value: u8 = rng.random();
            if let Some(tail) = memory.get_mut(index..) {
                tail.rotate_right(1);
            }
            if let Some(byte) = memory.get_mut(index) {
                *byte = value;
            }
            true
        }
        MutationType::Duplication => {
            let segment = rng.random_range(1..=MAX_SEGMENT.min(len));
            let last_start = len.saturating_sub(segment);
            let src = rng.random_range(0..=last_start);
            let dst = rng.random_range(0..=last_start);
            memory.copy_within(src..src.saturating_add(segment), dst);
            true
        }
        MutationType::Translocation => {
            let half = len / 2;
            if half == 0 {
                return false;
            }
            let segment = rng.random_range(1..=MAX_SEGMENT.min(half));
            let first = rng.random_range(0..=len.saturating_sub(segment.saturating_mul(2)));
            let second_min = first.saturating_add(segment);
            let second = rng.random_range(second_min..=len.saturating_sub(segment));
            let (head, tail) = memory.split_at_mut(second);
            match (
                head.get_mut(first..first.saturating_add(segment)),
                tail.get_mut(..segment),
            ) {
                (Some(a), Some(b)) => {
                    a.swap_with_slice(b);
                    true
                }
                _ => false,
            }
        }
        MutationType::BondRewire => false,
    }
}

/// Pick a bond change for `cell`: remove a random bond or request a new one.
pub fn rewire_bond<R: Rng + ?Sized>(cell: &Cell, rng: &mut R) -> Option<StructuralRequest> {
    let remove = !cell.bonds.is_empty() && (!cell.has_free_bond_slot() || rng.random::<bool>());
    if remove {
        let index = rng.random_range(0..cell.bonds.len());
        let other = *cell.bonds.get(index)?;
        Some(StructuralRequest::RemoveBond {
            cell: cell.id,
            other,
        })
    } else if cell.has_free_bond_slot() {
        Some(StructuralRequest::CreateBond { cell: cell.id })
    } else {
        None
    }
}
