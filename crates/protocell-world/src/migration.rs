//! Migration records and the mailboxes that carry them between phases.
//!
//! A compartment never writes to a neighbour. During the local phase it
//! stages departing entities in per-direction outbound queues; after the
//! barrier they are posted into [`Mailboxes`], one slot per
//! `(receiver, direction of travel)`. Every slot has exactly one writer
//! (the neighbour on the reciprocal side) and one reader (the receiver), and
//! the barrier separates writes from reads.

use std::sync::{Mutex, PoisonError};

use protocell_types::{CompartmentId, Entity};

use crate::graph::Direction;

/// An entity in transit to an adjacent compartment.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    /// The entity with its post-step state.
    pub entity: Entity,
    /// Sending compartment.
    pub from: CompartmentId,
    /// Receiving compartment.
    pub to: CompartmentId,
    /// Direction of travel.
    pub direction: Direction,
    /// Whether the position was clamped to keep the hop single.
    pub overflow: bool,
}

/// Single-writer inbound slots for every compartment and direction.
#[derive(Debug, Default)]
pub struct Mailboxes {
    slots: Vec<Mutex<Vec<MigrationRecord>>>,
}

impl Mailboxes {
    /// Create empty mailboxes for `compartments` receivers.
    pub fn new(compartments: usize) -> Self {
        let count = compartments.saturating_mul(Direction::ALL.len());
        Self {
            slots: (0..count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn slot(&self, to: CompartmentId, direction: Direction) -> Option<&Mutex<Vec<MigrationRecord>>> {
        let index = to
            .0
            .checked_mul(Direction::ALL.len())?
            .checked_add(direction.index())?;
        self.slots.get(index)
    }

    /// Deliver records travelling in `direction` to `to`.
    ///
    /// Returns the records that could not be delivered because `to` is not a
    /// known receiver.
    pub fn post(
        &self,
        to: CompartmentId,
        direction: Direction,
        records: Vec<MigrationRecord>,
    ) -> Vec<MigrationRecord> {
        if records.is_empty() {
            return records;
        }
        match self.slot(to, direction) {
            Some(slot) => {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(records);
                Vec::new()
            }
            None => records,
        }
    }

    /// Take everything delivered to `to`, in [`Direction::ALL`] order.
    pub fn drain(&self, to: CompartmentId) -> Vec<MigrationRecord> {
        let mut inbound = Vec::new();
        for direction in Direction::ALL {
            if let Some(slot) = self.slot(to, direction) {
                inbound.append(&mut slot.lock().unwrap_or_else(PoisonError::into_inner));
            }
        }
        inbound
    }

    /// Whether no record is waiting anywhere.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocell_types::{EntityId, Particle, Vec2};

    fn record(id: u64, to: usize, direction: Direction) -> MigrationRecord {
        MigrationRecord {
            entity: Entity::Particle(Particle {
                id: EntityId(id),
                pos: Vec2::ZERO,
                vel: Vec2::ZERO,
                energy: 1.0,
            }),
            from: CompartmentId(0),
            to: CompartmentId(to),
            direction,
            overflow: false,
        }
    }

    #[test]
    fn drain_follows_direction_order() {
        let mailboxes = Mailboxes::new(2);
        let rest = mailboxes.post(CompartmentId(1), Direction::Lower, vec![record(1, 1, Direction::Lower)]);
        assert!(rest.is_empty());
        let _ = mailboxes.post(CompartmentId(1), Direction::Upper, vec![record(2, 1, Direction::Upper)]);
        let ids: Vec<_> = mailboxes.drain(CompartmentId(1)).iter().map(|r| r.entity.id()).collect();
        assert_eq!(ids, vec![EntityId(2), EntityId(1)]);
        assert!(mailboxes.is_empty());
    }

    #[test]
    fn unknown_receiver_returns_records() {
        let mailboxes = Mailboxes::new(1);
        let rest = mailboxes.post(CompartmentId(7), Direction::Left, vec![record(3, 7, Direction::Left)]);
        assert_eq!(rest.len(), 1);
    }
}
