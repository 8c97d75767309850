// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Order violation tracking
//!
//! Operations register at request time, receiving an intended sequence and
//! optionally naming a predecessor. On completion the tracker compares the
//! completion against what was declared. An inversion is attributed to the
//! operation that completes late: completing sequence 2 after sequence 3
//! blames 2, so `[1, 3, 2]` yields exactly one violation.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::SimulationClock;
use crate::error::{HazardError, HazardResult};
use crate::recorder::{Evidence, ViolationRecord, ViolationRecorder};
use crate::types::{ActorId, HazardKind};

/// Registration handle returned at request time
#[derive(Debug, PartialEq, Eq)]
pub struct OrderTicket {
    pub operation: u64,
    pub intended: u64,
    pub predecessor: Option<u64>,
    pub actor: ActorId,
}

#[derive(Debug, Clone, Copy)]
struct Completion {
    actor: ActorId,
    position: u64,
}

#[derive(Debug, Default)]
struct OrderState {
    next_operation: u64,
    next_sequence: u64,
    registered: BTreeMap<u64, u64>,
    completed: BTreeMap<u64, Completion>,
    completed_operations: BTreeMap<u64, Completion>,
}

/// Records intended versus actual completion order
pub struct OrderTracker {
    clock: SimulationClock,
    recorder: Arc<ViolationRecorder>,
    state: Mutex<OrderState>,
}

impl OrderTracker {
    pub fn new(clock: SimulationClock, recorder: Arc<ViolationRecorder>) -> Self {
        Self {
            clock,
            recorder,
            state: Mutex::new(OrderState::default()),
        }
    }

    /// Register the next operation in request order
    pub fn register(&self, actor: ActorId, predecessor: Option<u64>) -> OrderTicket {
        let mut state = self.state.lock();
        state.next_operation += 1;
        state.next_sequence += 1;
        let ticket = OrderTicket {
            operation: state.next_operation,
            intended: state.next_sequence,
            predecessor,
            actor,
        };
        state.registered.insert(ticket.intended, ticket.operation);
        ticket
    }

    /// Register an operation with an explicit intended sequence
    pub fn register_at(&self, actor: ActorId, intended: u64, predecessor: Option<u64>) -> HazardResult<OrderTicket> {
        let mut state = self.state.lock();
        if state.registered.contains_key(&intended) {
            return Err(HazardError::Scenario(format!("sequence {intended} is already registered")));
        }
        state.next_operation += 1;
        state.next_sequence = state.next_sequence.max(intended);
        let ticket = OrderTicket {
            operation: state.next_operation,
            intended,
            predecessor,
            actor,
        };
        state.registered.insert(intended, ticket.operation);
        Ok(ticket)
    }

    /// Mark the ticket's operation complete, recording a violation if it
    /// finished after a later-sequenced operation or before its predecessor
    pub fn complete(&self, ticket: OrderTicket) -> Option<ViolationRecord> {
        let record = {
            let mut state = self.state.lock();
            let position = state.completed.len() as u64 + 1;
            let completion = Completion { actor: ticket.actor, position };

            let overtaken: Vec<(u64, Completion)> = state
                .completed
                .range(ticket.intended + 1..)
                .map(|(sequence, completion)| (*sequence, *completion))
                .collect();
            state.completed.insert(ticket.intended, completion);
            state.completed_operations.insert(ticket.operation, completion);
            debug!(operation = ticket.operation, intended = ticket.intended, position, "operation completed");

            let at = self.clock.now();
            if !overtaken.is_empty() {
                let mut involved = vec![ticket.actor];
                involved.extend(overtaken.iter().map(|(_, completion)| completion.actor));
                Some(ViolationRecord::new(
                    HazardKind::OrderViolation,
                    involved,
                    at,
                    Evidence::SequenceInversion {
                        operation: ticket.operation,
                        intended: ticket.intended,
                        actual_position: position,
                        overtaken_by: overtaken.iter().map(|(sequence, _)| *sequence).collect(),
                    },
                ))
            } else {
                match ticket.predecessor {
                    Some(predecessor) if !state.completed_operations.contains_key(&predecessor) => Some(ViolationRecord::new(
                        HazardKind::OrderViolation,
                        vec![ticket.actor],
                        at,
                        Evidence::MissingPredecessor {
                            operation: ticket.operation,
                            predecessor,
                        },
                    )),
                    _ => None,
                }
            }
        };
        if let Some(record) = &record {
            self.recorder.append(record.clone());
        }
        record
    }

    /// Completion position of every finished sequence, in intended order
    pub fn completion_order(&self) -> Vec<(u64, u64)> {
        self.state
            .lock()
            .completed
            .iter()
            .map(|(sequence, completion)| (*sequence, completion.position))
            .collect()
    }
}

impl std::fmt::Debug for OrderTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OrderTracker")
            .field("registered", &state.registered.len())
            .field("completed", &state.completed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> OrderTracker {
        OrderTracker::new(SimulationClock::start(), Arc::new(ViolationRecorder::new()))
    }

    #[test]
    fn test_in_order_completion_is_clean() {
        let tracker = tracker();
        let tickets: Vec<_> = (0..3).map(|i| tracker.register(ActorId(i), None)).collect();
        for ticket in tickets {
            assert!(tracker.complete(ticket).is_none());
        }
        assert_eq!(tracker.completion_order(), vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn test_inversion_blames_late_operation() {
        let tracker = tracker();
        let one = tracker.register(ActorId(1), None);
        let two = tracker.register(ActorId(2), None);
        let three = tracker.register(ActorId(3), None);

        assert!(tracker.complete(one).is_none());
        assert!(tracker.complete(three).is_none());
        let record = tracker.complete(two).unwrap();

        assert_eq!(record.kind, HazardKind::OrderViolation);
        assert_eq!(record.involved_actors, vec![ActorId(2), ActorId(3)]);
        assert_eq!(
            record.evidence,
            Evidence::SequenceInversion {
                operation: 2,
                intended: 2,
                actual_position: 3,
                overtaken_by: vec![3],
            }
        );
    }

    #[test]
    fn test_missing_predecessor() {
        let tracker = tracker();
        let fetch = tracker.register(ActorId(1), None);
        let process = tracker.register_at(ActorId(2), 10, Some(fetch.operation)).unwrap();

        let record = tracker.complete(process).unwrap();
        assert_eq!(record.evidence, Evidence::MissingPredecessor { operation: 2, predecessor: 1 });
        assert_eq!(record.involved_actors, vec![ActorId(2)]);
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let tracker = tracker();
        tracker.register_at(ActorId(1), 4, None).unwrap();
        assert!(matches!(tracker.register_at(ActorId(2), 4, None), Err(HazardError::Scenario(_))));
    }
}
