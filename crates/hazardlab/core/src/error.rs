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

//! Error taxonomy for the contention engine.
//!
//! Actor-level failures (`TimedOut`, `DeadlockVictim`, `InjectedFault`) are
//! recovered by the actor's retry loop. `QueueInvariantViolation` means the
//! engine itself is broken and halts the run, as does `ActorPanicked`.

use std::time::Duration;

use crate::types::{ActorId, CellId, ResourceId};

/// Error types produced by the simulation core
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HazardError {
    #[error("actor {actor} timed out after {waited:?} waiting for resource {resource}")]
    TimedOut { actor: ActorId, resource: ResourceId, waited: Duration },

    #[error("actor {actor} released resource {resource} it does not own (owner: {owner:?})")]
    NotOwner { actor: ActorId, resource: ResourceId, owner: Option<ActorId> },

    #[error("queue invariant violated on resource {resource}: {detail}")]
    QueueInvariantViolation { resource: ResourceId, detail: String },

    #[error("cannot victimize actor {actor}: {detail}")]
    VictimizationFailure { actor: ActorId, detail: String },

    #[error("actor {actor} was chosen as deadlock victim while waiting for resource {resource}")]
    DeadlockVictim { actor: ActorId, resource: ResourceId },

    #[error("simulation is shutting down")]
    Cancelled,

    #[error("actor {actor} thread panicked: {message}")]
    ActorPanicked { actor: ActorId, message: String },

    #[error("injected fault during processing delay of actor {actor}")]
    InjectedFault { actor: ActorId },

    #[error("unknown actor {0}")]
    UnknownActor(ActorId),

    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),

    #[error("unknown state cell {0}")]
    UnknownCell(CellId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("scenario error: {0}")]
    Scenario(String),
}

impl HazardError {
    /// Whether the actor's retry loop may absorb this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TimedOut { .. } | Self::DeadlockVictim { .. } | Self::InjectedFault { .. } | Self::VictimizationFailure { .. }
        )
    }

    /// Whether this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::QueueInvariantViolation { .. } | Self::ActorPanicked { .. })
    }
}

impl From<serde_json::Error> for HazardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Scenario(err.to_string())
    }
}

/// Result type for simulation operations
pub type HazardResult<T> = std::result::Result<T, HazardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timed_out = HazardError::TimedOut {
            actor: ActorId(1),
            resource: ResourceId(2),
            waited: Duration::from_millis(5),
        };
        assert!(timed_out.is_recoverable());
        assert!(!timed_out.is_fatal());

        let not_owner = HazardError::NotOwner {
            actor: ActorId(1),
            resource: ResourceId(2),
            owner: None,
        };
        assert!(!not_owner.is_recoverable());
        assert!(!not_owner.is_fatal());

        let broken = HazardError::QueueInvariantViolation {
            resource: ResourceId(2),
            detail: "granted request still queued".to_string(),
        };
        assert!(broken.is_fatal());
        assert!(!broken.is_recoverable());

        let panicked = HazardError::ActorPanicked {
            actor: ActorId(1),
            message: "boom".to_string(),
        };
        assert!(panicked.is_fatal());
        assert!(!panicked.is_recoverable());
        assert!(!HazardError::Cancelled.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = HazardError::NotOwner {
            actor: ActorId(3),
            resource: ResourceId(7),
            owner: Some(ActorId(4)),
        };
        let message = err.to_string();
        assert!(message.contains("A3"));
        assert!(message.contains("R7"));
    }
}
