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

// Read-only views of the simulation state

use serde::{Deserialize, Serialize};

use crate::actor::ActorSnapshot;
use crate::clock::Timestamp;
use crate::resource::ResourceSnapshot;
use crate::types::{ActorId, ActorState, ResourceId};

/// Consistent copy of every actor and resource taken under one lock acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSample {
    pub at: Timestamp,
    pub actors: Vec<ActorSnapshot>,
    pub resources: Vec<ResourceSnapshot>,
}

impl StateSample {
    pub fn actor(&self, id: ActorId) -> Option<&ActorSnapshot> {
        self.actors.iter().find(|actor| actor.id == id)
    }

    pub fn resource(&self, id: ResourceId) -> Option<&ResourceSnapshot> {
        self.resources.iter().find(|resource| resource.id == id)
    }

    pub fn owner_of(&self, id: ResourceId) -> Option<ActorId> {
        self.resource(id).and_then(|resource| resource.owner)
    }

    /// Sum of completed operations across all actors
    pub fn completed_total(&self) -> u64 {
        self.actors.iter().map(|actor| actor.completed_ops).sum()
    }

    pub fn all_finished(&self) -> bool {
        self.actors.iter().all(|actor| actor.state == ActorState::Finished)
    }
}
