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

//! Livelock detection
//!
//! A watched group is livelocked when every member has gone longer than the
//! threshold without progress, at least one member is actively retrying,
//! state keeps churning between samples, and the blocking is symmetric: each
//! member was last turned away by another member that was itself turned away
//! inside the group. Asymmetric neglect of a single actor is starvation and
//! is left to the next detector. An episode lasts until a member makes
//! progress or finishes.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::debug;

use super::{HazardDetector, SampleAnalysis};
use crate::actor::ActorSnapshot;
use crate::recorder::{Evidence, ViolationRecord};
use crate::snapshot::StateSample;
use crate::types::{ActorId, ActorState, HazardKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Activity {
    state_changes: u64,
    retries: u64,
}

impl From<&ActorSnapshot> for Activity {
    fn from(actor: &ActorSnapshot) -> Self {
        Self {
            state_changes: actor.state_changes,
            retries: actor.retries,
        }
    }
}

/// Flags groups that keep changing state without making progress
#[derive(Debug)]
pub struct LivelockDetector {
    threshold: Duration,
    groups: Vec<BTreeSet<ActorId>>,
    previous: BTreeMap<ActorId, Activity>,
    active: BTreeSet<BTreeSet<ActorId>>,
}

impl LivelockDetector {
    /// `groups` empty means all unfinished actors form one group
    pub fn new(threshold: Duration, groups: Vec<Vec<ActorId>>) -> Self {
        Self {
            threshold,
            groups: groups.into_iter().map(|group| group.into_iter().collect()).collect(),
            previous: BTreeMap::new(),
            active: BTreeSet::new(),
        }
    }

    fn watched_groups(&self, sample: &StateSample) -> Vec<BTreeSet<ActorId>> {
        if self.groups.is_empty() {
            let unfinished: BTreeSet<ActorId> = sample
                .actors
                .iter()
                .filter(|actor| actor.state != ActorState::Finished)
                .map(|actor| actor.id)
                .collect();
            vec![unfinished]
        } else {
            self.groups.clone()
        }
    }

    fn is_livelocked(&self, sample: &StateSample, analysis: &SampleAnalysis, members: &[&ActorSnapshot], group: &BTreeSet<ActorId>) -> bool {
        if members.len() < 2 || members.len() != group.len() {
            return false;
        }
        if members.iter().any(|actor| actor.state == ActorState::Finished || analysis.deadlocked.contains(&actor.id)) {
            return false;
        }
        if !members.iter().all(|actor| actor.stalled_for(sample.at) > self.threshold) {
            return false;
        }
        if !members.iter().any(|actor| actor.state.is_active()) {
            return false;
        }
        let churning = members
            .iter()
            .any(|actor| self.previous.get(&actor.id).is_some_and(|before| *before != Activity::from(*actor)));
        if !churning {
            return false;
        }
        members.iter().all(|actor| {
            actor
                .blocked_by
                .filter(|blocker| group.contains(&blocker.holder) && blocker.holder != actor.id)
                .and_then(|blocker| sample.actor(blocker.holder))
                .and_then(|holder| holder.blocked_by)
                .is_some_and(|next| group.contains(&next.holder))
        })
    }
}

impl HazardDetector for LivelockDetector {
    fn name(&self) -> &'static str {
        "livelock"
    }

    fn inspect(&mut self, sample: &StateSample, analysis: &mut SampleAnalysis) -> Vec<ViolationRecord> {
        let mut records = Vec::new();
        let mut still_active = BTreeSet::new();

        for group in self.watched_groups(sample) {
            let members: Vec<&ActorSnapshot> = group.iter().filter_map(|id| sample.actor(*id)).collect();
            if !self.is_livelocked(sample, analysis, &members, &group) {
                continue;
            }
            analysis.livelocked.extend(group.iter().copied());
            still_active.insert(group.clone());
            if self.active.contains(&group) {
                continue;
            }

            let stalled = members.iter().map(|actor| actor.stalled_for(sample.at)).min().unwrap_or_default();
            let blockers = members
                .iter()
                .filter_map(|actor| actor.blocked_by.map(|blocker| (actor.id, blocker.holder)))
                .collect();
            debug!(group = ?group, stalled_ms = stalled.as_millis() as u64, "livelock confirmed");
            records.push(ViolationRecord::new(
                HazardKind::Livelock,
                group.iter().copied().collect(),
                sample.at,
                Evidence::NoProgress {
                    stalled_ms: stalled.as_millis() as u64,
                    retries: members.iter().map(|actor| actor.retries).sum(),
                    blockers,
                },
            ));
        }

        // A sample that misses the pattern does not end the episode; progress does.
        for group in &self.active {
            let stalled = group.iter().all(|id| {
                sample
                    .actor(*id)
                    .is_some_and(|actor| actor.state != ActorState::Finished && actor.stalled_for(sample.at) > self.threshold)
            });
            if stalled {
                still_active.insert(group.clone());
            }
        }

        self.active = still_active;
        self.previous = sample.actors.iter().map(|actor| (actor.id, Activity::from(actor))).collect();
        records
    }
}
