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

//! Starvation detection
//!
//! An actor starves when it keeps asking for a resource without being served
//! and the rest of the system completed work since the previous sample. The
//! wait counted is everything since its last grant, so an actor whose
//! requests keep timing out accumulates wait across retries (it is briefly
//! `Idle` between them). Its mean wait per completed operation counts too.
//! Actors already explained by a deadlock or a livelock in the same sample
//! are skipped.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use super::{HazardDetector, SampleAnalysis};
use crate::recorder::{Evidence, ViolationRecord};
use crate::snapshot::StateSample;
use crate::types::{ActorId, HazardKind};

#[derive(Debug)]
pub struct StarvationDetector {
    threshold: Duration,
    previous_completed: BTreeMap<ActorId, u64>,
    /// Starving actors already reported, with their completed count at the time
    reported: BTreeMap<ActorId, u64>,
}

impl StarvationDetector {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            previous_completed: BTreeMap::new(),
            reported: BTreeMap::new(),
        }
    }

    fn others_completed(completed: &BTreeMap<ActorId, u64>, actor: ActorId) -> u64 {
        completed.iter().filter(|(id, _)| **id != actor).map(|(_, count)| *count).sum()
    }
}

impl HazardDetector for StarvationDetector {
    fn name(&self) -> &'static str {
        "starvation"
    }

    fn inspect(&mut self, sample: &StateSample, analysis: &mut SampleAnalysis) -> Vec<ViolationRecord> {
        let completed: BTreeMap<ActorId, u64> = sample.actors.iter().map(|actor| (actor.id, actor.completed_ops)).collect();
        let mut records = Vec::new();

        for actor in &sample.actors {
            // A completed operation ends the episode.
            if self.reported.get(&actor.id).is_some_and(|at| *at != actor.completed_ops) {
                self.reported.remove(&actor.id);
            }
            if !actor.is_contending() || analysis.is_explained(actor.id) {
                continue;
            }

            let average_wait = actor.average_wait();
            let waited = actor.unserved_for(sample.at).max(average_wait.unwrap_or_default());
            if waited <= self.threshold {
                continue;
            }

            let others_now = Self::others_completed(&completed, actor.id);
            let others_before = Self::others_completed(&self.previous_completed, actor.id);
            if self.previous_completed.is_empty() || others_now <= others_before {
                continue;
            }

            if self.reported.contains_key(&actor.id) {
                continue;
            }
            self.reported.insert(actor.id, actor.completed_ops);
            debug!(actor = %actor.id, priority = %actor.priority, waited_ms = waited.as_millis() as u64, "starvation confirmed");
            records.push(ViolationRecord::new(
                HazardKind::Starvation,
                vec![actor.id],
                sample.at,
                Evidence::WaitExceeded {
                    priority: actor.priority,
                    waited_ms: waited.as_millis() as u64,
                    average_wait_ms: average_wait.map(|wait| wait.as_millis() as u64),
                    threshold_ms: self.threshold.as_millis() as u64,
                    others_completed: others_now - others_before,
                },
            ));
        }

        self.previous_completed = completed;
        records
    }
}
