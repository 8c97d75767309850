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

//! Deadlock detection and resolution
//!
//! A wait-for cycle is only a candidate when first seen; it becomes a
//! confirmed deadlock once it has been present in at least two consecutive
//! samples spanning the recheck window. Each episode is reported once and
//! forgotten as soon as the cycle disappears.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::debug;

use super::{HazardDetector, Resolution, SampleAnalysis, WaitCycle};
use crate::clock::Timestamp;
use crate::config::VictimPolicy;
use crate::recorder::{Evidence, ViolationRecord};
use crate::snapshot::StateSample;
use crate::types::{ActorId, HazardKind};

#[derive(Debug, Clone, Copy)]
struct Sighting {
    first_seen: Timestamp,
    samples: u64,
    reported: bool,
}

/// Confirms persistent wait-for cycles and optionally picks victims
#[derive(Debug)]
pub struct DeadlockDetector {
    recheck_window: Duration,
    resolve: bool,
    victim_policy: VictimPolicy,
    sightings: BTreeMap<BTreeSet<ActorId>, Sighting>,
}

impl DeadlockDetector {
    pub fn new(recheck_window: Duration, resolve: bool, victim_policy: VictimPolicy) -> Self {
        Self {
            recheck_window,
            resolve,
            victim_policy,
            sightings: BTreeMap::new(),
        }
    }

    /// Pick the cycle member to sacrifice; ties go to the highest actor id
    pub fn choose_victim(&self, cycle: &WaitCycle, sample: &StateSample) -> Option<ActorId> {
        let members = cycle.actors.iter().filter_map(|id| sample.actor(*id));
        match self.victim_policy {
            VictimPolicy::LowestPriority => members.min_by_key(|actor| (actor.priority, Reverse(actor.id))).map(|actor| actor.id),
            VictimPolicy::MostRecentlyBlocked => members.max_by_key(|actor| (actor.wait_started_at, actor.id)).map(|actor| actor.id),
        }
    }
}

impl HazardDetector for DeadlockDetector {
    fn name(&self) -> &'static str {
        "deadlock"
    }

    fn inspect(&mut self, sample: &StateSample, analysis: &mut SampleAnalysis) -> Vec<ViolationRecord> {
        let current: BTreeSet<BTreeSet<ActorId>> = analysis.cycles.iter().map(WaitCycle::key).collect();
        self.sightings.retain(|key, _| current.contains(key));

        let mut records = Vec::new();
        for cycle in &analysis.cycles {
            let sighting = self.sightings.entry(cycle.key()).or_insert(Sighting {
                first_seen: sample.at,
                samples: 0,
                reported: false,
            });
            sighting.samples += 1;
            let persisted = sample.at.saturating_since(sighting.first_seen);
            if sighting.samples < 2 || persisted < self.recheck_window {
                debug!(cycle = ?cycle.actors, samples = sighting.samples, "wait-for cycle pending confirmation");
                continue;
            }
            let first_report = !sighting.reported;
            sighting.reported = true;

            let victim = if self.resolve { self.choose_victim(cycle, sample) } else { None };
            if first_report {
                records.push(ViolationRecord::new(
                    HazardKind::Deadlock,
                    cycle.actors.clone(),
                    sample.at,
                    Evidence::WaitCycle {
                        cycle: cycle.actors.clone(),
                        resources: cycle.resources.clone(),
                        persisted_ms: persisted.as_millis() as u64,
                        victim,
                    },
                ));
            }
            if let Some(victim) = victim {
                let held = sample.actor(victim).map(|actor| actor.held.clone()).unwrap_or_default();
                analysis.resolutions.push(Resolution {
                    victim,
                    held,
                    cycle: cycle.actors.clone(),
                });
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorSnapshot;
    use crate::resource::{ContentionStats, ResourceSnapshot};
    use crate::types::{ActorState, Priority, ResourceId};

    fn actor(id: u32, priority: u32, held: u32, waiting_on: u32, since: u64) -> ActorSnapshot {
        ActorSnapshot {
            id: ActorId(id),
            name: format!("actor-{id}"),
            priority: Priority(priority),
            state: ActorState::Waiting,
            held: vec![ResourceId(held)],
            waiting_on: Some(ResourceId(waiting_on)),
            wait_started_at: Some(Timestamp(since)),
            blocked_by: None,
            last_progress_at: Timestamp::ZERO,
            total_wait_us: 0,
            unserved_wait_us: 0,
            completed_ops: 0,
            grants: 1,
            state_changes: 2,
            retries: 0,
            timeouts: 0,
            victimizations: 0,
        }
    }

    fn resource(id: u32, owner: u32) -> ResourceSnapshot {
        ResourceSnapshot {
            id: ResourceId(id),
            name: format!("resource-{id}"),
            owner: Some(ActorId(owner)),
            held_since: Some(Timestamp::ZERO),
            wait_queue: Vec::new(),
            stats: ContentionStats::default(),
        }
    }

    fn crossed(at_ms: u64) -> StateSample {
        StateSample {
            at: Timestamp(at_ms * 1000),
            actors: vec![actor(1, 5, 1, 2, 1_000), actor(2, 5, 2, 1, 2_000)],
            resources: vec![resource(1, 1), resource(2, 2)],
        }
    }

    fn inspect(detector: &mut DeadlockDetector, sample: &StateSample) -> (Vec<ViolationRecord>, SampleAnalysis) {
        let mut analysis = SampleAnalysis::new(sample);
        let records = detector.inspect(sample, &mut analysis);
        (records, analysis)
    }

    #[test]
    fn test_cycle_reported_once_after_window() {
        let mut detector = DeadlockDetector::new(Duration::from_millis(200), false, VictimPolicy::LowestPriority);

        assert!(inspect(&mut detector, &crossed(10)).0.is_empty());
        assert!(inspect(&mut detector, &crossed(100)).0.is_empty());
        let (records, analysis) = inspect(&mut detector, &crossed(220));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].involved_actors, vec![ActorId(1), ActorId(2)]);
        assert!(analysis.resolutions.is_empty());

        // Still the same episode.
        assert!(inspect(&mut detector, &crossed(400)).0.is_empty());
    }

    #[test]
    fn test_transient_cycle_is_not_confirmed() {
        let mut detector = DeadlockDetector::new(Duration::from_millis(50), false, VictimPolicy::LowestPriority);
        assert!(inspect(&mut detector, &crossed(10)).0.is_empty());

        let cleared = StateSample {
            at: Timestamp(80_000),
            actors: Vec::new(),
            resources: Vec::new(),
        };
        assert!(inspect(&mut detector, &cleared).0.is_empty());
        // The cycle reappears: a new first sighting, not a confirmation.
        assert!(inspect(&mut detector, &crossed(90)).0.is_empty());
    }

    #[test]
    fn test_victim_policies() {
        let sample = crossed(0);
        let cycle = SampleAnalysis::new(&sample).cycles.remove(0);

        let lowest = DeadlockDetector::new(Duration::ZERO, true, VictimPolicy::LowestPriority);
        // Equal priorities: highest id loses.
        assert_eq!(lowest.choose_victim(&cycle, &sample), Some(ActorId(2)));

        let recent = DeadlockDetector::new(Duration::ZERO, true, VictimPolicy::MostRecentlyBlocked);
        assert_eq!(recent.choose_victim(&cycle, &sample), Some(ActorId(2)));

        let mut skewed = sample.clone();
        skewed.actors[0].priority = Priority(1);
        skewed.actors[1].wait_started_at = Some(Timestamp(500));
        assert_eq!(lowest.choose_victim(&cycle, &skewed), Some(ActorId(1)));
        assert_eq!(recent.choose_victim(&cycle, &skewed), Some(ActorId(1)));
    }

    #[test]
    fn test_resolution_requested_until_cycle_clears() {
        let mut detector = DeadlockDetector::new(Duration::ZERO, true, VictimPolicy::LowestPriority);
        inspect(&mut detector, &crossed(0));
        let (records, analysis) = inspect(&mut detector, &crossed(20));
        assert_eq!(records.len(), 1);
        assert_eq!(
            analysis.resolutions,
            vec![Resolution {
                victim: ActorId(2),
                held: vec![ResourceId(2)],
                cycle: vec![ActorId(1), ActorId(2)],
            }]
        );

        let (records, analysis) = inspect(&mut detector, &crossed(40));
        assert!(records.is_empty());
        assert_eq!(analysis.resolutions.len(), 1);
    }
}
