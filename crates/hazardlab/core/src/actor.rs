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

//! Simulated concurrent participants
//!
//! An `Actor` is bookkeeping only; the thread that drives it lives in the
//! simulation module. `last_progress_at` moves exclusively when the engine
//! lets an actor into its critical section (every resource it needs has been
//! granted) or when the section completes, never on a bare retry.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::types::{ActorId, ActorState, Priority, ResourceId};

/// The resource an actor last failed to get and who held it at that moment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub resource: ResourceId,
    pub holder: ActorId,
    pub observed_at: Timestamp,
}

/// Mutable record of one actor, owned by the simulation context
#[derive(Debug, Clone)]
pub struct Actor {
    id: ActorId,
    name: String,
    priority: Priority,
    held: BTreeSet<ResourceId>,
    state: ActorState,
    last_progress_at: Timestamp,
    total_wait: Duration,
    /// Wait accumulated since the last grant, across timeouts and retries
    unserved_wait: Duration,
    completed_ops: u64,
    waiting_on: Option<ResourceId>,
    wait_started_at: Option<Timestamp>,
    blocked_by: Option<Blocker>,
    state_changes: u64,
    retries: u64,
    timeouts: u64,
    victimizations: u64,
    grants: u64,
    withdrawn: bool,
}

impl Actor {
    pub fn new(id: ActorId, name: impl Into<String>, priority: Priority, now: Timestamp) -> Self {
        Self {
            id,
            name: name.into(),
            priority,
            held: BTreeSet::new(),
            state: ActorState::Idle,
            last_progress_at: now,
            total_wait: Duration::ZERO,
            unserved_wait: Duration::ZERO,
            completed_ops: 0,
            waiting_on: None,
            wait_started_at: None,
            blocked_by: None,
            state_changes: 0,
            retries: 0,
            timeouts: 0,
            victimizations: 0,
            grants: 0,
            withdrawn: false,
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> ActorState {
        self.state
    }

    pub fn held(&self) -> &BTreeSet<ResourceId> {
        &self.held
    }

    pub fn waiting_on(&self) -> Option<ResourceId> {
        self.waiting_on
    }

    pub fn completed_ops(&self) -> u64 {
        self.completed_ops
    }

    pub fn last_progress_at(&self) -> Timestamp {
        self.last_progress_at
    }

    pub(crate) fn set_state(&mut self, state: ActorState) {
        if self.state != state {
            self.state = state;
            self.state_changes += 1;
        }
    }

    /// Blocking wait on `resource` started
    pub(crate) fn begin_wait(&mut self, resource: ResourceId, holder: Option<ActorId>, now: Timestamp) {
        self.waiting_on = Some(resource);
        self.wait_started_at = Some(now);
        if let Some(holder) = holder {
            self.blocked_by = Some(Blocker {
                resource,
                holder,
                observed_at: now,
            });
        }
        self.set_state(ActorState::Waiting);
    }

    /// Ownership of `resource` was transferred to this actor
    pub(crate) fn on_grant(&mut self, resource: ResourceId, now: Timestamp) -> Duration {
        let waited = self.wait_started_at.take().map(|started| now.saturating_since(started)).unwrap_or_default();
        self.held.insert(resource);
        self.total_wait += waited;
        self.unserved_wait = Duration::ZERO;
        self.waiting_on = None;
        self.withdrawn = false;
        self.grants += 1;
        self.set_state(ActorState::Holding);
        waited
    }

    /// A non-blocking attempt failed; no progress is recorded
    pub(crate) fn on_failed_attempt(&mut self, resource: ResourceId, holder: Option<ActorId>, now: Timestamp) {
        self.retries += 1;
        if self.wait_started_at.is_none() {
            self.wait_started_at = Some(now);
        }
        if let Some(holder) = holder {
            self.blocked_by = Some(Blocker {
                resource,
                holder,
                observed_at: now,
            });
        }
        self.set_state(ActorState::Waiting);
    }

    /// The blocking wait ended without a grant
    pub(crate) fn abandon_wait(&mut self, now: Timestamp) {
        if let Some(started) = self.wait_started_at.take() {
            let waited = now.saturating_since(started);
            self.total_wait += waited;
            self.unserved_wait += waited;
        }
        self.waiting_on = None;
        let next = if self.held.is_empty() { ActorState::Idle } else { ActorState::Holding };
        self.set_state(next);
    }

    pub(crate) fn on_timeout(&mut self, now: Timestamp) {
        self.timeouts += 1;
        self.abandon_wait(now);
    }

    pub(crate) fn on_release(&mut self, resource: ResourceId) -> bool {
        let removed = self.held.remove(&resource);
        if removed && self.held.is_empty() && self.state == ActorState::Holding {
            self.set_state(ActorState::Idle);
        }
        removed
    }

    /// Forced victimization: drop every holding and withdraw the pending wait
    pub(crate) fn victimize(&mut self, now: Timestamp) -> BTreeSet<ResourceId> {
        self.victimizations += 1;
        self.withdrawn = true;
        let held = std::mem::take(&mut self.held);
        self.abandon_wait(now);
        held
    }

    pub(crate) fn take_withdrawn(&mut self) -> bool {
        std::mem::take(&mut self.withdrawn)
    }

    /// All resources granted and the critical section entered; forward progress
    pub(crate) fn begin_work(&mut self, now: Timestamp) {
        self.last_progress_at = now;
        self.set_state(ActorState::Working);
    }

    /// A critical section finished; counts as forward progress
    pub(crate) fn on_complete(&mut self, now: Timestamp) {
        self.completed_ops += 1;
        self.last_progress_at = now;
        let next = if self.held.is_empty() { ActorState::Idle } else { ActorState::Holding };
        self.set_state(next);
    }

    /// Retry loop gave up or restarted; resets to `Idle` once nothing is held
    pub(crate) fn roll_back(&mut self, now: Timestamp) {
        if self.waiting_on.is_some() {
            self.abandon_wait(now);
        }
        if self.held.is_empty() {
            self.set_state(ActorState::Idle);
        }
    }

    pub fn snapshot(&self) -> ActorSnapshot {
        ActorSnapshot {
            id: self.id,
            name: self.name.clone(),
            priority: self.priority,
            state: self.state,
            held: self.held.iter().copied().collect(),
            waiting_on: self.waiting_on,
            wait_started_at: self.wait_started_at,
            blocked_by: self.blocked_by,
            last_progress_at: self.last_progress_at,
            total_wait_us: u64::try_from(self.total_wait.as_micros()).unwrap_or(u64::MAX),
            unserved_wait_us: u64::try_from(self.unserved_wait.as_micros()).unwrap_or(u64::MAX),
            completed_ops: self.completed_ops,
            grants: self.grants,
            state_changes: self.state_changes,
            retries: self.retries,
            timeouts: self.timeouts,
            victimizations: self.victimizations,
        }
    }
}

/// Read-only copy of an actor's counters and state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSnapshot {
    pub id: ActorId,
    pub name: String,
    pub priority: Priority,
    pub state: ActorState,
    pub held: Vec<ResourceId>,
    pub waiting_on: Option<ResourceId>,
    pub wait_started_at: Option<Timestamp>,
    pub blocked_by: Option<Blocker>,
    pub last_progress_at: Timestamp,
    pub total_wait_us: u64,
    /// Finished waits since the last grant; the current wait is not included
    #[serde(default)]
    pub unserved_wait_us: u64,
    pub completed_ops: u64,
    pub grants: u64,
    pub state_changes: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub victimizations: u64,
}

impl ActorSnapshot {
    pub fn total_wait(&self) -> Duration {
        Duration::from_micros(self.total_wait_us)
    }

    /// Mean wait per completed operation, `None` before the first completion
    pub fn average_wait(&self) -> Option<Duration> {
        (self.completed_ops > 0).then(|| Duration::from_micros(self.total_wait_us / self.completed_ops))
    }

    /// Everything waited since the last grant, including the wait in progress
    pub fn unserved_for(&self, now: Timestamp) -> Duration {
        let current = self.wait_started_at.map(|started| now.saturating_since(started)).unwrap_or_default();
        Duration::from_micros(self.unserved_wait_us) + current
    }

    /// Turned away since the last grant and not yet served
    pub fn is_contending(&self) -> bool {
        match self.state {
            ActorState::Waiting => true,
            ActorState::Idle => self.unserved_wait_us > 0 || self.wait_started_at.is_some(),
            ActorState::Holding | ActorState::Working | ActorState::Finished => false,
        }
    }

    pub fn stalled_for(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.last_progress_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_only_on_entry_and_completion() {
        let mut actor = Actor::new(ActorId(1), "teller", Priority(1), Timestamp(0));

        actor.on_failed_attempt(ResourceId(1), Some(ActorId(2)), Timestamp(100));
        actor.on_failed_attempt(ResourceId(1), Some(ActorId(2)), Timestamp(200));
        assert_eq!(actor.last_progress_at(), Timestamp(0));
        assert_eq!(actor.state(), ActorState::Waiting);

        let waited = actor.on_grant(ResourceId(1), Timestamp(250));
        assert_eq!(waited, Duration::from_micros(150));
        assert_eq!(actor.last_progress_at(), Timestamp(0));
        assert_eq!(actor.state(), ActorState::Holding);

        actor.begin_work(Timestamp(300));
        assert_eq!(actor.last_progress_at(), Timestamp(300));
        assert_eq!(actor.state(), ActorState::Working);
        actor.on_complete(Timestamp(400));
        assert_eq!(actor.last_progress_at(), Timestamp(400));
        assert_eq!(actor.completed_ops(), 1);
        assert_eq!(actor.state(), ActorState::Holding);

        assert!(actor.on_release(ResourceId(1)));
        assert_eq!(actor.state(), ActorState::Idle);
    }

    #[test]
    fn test_timeout_rolls_back_to_idle() {
        let mut actor = Actor::new(ActorId(1), "teller", Priority(1), Timestamp(0));
        actor.begin_wait(ResourceId(4), Some(ActorId(2)), Timestamp(10));
        actor.on_timeout(Timestamp(60));

        let snapshot = actor.snapshot();
        assert_eq!(snapshot.state, ActorState::Idle);
        assert_eq!(snapshot.waiting_on, None);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.total_wait(), Duration::from_micros(50));
    }

    #[test]
    fn test_victimize_drops_holdings() {
        let mut actor = Actor::new(ActorId(1), "teller", Priority(1), Timestamp(0));
        actor.on_grant(ResourceId(1), Timestamp(5));
        actor.begin_wait(ResourceId(2), Some(ActorId(2)), Timestamp(10));

        let released = actor.victimize(Timestamp(20));
        assert_eq!(released.into_iter().collect::<Vec<_>>(), vec![ResourceId(1)]);
        assert!(actor.held().is_empty());
        assert_eq!(actor.state(), ActorState::Idle);
        assert!(actor.take_withdrawn());
        assert!(!actor.take_withdrawn());
    }

    #[test]
    fn test_unserved_wait_spans_timeouts_until_grant() {
        let mut actor = Actor::new(ActorId(1), "teller", Priority(1), Timestamp(0));
        actor.begin_wait(ResourceId(1), Some(ActorId(2)), Timestamp(0));
        actor.on_timeout(Timestamp(200_000));
        actor.begin_wait(ResourceId(1), Some(ActorId(2)), Timestamp(220_000));
        actor.on_timeout(Timestamp(420_000));

        let snapshot = actor.snapshot();
        assert_eq!(snapshot.state, ActorState::Idle);
        assert!(snapshot.is_contending());
        assert_eq!(snapshot.unserved_for(Timestamp(430_000)), Duration::from_millis(400));

        actor.begin_wait(ResourceId(1), Some(ActorId(2)), Timestamp(440_000));
        assert_eq!(actor.snapshot().unserved_for(Timestamp(500_000)), Duration::from_millis(460));

        actor.on_grant(ResourceId(1), Timestamp(510_000));
        let snapshot = actor.snapshot();
        assert_eq!(snapshot.unserved_wait_us, 0);
        assert!(!snapshot.is_contending());
    }

    #[test]
    fn test_average_wait() {
        let mut actor = Actor::new(ActorId(1), "teller", Priority(1), Timestamp(0));
        assert_eq!(actor.snapshot().average_wait(), None);
        actor.begin_wait(ResourceId(1), Some(ActorId(2)), Timestamp(0));
        actor.on_grant(ResourceId(1), Timestamp(4_000));
        actor.on_complete(Timestamp(5_000));
        actor.on_release(ResourceId(1));
        actor.begin_wait(ResourceId(1), Some(ActorId(2)), Timestamp(6_000));
        actor.on_grant(ResourceId(1), Timestamp(8_000));
        actor.on_complete(Timestamp(9_000));
        assert_eq!(actor.snapshot().average_wait(), Some(Duration::from_millis(3)));
    }
}
