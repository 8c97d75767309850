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

//! Lockable resources and their wait queues
//!
//! A `Resource` is only ever mutated under the context's state lock. It knows
//! nothing about arbitration order; the `Arbiter` decides which queued
//! request is served next.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::error::{HazardError, HazardResult};
use crate::types::{ActorId, Priority, ResourceId};

/// A request waiting in a resource's queue
///
/// Immutable once created; leaves the queue exactly once, on grant or on
/// withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub actor: ActorId,
    pub resource: ResourceId,
    pub priority: Priority,
    pub enqueued_at: Timestamp,
}

impl PendingRequest {
    pub fn new(actor: ActorId, resource: ResourceId, priority: Priority, enqueued_at: Timestamp) -> Self {
        Self {
            actor,
            resource,
            priority,
            enqueued_at,
        }
    }

    /// How long this request has been queued at `now`
    pub fn waited(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.enqueued_at)
    }
}

/// Contention counters for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentionStats {
    /// Grants of any kind
    pub acquisitions: u64,
    /// Grants that had to wait in the queue
    pub contended_acquisitions: u64,
    /// Non-blocking attempts that found the resource taken
    pub failed_attempts: u64,
    /// Blocking acquires that gave up at their deadline
    pub timeouts: u64,
    /// Ownerships revoked by deadlock resolution
    pub forced_releases: u64,
    pub total_wait_us: u64,
    pub max_wait_us: u64,
    pub total_hold_us: u64,
}

impl ContentionStats {
    fn record_wait(&mut self, waited: Duration) {
        let micros = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        self.total_wait_us = self.total_wait_us.saturating_add(micros);
        self.max_wait_us = self.max_wait_us.max(micros);
    }

    /// Mean wait of contended grants
    pub fn average_wait(&self) -> Duration {
        if self.contended_acquisitions == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.total_wait_us / self.contended_acquisitions)
        }
    }

    /// Fraction of grants that had to queue
    pub fn contention_ratio(&self) -> f64 {
        if self.acquisitions == 0 {
            0.0
        } else {
            self.contended_acquisitions as f64 / self.acquisitions as f64
        }
    }
}

/// A lockable unit of contention with an owner and a wait queue
#[derive(Debug, Clone)]
pub struct Resource {
    id: ResourceId,
    name: String,
    owner: Option<ActorId>,
    held_since: Option<Timestamp>,
    wait_queue: Vec<PendingRequest>,
    stats: ContentionStats,
}

impl Resource {
    pub fn new(id: ResourceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            owner: None,
            held_since: None,
            wait_queue: Vec::new(),
            stats: ContentionStats::default(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<ActorId> {
        self.owner
    }

    pub fn held_since(&self) -> Option<Timestamp> {
        self.held_since
    }

    pub fn wait_queue(&self) -> &[PendingRequest] {
        &self.wait_queue
    }

    pub(crate) fn wait_queue_mut(&mut self) -> &mut Vec<PendingRequest> {
        &mut self.wait_queue
    }

    pub fn stats(&self) -> &ContentionStats {
        &self.stats
    }

    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    pub fn is_queued(&self, actor: ActorId) -> bool {
        self.wait_queue.iter().any(|request| request.actor == actor)
    }

    /// Hand ownership to `actor`; `waited` is zero for uncontended grants
    pub(crate) fn grant(&mut self, actor: ActorId, now: Timestamp, waited: Option<Duration>) {
        self.owner = Some(actor);
        self.held_since = Some(now);
        self.stats.acquisitions += 1;
        if let Some(waited) = waited {
            self.stats.contended_acquisitions += 1;
            self.stats.record_wait(waited);
        }
    }

    /// Drop ownership, returning the previous owner
    pub(crate) fn clear_owner(&mut self, now: Timestamp) -> Option<ActorId> {
        if let Some(since) = self.held_since.take() {
            let held = now.saturating_since(since);
            self.stats.total_hold_us = self.stats.total_hold_us.saturating_add(u64::try_from(held.as_micros()).unwrap_or(u64::MAX));
        }
        self.owner.take()
    }

    pub(crate) fn enqueue(&mut self, request: PendingRequest) {
        self.wait_queue.push(request);
    }

    /// Remove the pending request of `actor`, if any
    pub(crate) fn withdraw(&mut self, actor: ActorId) -> Option<PendingRequest> {
        let position = self.wait_queue.iter().position(|request| request.actor == actor)?;
        Some(self.wait_queue.remove(position))
    }

    pub(crate) fn note_failed_attempt(&mut self) {
        self.stats.failed_attempts += 1;
    }

    pub(crate) fn note_timeout(&mut self) {
        self.stats.timeouts += 1;
    }

    pub(crate) fn note_forced_release(&mut self) {
        self.stats.forced_releases += 1;
    }

    /// Internal consistency check run after every queue or ownership transition
    pub fn check_invariants(&self) -> HazardResult<()> {
        let violation = |detail: String| HazardError::QueueInvariantViolation { resource: self.id, detail };

        if self.owner.is_some() != self.held_since.is_some() {
            return Err(violation(format!("owner {:?} disagrees with held_since {:?}", self.owner, self.held_since)));
        }
        if let Some(owner) = self.owner
            && self.is_queued(owner)
        {
            return Err(violation(format!("owner {owner} still has a pending request")));
        }
        if self.owner.is_none() && !self.wait_queue.is_empty() {
            return Err(violation(format!("free resource with {} ungranted requests", self.wait_queue.len())));
        }
        for (index, request) in self.wait_queue.iter().enumerate() {
            if request.resource != self.id {
                return Err(violation(format!("request of {} targets {}", request.actor, request.resource)));
            }
            if self.wait_queue[index + 1..].iter().any(|other| other.actor == request.actor) {
                return Err(violation(format!("{} queued twice", request.actor)));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner,
            held_since: self.held_since,
            wait_queue: self.wait_queue.clone(),
            stats: self.stats,
        }
    }
}

/// Read-only copy of a resource's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub name: String,
    pub owner: Option<ActorId>,
    pub held_since: Option<Timestamp>,
    /// Pending requests in arbitration order at snapshot time
    pub wait_queue: Vec<PendingRequest>,
    pub stats: ContentionStats,
}

impl ResourceSnapshot {
    pub fn is_queued(&self, actor: ActorId) -> bool {
        self.wait_queue.iter().any(|request| request.actor == actor)
    }
}
