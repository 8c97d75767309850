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

//! Simulation context and the exclusive-access protocol
//!
//! `SimulationContext` replaces module-level shared state: it owns every
//! resource and actor record behind one short-held lock, the arbiter that
//! orders wait queues, the clock and the violation recorder. Actor threads
//! block only on the condition variable inside `acquire`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::actor::Actor;
use crate::arbiter::Arbiter;
use crate::clock::{SimulationClock, Timestamp};
use crate::config::SimulationConfig;
use crate::error::{HazardError, HazardResult};
use crate::recorder::ViolationRecorder;
use crate::resource::{PendingRequest, Resource};
use crate::snapshot::StateSample;
use crate::types::{ActorId, ActorState, Priority, ResourceId};

/// Successful acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub resource: ResourceId,
    pub waited: Duration,
}

struct EngineState {
    resources: BTreeMap<ResourceId, Resource>,
    actors: BTreeMap<ActorId, Actor>,
    arbiter: Arbiter,
}

impl EngineState {
    fn resource_mut(&mut self, id: ResourceId) -> HazardResult<&mut Resource> {
        self.resources.get_mut(&id).ok_or(HazardError::UnknownResource(id))
    }

    fn actor_mut(&mut self, id: ActorId) -> HazardResult<&mut Actor> {
        self.actors.get_mut(&id).ok_or(HazardError::UnknownActor(id))
    }
}

/// Serve the head of a free resource's queue and update the new owner's record
fn regrant(arbiter: &Arbiter, resource: &mut Resource, actors: &mut BTreeMap<ActorId, Actor>, now: Timestamp) -> HazardResult<Option<ActorId>> {
    let served = arbiter.grant_next(resource, now);
    if let Some(request) = served {
        let actor = actors.get_mut(&request.actor).ok_or(HazardError::UnknownActor(request.actor))?;
        let waited = actor.on_grant(resource.id(), now);
        debug!(resource = %resource.id(), actor = %request.actor, waited_us = waited.as_micros() as u64, policy = arbiter.policy_name(), "granted from queue");
    }
    resource.check_invariants()?;
    Ok(served.map(|request| request.actor))
}

/// Owner of every resource and actor in one simulation run
pub struct SimulationContext {
    config: SimulationConfig,
    clock: SimulationClock,
    state: Mutex<EngineState>,
    changed: Condvar,
    recorder: Arc<ViolationRecorder>,
    stopping: AtomicBool,
}

impl SimulationContext {
    /// Create a context with a tracing-backed recorder
    pub fn new(config: SimulationConfig) -> HazardResult<Self> {
        Self::with_recorder(config, Arc::new(ViolationRecorder::with_tracing()))
    }

    pub fn with_recorder(config: SimulationConfig, recorder: Arc<ViolationRecorder>) -> HazardResult<Self> {
        config.validate()?;
        let arbiter = Arbiter::for_policy(config.policy, config.aging_rate);
        info!(policy = arbiter.policy_name(), mode = ?config.mode, "simulation context created");
        Ok(Self {
            config,
            clock: SimulationClock::start(),
            state: Mutex::new(EngineState {
                resources: BTreeMap::new(),
                actors: BTreeMap::new(),
                arbiter,
            }),
            changed: Condvar::new(),
            recorder,
            stopping: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn recorder(&self) -> &Arc<ViolationRecorder> {
        &self.recorder
    }

    /// Register a resource; ids are assigned sequentially from 1
    pub fn add_resource(&self, name: impl Into<String>) -> ResourceId {
        let mut state = self.state.lock();
        let id = ResourceId(state.resources.keys().next_back().map_or(1, |last| last.0 + 1));
        state.resources.insert(id, Resource::new(id, name));
        id
    }

    /// Register an actor; ids are assigned sequentially from 1
    pub fn add_actor(&self, name: impl Into<String>, priority: Priority) -> ActorId {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let id = ActorId(state.actors.keys().next_back().map_or(1, |last| last.0 + 1));
        state.actors.insert(id, Actor::new(id, name, priority, now));
        id
    }

    /// Non-blocking acquisition; succeeds iff the resource has no owner
    pub fn try_acquire(&self, actor: ActorId, resource: ResourceId) -> HazardResult<bool> {
        let mut guard = self.state.lock();
        let now = self.clock.now();
        let EngineState { resources, actors, .. } = &mut *guard;
        let entry = resources.get_mut(&resource).ok_or(HazardError::UnknownResource(resource))?;
        let record = actors.get_mut(&actor).ok_or(HazardError::UnknownActor(actor))?;

        if entry.owner() == Some(actor) {
            return Ok(true);
        }
        if entry.is_free() {
            entry.check_invariants()?;
            entry.grant(actor, now, None);
            record.on_grant(resource, now);
            debug!(%actor, %resource, "try_acquire granted");
            Ok(true)
        } else {
            entry.note_failed_attempt();
            record.on_failed_attempt(resource, entry.owner(), now);
            Ok(false)
        }
    }

    /// Blocking acquisition bounded by `timeout`
    ///
    /// On timeout, cancellation or victimization the caller's pending request
    /// is gone from the wait queue before this returns.
    pub fn acquire(&self, actor: ActorId, resource: ResourceId, timeout: Duration) -> HazardResult<Grant> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock();
        if self.is_stopping() {
            return Err(HazardError::Cancelled);
        }
        let started = self.clock.now();
        {
            let EngineState { resources, actors, .. } = &mut *guard;
            let entry = resources.get_mut(&resource).ok_or(HazardError::UnknownResource(resource))?;
            let record = actors.get_mut(&actor).ok_or(HazardError::UnknownActor(actor))?;

            if entry.owner() == Some(actor) {
                return Ok(Grant { resource, waited: Duration::ZERO });
            }
            if entry.is_queued(actor) {
                return Err(HazardError::QueueInvariantViolation {
                    resource,
                    detail: format!("{actor} is already queued"),
                });
            }
            if entry.is_free() {
                entry.check_invariants()?;
                entry.grant(actor, started, None);
                let waited = record.on_grant(resource, started);
                debug!(%actor, %resource, "acquired uncontended");
                return Ok(Grant { resource, waited });
            }

            let holder = entry.owner();
            entry.enqueue(PendingRequest::new(actor, resource, record.priority(), started));
            record.begin_wait(resource, holder, started);
            debug!(%actor, %resource, holder = ?holder, "queued");
        }

        loop {
            let now = self.clock.now();
            let EngineState { resources, actors, .. } = &mut *guard;
            let entry = resources.get_mut(&resource).ok_or(HazardError::UnknownResource(resource))?;
            let record = actors.get_mut(&actor).ok_or(HazardError::UnknownActor(actor))?;

            if entry.owner() == Some(actor) {
                return Ok(Grant {
                    resource,
                    waited: now.saturating_since(started),
                });
            }
            if record.take_withdrawn() {
                return Err(HazardError::DeadlockVictim { actor, resource });
            }
            if self.is_stopping() {
                entry.withdraw(actor);
                record.abandon_wait(now);
                return Err(HazardError::Cancelled);
            }
            if Instant::now() >= deadline {
                entry.withdraw(actor);
                entry.note_timeout();
                record.on_timeout(now);
                debug!(%actor, %resource, "acquire timed out");
                return Err(HazardError::TimedOut {
                    actor,
                    resource,
                    waited: now.saturating_since(started),
                });
            }
            self.changed.wait_until(&mut guard, deadline);
        }
    }

    /// Release a resource held by `actor` and hand it to the next waiter
    pub fn release(&self, actor: ActorId, resource: ResourceId) -> HazardResult<()> {
        {
            let mut guard = self.state.lock();
            let now = self.clock.now();
            let EngineState { resources, actors, arbiter } = &mut *guard;
            let entry = resources.get_mut(&resource).ok_or(HazardError::UnknownResource(resource))?;
            if entry.owner() != Some(actor) {
                return Err(HazardError::NotOwner {
                    actor,
                    resource,
                    owner: entry.owner(),
                });
            }
            actors.get_mut(&actor).ok_or(HazardError::UnknownActor(actor))?.on_release(resource);
            entry.clear_owner(now);
            debug!(%actor, %resource, "released");
            regrant(arbiter, entry, actors, now)?;
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Release everything `actor` currently holds, in id order
    pub fn release_all(&self, actor: ActorId) -> HazardResult<Vec<ResourceId>> {
        let released = {
            let mut guard = self.state.lock();
            let now = self.clock.now();
            let EngineState { resources, actors, arbiter } = &mut *guard;
            let record = actors.get_mut(&actor).ok_or(HazardError::UnknownActor(actor))?;
            let held: Vec<ResourceId> = record.held().iter().copied().collect();
            for resource in &held {
                record.on_release(*resource);
            }
            for resource in &held {
                let entry = resources.get_mut(resource).ok_or(HazardError::UnknownResource(*resource))?;
                entry.clear_owner(now);
                regrant(arbiter, entry, actors, now)?;
            }
            held
        };
        if !released.is_empty() {
            debug!(%actor, resources = ?released, "released all");
            self.changed.notify_all();
        }
        Ok(released)
    }

    /// Every resource the operation needs is held; enter the critical section
    pub fn begin_work(&self, actor: ActorId) -> HazardResult<()> {
        let now = self.clock.now();
        self.state.lock().actor_mut(actor)?.begin_work(now);
        Ok(())
    }

    pub fn complete_operation(&self, actor: ActorId) -> HazardResult<()> {
        let now = self.clock.now();
        self.state.lock().actor_mut(actor)?.on_complete(now);
        Ok(())
    }

    /// Return an actor to `Idle` after a failed attempt; holdings must be released first
    pub fn roll_back(&self, actor: ActorId) -> HazardResult<()> {
        let now = self.clock.now();
        self.state.lock().actor_mut(actor)?.roll_back(now);
        Ok(())
    }

    pub fn finish(&self, actor: ActorId) -> HazardResult<()> {
        self.state.lock().actor_mut(actor)?.set_state(ActorState::Finished);
        Ok(())
    }

    /// Forcibly break a deadlock by stripping `victim` of its holdings
    ///
    /// `expected_held` is what the monitor saw when it chose the victim; if the
    /// victim no longer holds those resources, or is no longer blocked, the
    /// sample is stale and `VictimizationFailure` is returned.
    pub fn victimize(&self, victim: ActorId, expected_held: &[ResourceId]) -> HazardResult<Vec<ResourceId>> {
        let released = {
            let mut guard = self.state.lock();
            let now = self.clock.now();
            let EngineState { resources, actors, arbiter } = &mut *guard;
            let record = actors.get_mut(&victim).ok_or(HazardError::UnknownActor(victim))?;
            let Some(waiting_on) = record.waiting_on() else {
                return Err(HazardError::VictimizationFailure {
                    actor: victim,
                    detail: "actor is no longer blocked".to_string(),
                });
            };
            if let Some(missing) = expected_held.iter().find(|resource| !record.held().contains(*resource)) {
                return Err(HazardError::VictimizationFailure {
                    actor: victim,
                    detail: format!("actor no longer holds {missing}"),
                });
            }
            if record.held().is_empty() {
                return Err(HazardError::VictimizationFailure {
                    actor: victim,
                    detail: "actor holds nothing".to_string(),
                });
            }

            let released: Vec<ResourceId> = record.victimize(now).into_iter().collect();
            let pending = resources.get_mut(&waiting_on).ok_or(HazardError::UnknownResource(waiting_on))?;
            pending.withdraw(victim);
            pending.check_invariants()?;

            for resource in &released {
                let entry = resources.get_mut(resource).ok_or(HazardError::UnknownResource(*resource))?;
                entry.clear_owner(now);
                entry.note_forced_release();
                regrant(arbiter, entry, actors, now)?;
            }
            info!(%victim, released = ?released, "deadlock victim force-released");
            released
        };
        self.changed.notify_all();
        Ok(released)
    }

    /// Consistent copy of all state; wait queues are listed in arbitration order
    pub fn sample(&self) -> StateSample {
        let state = self.state.lock();
        let at = self.clock.now();
        StateSample {
            at,
            actors: state.actors.values().map(Actor::snapshot).collect(),
            resources: state
                .resources
                .values()
                .map(|resource| {
                    let mut snapshot = resource.snapshot();
                    snapshot.wait_queue = state.arbiter.ordered(resource.wait_queue(), at);
                    snapshot
                })
                .collect(),
        }
    }

    /// Cross-check resource ownership against actor holdings
    pub fn verify_invariants(&self) -> HazardResult<()> {
        let state = self.state.lock();
        for resource in state.resources.values() {
            resource.check_invariants()?;
            if let Some(owner) = resource.owner() {
                let holds = state.actors.get(&owner).is_some_and(|actor| actor.held().contains(&resource.id()));
                if !holds {
                    return Err(HazardError::QueueInvariantViolation {
                        resource: resource.id(),
                        detail: format!("owner {owner} does not list the resource as held"),
                    });
                }
            }
        }
        for actor in state.actors.values() {
            for held in actor.held() {
                let owner = state.resources.get(held).and_then(Resource::owner);
                if owner != Some(actor.id()) {
                    return Err(HazardError::QueueInvariantViolation {
                        resource: *held,
                        detail: format!("{} lists the resource as held but the owner is {owner:?}", actor.id()),
                    });
                }
            }
            if let Some(waiting_on) = actor.waiting_on() {
                let queued = state.resources.get(&waiting_on).is_some_and(|resource| resource.is_queued(actor.id()));
                if !queued {
                    return Err(HazardError::QueueInvariantViolation {
                        resource: waiting_on,
                        detail: format!("{} waits without a pending request", actor.id()),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn all_finished(&self) -> bool {
        self.state.lock().actors.values().all(|actor| actor.state() == ActorState::Finished)
    }

    /// Ask every blocked acquire to return `Cancelled`
    pub fn shutdown(&self) {
        {
            let _state = self.state.lock();
            self.stopping.store(true, Ordering::Release);
        }
        self.changed.notify_all();
        info!("simulation shutdown requested");
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SimulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulationContext")
            .field("policy", &state.arbiter.policy_name())
            .field("resources", &state.resources.len())
            .field("actors", &state.actors.len())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocationPolicy;

    fn context(policy: AllocationPolicy) -> SimulationContext {
        let config = SimulationConfig {
            policy,
            ..SimulationConfig::default()
        };
        SimulationContext::with_recorder(config, Arc::new(ViolationRecorder::new())).unwrap()
    }

    #[test]
    fn test_try_acquire_is_exclusive() {
        let ctx = context(AllocationPolicy::Fifo);
        let r = ctx.add_resource("seat");
        let a = ctx.add_actor("a", Priority(1));
        let b = ctx.add_actor("b", Priority(1));

        assert!(ctx.try_acquire(a, r).unwrap());
        assert!(!ctx.try_acquire(b, r).unwrap());

        let sample = ctx.sample();
        assert_eq!(sample.owner_of(r), Some(a));
        assert_eq!(sample.actor(b).unwrap().blocked_by.map(|blocker| blocker.holder), Some(a));
        assert_eq!(sample.resource(r).unwrap().stats.failed_attempts, 1);
    }

    #[test]
    fn test_release_by_non_owner_is_surfaced() {
        let ctx = context(AllocationPolicy::Fifo);
        let r = ctx.add_resource("seat");
        let a = ctx.add_actor("a", Priority(1));
        let b = ctx.add_actor("b", Priority(1));

        assert!(matches!(ctx.release(a, r), Err(HazardError::NotOwner { owner: None, .. })));
        ctx.try_acquire(a, r).unwrap();
        assert_eq!(
            ctx.release(b, r),
            Err(HazardError::NotOwner {
                actor: b,
                resource: r,
                owner: Some(a)
            })
        );
        assert!(ctx.release(a, r).is_ok());
        assert!(ctx.verify_invariants().is_ok());
    }

    #[test]
    fn test_timeout_leaves_no_pending_request() {
        let ctx = context(AllocationPolicy::Fifo);
        let r = ctx.add_resource("seat");
        let a = ctx.add_actor("a", Priority(1));
        let b = ctx.add_actor("b", Priority(1));
        ctx.try_acquire(a, r).unwrap();

        let err = ctx.acquire(b, r, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, HazardError::TimedOut { .. }));

        let sample = ctx.sample();
        assert!(!sample.resource(r).unwrap().is_queued(b));
        assert_eq!(sample.actor(b).unwrap().state, ActorState::Idle);
        assert_eq!(sample.resource(r).unwrap().stats.timeouts, 1);
        assert!(ctx.verify_invariants().is_ok());
    }

    #[test]
    fn test_release_grants_next_waiter() {
        let ctx = Arc::new(context(AllocationPolicy::Fifo));
        let r = ctx.add_resource("seat");
        let a = ctx.add_actor("a", Priority(1));
        let b = ctx.add_actor("b", Priority(1));
        ctx.try_acquire(a, r).unwrap();

        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || ctx.acquire(b, r, Duration::from_secs(5)))
        };
        while !ctx.sample().resource(r).unwrap().is_queued(b) {
            std::thread::sleep(Duration::from_millis(1));
        }
        ctx.release(a, r).unwrap();

        // Ownership moved before the waiter even woke up.
        assert_eq!(ctx.sample().owner_of(r), Some(b));
        let grant = waiter.join().unwrap().unwrap();
        assert_eq!(grant.resource, r);
        assert!(ctx.verify_invariants().is_ok());
    }

    #[test]
    fn test_strict_priority_grant_order() {
        let ctx = Arc::new(context(AllocationPolicy::Priority));
        let r = ctx.add_resource("seat");
        let holder = ctx.add_actor("holder", Priority(1));
        let low = ctx.add_actor("low", Priority(1));
        let high = ctx.add_actor("high", Priority(9));
        ctx.try_acquire(holder, r).unwrap();

        let spawn = |actor| {
            let ctx = ctx.clone();
            std::thread::spawn(move || ctx.acquire(actor, r, Duration::from_secs(5)))
        };
        let low_handle = spawn(low);
        while !ctx.sample().resource(r).unwrap().is_queued(low) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let high_handle = spawn(high);
        while !ctx.sample().resource(r).unwrap().is_queued(high) {
            std::thread::sleep(Duration::from_millis(1));
        }

        ctx.release(holder, r).unwrap();
        assert_eq!(ctx.sample().owner_of(r), Some(high));
        high_handle.join().unwrap().unwrap();
        ctx.release(high, r).unwrap();
        low_handle.join().unwrap().unwrap();
        assert_eq!(ctx.sample().owner_of(r), Some(low));
    }

    #[test]
    fn test_shutdown_cancels_blocked_acquire() {
        let ctx = Arc::new(context(AllocationPolicy::Fifo));
        let r = ctx.add_resource("seat");
        let a = ctx.add_actor("a", Priority(1));
        let b = ctx.add_actor("b", Priority(1));
        ctx.try_acquire(a, r).unwrap();

        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || ctx.acquire(b, r, Duration::from_secs(30)))
        };
        while !ctx.sample().resource(r).unwrap().is_queued(b) {
            std::thread::sleep(Duration::from_millis(1));
        }
        ctx.shutdown();
        assert_eq!(waiter.join().unwrap(), Err(HazardError::Cancelled));
        assert!(!ctx.sample().resource(r).unwrap().is_queued(b));
    }

    #[test]
    fn test_victimize_requires_blocked_holder() {
        let ctx = context(AllocationPolicy::Fifo);
        let r = ctx.add_resource("seat");
        let a = ctx.add_actor("a", Priority(1));
        ctx.try_acquire(a, r).unwrap();
        assert!(matches!(ctx.victimize(a, &[r]), Err(HazardError::VictimizationFailure { .. })));
        assert_eq!(ctx.sample().owner_of(r), Some(a));
    }

    #[test]
    fn test_release_all() {
        let ctx = context(AllocationPolicy::Fifo);
        let r1 = ctx.add_resource("fork-1");
        let r2 = ctx.add_resource("fork-2");
        let a = ctx.add_actor("a", Priority(1));
        ctx.try_acquire(a, r1).unwrap();
        ctx.try_acquire(a, r2).unwrap();

        assert_eq!(ctx.release_all(a).unwrap(), vec![r1, r2]);
        let sample = ctx.sample();
        assert!(sample.resource(r1).unwrap().owner.is_none());
        assert!(sample.resource(r2).unwrap().owner.is_none());
        assert_eq!(sample.actor(a).unwrap().state, ActorState::Idle);
        assert!(ctx.release_all(a).unwrap().is_empty());
    }
}
