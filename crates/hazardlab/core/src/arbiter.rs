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

//! Allocation policy and grant logic
//!
//! Ordering is a pluggable comparator over pending requests. The arbiter
//! re-sorts a resource's queue whenever the resource becomes free and hands
//! it to the head request in the same critical section, so no caller can
//! observe a free resource with ungranted waiters.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::config::AllocationPolicy;
use crate::resource::{PendingRequest, Resource};

/// Comparator deciding which pending request is served first
pub trait RequestOrdering: Send + Sync + fmt::Debug {
    /// `Ordering::Less` means `a` is served before `b`
    fn compare(&self, a: &PendingRequest, b: &PendingRequest, now: Timestamp) -> Ordering;

    fn name(&self) -> &'static str;
}

fn arrival_order(a: &PendingRequest, b: &PendingRequest) -> Ordering {
    a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.actor.cmp(&b.actor))
}

/// Serve requests in arrival order
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoOrdering;

impl RequestOrdering for FifoOrdering {
    fn compare(&self, a: &PendingRequest, b: &PendingRequest, _now: Timestamp) -> Ordering {
        arrival_order(a, b)
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}

/// Highest static priority first, arrival order among equals
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictPriorityOrdering;

impl RequestOrdering for StrictPriorityOrdering {
    fn compare(&self, a: &PendingRequest, b: &PendingRequest, _now: Timestamp) -> Ordering {
        b.priority.cmp(&a.priority).then_with(|| arrival_order(a, b))
    }

    fn name(&self) -> &'static str {
        "priority"
    }
}

/// Effective priority grows linearly with queueing time
#[derive(Debug, Clone, Copy)]
pub struct AgingOrdering {
    /// Priority units gained per second spent in the queue
    pub rate: f64,
}

impl AgingOrdering {
    pub fn effective_priority(&self, request: &PendingRequest, now: Timestamp) -> f64 {
        request.priority.as_f64() + self.rate * request.waited(now).as_secs_f64()
    }
}

impl RequestOrdering for AgingOrdering {
    fn compare(&self, a: &PendingRequest, b: &PendingRequest, now: Timestamp) -> Ordering {
        let ea = self.effective_priority(a, now);
        let eb = self.effective_priority(b, now);
        eb.total_cmp(&ea).then_with(|| arrival_order(a, b))
    }

    fn name(&self) -> &'static str {
        "priority-aging"
    }
}

/// Per-resource arbitration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArbitrationState {
    /// No owner, no waiters
    Empty,
    /// No owner but waiters queued; only legal inside a grant transition
    Pending,
    /// Owned, possibly with waiters
    Granted,
}

/// Orders wait queues and grants resources under the active policy
#[derive(Debug)]
pub struct Arbiter {
    ordering: Box<dyn RequestOrdering>,
}

impl Arbiter {
    pub fn new(ordering: Box<dyn RequestOrdering>) -> Self {
        Self { ordering }
    }

    pub fn for_policy(policy: AllocationPolicy, aging_rate: f64) -> Self {
        let ordering: Box<dyn RequestOrdering> = match policy {
            AllocationPolicy::Fifo => Box::new(FifoOrdering),
            AllocationPolicy::Priority => Box::new(StrictPriorityOrdering),
            AllocationPolicy::PriorityAging => Box::new(AgingOrdering { rate: aging_rate }),
        };
        Self::new(ordering)
    }

    pub fn policy_name(&self) -> &'static str {
        self.ordering.name()
    }

    pub fn state_of(resource: &Resource) -> ArbitrationState {
        match (resource.owner(), resource.wait_queue().is_empty()) {
            (Some(_), _) => ArbitrationState::Granted,
            (None, true) => ArbitrationState::Empty,
            (None, false) => ArbitrationState::Pending,
        }
    }

    /// Queue contents in the order they would be served at `now`
    pub fn ordered(&self, requests: &[PendingRequest], now: Timestamp) -> Vec<PendingRequest> {
        let mut ordered = requests.to_vec();
        ordered.sort_by(|a, b| self.ordering.compare(a, b, now));
        ordered
    }

    /// Grant a free resource to the head of its re-sorted queue
    ///
    /// Returns the request that was served; it is no longer in the queue when
    /// this returns.
    pub fn grant_next(&self, resource: &mut Resource, now: Timestamp) -> Option<PendingRequest> {
        if !resource.is_free() || resource.wait_queue().is_empty() {
            return None;
        }
        let queue = resource.wait_queue_mut();
        queue.sort_by(|a, b| self.ordering.compare(a, b, now));
        let head = queue.remove(0);
        resource.grant(head.actor, now, Some(head.waited(now)));
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActorId, Priority, ResourceId};
    use proptest::prelude::*;

    fn request(actor: u32, priority: u32, at_ms: u64) -> PendingRequest {
        PendingRequest::new(ActorId(actor), ResourceId(1), Priority(priority), Timestamp(at_ms * 1000))
    }

    fn queued(requests: &[PendingRequest], owner: u32) -> Resource {
        let mut resource = Resource::new(ResourceId(1), "pool");
        resource.grant(ActorId(owner), Timestamp(0), None);
        for request in requests {
            resource.enqueue(*request);
        }
        resource
    }

    #[test]
    fn test_fifo_serves_arrival_order() {
        let arbiter = Arbiter::for_policy(AllocationPolicy::Fifo, 0.0);
        let mut resource = queued(&[request(2, 9, 20), request(3, 1, 10)], 1);
        resource.clear_owner(Timestamp(30_000));

        let served = arbiter.grant_next(&mut resource, Timestamp(30_000)).unwrap();
        assert_eq!(served.actor, ActorId(3));
        assert_eq!(resource.owner(), Some(ActorId(3)));
        assert!(!resource.is_queued(ActorId(3)));
        assert_eq!(Arbiter::state_of(&resource), ArbitrationState::Granted);
    }

    #[test]
    fn test_strict_priority_with_stable_ties() {
        let arbiter = Arbiter::for_policy(AllocationPolicy::Priority, 0.0);
        let requests = [request(2, 1, 1), request(3, 5, 3), request(4, 5, 2)];
        let order: Vec<_> = arbiter.ordered(&requests, Timestamp(10_000)).iter().map(|r| r.actor).collect();
        assert_eq!(order, vec![ActorId(4), ActorId(3), ActorId(2)]);
    }

    #[test]
    fn test_aging_promotes_old_requests() {
        let arbiter = Arbiter::for_policy(AllocationPolicy::PriorityAging, 100.0);
        // Low priority waiting for 1s gains 100, the fresh high priority request gains ~0.
        let requests = [request(1, 1, 0), request(2, 10, 999)];
        let order: Vec<_> = arbiter.ordered(&requests, Timestamp(1_000_000)).iter().map(|r| r.actor).collect();
        assert_eq!(order, vec![ActorId(1), ActorId(2)]);

        // After 50ms of waiting the low priority request has only gained 5.
        let fresh = [request(1, 1, 0), request(2, 10, 0)];
        let order: Vec<_> = arbiter.ordered(&fresh, Timestamp(50_000)).iter().map(|r| r.actor).collect();
        assert_eq!(order, vec![ActorId(2), ActorId(1)]);
    }

    #[test]
    fn test_grant_next_requires_free_resource() {
        let arbiter = Arbiter::for_policy(AllocationPolicy::Fifo, 0.0);
        let mut resource = queued(&[request(2, 1, 1)], 1);
        assert!(arbiter.grant_next(&mut resource, Timestamp(5_000)).is_none());
        assert_eq!(resource.owner(), Some(ActorId(1)));

        let mut empty = Resource::new(ResourceId(1), "pool");
        assert!(arbiter.grant_next(&mut empty, Timestamp(5_000)).is_none());
        assert_eq!(Arbiter::state_of(&empty), ArbitrationState::Empty);
    }

    proptest! {
        #[test]
        fn prop_strict_priority_head_has_max_priority(entries in proptest::collection::vec((0u32..8, 0u64..1000), 1..20)) {
            let requests: Vec<_> = entries.iter().enumerate().map(|(i, (p, at))| request(i as u32, *p, *at)).collect();
            let arbiter = Arbiter::for_policy(AllocationPolicy::Priority, 0.0);
            let ordered = arbiter.ordered(&requests, Timestamp(2_000_000));
            let max = requests.iter().map(|r| r.priority).max().unwrap();
            prop_assert_eq!(ordered[0].priority, max);
            for pair in ordered.windows(2) {
                prop_assert!(pair[0].priority > pair[1].priority
                    || (pair[0].priority == pair[1].priority && pair[0].enqueued_at <= pair[1].enqueued_at));
            }
        }

        #[test]
        fn prop_zero_rate_aging_matches_strict(entries in proptest::collection::vec((0u32..8, 0u64..1000), 1..20)) {
            let requests: Vec<_> = entries.iter().enumerate().map(|(i, (p, at))| request(i as u32, *p, *at)).collect();
            let strict = Arbiter::for_policy(AllocationPolicy::Priority, 0.0);
            let aging = Arbiter::for_policy(AllocationPolicy::PriorityAging, 0.0);
            let now = Timestamp(2_000_000);
            prop_assert_eq!(strict.ordered(&requests, now), aging.ordered(&requests, now));
        }

        #[test]
        fn prop_fifo_is_sorted_by_arrival(entries in proptest::collection::vec((0u32..8, 0u64..1000), 1..20)) {
            let requests: Vec<_> = entries.iter().enumerate().map(|(i, (p, at))| request(i as u32, *p, *at)).collect();
            let ordered = Arbiter::for_policy(AllocationPolicy::Fifo, 0.0).ordered(&requests, Timestamp(2_000_000));
            for pair in ordered.windows(2) {
                prop_assert!(pair[0].enqueued_at <= pair[1].enqueued_at);
            }
        }
    }
}
