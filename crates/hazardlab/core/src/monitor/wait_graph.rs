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

//! Wait-for graph
//!
//! Edge `A -> B` means actor A is blocked on a resource currently owned by
//! actor B. Cycles are found with a depth-first search that keeps a recursion
//! stack; each cycle is reported once, rotated so its smallest actor id comes
//! first.

use std::collections::{BTreeMap, BTreeSet};

use crate::clock::Timestamp;
use crate::snapshot::StateSample;
use crate::types::{ActorId, ResourceId};

/// A blocking dependency between two actors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitForEdge {
    /// Actor that is waiting
    pub waiter: ActorId,
    /// Actor that owns the resource
    pub holder: ActorId,
    /// Resource being waited for
    pub resource: ResourceId,
    /// When the waiter started waiting
    pub since: Option<Timestamp>,
}

/// A cycle of actors each waiting on the next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitCycle {
    /// Actors in wait order, smallest id first
    pub actors: Vec<ActorId>,
    /// Resources waited on along the cycle, in the same order
    pub resources: Vec<ResourceId>,
}

impl WaitCycle {
    /// Order-independent identity of the cycle
    pub fn key(&self) -> BTreeSet<ActorId> {
        self.actors.iter().copied().collect()
    }

    pub fn contains(&self, actor: ActorId) -> bool {
        self.actors.contains(&actor)
    }
}

/// Directed graph of blocking dependencies built from one state sample
#[derive(Debug, Clone, Default)]
pub struct WaitForGraph {
    edges: BTreeMap<ActorId, Vec<WaitForEdge>>,
    waited_on_by: BTreeMap<ActorId, BTreeSet<ActorId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the graph from who waits on what and who owns it
    pub fn from_sample(sample: &StateSample) -> Self {
        let mut graph = Self::new();
        for actor in &sample.actors {
            let Some(resource) = actor.waiting_on else {
                continue;
            };
            if let Some(holder) = sample.owner_of(resource)
                && holder != actor.id
            {
                graph.add_edge(WaitForEdge {
                    waiter: actor.id,
                    holder,
                    resource,
                    since: actor.wait_started_at,
                });
            }
        }
        graph
    }

    pub fn add_edge(&mut self, edge: WaitForEdge) {
        self.edges.entry(edge.waiter).or_default().push(edge);
        self.waited_on_by.entry(edge.holder).or_default().insert(edge.waiter);
    }

    /// Actors directly blocked by `holder`
    pub fn waiters_of(&self, holder: ActorId) -> impl Iterator<Item = ActorId> + '_ {
        self.waited_on_by.get(&holder).into_iter().flatten().copied()
    }

    pub fn edges_from(&self, waiter: ActorId) -> &[WaitForEdge] {
        self.edges.get(&waiter).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Every elementary cycle reachable by DFS, each reported once
    pub fn detect_cycles(&self) -> Vec<WaitCycle> {
        let mut visited = BTreeSet::new();
        let mut recursion_stack = BTreeSet::new();
        let mut path = Vec::new();
        let mut cycles = Vec::new();

        for &actor in self.edges.keys() {
            if !visited.contains(&actor) {
                self.dfs(actor, &mut visited, &mut recursion_stack, &mut path, &mut cycles);
            }
        }

        let mut seen = BTreeSet::new();
        cycles.retain(|cycle: &WaitCycle| seen.insert(cycle.actors.clone()));
        cycles
    }

    fn dfs(
        &self,
        actor: ActorId,
        visited: &mut BTreeSet<ActorId>,
        recursion_stack: &mut BTreeSet<ActorId>,
        path: &mut Vec<WaitForEdge>,
        cycles: &mut Vec<WaitCycle>,
    ) {
        visited.insert(actor);
        recursion_stack.insert(actor);

        for edge in self.edges_from(actor) {
            path.push(*edge);
            if !visited.contains(&edge.holder) {
                self.dfs(edge.holder, visited, recursion_stack, path, cycles);
            } else if recursion_stack.contains(&edge.holder)
                && let Some(start) = path.iter().position(|step| step.waiter == edge.holder)
            {
                cycles.push(Self::canonical(&path[start..]));
            }
            path.pop();
        }

        recursion_stack.remove(&actor);
    }

    fn canonical(steps: &[WaitForEdge]) -> WaitCycle {
        let pivot = steps
            .iter()
            .enumerate()
            .min_by_key(|(_, step)| step.waiter)
            .map_or(0, |(index, _)| index);
        let rotated = steps[pivot..].iter().chain(&steps[..pivot]);
        let (actors, resources) = rotated.map(|step| (step.waiter, step.resource)).unzip();
        WaitCycle { actors, resources }
    }
}
