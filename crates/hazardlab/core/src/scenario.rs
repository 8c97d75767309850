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

//! Scenario definitions and built-in presets
//!
//! A scenario is the complete input of one run: configuration, resources,
//! shared state cells and the actors with their request patterns. Resource
//! and cell ids are positional, starting at 1.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{AllocationPolicy, DelayRange, ExecutionMode, SimulationConfig};
use crate::error::{HazardError, HazardResult};
use crate::types::{CellId, Priority, ResourceId};

/// Request pattern an actor repeats every iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Workload {
    /// Block on each resource in turn while holding the previous ones
    HoldAndWait {
        resources: Vec<ResourceId>,
        hold_ms: u64,
        /// Acquire in ascending id order instead of the listed order
        #[serde(default)]
        ordered: bool,
    },
    /// Take the first resource, try the rest, back off and start over on failure
    Polite { resources: Vec<ResourceId>, hold_ms: u64 },
    /// Repeatedly hold a single resource
    Exclusive { resource: ResourceId, hold_ms: u64 },
    /// Read-delay-write increment of a shared cell
    Counter { cell: CellId, delta: i64 },
    /// Like `Counter`, with the intended order fixed when the request is made
    Ticketed { cell: CellId, delta: i64 },
}

impl Workload {
    /// Resources in the order the workload acquires them
    pub fn acquisition_order(&self) -> Vec<ResourceId> {
        match self {
            Self::HoldAndWait { resources, ordered, .. } => {
                let mut order = resources.clone();
                if *ordered {
                    order.sort_unstable();
                    order.dedup();
                }
                order
            }
            Self::Polite { resources, .. } => resources.clone(),
            Self::Exclusive { resource, .. } => vec![*resource],
            Self::Counter { .. } | Self::Ticketed { .. } => Vec::new(),
        }
    }

    pub fn hold(&self) -> Duration {
        match self {
            Self::HoldAndWait { hold_ms, .. } | Self::Polite { hold_ms, .. } | Self::Exclusive { hold_ms, .. } => Duration::from_millis(*hold_ms),
            Self::Counter { .. } | Self::Ticketed { .. } => Duration::ZERO,
        }
    }
}

/// One simulated participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorSpec {
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    /// Number of operations to complete; `None` repeats until the run ends
    #[serde(default)]
    pub iterations: Option<u64>,
    /// Pause between operations
    #[serde(default)]
    pub think_ms: u64,
    pub workload: Workload,
}

/// Shared integer state guarded by one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSpec {
    pub guard: ResourceId,
    #[serde(default)]
    pub initial: i64,
}

/// Complete input of a simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: SimulationConfig,
    /// Resource names; the resource at index `i` gets id `i + 1`
    pub resources: Vec<String>,
    #[serde(default)]
    pub cells: Vec<CellSpec>,
    pub actors: Vec<ActorSpec>,
}

impl Scenario {
    pub fn from_json(json: &str) -> HazardResult<Self> {
        let scenario: Self = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn check_resource(&self, actor: &str, resource: ResourceId) -> HazardResult<()> {
        if resource.0 == 0 || resource.0 as usize > self.resources.len() {
            return Err(HazardError::Scenario(format!("actor {actor} references unknown resource {resource}")));
        }
        Ok(())
    }

    fn check_cell(&self, actor: &str, cell: CellId) -> HazardResult<()> {
        if cell.0 == 0 || cell.0 as usize > self.cells.len() {
            return Err(HazardError::Scenario(format!("actor {actor} references unknown cell {cell}")));
        }
        Ok(())
    }

    /// Check every cross reference and the embedded configuration
    pub fn validate(&self) -> HazardResult<()> {
        self.config.validate()?;
        if self.actors.is_empty() {
            return Err(HazardError::Scenario("scenario has no actors".to_string()));
        }
        for (index, cell) in self.cells.iter().enumerate() {
            self.check_resource(&format!("cell #{}", index + 1), cell.guard)?;
        }
        for actor in &self.actors {
            match &actor.workload {
                Workload::HoldAndWait { resources, .. } | Workload::Polite { resources, .. } => {
                    if resources.is_empty() {
                        return Err(HazardError::Scenario(format!("actor {} has an empty resource list", actor.name)));
                    }
                    for resource in resources {
                        self.check_resource(&actor.name, *resource)?;
                    }
                    if matches!(actor.workload, Workload::Polite { .. }) && resources.len() < 2 {
                        return Err(HazardError::Scenario(format!("polite actor {} needs at least two resources", actor.name)));
                    }
                }
                Workload::Exclusive { resource, .. } => self.check_resource(&actor.name, *resource)?,
                Workload::Counter { cell, .. } | Workload::Ticketed { cell, .. } => self.check_cell(&actor.name, *cell)?,
            }
        }
        Ok(())
    }

    /// Built-in scenario by name
    pub fn preset(name: &str) -> HazardResult<Self> {
        let scenario = match name {
            "deadlock" => crossed_locks(false),
            "ordered-locking" => crossed_locks(true),
            "livelock" => polite_pair(),
            "starvation" => priority_pool(),
            "atomicity" => shared_counter(),
            "ordering" => ticket_queue(),
            "contention" => busy_pool(),
            other => {
                let known: Vec<&str> = PRESETS.iter().map(|(name, _)| *name).collect();
                return Err(HazardError::Scenario(format!("unknown preset {other:?}, expected one of {}", known.join(", "))));
            }
        };
        scenario.validate()?;
        Ok(scenario)
    }
}

/// Names and one-line descriptions of the built-in presets
pub const PRESETS: &[(&str, &str)] = &[
    ("deadlock", "two actors acquire two resources in opposite order"),
    ("ordered-locking", "the deadlock preset with a global acquisition order"),
    ("livelock", "two polite actors keep backing off from each other"),
    ("starvation", "strict priority keeps a low priority actor waiting"),
    ("atomicity", "unguarded read-delay-write increments lose updates"),
    ("ordering", "ticketed operations complete out of their intended order"),
    ("contention", "six actors share three resources under FIFO"),
];

fn actor(name: &str, priority: u32, iterations: Option<u64>, workload: Workload) -> ActorSpec {
    ActorSpec {
        name: name.to_string(),
        priority: Priority(priority),
        iterations,
        think_ms: 0,
        workload,
    }
}

fn crossed_locks(ordered: bool) -> Scenario {
    let iterations = if ordered { Some(20) } else { Some(1) };
    Scenario {
        name: if ordered { "ordered-locking" } else { "deadlock" }.to_string(),
        config: SimulationConfig {
            acquire_timeout_ms: 10_000,
            run_duration_ms: 1_500,
            ..SimulationConfig::default()
        },
        resources: vec!["left-fork".to_string(), "right-fork".to_string()],
        cells: Vec::new(),
        actors: vec![
            actor(
                "philosopher-1",
                1,
                iterations,
                Workload::HoldAndWait {
                    resources: vec![ResourceId(1), ResourceId(2)],
                    hold_ms: 50,
                    ordered,
                },
            ),
            actor(
                "philosopher-2",
                1,
                iterations,
                Workload::HoldAndWait {
                    resources: vec![ResourceId(2), ResourceId(1)],
                    hold_ms: 50,
                    ordered,
                },
            ),
        ],
    }
}

fn polite_pair() -> Scenario {
    Scenario {
        name: "livelock".to_string(),
        config: SimulationConfig {
            livelock_threshold_ms: 500,
            backoff_ms: DelayRange::fixed(10),
            max_retries: 3,
            run_duration_ms: 2_000,
            ..SimulationConfig::default()
        },
        resources: vec!["corridor-left".to_string(), "corridor-right".to_string()],
        cells: Vec::new(),
        actors: vec![
            actor(
                "walker-1",
                1,
                None,
                Workload::Polite {
                    resources: vec![ResourceId(1), ResourceId(2)],
                    hold_ms: 20,
                },
            ),
            actor(
                "walker-2",
                1,
                None,
                Workload::Polite {
                    resources: vec![ResourceId(2), ResourceId(1)],
                    hold_ms: 20,
                },
            ),
        ],
    }
}

fn priority_pool() -> Scenario {
    let worker = |name: &str, priority| {
        actor(
            name,
            priority,
            None,
            Workload::Exclusive {
                resource: ResourceId(1),
                hold_ms: 2,
            },
        )
    };
    Scenario {
        name: "starvation".to_string(),
        config: SimulationConfig {
            policy: AllocationPolicy::Priority,
            starvation_threshold_ms: 500,
            acquire_timeout_ms: 10_000,
            run_duration_ms: 1_500,
            ..SimulationConfig::default()
        },
        resources: vec!["printer".to_string()],
        cells: Vec::new(),
        actors: vec![worker("urgent-1", 10), worker("urgent-2", 10), worker("background", 1)],
    }
}

fn shared_counter() -> Scenario {
    Scenario {
        name: "atomicity".to_string(),
        config: SimulationConfig {
            mode: ExecutionMode::Unguarded,
            processing_delay_ms: DelayRange { min: 1, max: 5 },
            ..SimulationConfig::default()
        },
        resources: vec!["balance-lock".to_string()],
        cells: vec![CellSpec {
            guard: ResourceId(1),
            initial: 0,
        }],
        actors: (1..=10)
            .map(|i| actor(&format!("depositor-{i}"), 1, Some(5), Workload::Counter { cell: CellId(1), delta: 1 }))
            .collect(),
    }
}

fn ticket_queue() -> Scenario {
    Scenario {
        name: "ordering".to_string(),
        config: SimulationConfig {
            mode: ExecutionMode::Unguarded,
            processing_delay_ms: DelayRange { min: 1, max: 10 },
            ..SimulationConfig::default()
        },
        resources: vec!["seat-map".to_string()],
        cells: vec![CellSpec {
            guard: ResourceId(1),
            initial: 0,
        }],
        actors: (1..=5)
            .map(|i| actor(&format!("booking-{i}"), 1, Some(4), Workload::Ticketed { cell: CellId(1), delta: 1 }))
            .collect(),
    }
}

fn busy_pool() -> Scenario {
    let workloads = [(1, 3), (2, 2), (3, 4), (1, 1), (2, 3), (3, 2)];
    Scenario {
        name: "contention".to_string(),
        config: SimulationConfig {
            run_duration_ms: 1_000,
            ..SimulationConfig::default()
        },
        resources: vec!["pool-a".to_string(), "pool-b".to_string(), "pool-c".to_string()],
        cells: Vec::new(),
        actors: workloads
            .iter()
            .enumerate()
            .map(|(i, (resource, hold_ms))| {
                let mut spec = actor(
                    &format!("client-{}", i + 1),
                    1,
                    Some(25),
                    Workload::Exclusive {
                        resource: ResourceId(*resource),
                        hold_ms: *hold_ms,
                    },
                );
                spec.think_ms = 1;
                spec
            })
            .collect(),
    }
}
