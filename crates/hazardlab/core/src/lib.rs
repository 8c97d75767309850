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

// Resource contention simulation and concurrency hazard detection
// Actors contend for exclusive resources under a pluggable allocation policy
// while a periodic monitor watches for deadlock, livelock and starvation, and
// instrumented critical sections report atomicity and ordering violations.

pub mod actor;
pub mod arbiter;
pub mod clock;
pub mod config;
pub mod context;
pub mod delay;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod order;
pub mod recorder;
pub mod report;
pub mod resource;
pub mod scenario;
pub mod simulation;
pub mod snapshot;
pub mod types;

// Public exports
pub use actor::{Actor, ActorSnapshot, Blocker};
pub use arbiter::{AgingOrdering, Arbiter, ArbitrationState, FifoOrdering, RequestOrdering, StrictPriorityOrdering};
pub use clock::{SimulationClock, Timestamp};
pub use config::{AllocationPolicy, DelayRange, ExecutionMode, SimulationConfig, VictimPolicy};
pub use context::{Grant, SimulationContext};
pub use delay::{DelayStrategy, FaultInjector, FixedDelay, NoDelay, SeededJitter};
pub use engine::{CellReport, ExecutionEngine, GrantGuard, OperationOutcome};
pub use error::{HazardError, HazardResult};
pub use monitor::{HazardDetector, HazardMonitor, MonitorHandle, MonitorSummary, Resolution, SampleAnalysis};
pub use order::{OrderTicket, OrderTracker};
pub use recorder::{Evidence, TracingSubscriber, ViolationRecord, ViolationRecorder, ViolationSubscriber};
pub use report::SimulationReport;
pub use resource::{ContentionStats, PendingRequest, Resource, ResourceSnapshot};
pub use scenario::{ActorSpec, CellSpec, PRESETS, Scenario, Workload};
pub use simulation::Simulation;
pub use snapshot::StateSample;
pub use types::{ActorId, ActorState, CellId, HazardKind, Priority, ResourceId};
