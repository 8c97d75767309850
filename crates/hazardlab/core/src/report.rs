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

//! End-of-run report

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{AllocationPolicy, ExecutionMode};
use crate::engine::CellReport;
use crate::monitor::MonitorSummary;
use crate::recorder::{ViolationRecord, count_by_kind};
use crate::scenario::Scenario;
use crate::snapshot::StateSample;
use crate::types::HazardKind;

/// Everything an external reporter needs after a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub scenario: String,
    pub policy: AllocationPolicy,
    pub mode: ExecutionMode,
    pub elapsed_ms: u64,
    pub snapshot: StateSample,
    /// Ordered by detection time
    pub violations: Vec<ViolationRecord>,
    /// Every hazard kind, zero included
    pub counts: BTreeMap<HazardKind, usize>,
    pub cells: Vec<CellReport>,
    pub monitor: MonitorSummary,
}

impl SimulationReport {
    pub fn new(
        scenario: &Scenario,
        snapshot: StateSample,
        violations: Vec<ViolationRecord>,
        cells: Vec<CellReport>,
        monitor: MonitorSummary,
        elapsed: Duration,
    ) -> Self {
        Self {
            scenario: scenario.name.clone(),
            policy: scenario.config.policy,
            mode: scenario.config.mode,
            elapsed_ms: elapsed.as_millis() as u64,
            snapshot,
            counts: count_by_kind(&violations),
            violations,
            cells,
            monitor,
        }
    }

    pub fn count(&self, kind: HazardKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or_default()
    }

    pub fn has_deadlock(&self) -> bool {
        self.count(HazardKind::Deadlock) > 0
    }

    pub fn has_confirmed_atomic_violation(&self) -> bool {
        self.violations
            .iter()
            .any(|record| record.kind == HazardKind::AtomicViolation && record.is_confirmed())
    }

    /// Process exit status: non-zero iff a deadlock or a confirmed atomic violation was recorded
    pub fn exit_code(&self) -> i32 {
        if self.has_deadlock() || self.has_confirmed_atomic_violation() { 1 } else { 0 }
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scenario {} ({:?}, {:?}) ran for {}ms", self.scenario, self.policy, self.mode, self.elapsed_ms)?;
        for (kind, count) in &self.counts {
            writeln!(f, "  {kind}: {count}")?;
        }
        for cell in &self.cells {
            writeln!(
                f,
                "  cell {}: observed {} serialized {} delta {} ({} lost updates)",
                cell.cell, cell.observed, cell.serialized, cell.delta, cell.lost_updates
            )?;
        }
        for actor in &self.snapshot.actors {
            writeln!(
                f,
                "  actor {} {} {}: {} ops, waited {:?}, {} timeouts",
                actor.id,
                actor.name,
                actor.priority,
                actor.completed_ops,
                actor.total_wait(),
                actor.timeouts
            )?;
        }
        Ok(())
    }
}
