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

//! Execution engine
//!
//! Every operation is a `read -> processing delay -> write` template over a
//! shared integer cell guarded by one resource. Guarded mode runs the whole
//! template inside one acquisition. Unguarded mode releases the guard between
//! the read and the write, so concurrent operations can overwrite each other.
//!
//! Each cell also keeps a serialized ledger: every committed operation is
//! applied to it in commit order, which is the value a serial execution of
//! the same operations would have produced. Comparing the two at the end of a
//! run quantifies an atomicity violation instead of leaving it to the logs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Timestamp;
use crate::config::ExecutionMode;
use crate::context::SimulationContext;
use crate::delay::DelayStrategy;
use crate::error::{HazardError, HazardResult};
use crate::recorder::{Evidence, ViolationRecord};
use crate::types::{ActorId, CellId, HazardKind, ResourceId};

/// Ownership of one resource that is released when dropped
///
/// Dropping the guard on an error path releases the resource; a release that
/// fails because the actor was already stripped of it is only logged.
#[must_use = "dropping the guard releases the resource immediately"]
pub struct GrantGuard<'a> {
    ctx: &'a SimulationContext,
    actor: ActorId,
    resource: ResourceId,
    waited: Duration,
    released: bool,
}

impl<'a> GrantGuard<'a> {
    pub fn acquire(ctx: &'a SimulationContext, actor: ActorId, resource: ResourceId, timeout: Duration) -> HazardResult<Self> {
        let grant = ctx.acquire(actor, resource, timeout)?;
        Ok(Self {
            ctx,
            actor,
            resource,
            waited: grant.waited,
            released: false,
        })
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Release explicitly, surfacing `NotOwner`
    pub fn release(mut self) -> HazardResult<()> {
        self.released = true;
        self.ctx.release(self.actor, self.resource)
    }
}

impl Drop for GrantGuard<'_> {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.ctx.release(self.actor, self.resource)
        {
            match e {
                HazardError::NotOwner { .. } => debug!(actor = %self.actor, resource = %self.resource, "guard already released"),
                other => warn!(actor = %self.actor, resource = %self.resource, error = %other, "failed to release guard"),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StateCell {
    guard: ResourceId,
    initial: i64,
    value: i64,
    version: u64,
    serialized: i64,
    last_writer: Option<ActorId>,
    writers: BTreeSet<ActorId>,
    lost_updates: u64,
}

struct Commit {
    version: u64,
    overwritten: Option<(u64, Option<ActorId>)>,
}

/// Result of one engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub cell: CellId,
    pub read: i64,
    pub written: i64,
    pub version: u64,
    /// The write overwrote a version this operation never read
    pub lost_update: bool,
}

/// Observed versus serialized-equivalent value of a cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellReport {
    pub cell: CellId,
    pub guard: ResourceId,
    pub initial: i64,
    pub observed: i64,
    pub serialized: i64,
    /// `observed - serialized`, wrapping on overflow
    pub delta: i64,
    pub operations: u64,
    pub lost_updates: u64,
}

impl CellReport {
    pub fn is_consistent(&self) -> bool {
        self.delta == 0
    }
}

/// Runs actor operations against shared state cells
pub struct ExecutionEngine {
    ctx: Arc<SimulationContext>,
    delay: Arc<dyn DelayStrategy>,
    cells: Mutex<BTreeMap<CellId, StateCell>>,
}

impl ExecutionEngine {
    pub fn new(ctx: Arc<SimulationContext>, delay: Arc<dyn DelayStrategy>) -> Self {
        Self {
            ctx,
            delay,
            cells: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<SimulationContext> {
        &self.ctx
    }

    pub fn delay(&self) -> &Arc<dyn DelayStrategy> {
        &self.delay
    }

    /// Register a cell guarded by `guard`; ids are assigned sequentially from 1
    pub fn add_cell(&self, guard: ResourceId, initial: i64) -> CellId {
        let mut cells = self.cells.lock();
        let id = CellId(cells.keys().next_back().map_or(1, |last| last.0 + 1));
        cells.insert(
            id,
            StateCell {
                guard,
                initial,
                value: initial,
                version: 0,
                serialized: initial,
                last_writer: None,
                writers: BTreeSet::new(),
                lost_updates: 0,
            },
        );
        id
    }

    pub fn guard_of(&self, cell: CellId) -> HazardResult<ResourceId> {
        self.cells.lock().get(&cell).map(|state| state.guard).ok_or(HazardError::UnknownCell(cell))
    }

    /// Current value of a cell
    pub fn value(&self, cell: CellId) -> HazardResult<i64> {
        self.cells.lock().get(&cell).map(|state| state.value).ok_or(HazardError::UnknownCell(cell))
    }

    /// Run `op` on `cell` in `mode`
    ///
    /// Whatever the outcome, the actor holds none of the cell's resources when
    /// this returns and an aborted operation leaves the actor `Idle`.
    pub fn run_operation<F>(&self, actor: ActorId, cell: CellId, mode: ExecutionMode, op: F) -> HazardResult<OperationOutcome>
    where
        F: Fn(i64) -> i64,
    {
        let guard = self.guard_of(cell)?;
        let result = match mode {
            ExecutionMode::Guarded => self.run_guarded(actor, cell, guard, &op),
            ExecutionMode::Unguarded => self.run_unguarded(actor, cell, guard, &op),
        };
        if let Err(e) = &result {
            debug!(%actor, %cell, error = %e, "operation aborted");
            self.ctx.roll_back(actor)?;
        }
        result
    }

    fn run_guarded(&self, actor: ActorId, cell: CellId, guard: ResourceId, op: &dyn Fn(i64) -> i64) -> HazardResult<OperationOutcome> {
        let timeout = self.ctx.config().acquire_timeout();
        let lock = GrantGuard::acquire(&self.ctx, actor, guard, timeout)?;
        self.ctx.begin_work(actor)?;

        let (read, read_version) = self.read(cell)?;
        self.pause(actor)?;
        let written = op(read);
        let commit = self.commit(cell, actor, read_version, written, op)?;

        self.ctx.complete_operation(actor)?;
        lock.release()?;
        Ok(OperationOutcome {
            cell,
            read,
            written,
            version: commit.version,
            lost_update: false,
        })
    }

    fn run_unguarded(&self, actor: ActorId, cell: CellId, guard: ResourceId, op: &dyn Fn(i64) -> i64) -> HazardResult<OperationOutcome> {
        let timeout = self.ctx.config().acquire_timeout();

        let lock = GrantGuard::acquire(&self.ctx, actor, guard, timeout)?;
        let (read, read_version) = self.read(cell)?;
        lock.release()?;

        self.ctx.begin_work(actor)?;
        self.pause(actor)?;
        let written = op(read);

        let lock = GrantGuard::acquire(&self.ctx, actor, guard, timeout)?;
        let commit = self.commit(cell, actor, read_version, written, op)?;
        lock.release()?;

        if let Some((overwritten_version, previous_writer)) = commit.overwritten {
            let mut involved = vec![actor];
            involved.extend(previous_writer);
            self.ctx.recorder().append(ViolationRecord::new(
                HazardKind::AtomicViolation,
                involved,
                self.ctx.now(),
                Evidence::LostUpdate {
                    cell,
                    read_value: read,
                    read_version,
                    overwritten_version,
                    written_value: written,
                },
            ));
        }

        self.ctx.complete_operation(actor)?;
        Ok(OperationOutcome {
            cell,
            read,
            written,
            version: commit.version,
            lost_update: commit.overwritten.is_some(),
        })
    }

    fn pause(&self, actor: ActorId) -> HazardResult<()> {
        let delay = self.delay.processing_delay(actor)?;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn read(&self, cell: CellId) -> HazardResult<(i64, u64)> {
        let cells = self.cells.lock();
        let state = cells.get(&cell).ok_or(HazardError::UnknownCell(cell))?;
        Ok((state.value, state.version))
    }

    fn commit(&self, cell: CellId, actor: ActorId, read_version: u64, written: i64, op: &dyn Fn(i64) -> i64) -> HazardResult<Commit> {
        let mut cells = self.cells.lock();
        let state = cells.get_mut(&cell).ok_or(HazardError::UnknownCell(cell))?;
        let overwritten = (state.version != read_version).then_some((state.version, state.last_writer));
        if overwritten.is_some() {
            state.lost_updates += 1;
        }
        state.value = written;
        state.serialized = op(state.serialized);
        state.version += 1;
        state.last_writer = Some(actor);
        state.writers.insert(actor);
        Ok(Commit {
            version: state.version,
            overwritten,
        })
    }

    /// Compare every cell with its serialized ledger, recording each mismatch
    /// as a confirmed atomic violation
    pub fn verify_cells(&self, at: Timestamp) -> Vec<CellReport> {
        let cells = self.cells.lock();
        let mut reports = Vec::with_capacity(cells.len());
        for (id, state) in cells.iter() {
            let report = CellReport {
                cell: *id,
                guard: state.guard,
                initial: state.initial,
                observed: state.value,
                serialized: state.serialized,
                delta: state.value.wrapping_sub(state.serialized),
                operations: state.version,
                lost_updates: state.lost_updates,
            };
            if !report.is_consistent() {
                self.ctx.recorder().append(ViolationRecord::new(
                    HazardKind::AtomicViolation,
                    state.writers.iter().copied().collect(),
                    at,
                    Evidence::Discrepancy {
                        cell: *id,
                        observed: report.observed,
                        serialized: report.serialized,
                        delta: report.delta,
                    },
                ));
            }
            reports.push(report);
        }
        reports
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("delay", &self.delay)
            .field("cells", &self.cells.lock().len())
            .finish()
    }
}
