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

//! Hazard Monitor
//!
//! A periodic observer that samples the simulation state on a fixed cadence
//! and runs its detectors over each sample. The monitor is read-only with
//! respect to actors and resources; the one exception is deadlock
//! resolution, which goes through `SimulationContext::victimize` like any
//! other engine transition.
//!
//! Detectors run in a fixed order (deadlock, livelock, starvation) and share
//! a per-sample [`SampleAnalysis`], so a later detector can skip actors whose
//! lack of progress is already explained by an earlier hazard.

pub mod deadlock;
pub mod livelock;
pub mod starvation;
pub mod wait_graph;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub use deadlock::DeadlockDetector;
pub use livelock::LivelockDetector;
pub use starvation::StarvationDetector;
pub use wait_graph::{WaitCycle, WaitForEdge, WaitForGraph};

use crate::context::SimulationContext;
use crate::error::{HazardError, HazardResult};
use crate::recorder::ViolationRecord;
use crate::snapshot::StateSample;
use crate::types::{ActorId, ResourceId};

/// A forced release the deadlock detector asks the monitor to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub victim: ActorId,
    /// What the victim held in the sample the decision was based on
    pub held: Vec<ResourceId>,
    pub cycle: Vec<ActorId>,
}

/// Findings shared between detectors while one sample is inspected
#[derive(Debug, Clone, Default)]
pub struct SampleAnalysis {
    pub graph: WaitForGraph,
    pub cycles: Vec<WaitCycle>,
    /// Members of any current wait-for cycle, confirmed or not
    pub deadlocked: BTreeSet<ActorId>,
    /// Members of a group the livelock detector flagged in this sample
    pub livelocked: BTreeSet<ActorId>,
    pub resolutions: Vec<Resolution>,
}

impl SampleAnalysis {
    pub fn new(sample: &StateSample) -> Self {
        let graph = WaitForGraph::from_sample(sample);
        let cycles = graph.detect_cycles();
        let deadlocked = cycles.iter().flat_map(|cycle| cycle.actors.iter().copied()).collect();
        Self {
            graph,
            cycles,
            deadlocked,
            livelocked: BTreeSet::new(),
            resolutions: Vec::new(),
        }
    }

    /// Whether the actor's lack of progress is already attributed to a deadlock or livelock
    pub fn is_explained(&self, actor: ActorId) -> bool {
        self.deadlocked.contains(&actor) || self.livelocked.contains(&actor)
    }
}

/// A detection algorithm run once per sample
pub trait HazardDetector: Send {
    fn name(&self) -> &'static str;

    /// Inspect one sample and return new findings
    ///
    /// Detectors keep their own episode state so a persisting hazard is
    /// reported once, not once per sample.
    fn inspect(&mut self, sample: &StateSample, analysis: &mut SampleAnalysis) -> Vec<ViolationRecord>;
}

/// Counters describing a finished monitor run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSummary {
    pub samples: u64,
    pub records: u64,
    pub victims: Vec<ActorId>,
    pub resolution_failures: u64,
}

/// Periodic hazard observer
pub struct HazardMonitor {
    ctx: Arc<SimulationContext>,
    detectors: Vec<Box<dyn HazardDetector>>,
    summary: MonitorSummary,
}

impl HazardMonitor {
    /// Monitor running the built-in detectors configured from the context
    pub fn new(ctx: Arc<SimulationContext>) -> Self {
        let config = ctx.config();
        let detectors: Vec<Box<dyn HazardDetector>> = vec![
            Box::new(DeadlockDetector::new(
                config.deadlock_recheck_window(),
                config.resolve_deadlocks,
                config.victim_policy,
            )),
            Box::new(LivelockDetector::new(config.livelock_threshold(), config.livelock_groups.clone())),
            Box::new(StarvationDetector::new(config.starvation_threshold())),
        ];
        Self::with_detectors(ctx, detectors)
    }

    pub fn with_detectors(ctx: Arc<SimulationContext>, detectors: Vec<Box<dyn HazardDetector>>) -> Self {
        Self {
            ctx,
            detectors,
            summary: MonitorSummary::default(),
        }
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|detector| detector.name()).collect()
    }

    pub fn summary(&self) -> &MonitorSummary {
        &self.summary
    }

    /// Take one sample, run every detector, record findings and apply resolutions
    pub fn sample_once(&mut self) -> HazardResult<Vec<ViolationRecord>> {
        if let Err(e) = self.ctx.verify_invariants() {
            self.dump_state(&e);
            return Err(e);
        }

        let sample = self.ctx.sample();
        let mut analysis = SampleAnalysis::new(&sample);
        let mut records = Vec::new();
        for detector in &mut self.detectors {
            records.extend(detector.inspect(&sample, &mut analysis));
        }

        for record in &records {
            self.ctx.recorder().append(record.clone());
        }
        self.summary.samples += 1;
        self.summary.records += records.len() as u64;

        for resolution in analysis.resolutions {
            self.resolve(&resolution)?;
        }
        Ok(records)
    }

    fn resolve(&mut self, resolution: &Resolution) -> HazardResult<()> {
        match self.ctx.victimize(resolution.victim, &resolution.held) {
            Ok(released) => {
                info!(victim = %resolution.victim, cycle = ?resolution.cycle, released = ?released, "deadlock resolved");
                self.summary.victims.push(resolution.victim);
                Ok(())
            }
            Err(e @ HazardError::VictimizationFailure { .. }) => {
                // Stale sample; the next one decides again.
                warn!(error = %e, "victimization failed");
                self.summary.resolution_failures += 1;
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                self.dump_state(&e);
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "deadlock resolution skipped");
                self.summary.resolution_failures += 1;
                Ok(())
            }
        }
    }

    fn dump_state(&self, cause: &HazardError) {
        let sample = self.ctx.sample();
        match serde_json::to_string(&sample) {
            Ok(dump) => error!(error = %cause, state = %dump, "engine invariant violated, halting run"),
            Err(e) => error!(error = %cause, dump_error = %e, "engine invariant violated, halting run"),
        }
    }

    /// Run on a background thread until stopped
    pub fn spawn(mut self) -> HazardResult<MonitorHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let interval = self.ctx.config().monitor_cadence();
        info!(interval_ms = interval.as_millis() as u64, detectors = ?self.detector_names(), "hazard monitor started");

        let handle = std::thread::Builder::new()
            .name("hazard-monitor".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    if let Err(e) = self.sample_once() {
                        self.ctx.shutdown();
                        return Err(e);
                    }
                    std::thread::sleep(interval);
                }
                info!(samples = self.summary.samples, records = self.summary.records, "hazard monitor stopped");
                Ok(self.summary)
            })
            .map_err(|e| HazardError::InvalidConfig(format!("failed to spawn monitor thread: {e}")))?;

        Ok(MonitorHandle { stop, handle })
    }
}

impl std::fmt::Debug for HazardMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HazardMonitor")
            .field("detectors", &self.detector_names())
            .field("summary", &self.summary)
            .finish()
    }
}

/// Handle to a running monitor thread
#[derive(Debug)]
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<HazardResult<MonitorSummary>>,
}

impl MonitorHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop sampling and wait for the thread
    pub fn stop(self) -> HazardResult<MonitorSummary> {
        self.stop.store(true, Ordering::Release);
        self.handle.join().unwrap_or_else(|_| {
            error!("hazard monitor thread panicked");
            Err(HazardError::Cancelled)
        })
    }
}
