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

//! Simulation driver
//!
//! Builds the context from a scenario, runs one thread per actor plus the
//! hazard monitor, stops everything after the run duration or once every
//! actor has finished, and assembles the final report.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::context::SimulationContext;
use crate::delay::{DelayStrategy, SeededJitter};
use crate::engine::ExecutionEngine;
use crate::error::{HazardError, HazardResult};
use crate::monitor::HazardMonitor;
use crate::order::OrderTracker;
use crate::recorder::ViolationRecorder;
use crate::report::SimulationReport;
use crate::scenario::{ActorSpec, Scenario, Workload};
use crate::types::{ActorId, ResourceId};

/// A fully wired simulation ready to run
pub struct Simulation {
    scenario: Scenario,
    ctx: Arc<SimulationContext>,
    engine: ExecutionEngine,
    orders: OrderTracker,
    actors: Vec<(ActorId, ActorSpec)>,
}

impl Simulation {
    /// Simulation with seeded jitter delays and a tracing-backed recorder
    pub fn new(scenario: Scenario) -> HazardResult<Self> {
        let delay = Arc::new(SeededJitter::from_config(&scenario.config));
        Self::with_parts(scenario, delay, Arc::new(ViolationRecorder::with_tracing()))
    }

    pub fn with_parts(scenario: Scenario, delay: Arc<dyn DelayStrategy>, recorder: Arc<ViolationRecorder>) -> HazardResult<Self> {
        scenario.validate()?;
        let ctx = Arc::new(SimulationContext::with_recorder(scenario.config.clone(), recorder.clone())?);
        for name in &scenario.resources {
            ctx.add_resource(name.clone());
        }
        let engine = ExecutionEngine::new(ctx.clone(), delay);
        for cell in &scenario.cells {
            engine.add_cell(cell.guard, cell.initial);
        }
        let actors = scenario
            .actors
            .iter()
            .map(|spec| (ctx.add_actor(spec.name.clone(), spec.priority), spec.clone()))
            .collect();
        let orders = OrderTracker::new(*ctx.clock(), recorder);
        Ok(Self {
            scenario,
            ctx,
            engine,
            orders,
            actors,
        })
    }

    pub fn context(&self) -> &Arc<SimulationContext> {
        &self.ctx
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Run to completion and return the final report
    ///
    /// Fails only on engine faults (`QueueInvariantViolation`, `NotOwner`,
    /// `ActorPanicked`); simulated hazards end up in the report.
    pub fn run(self) -> HazardResult<SimulationReport> {
        let started = Instant::now();
        let run_duration = self.ctx.config().run_duration();
        let poll = self.ctx.config().sampling_interval().min(Duration::from_millis(5));
        info!(
            scenario = %self.scenario.name,
            actors = self.actors.len(),
            duration_ms = run_duration.as_millis() as u64,
            "simulation started"
        );

        let monitor = HazardMonitor::new(self.ctx.clone()).spawn()?;
        let outcomes: Vec<HazardResult<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .actors
                .iter()
                .map(|(id, spec)| {
                    let runner = ActorRunner {
                        id: *id,
                        spec,
                        ctx: &self.ctx,
                        engine: &self.engine,
                        orders: &self.orders,
                    };
                    (*id, scope.spawn(move || runner.run()))
                })
                .collect();

            while started.elapsed() < run_duration && !self.ctx.all_finished() && !monitor.is_finished() {
                std::thread::sleep(poll);
            }
            self.ctx.shutdown();

            handles
                .into_iter()
                .map(|(id, handle)| {
                    handle.join().unwrap_or_else(|payload| {
                        let message = panic_message(payload.as_ref());
                        error!(actor = %id, panic = %message, "actor thread panicked");
                        Err(HazardError::ActorPanicked { actor: id, message })
                    })
                })
                .collect()
        });
        let monitor = monitor.stop()?;

        if let Some(fault) = outcomes.into_iter().find_map(Result::err) {
            error!(error = %fault, "simulation aborted");
            return Err(fault);
        }
        self.ctx.verify_invariants()?;

        let cells = self.engine.verify_cells(self.ctx.now());
        let report = SimulationReport::new(&self.scenario, self.ctx.sample(), self.ctx.recorder().records(), cells, monitor, started.elapsed());
        info!(
            scenario = %self.scenario.name,
            violations = report.violations.len(),
            exit_code = report.exit_code(),
            "simulation finished"
        );
        Ok(report)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("scenario", &self.scenario.name)
            .field("ctx", &self.ctx)
            .field("engine", &self.engine)
            .finish()
    }
}

/// The task driving one actor
struct ActorRunner<'a> {
    id: ActorId,
    spec: &'a ActorSpec,
    ctx: &'a SimulationContext,
    engine: &'a ExecutionEngine,
    orders: &'a OrderTracker,
}

impl ActorRunner<'_> {
    /// Only engine faults are returned; cancellation ends the run normally
    fn run(&self) -> HazardResult<()> {
        let result = self.run_iterations();
        if let Err(e) = self.ctx.release_all(self.id) {
            warn!(actor = %self.id, error = %e, "release on exit failed");
        }
        match result {
            Ok(()) | Err(HazardError::Cancelled) => {
                self.ctx.roll_back(self.id)?;
                self.ctx.finish(self.id)?;
                debug!(actor = %self.id, "actor finished");
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    self.ctx.shutdown();
                }
                Err(e)
            }
        }
    }

    fn run_iterations(&self) -> HazardResult<()> {
        let think = Duration::from_millis(self.spec.think_ms);
        let mut iteration = 0u64;
        while self.spec.iterations.is_none_or(|limit| iteration < limit) {
            if self.ctx.is_stopping() {
                return Err(HazardError::Cancelled);
            }
            self.run_iteration()?;
            iteration += 1;
            if !think.is_zero() {
                std::thread::sleep(think);
            }
        }
        Ok(())
    }

    fn run_iteration(&self) -> HazardResult<()> {
        let mode = self.ctx.config().mode;
        match &self.spec.workload {
            Workload::HoldAndWait { .. } | Workload::Exclusive { .. } => {
                let order = self.spec.workload.acquisition_order();
                let hold = self.spec.workload.hold();
                self.with_retries(|| self.hold_and_wait(&order, hold)).map(|_| ())
            }
            Workload::Polite { resources, hold_ms } => self.polite(resources, Duration::from_millis(*hold_ms)),
            Workload::Counter { cell, delta } => {
                let delta = *delta;
                self.with_retries(|| self.engine.run_operation(self.id, *cell, mode, |value| value.wrapping_add(delta)))
                    .map(|_| ())
            }
            Workload::Ticketed { cell, delta } => {
                let delta = *delta;
                let ticket = self.orders.register(self.id, None);
                if self
                    .with_retries(|| self.engine.run_operation(self.id, *cell, mode, |value| value.wrapping_add(delta)))?
                    .is_some()
                {
                    self.orders.complete(ticket);
                }
                Ok(())
            }
        }
    }

    /// Retry a recoverable failure up to the configured budget
    ///
    /// Returns `None` when the budget ran out; the operation is abandoned.
    fn with_retries<T>(&self, mut attempt: impl FnMut() -> HazardResult<T>) -> HazardResult<Option<T>> {
        let budget = self.ctx.config().max_retries;
        let mut failures = 0u32;
        loop {
            match attempt() {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_recoverable() => {
                    self.ctx.release_all(self.id)?;
                    self.ctx.roll_back(self.id)?;
                    failures += 1;
                    if failures > budget {
                        warn!(actor = %self.id, error = %e, failures, "retry budget exhausted, abandoning operation");
                        return Ok(None);
                    }
                    debug!(actor = %self.id, error = %e, failures, "retrying operation");
                    let backoff = self.engine.delay().backoff(self.id);
                    if !backoff.is_zero() {
                        std::thread::sleep(backoff);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquire every resource in order, holding each for `hold`, then work
    fn hold_and_wait(&self, order: &[ResourceId], hold: Duration) -> HazardResult<()> {
        let timeout = self.ctx.config().acquire_timeout();
        for (index, resource) in order.iter().enumerate() {
            self.ctx.acquire(self.id, *resource, timeout)?;
            if index + 1 < order.len() && !hold.is_zero() {
                std::thread::sleep(hold);
            }
        }
        self.ctx.begin_work(self.id)?;
        if !hold.is_zero() {
            std::thread::sleep(hold);
        }
        self.ctx.complete_operation(self.id)?;
        self.ctx.release_all(self.id)?;
        Ok(())
    }

    /// Take the first resource, then politely try the others
    ///
    /// The actor keeps what it has while it tries, backing off between tries;
    /// after `max_retries` tries it gives everything back, backs off once more
    /// and starts over. Giving up is not progress.
    fn polite(&self, resources: &[ResourceId], hold: Duration) -> HazardResult<()> {
        let timeout = self.ctx.config().acquire_timeout();
        let patience = self.ctx.config().max_retries.max(1);
        let Some((first, rest)) = resources.split_first() else {
            return Ok(());
        };

        loop {
            if self.ctx.is_stopping() {
                return Err(HazardError::Cancelled);
            }
            match self.ctx.acquire(self.id, *first, timeout) {
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    self.ctx.release_all(self.id)?;
                    self.ctx.roll_back(self.id)?;
                    continue;
                }
                Err(e) => return Err(e),
            }
            std::thread::sleep(hold);

            let mut pending: Vec<ResourceId> = rest.to_vec();
            for _ in 0..patience {
                let mut still_pending = Vec::with_capacity(pending.len());
                for resource in pending {
                    if !self.ctx.try_acquire(self.id, resource)? {
                        still_pending.push(resource);
                    }
                }
                pending = still_pending;
                if pending.is_empty() {
                    break;
                }
                std::thread::sleep(self.engine.delay().backoff(self.id));
            }

            if pending.is_empty() {
                self.ctx.begin_work(self.id)?;
                std::thread::sleep(hold);
                self.ctx.complete_operation(self.id)?;
                self.ctx.release_all(self.id)?;
                return Ok(());
            }

            debug!(actor = %self.id, missing = ?pending, "polite actor backing off");
            self.ctx.release_all(self.id)?;
            self.ctx.roll_back(self.id)?;
            std::thread::sleep(self.engine.delay().backoff(self.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::delay::NoDelay;
    use crate::scenario::CellSpec;
    use crate::types::{CellId, HazardKind, Priority};

    fn counter_scenario(actors: usize, iterations: u64) -> Scenario {
        Scenario {
            name: "counter".to_string(),
            config: SimulationConfig {
                run_duration_ms: 5_000,
                ..SimulationConfig::default()
            },
            resources: vec!["lock".to_string()],
            cells: vec![CellSpec {
                guard: ResourceId(1),
                initial: 0,
            }],
            actors: (0..actors)
                .map(|i| ActorSpec {
                    name: format!("worker-{i}"),
                    priority: Priority(1),
                    iterations: Some(iterations),
                    think_ms: 0,
                    workload: Workload::Counter { cell: CellId(1), delta: 1 },
                })
                .collect(),
        }
    }

    #[test]
    fn test_run_stops_when_all_actors_finish() {
        let simulation = Simulation::with_parts(counter_scenario(4, 3), Arc::new(NoDelay), Arc::new(ViolationRecorder::new())).unwrap();
        let report = simulation.run().unwrap();

        assert!(report.elapsed_ms < 5_000);
        assert_eq!(report.cells[0].observed, 12);
        assert_eq!(report.cells[0].serialized, 12);
        assert_eq!(report.exit_code(), 0);
        assert!(report.snapshot.all_finished());
        assert_eq!(report.counts[&HazardKind::AtomicViolation], 0);
    }

    #[test]
    fn test_counter_near_overflow_wraps_consistently() {
        let mut scenario = counter_scenario(2, 2);
        scenario.cells[0].initial = i64::MAX - 1;
        let simulation = Simulation::with_parts(scenario, Arc::new(NoDelay), Arc::new(ViolationRecorder::new())).unwrap();
        let report = simulation.run().unwrap();

        assert_eq!(report.cells[0].observed, i64::MIN + 2);
        assert_eq!(report.cells[0].serialized, report.cells[0].observed);
        assert_eq!(report.cells[0].delta, 0);
        assert_eq!(report.exit_code(), 0);
    }

    /// Panics in the processing delay of actor 1
    #[derive(Debug)]
    struct ExplodingDelay;

    impl DelayStrategy for ExplodingDelay {
        fn processing_delay(&self, actor: ActorId) -> HazardResult<Duration> {
            if actor == ActorId(1) {
                panic!("delay exploded for {actor}");
            }
            Ok(Duration::ZERO)
        }

        fn backoff(&self, _actor: ActorId) -> Duration {
            Duration::ZERO
        }
    }

    #[test]
    fn test_actor_panic_is_reported_with_its_cause() {
        let mut scenario = counter_scenario(2, 1);
        scenario.config.run_duration_ms = 300;
        let simulation = Simulation::with_parts(scenario, Arc::new(ExplodingDelay), Arc::new(ViolationRecorder::new())).unwrap();

        match simulation.run() {
            Err(HazardError::ActorPanicked { actor, message }) => {
                assert_eq!(actor, ActorId(1));
                assert!(message.contains("delay exploded"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_invalid_scenario_is_rejected() {
        let mut scenario = counter_scenario(1, 1);
        scenario.cells[0].guard = ResourceId(4);
        let err = Simulation::with_parts(scenario, Arc::new(NoDelay), Arc::new(ViolationRecorder::new())).unwrap_err();
        assert!(matches!(err, HazardError::Scenario(_)));
    }
}
