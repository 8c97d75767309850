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

//! End-to-end hazard scenarios
//!
//! Each test drives a full simulation (or the context directly) with real
//! threads and checks what the monitor and the instrumented sections report.

use std::sync::Arc;
use std::time::Duration;

use hazardlab_core::{
    ActorId, ActorSpec, ActorState, AllocationPolicy, CellId, CellSpec, DelayRange, Evidence, ExecutionMode, FaultInjector, HazardError, HazardKind,
    NoDelay, OrderTracker, Priority, ResourceId, Scenario, Simulation, SimulationConfig, SimulationContext, SimulationReport, ViolationRecorder,
    Workload,
};

fn run(scenario: Scenario) -> SimulationReport {
    Simulation::new(scenario).unwrap().run().unwrap()
}

fn counter_scenario(actors: usize, iterations: u64, mode: ExecutionMode) -> Scenario {
    Scenario {
        name: format!("counter-{actors}"),
        config: SimulationConfig {
            mode,
            processing_delay_ms: DelayRange { min: 0, max: 1 },
            run_duration_ms: 10_000,
            ..SimulationConfig::default()
        },
        resources: vec!["lock".to_string()],
        cells: vec![CellSpec {
            guard: ResourceId(1),
            initial: 100,
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
fn test_guarded_counter_matches_serial_execution() {
    for actors in [2usize, 10, 50] {
        let report = run(counter_scenario(actors, 2, ExecutionMode::Guarded));
        let cell = &report.cells[0];

        assert_eq!(cell.observed, 100 + 2 * actors as i64, "{actors} actors");
        assert_eq!(cell.serialized, cell.observed);
        assert_eq!(cell.lost_updates, 0);
        assert_eq!(report.count(HazardKind::AtomicViolation), 0);
        assert_eq!(report.exit_code(), 0);
        assert!(report.snapshot.all_finished());
    }
}

#[test]
fn test_unguarded_counter_loses_updates() {
    let mut found = None;
    for trial in 0..100u64 {
        let mut scenario = Scenario::preset("atomicity").unwrap();
        scenario.config.seed = trial;
        let report = run(scenario);
        if report.has_confirmed_atomic_violation() {
            found = Some(report);
            break;
        }
    }

    let report = found.expect("no lost update within 100 trials");
    let cell = &report.cells[0];
    assert!(cell.observed < cell.serialized);
    assert!(cell.lost_updates > 0);
    assert_eq!(report.exit_code(), 1);
    assert!(
        report
            .violations
            .iter()
            .any(|record| matches!(record.evidence, Evidence::Discrepancy { .. }) && record.is_confirmed())
    );
}

#[test]
fn test_timed_out_request_leaves_no_trace() {
    let ctx = SimulationContext::new(SimulationConfig::default()).unwrap();
    let resource = ctx.add_resource("ledger");
    let holder = ctx.add_actor("holder", Priority(1));
    let waiter = ctx.add_actor("waiter", Priority(1));

    ctx.acquire(holder, resource, Duration::from_millis(10)).unwrap();
    let err = ctx.acquire(waiter, resource, Duration::from_millis(30)).unwrap_err();
    assert!(matches!(err, HazardError::TimedOut { .. }));

    let sample = ctx.sample();
    assert!(!sample.resource(resource).unwrap().is_queued(waiter));
    let waiter_state = sample.actor(waiter).unwrap();
    assert_ne!(waiter_state.state, ActorState::Waiting);
    assert_eq!(waiter_state.waiting_on, None);
    assert_eq!(waiter_state.timeouts, 1);
    assert!(ctx.verify_invariants().is_ok());

    // The holder's release must not hand the resource to the departed waiter
    ctx.release(holder, resource).unwrap();
    assert_eq!(ctx.sample().owner_of(resource), None);
}

fn deadlock_scenario(resolve: bool) -> Scenario {
    let mut scenario = Scenario::preset("deadlock").unwrap();
    scenario.config.deadlock_recheck_window_ms = 200;
    scenario.config.sampling_interval_ms = 20;
    scenario.config.run_duration_ms = 1_000;
    scenario.config.resolve_deadlocks = resolve;
    scenario
}

#[test]
fn test_crossed_acquisition_reports_one_deadlock() {
    let report = run(deadlock_scenario(false));

    let deadlocks: Vec<_> = report.violations.iter().filter(|record| record.kind == HazardKind::Deadlock).collect();
    assert_eq!(deadlocks.len(), 1);
    let record = deadlocks[0];
    assert_eq!(record.involved_actors, vec![ActorId(1), ActorId(2)]);
    // Cycle forms after the 50ms hold; confirmation must follow within two windows
    assert!(record.detected_at.as_duration() < Duration::from_millis(50 + 2 * 200 + 100));
    match &record.evidence {
        Evidence::WaitCycle { cycle, persisted_ms, victim, .. } => {
            assert_eq!(cycle.len(), 2);
            assert!(*persisted_ms >= 200);
            assert_eq!(*victim, None);
        }
        other => panic!("unexpected evidence {other:?}"),
    }
    assert_eq!(report.exit_code(), 1);
    assert!(report.monitor.victims.is_empty());
}

#[test]
fn test_deadlock_resolution_lets_both_actors_finish() {
    let report = run(deadlock_scenario(true));

    assert_eq!(report.count(HazardKind::Deadlock), 1);
    assert_eq!(report.monitor.victims, vec![ActorId(2)]);
    assert!(report.snapshot.all_finished());
    assert_eq!(report.snapshot.completed_total(), 2);
    assert_eq!(report.snapshot.actor(ActorId(2)).unwrap().victimizations, 1);
}

#[test]
fn test_coarse_sampling_still_confirms_within_two_windows() {
    let mut scenario = deadlock_scenario(false);
    scenario.config.deadlock_recheck_window_ms = 40;
    scenario.config.sampling_interval_ms = 400;
    let report = run(scenario);

    let deadlocks: Vec<_> = report.violations.iter().filter(|record| record.kind == HazardKind::Deadlock).collect();
    assert_eq!(deadlocks.len(), 1);
    // Cycle forms after the 50ms hold
    let detected = deadlocks[0].detected_at.as_duration();
    assert!(detected < Duration::from_millis(50 + 2 * 40 + 100), "detected at {detected:?}");
}

#[test]
fn test_ordered_locking_never_deadlocks() {
    let mut scenario = Scenario::preset("ordered-locking").unwrap();
    scenario.config.run_duration_ms = 600;
    let report = run(scenario);

    assert_eq!(report.count(HazardKind::Deadlock), 0);
    assert!(report.snapshot.completed_total() > 0);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn test_strict_priority_starves_background_actor() {
    let scenario = Scenario::preset("starvation").unwrap();
    let threshold = Duration::from_millis(scenario.config.starvation_threshold_ms);
    let interval = Duration::from_millis(scenario.config.sampling_interval_ms);
    let report = run(scenario);

    let starving: Vec<_> = report.violations.iter().filter(|record| record.kind == HazardKind::Starvation).collect();
    assert!(!starving.is_empty());
    assert!(starving.iter().all(|record| record.involved_actors == vec![ActorId(3)]));
    assert!(report.snapshot.actor(ActorId(3)).unwrap().completed_ops <= 1);
    assert_eq!(report.count(HazardKind::Deadlock), 0);

    // The background actor queues right at start; allow for thread start-up
    let first = starving.iter().map(|record| record.detected_at.as_duration()).min().unwrap();
    assert!(first <= threshold + interval + Duration::from_millis(80), "first report at {first:?}");

    let urgent_grants = report.snapshot.actor(ActorId(1)).unwrap().grants + report.snapshot.actor(ActorId(2)).unwrap().grants;
    let rate = urgent_grants as f64 / (report.elapsed_ms as f64 / 1000.0);
    assert!(rate >= 100.0, "urgent grants per second {rate}");
}

#[test]
fn test_retrying_background_actor_starves_across_timeouts() {
    let mut scenario = Scenario::preset("starvation").unwrap();
    scenario.config.acquire_timeout_ms = 200;
    scenario.config.run_duration_ms = 2_000;
    let report = run(scenario);

    let background = report.snapshot.actor(ActorId(3)).unwrap();
    assert!(background.timeouts > 0);
    let starving: Vec<_> = report.violations.iter().filter(|record| record.kind == HazardKind::Starvation).collect();
    assert!(!starving.is_empty());
    assert!(starving.iter().all(|record| record.involved_actors == vec![ActorId(3)]));
    assert_eq!(report.count(HazardKind::Deadlock), 0);
}

#[test]
fn test_aging_prevents_starvation() {
    let mut scenario = Scenario::preset("starvation").unwrap();
    scenario.config.policy = AllocationPolicy::PriorityAging;
    scenario.config.aging_rate = 100.0;
    let report = run(scenario);

    assert_eq!(report.count(HazardKind::Starvation), 0);
    assert!(report.snapshot.actor(ActorId(3)).unwrap().completed_ops > 0);
}

#[test]
fn test_out_of_order_completion_is_reported_once() {
    let recorder = Arc::new(ViolationRecorder::new());
    let ctx = SimulationContext::with_recorder(SimulationConfig::default(), recorder.clone()).unwrap();
    let orders = OrderTracker::new(*ctx.clock(), recorder.clone());
    let actor = ctx.add_actor("clerk", Priority(1));

    let first = orders.register_at(actor, 1, None).unwrap();
    let second = orders.register_at(actor, 2, None).unwrap();
    let third = orders.register_at(actor, 3, None).unwrap();
    assert!(orders.complete(first).is_none());
    assert!(orders.complete(third).is_none());
    assert!(orders.complete(second).is_some());

    let records = recorder.records_of(HazardKind::OrderViolation);
    assert_eq!(records.len(), 1);
    match &records[0].evidence {
        Evidence::SequenceInversion {
            intended,
            actual_position,
            overtaken_by,
            ..
        } => {
            assert_eq!(*intended, 2);
            assert_eq!(*actual_position, 3);
            assert_eq!(overtaken_by, &vec![3]);
        }
        other => panic!("unexpected evidence {other:?}"),
    }
}

#[test]
fn test_unguarded_tickets_complete_out_of_order() {
    let mut inversions = 0;
    for trial in 0..20u64 {
        let mut scenario = Scenario::preset("ordering").unwrap();
        scenario.config.seed = trial;
        let report = run(scenario);
        inversions = report.count(HazardKind::OrderViolation);
        if inversions > 0 {
            assert!(
                report
                    .violations
                    .iter()
                    .filter(|record| record.kind == HazardKind::OrderViolation)
                    .all(|record| matches!(record.evidence, Evidence::SequenceInversion { .. }))
            );
            break;
        }
    }
    assert!(inversions > 0);
}

#[test]
fn test_polite_pair_livelocks_without_deadlock() {
    let report = run(Scenario::preset("livelock").unwrap());

    assert_eq!(report.count(HazardKind::Deadlock), 0);
    let livelocks: Vec<_> = report.violations.iter().filter(|record| record.kind == HazardKind::Livelock).collect();
    assert!(!livelocks.is_empty());
    assert_eq!(livelocks[0].involved_actors, vec![ActorId(1), ActorId(2)]);
    assert!(matches!(livelocks[0].evidence, Evidence::NoProgress { .. }));
}

#[test]
fn test_injected_faults_release_every_guard() {
    let mut scenario = counter_scenario(3, 4, ExecutionMode::Guarded);
    scenario.config.max_retries = 10;
    let injector = Arc::new(FaultInjector::new(Box::new(NoDelay), 3));
    let simulation = Simulation::with_parts(scenario, injector.clone(), Arc::new(ViolationRecorder::new())).unwrap();
    let report = simulation.run().unwrap();

    // 17 calls: 12 successes and the 5 failures at every third call
    assert_eq!(injector.injected(), 5);
    assert_eq!(report.cells[0].observed, 112);
    assert_eq!(report.cells[0].serialized, 112);
    assert!(report.snapshot.resources.iter().all(|resource| resource.owner.is_none() && resource.wait_queue.is_empty()));
    assert!(report.snapshot.actors.iter().all(|actor| actor.held.is_empty()));
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn test_presets_load_and_unknown_names_fail() {
    for (name, _) in hazardlab_core::PRESETS {
        let scenario = Scenario::preset(name).unwrap();
        assert_eq!(scenario.name, *name);
        assert!(scenario.validate().is_ok());
    }
    assert!(matches!(Scenario::preset("bogus"), Err(HazardError::Scenario(_))));
}

#[test]
fn test_scenario_from_json() {
    let json = r#"{
        "name": "pair",
        "config": {"policy": "priority", "run_duration_ms": 300},
        "resources": ["a", "b"],
        "actors": [
            {"name": "left", "iterations": 2, "workload": {"kind": "hold_and_wait", "resources": [1, 2], "hold_ms": 1, "ordered": true}},
            {"name": "right", "priority": 5, "iterations": 2, "workload": {"kind": "exclusive", "resource": 2, "hold_ms": 1}}
        ]
    }"#;
    let scenario = Scenario::from_json(json).unwrap();
    assert_eq!(scenario.config.policy, AllocationPolicy::Priority);
    assert_eq!(scenario.actors[1].priority, Priority(5));

    let report = run(scenario);
    assert!(report.snapshot.all_finished());
    assert_eq!(report.snapshot.completed_total(), 4);
    assert_eq!(report.exit_code(), 0);
}
