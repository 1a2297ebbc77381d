use xp_core::{ExperimentStore, ScanFilter, TraceKind, WorkState};
use xp_sim::invariants::check_final_consistency;
use xp_sim::ops::Op;
use xp_sim::{FaultConfig, Sim};

#[tokio::test(start_paused = true)]
async fn sim_seed_42_50_steps() {
    let mut sim = Sim::new(42);
    let violations = sim.run(50).await;
    assert!(violations.is_empty(), "{:#?}", violations);
}

#[tokio::test(start_paused = true)]
async fn sim_seed_42_drains_completely() {
    let mut sim = Sim::new(42);
    let _ = sim.run(80).await;
    let violations = sim.drain(true).await;
    assert!(violations.is_empty(), "{:#?}", violations);
}

#[tokio::test(start_paused = true)]
async fn sim_fuzz_20_seeds() {
    for seed in 0..20 {
        let mut sim = Sim::new(seed);
        let _ = sim.run(60).await;
        let drained = sim.drain(true).await;
        assert!(drained.is_empty(), "seed {}: {:#?}", seed, drained);
        assert!(sim.violations.is_empty(), "seed {}: {:#?}", seed, sim.violations);
    }
}

#[tokio::test(start_paused = true)]
async fn sim_same_seed_same_trace() {
    let mut a = Sim::new(7);
    let mut b = Sim::new(7);
    let _ = a.run(40).await;
    let _ = b.run(40).await;

    let ops_a: Vec<(&str, &str)> = a.trace.iter().map(|e| (e.op.as_str(), e.outcome.as_str())).collect();
    let ops_b: Vec<(&str, &str)> = b.trace.iter().map(|e| (e.op.as_str(), e.outcome.as_str())).collect();
    assert_eq!(ops_a, ops_b);
}

#[tokio::test(start_paused = true)]
async fn sim_scripted_pipeline() {
    let mut sim = Sim::new(1);
    let mut violations = Vec::new();
    for op in [
        Op::CreateSingles { count: 4 },
        Op::CreateGroup { width: 3 },
        Op::CreateDelta { pairs: 2 },
        // Aggregates are not ready before their members are simulated
        Op::AnalyzeConcurrent,
        Op::SimulateConcurrent,
        Op::AnalyzeConcurrent,
        Op::SecondPassConcurrent,
    ] {
        violations.extend(sim.step_with(op).await);
    }
    assert!(violations.is_empty(), "{:#?}", violations);

    let records = sim.store.scan(&ScanFilter::default()).await.unwrap();
    assert_eq!(records.len(), 6);
    for record in &records {
        let expected = match record.trace_type() {
            TraceKind::Single => WorkState::AnalysisDone,
            _ => WorkState::SecondPassDone,
        };
        assert_eq!(record.work_state, expected, "record {}", record.trace_id);
    }
    assert_eq!(sim.simulator.runs(), 4);
}

#[tokio::test(start_paused = true)]
async fn sim_concurrent_simulation_runs_each_single_once() {
    let mut sim = Sim::new(3);
    let _ = sim.step_with(Op::CreateSingles { count: 4 }).await;
    let _ = sim.step_with(Op::CreateSingles { count: 4 }).await;
    let violations = sim.step_with(Op::SimulateConcurrent).await;
    assert!(violations.is_empty(), "{:#?}", violations);
    assert_eq!(sim.simulator.runs(), 8);

    let counts = sim.store.state_counts().await.unwrap();
    assert_eq!(counts.get(&WorkState::SimulationDone), Some(&8));
}

#[tokio::test(start_paused = true)]
async fn sim_failed_simulations_block_aggregates() {
    let mut sim = Sim::new_with_faults(
        5,
        Some(FaultConfig {
            error_rate: 0.0,
            simulation_failure_rate: 1.0,
        }),
    );
    let mut violations = Vec::new();
    for op in [
        Op::CreateSingles { count: 2 },
        Op::CreateGroup { width: 2 },
        Op::SimulateConcurrent,
        Op::AnalyzeConcurrent,
        Op::Rescue { agent: 1 },
        Op::ResetErrors,
    ] {
        violations.extend(sim.step_with(op).await);
    }
    assert!(violations.is_empty(), "{:#?}", violations);

    // Nothing can complete, and that is not a violation when not expected.
    let drained = sim.drain(false).await;
    assert!(drained.is_empty(), "{:#?}", drained);
    let strict = check_final_consistency(sim.step, sim.store.as_ref(), true).await;
    assert!(!strict.is_empty());

    let group = sim
        .store
        .scan(&ScanFilter::default().kinds(&[TraceKind::Group]))
        .await
        .unwrap();
    assert_eq!(group[0].work_state, WorkState::Fresh);
}

#[tokio::test(start_paused = true)]
async fn sim_detects_missing_trace() {
    let mut sim = Sim::new(9);
    for op in [Op::CreateSingles { count: 1 }, Op::Simulate { agent: 0 }] {
        let _ = sim.step_with(op).await;
    }

    // Drop the trace behind the workers' backs.
    let record = sim.store.scan(&ScanFilter::default()).await.unwrap().remove(0);
    assert_eq!(record.work_state, WorkState::SimulationDone);
    sim.store
        .put_trace(record.trace_id, &Default::default())
        .await
        .unwrap();

    let violations = sim.step_with(Op::Rescue { agent: 0 }).await;
    assert!(
        violations.iter().any(|v| v.invariant == "trace-present"),
        "{:#?}",
        violations
    );
}
