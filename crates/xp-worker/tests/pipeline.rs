//! End-to-end pipeline runs against real stores with the stub collaborators.

use std::collections::HashSet;
use std::sync::Arc;

use tempfile::TempDir;
use xp_core::{
    ExperimentStore, NewExperiment, ResultEntry, ResultKind, ScriptedSimulator, StubStatsEngine,
    TraceKind, WorkState, WorkflowHandling,
};
use xp_store::{MemoryStore, SqliteStore};
use xp_worker::{
    common_count, create, AnalysisWorker, ExperimentWorker, SecondPass, WorkerSettings,
};

fn definition(seed: &str) -> NewExperiment {
    NewExperiment::single(seed, "edison").with_workflows(
        WorkflowHandling::Single,
        "fcfs",
        1800,
        &["floodplain.json", "montage.json"],
    )
}

async fn workflow_count(store: &dyn ExperimentStore, trace_id: u64) -> usize {
    match store
        .get_result(trace_id, ResultKind::Summary)
        .await
        .unwrap()
    {
        Some(ResultEntry::Summary(summary)) => summary.workflow_count,
        other => panic!("no summary for {}: {:?}", trace_id, other),
    }
}

/// Run every stage of the pipeline over a group and a delta.
async fn run_pipeline(store: Arc<dyn ExperimentStore>) {
    let simulator = Arc::new(ScriptedSimulator::new());
    let stats = Arc::new(StubStatsEngine::new());
    let settings = WorkerSettings::new("w1");

    // 1. Singles, then aggregates over them
    let mut singles = Vec::new();
    for seed in ["1", "2", "3", "4"] {
        singles.push(create(store.as_ref(), &definition(seed)).await.unwrap().trace_id);
    }
    let group = create(
        store.as_ref(),
        &definition("1").aggregate_of(TraceKind::Group, singles[..3].to_vec()),
    )
    .await
    .unwrap()
    .trace_id;
    let delta = create(
        store.as_ref(),
        &definition("1").aggregate_of(TraceKind::Delta, singles.clone()),
    )
    .await
    .unwrap()
    .trace_id;

    // 2. Aggregates are not analyzable before their members are simulated
    let analysis = AnalysisWorker::new(store.clone(), stats.clone(), settings.clone());
    let early = analysis.run(None).await.unwrap();
    assert!(early.succeeded.is_empty());
    assert_eq!(early.not_ready, vec![group, delta]);

    // 3. Simulation touches singles only
    let experiments = ExperimentWorker::new(store.clone(), simulator.clone(), settings.clone());
    let simulated = experiments.run(None).await.unwrap();
    assert_eq!(simulated.succeeded, singles);
    assert_eq!(simulator.runs(), 4);
    assert_eq!(
        store.get(group).await.unwrap().unwrap().work_state,
        WorkState::Fresh
    );

    // 4. Analysis covers singles and ready aggregates
    let analyzed = analysis.run(None).await.unwrap();
    let done: HashSet<u64> = analyzed.succeeded.iter().copied().collect();
    assert_eq!(done.len(), 6, "summary: {:?}", analyzed);
    for id in singles.iter().chain([group, delta].iter()) {
        assert_eq!(
            store.get(*id).await.unwrap().unwrap().work_state,
            WorkState::AnalysisDone
        );
    }

    // 5. Second pass truncates siblings to the common workflow count
    let second = SecondPass::new(store.clone(), stats.clone(), settings.clone());
    let reconciled = second.run(None).await.unwrap();
    assert_eq!(reconciled.succeeded, vec![group, delta]);

    let mut counts = Vec::new();
    for id in &singles[..3] {
        counts.push(workflow_count(store.as_ref(), *id).await);
    }
    match store
        .get_result(group, ResultKind::ReconciledWorkflowStats)
        .await
        .unwrap()
    {
        Some(ResultEntry::ReconciledWorkflowStats(bundle)) => {
            assert_eq!(bundle.count, common_count(&counts) * 3)
        }
        other => panic!("unexpected {:?}", other),
    }

    match store
        .get_result(delta, ResultKind::ReconciledDeltaStats)
        .await
        .unwrap()
    {
        Some(ResultEntry::ReconciledDeltaStats(summary)) => {
            let pairs: Vec<(u64, u64)> = summary.pairs.iter().map(|p| (p.first, p.second)).collect();
            assert_eq!(pairs, vec![(singles[0], singles[1]), (singles[2], singles[3])]);
            for pair in &summary.pairs {
                let expected = workflow_count(store.as_ref(), pair.first)
                    .await
                    .min(workflow_count(store.as_ref(), pair.second).await);
                assert_eq!(pair.truncated_to, Some(expected));
            }
        }
        other => panic!("unexpected {:?}", other),
    }

    for id in [group, delta] {
        assert_eq!(
            store.get(id).await.unwrap().unwrap().work_state,
            WorkState::SecondPassDone
        );
    }

    // 6. Nothing is left for any stage
    assert!(experiments.run(None).await.unwrap().is_empty());
    assert!(analysis.run(None).await.unwrap().is_empty());
    assert!(second.run(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pipeline_memory() {
    run_pipeline(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_pipeline_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("xp.db")).unwrap();
    run_pipeline(Arc::new(store)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_simulate_each_record_once() {
    let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
    let simulator = Arc::new(ScriptedSimulator::new());
    let mut expected = HashSet::new();
    for i in 0..24 {
        let rec = create(store.as_ref(), &definition(&i.to_string())).await.unwrap();
        expected.insert(rec.trace_id);
    }

    let mut handles = Vec::new();
    for i in 0..6 {
        let worker = ExperimentWorker::new(
            store.clone(),
            simulator.clone(),
            WorkerSettings::new(format!("w{}", i)),
        );
        handles.push(tokio::spawn(async move { worker.run(None).await.unwrap() }));
    }

    let mut simulated = Vec::new();
    for handle in handles {
        simulated.extend(handle.await.unwrap().succeeded);
    }
    let unique: HashSet<u64> = simulated.iter().copied().collect();
    assert_eq!(simulated.len(), unique.len(), "an experiment ran twice");
    assert_eq!(unique, expected);
    assert_eq!(simulator.runs(), 24);
}

#[tokio::test]
async fn test_aligned_second_pass_uses_per_index_minimum() {
    let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
    let simulator = Arc::new(ScriptedSimulator::new());
    let stats = Arc::new(StubStatsEngine::new());
    let settings = WorkerSettings::new("w1");

    let mut first = Vec::new();
    let mut second = Vec::new();
    for seed in ["1", "2"] {
        first.push(create(store.as_ref(), &definition(seed)).await.unwrap().trace_id);
        let other = definition(seed);
        let other = NewExperiment {
            workflow_policy: "backfill".to_string(),
            ..other
        };
        second.push(create(store.as_ref(), &other).await.unwrap().trace_id);
    }
    let parent_a = create(
        store.as_ref(),
        &definition("1").aggregate_of(TraceKind::Group, first.clone()),
    )
    .await
    .unwrap()
    .trace_id;
    let parent_b = create(
        store.as_ref(),
        &definition("1").aggregate_of(TraceKind::Group, second.clone()),
    )
    .await
    .unwrap()
    .trace_id;

    ExperimentWorker::new(store.clone(), simulator, settings.clone())
        .run(None)
        .await
        .unwrap();
    AnalysisWorker::new(store.clone(), stats.clone(), settings.clone())
        .run(None)
        .await
        .unwrap();

    let reconciler = SecondPass::new(store.clone(), stats, settings);
    let summary = reconciler.run_aligned(&[parent_a, parent_b]).await.unwrap();
    assert_eq!(summary.succeeded, vec![parent_a, parent_b]);

    let mut expected = 0;
    for (a, b) in first.iter().zip(&second) {
        expected += workflow_count(store.as_ref(), *a)
            .await
            .min(workflow_count(store.as_ref(), *b).await);
    }
    for parent in [parent_a, parent_b] {
        match store
            .get_result(parent, ResultKind::ReconciledWorkflowStats)
            .await
            .unwrap()
        {
            Some(ResultEntry::ReconciledWorkflowStats(bundle)) => assert_eq!(bundle.count, expected),
            other => panic!("unexpected {:?}", other),
        }
    }
}
