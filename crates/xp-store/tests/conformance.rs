//! Store Conformance Test Suite
//!
//! A single `run_conformance` function exercises every ExperimentStore
//! operation against any implementation, so all stores agree on semantics.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use xp_core::{
    Expectation, ExperimentStore, JobRecord, NewExperiment, Purge, ResultEntry, ResultKind,
    ScanFilter, StageOutput, StateUpdate, StatsBundle, StoreError, Trace, TraceKind, TraceSummary,
    WindowChange, WorkState,
};
use xp_store::{MemoryStore, SqliteStore};

fn job(id: u64, name: &str) -> JobRecord {
    JobRecord {
        id_job: id,
        job_name: name.to_string(),
        timelimit: 30,
        cpus_req: 48,
        dependency: String::new(),
        manifest: String::new(),
        time_submit: 100 + id as i64,
        time_start: 200 + id as i64,
        time_end: 900 + id as i64,
    }
}

fn summary(jobs: usize) -> ResultEntry {
    ResultEntry::Summary(TraceSummary {
        job_count: jobs,
        workflow_count: 0,
    })
}

/// Run the full conformance suite against any store implementation.
async fn run_conformance(store: &dyn ExperimentStore) {
    // 1. Insert assigns unique ids and starts fresh
    let mut ids = HashSet::new();
    for seed in ["A", "B", "C"] {
        let rec = store.insert(&NewExperiment::single(seed, "edison")).await.unwrap();
        assert_eq!(rec.work_state, WorkState::Fresh);
        assert_eq!(rec.version, 0);
        assert!(rec.assigned_worker.is_none());
        assert!(ids.insert(rec.trace_id), "duplicate trace_id {}", rec.trace_id);
    }
    let mut sorted: Vec<u64> = ids.iter().copied().collect();
    sorted.sort();
    let (a, b, c) = (sorted[0], sorted[1], sorted[2]);

    // 2. Get round-trips the definition
    let loaded = store.get(a).await.unwrap().unwrap();
    assert_eq!(loaded.seed, "A");
    assert_eq!(loaded.trace_type(), TraceKind::Single);
    assert!(store.get(999_999).await.unwrap().is_none());

    // 3. Aggregates keep their sub-trace order
    let group = store
        .insert(&NewExperiment::single("A", "edison").aggregate_of(TraceKind::Group, vec![c, a, b]))
        .await
        .unwrap();
    let loaded = store.get(group.trace_id).await.unwrap().unwrap();
    assert_eq!(loaded.subtraces(), &[c, a, b]);
    assert_eq!(loaded.trace_type(), TraceKind::Group);

    // 4. Scan filters by state and kind, oldest first
    let fresh = store
        .scan(&ScanFilter::states(&[WorkState::Fresh]).kinds(&[TraceKind::Single]))
        .await
        .unwrap();
    assert_eq!(fresh.iter().map(|r| r.trace_id).collect::<Vec<_>>(), vec![a, b, c]);
    let limited = store
        .scan(&ScanFilter::default().min_trace_id(b).limit(2))
        .await
        .unwrap();
    assert_eq!(limited.iter().map(|r| r.trace_id).collect::<Vec<_>>(), vec![b, c]);

    // 5. CAS applies once; the stale expectation then fails
    let claim = StateUpdate::new(WorkState::PreSimulating, Some("w1".to_string()));
    assert!(store
        .compare_and_swap(a, &Expectation::exact(WorkState::Fresh, 0), &claim)
        .await
        .unwrap());
    assert!(!store
        .compare_and_swap(a, &Expectation::exact(WorkState::Fresh, 0), &claim)
        .await
        .unwrap());
    let claimed = store.get(a).await.unwrap().unwrap();
    assert_eq!(claimed.work_state, WorkState::PreSimulating);
    assert_eq!(claimed.assigned_worker.as_deref(), Some("w1"));
    assert_eq!(claimed.version, 1);

    // 6. CAS against a missing record is a lost race, not an error
    assert!(!store
        .compare_and_swap(999_999, &Expectation::state(WorkState::Fresh), &claim)
        .await
        .unwrap());

    // 7. Simulation timestamps follow the window change
    let started = Utc::now();
    let run = StateUpdate::new(WorkState::Simulating, Some("w1".to_string()))
        .with_window(WindowChange::Start(started));
    assert!(store
        .compare_and_swap(a, &Expectation::held_by(WorkState::PreSimulating, 1, "w1"), &run)
        .await
        .unwrap());
    let ended = started + Duration::seconds(30);
    let done = StateUpdate::new(WorkState::SimulationDone, Some("w1".to_string()))
        .with_window(WindowChange::End(ended));
    assert!(store
        .compare_and_swap(a, &Expectation::held_by(WorkState::Simulating, 2, "w1"), &done)
        .await
        .unwrap());
    let loaded = store.get(a).await.unwrap().unwrap();
    assert_eq!(loaded.simulation_start, Some(started));
    assert_eq!(loaded.simulation_end, Some(ended));

    // 8. Traces are stored in order and replaced wholesale
    let trace = Trace::new(vec![job(1, "sim_job"), job(2, "wf_floodplain-0"), job(3, "sim_job")]);
    store.put_trace(a, &trace).await.unwrap();
    assert_eq!(store.get_trace(a).await.unwrap().unwrap(), trace);
    assert_eq!(store.trace_job_count(a).await.unwrap(), Some(3));
    let shorter = Trace::new(vec![job(7, "sim_job")]);
    store.put_trace(a, &shorter).await.unwrap();
    assert_eq!(store.trace_job_count(a).await.unwrap(), Some(1));
    assert!(store.get_trace(b).await.unwrap().is_none());
    assert_eq!(store.trace_job_count(b).await.unwrap(), None);

    // 9. Writing data for a missing record → NotFound
    let err = store.put_trace(999_999, &trace).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(999_999)), "got {:?}", err);
    let err = store.put_result(999_999, &summary(1)).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(999_999)), "got {:?}", err);

    // 10. Results are keyed by kind and replaced on rewrite
    store.put_result(a, &summary(3)).await.unwrap();
    store.put_result(a, &summary(1)).await.unwrap();
    store
        .put_result(a, &ResultEntry::ReconciledWorkflowStats(StatsBundle::default()))
        .await
        .unwrap();
    store
        .put_result(a, &ResultEntry::JobStats(StatsBundle::default()))
        .await
        .unwrap();
    assert_eq!(store.get_result(a, ResultKind::Summary).await.unwrap(), Some(summary(1)));
    let kinds: Vec<ResultKind> = store
        .list_results(a)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            ResultKind::JobStats,
            ResultKind::Summary,
            ResultKind::ReconciledWorkflowStats
        ]
    );

    // 11. Reset to analysis_done drops only second-pass results
    assert!(store
        .reset(
            a,
            &Expectation::state(WorkState::SimulationDone),
            &StateUpdate::new(WorkState::AnalysisDone, None),
            Purge::SecondPass,
        )
        .await
        .unwrap());
    assert_eq!(store.list_results(a).await.unwrap().len(), 2);
    assert!(store.get_trace(a).await.unwrap().is_some());

    // 12. Reset to pending drops results and keeps the trace
    assert!(store
        .reset(
            a,
            &Expectation::state(WorkState::AnalysisDone),
            &StateUpdate::new(WorkState::Pending, None),
            Purge::Results,
        )
        .await
        .unwrap());
    assert!(store.list_results(a).await.unwrap().is_empty());
    assert!(store.get_trace(a).await.unwrap().is_some());

    // 13. Reset to fresh drops trace and results and clears timestamps
    store.put_result(a, &summary(1)).await.unwrap();
    assert!(store
        .reset(
            a,
            &Expectation::state(WorkState::Pending),
            &StateUpdate::new(WorkState::Fresh, None).with_window(WindowChange::Clear),
            Purge::TraceAndResults,
        )
        .await
        .unwrap());
    assert!(store.get_trace(a).await.unwrap().is_none());
    assert!(store.list_results(a).await.unwrap().is_empty());
    let loaded = store.get(a).await.unwrap().unwrap();
    assert_eq!(loaded.work_state, WorkState::Fresh);
    assert_eq!(loaded.simulation_start, None);

    // 14. A reset whose expectation fails changes nothing
    assert!(!store
        .reset(
            a,
            &Expectation::state(WorkState::AnalysisDone),
            &StateUpdate::new(WorkState::Pending, None),
            Purge::Results,
        )
        .await
        .unwrap());

    // 15. Leases: renewal needs the holder, expiry is scannable
    let past = Utc::now() - Duration::seconds(5);
    let leased = StateUpdate::new(WorkState::PreSimulating, Some("w2".to_string()))
        .with_lease(Some(past));
    let rec_b = store.get(b).await.unwrap().unwrap();
    assert!(store
        .compare_and_swap(b, &Expectation::exact(WorkState::Fresh, rec_b.version), &leased)
        .await
        .unwrap());
    let expired = store
        .scan(&ScanFilter::states(&[WorkState::PreSimulating]).lease_expired_before(Utc::now()))
        .await
        .unwrap();
    assert_eq!(expired.iter().map(|r| r.trace_id).collect::<Vec<_>>(), vec![b]);

    let version_before = store.get(b).await.unwrap().unwrap().version;
    assert!(!store.renew_lease(b, "someone-else", Utc::now()).await.unwrap());
    let future = Utc::now() + Duration::seconds(600);
    assert!(store.renew_lease(b, "w2", future).await.unwrap());
    let renewed = store.get(b).await.unwrap().unwrap();
    assert_eq!(renewed.lease_expires_at, Some(future));
    assert_eq!(renewed.version, version_before);
    assert!(!store.renew_lease(c, "w2", future).await.unwrap());

    // 16. State counts cover every record
    let counts = store.state_counts().await.unwrap();
    assert_eq!(counts.values().sum::<usize>(), 4);
    assert_eq!(counts.get(&WorkState::Fresh), Some(&3));
    assert_eq!(counts.get(&WorkState::PreSimulating), Some(&1));

    // 17. Commit stores stage output with the state change, or nothing at all
    let output = StageOutput {
        trace: Some(Trace::new(vec![job(4, "sim_job")])),
        results: vec![summary(1)],
    };
    let done = StateUpdate::new(WorkState::SimulationDone, None);
    assert!(!store
        .commit(c, &Expectation::exact(WorkState::Fresh, 7), &done, &output)
        .await
        .unwrap());
    assert!(store.get_trace(c).await.unwrap().is_none());
    assert!(store.list_results(c).await.unwrap().is_empty());
    assert_eq!(store.get(c).await.unwrap().unwrap().work_state, WorkState::Fresh);

    assert!(store
        .commit(c, &Expectation::exact(WorkState::Fresh, 0), &done, &output)
        .await
        .unwrap());
    let loaded = store.get(c).await.unwrap().unwrap();
    assert_eq!(loaded.work_state, WorkState::SimulationDone);
    assert_eq!(loaded.version, 1);
    assert_eq!(store.trace_job_count(c).await.unwrap(), Some(1));
    assert_eq!(store.list_results(c).await.unwrap(), vec![summary(1)]);
}

#[tokio::test]
async fn test_memory_store_conformance() {
    let store = MemoryStore::new();
    run_conformance(&store).await;
}

#[tokio::test]
async fn test_sqlite_memory_conformance() {
    let store = SqliteStore::in_memory().unwrap();
    run_conformance(&store).await;
}

#[tokio::test]
async fn test_sqlite_file_conformance() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("xp.db")).unwrap();
    run_conformance(&store).await;
}

#[tokio::test]
async fn test_sqlite_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("xp.db");

    let trace_id = {
        let store = SqliteStore::open(&path).unwrap();
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        store.put_trace(rec.trace_id, &Trace::new(vec![job(1, "sim_job")])).await.unwrap();
        rec.trace_id
    };

    let store = SqliteStore::open(&path).unwrap();
    let rec = store.get(trace_id).await.unwrap().unwrap();
    assert_eq!(rec.seed, "A");
    assert_eq!(store.trace_job_count(trace_id).await.unwrap(), Some(1));
}
