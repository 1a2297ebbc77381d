//! Concurrent claim races against real stores.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use xp_core::{
    advance, claim_by_id, claim_by_scan, ClaimOptions, CoordError, ExperimentStore,
    NewExperiment, Stage, TraceKind, WindowChange, WorkState,
};
use xp_store::{MemoryStore, SqliteStore};

const SINGLES: &[TraceKind] = &[TraceKind::Single];

/// Spawn `workers` claimants that each claim until the scan reports no more work.
async fn drain(stores: Vec<Arc<dyn ExperimentStore>>, workers: usize) -> Vec<(String, u64)> {
    let mut handles = Vec::new();
    for i in 0..workers {
        let store = stores[i % stores.len()].clone();
        handles.push(tokio::spawn(async move {
            let opts = ClaimOptions::new(format!("worker-{}", i));
            let mut claimed = Vec::new();
            while let Some(record) =
                claim_by_scan(store.as_ref(), Stage::Simulation, SINGLES, &opts)
                    .await
                    .unwrap()
            {
                claimed.push((opts.worker.clone(), record.trace_id));
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_fresh_record_has_one_winner() {
    let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
    let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();

    let claims = drain(vec![store.clone()], 16).await;
    assert_eq!(claims.len(), 1, "claims: {:?}", claims);
    assert_eq!(claims[0].1, rec.trace_id);

    let stored = store.get(rec.trace_id).await.unwrap().unwrap();
    assert_eq!(stored.work_state, WorkState::PreSimulating);
    assert_eq!(stored.assigned_worker.as_deref(), Some(claims[0].0.as_str()));
    assert_eq!(stored.version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_records_claimed_exactly_once() {
    let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
    let mut expected = HashSet::new();
    for i in 0..40 {
        let rec = store
            .insert(&NewExperiment::single(format!("seed-{}", i), "edison"))
            .await
            .unwrap();
        expected.insert(rec.trace_id);
    }

    let claims = drain(vec![store.clone()], 8).await;
    let ids: Vec<u64> = claims.iter().map(|(_, id)| *id).collect();
    let unique: HashSet<u64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), unique.len(), "a record was claimed twice");
    assert_eq!(unique, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_sqlite_connections_race() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("race.db");
    let first: Arc<dyn ExperimentStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let second: Arc<dyn ExperimentStore> = Arc::new(SqliteStore::open(&path).unwrap());

    let mut expected = HashSet::new();
    for i in 0..12 {
        let rec = first
            .insert(&NewExperiment::single(format!("seed-{}", i), "edison"))
            .await
            .unwrap();
        expected.insert(rec.trace_id);
    }

    let claims = drain(vec![first.clone(), second.clone()], 6).await;
    let ids: Vec<u64> = claims.iter().map(|(_, id)| *id).collect();
    let unique: HashSet<u64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), unique.len(), "a record was claimed twice");
    assert_eq!(unique, expected);

    // Both connections agree on the owners.
    for (worker, trace_id) in &claims {
        let seen = second.get(*trace_id).await.unwrap().unwrap();
        assert_eq!(seen.assigned_worker.as_deref(), Some(worker.as_str()));
    }
}

#[tokio::test]
async fn test_claim_by_id_past_source_state_is_untouched() {
    let store = MemoryStore::new();
    let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
    let opts = ClaimOptions::new("w1");

    let claimed = claim_by_id(&store, rec.trace_id, Stage::Simulation, &opts)
        .await
        .unwrap();
    assert_eq!(claimed.work_state, WorkState::PreSimulating);

    let err = claim_by_id(&store, rec.trace_id, Stage::Simulation, &ClaimOptions::new("w2"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordError::UnexpectedState {
            actual: WorkState::PreSimulating,
            ..
        }
    ));
    assert!(err.is_misuse());

    let stored = store.get(rec.trace_id).await.unwrap().unwrap();
    assert_eq!(stored.version, claimed.version);
    assert_eq!(stored.assigned_worker.as_deref(), Some("w1"));
}

#[tokio::test]
async fn test_claim_by_id_unknown_record() {
    let store = MemoryStore::new();
    let err = claim_by_id(&store, 77, Stage::Analysis, &ClaimOptions::new("w1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::NotFound(77)));
}

#[tokio::test]
async fn test_scan_reports_no_more_work() {
    let store = MemoryStore::new();
    let opts = ClaimOptions::new("w1");
    assert!(claim_by_scan(&store, Stage::Simulation, SINGLES, &opts)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let store = SqliteStore::in_memory().unwrap();
    let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();

    let slow = ClaimOptions::new("w1").with_lease(Duration::from_millis(1));
    let mut held = claim_by_id(&store, rec.trace_id, Stage::Simulation, &slow)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let rescuer = ClaimOptions::new("w2").with_lease(Duration::from_secs(600));
    let taken = claim_by_scan(&store, Stage::Simulation, SINGLES, &rescuer)
        .await
        .unwrap()
        .expect("expired claim should be available");
    assert_eq!(taken.trace_id, rec.trace_id);
    assert_eq!(taken.assigned_worker.as_deref(), Some("w2"));

    // The original holder can no longer advance the record.
    let err = advance(
        &store,
        &mut held,
        WorkState::Simulating,
        WindowChange::Keep,
        &slow,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoordError::LostClaim { .. }));
}

#[tokio::test]
async fn test_live_lease_is_not_taken_over() {
    let store = MemoryStore::new();
    let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
    let opts = ClaimOptions::new("w1").with_lease(Duration::from_secs(600));
    claim_by_id(&store, rec.trace_id, Stage::Simulation, &opts)
        .await
        .unwrap();

    let other = ClaimOptions::new("w2").with_lease(Duration::from_secs(600));
    assert!(claim_by_scan(&store, Stage::Simulation, SINGLES, &other)
        .await
        .unwrap()
        .is_none());
}
