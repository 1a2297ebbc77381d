//! Administrative operations: creating experiments, state-targeted resets,
//! and status counts.

use std::collections::{BTreeMap, HashSet};

use tracing::{info, warn};
use xp_core::{
    CoordError, Expectation, ExperimentKind, ExperimentRecord, ExperimentStore, NewExperiment,
    Purge, ScanFilter, StateUpdate, TraceKind, WindowChange, WorkState, WorkflowHandling,
};

/// Validate `new` and store it as a fresh record.
pub async fn create(
    store: &dyn ExperimentStore,
    new: &NewExperiment,
) -> Result<ExperimentRecord, CoordError> {
    if new.workload_duration_s == 0 {
        return Err(CoordError::Misuse(
            "workload_duration_s must be greater than zero".to_string(),
        ));
    }
    if new.workflow_handling != WorkflowHandling::No {
        if new.manifest_list.is_empty() {
            return Err(CoordError::Misuse(format!(
                "workflow handling '{}' needs at least one manifest",
                new.workflow_handling
            )));
        }
        if new.workflow_period_s == 0 {
            return Err(CoordError::Misuse(format!(
                "workflow handling '{}' needs a workflow period",
                new.workflow_handling
            )));
        }
    }

    match &new.kind {
        ExperimentKind::Single => {}
        ExperimentKind::Group { subtraces } if subtraces.is_empty() => {
            return Err(CoordError::Misuse(
                "group experiment needs at least one sub-trace".to_string(),
            ))
        }
        ExperimentKind::Delta { subtraces } if subtraces.is_empty() || subtraces.len() % 2 != 0 => {
            return Err(CoordError::OddDeltaSubtraces(subtraces.len()))
        }
        ExperimentKind::Group { subtraces } | ExperimentKind::Delta { subtraces } => {
            let mut seen = HashSet::new();
            for &id in subtraces {
                if !seen.insert(id) {
                    return Err(CoordError::Misuse(format!(
                        "sub-trace {} is listed more than once",
                        id
                    )));
                }
                let sub = store.get(id).await?.ok_or_else(|| {
                    CoordError::Misuse(format!("sub-trace {} does not exist", id))
                })?;
                if sub.trace_type() != TraceKind::Single {
                    return Err(CoordError::Misuse(format!(
                        "sub-trace {} is a {} experiment, expected single",
                        id,
                        sub.trace_type()
                    )));
                }
            }
        }
    }

    let record = store.insert(new).await?;
    info!(
        "Created {} experiment {} ({})",
        record.trace_type(),
        record.trace_id,
        record.name
    );
    Ok(record)
}

/// Reset every record in `from` (or just `trace_id`) to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetRequest {
    pub from: WorkState,
    pub to: WorkState,
    pub trace_id: Option<u64>,
}

/// Apply a reset request; returns the ids that were reset.
pub async fn reset(
    store: &dyn ExperimentStore,
    request: &ResetRequest,
) -> Result<Vec<u64>, CoordError> {
    if Purge::for_reset_target(request.to).is_none() {
        return Err(CoordError::Misuse(format!(
            "cannot reset to '{}'; allowed targets are fresh, pending, analysis_done",
            request.to
        )));
    }
    if !request.from.can_reset_to(request.to) {
        return Err(CoordError::Misuse(format!(
            "cannot reset from '{}' to '{}'; resets only move experiments back",
            request.from, request.to
        )));
    }

    let records = match request.trace_id {
        Some(id) => {
            let record = store.get(id).await?.ok_or(CoordError::NotFound(id))?;
            if record.work_state != request.from {
                return Err(CoordError::UnexpectedState {
                    trace_id: id,
                    expected: vec![request.from],
                    actual: record.work_state,
                });
            }
            vec![record]
        }
        None => store.scan(&ScanFilter::states(&[request.from])).await?,
    };

    let mut reset_ids = Vec::new();
    for record in &records {
        if reset_record(store, record, request.to).await? {
            reset_ids.push(record.trace_id);
        } else {
            warn!(
                "Experiment {} changed before it could be reset",
                record.trace_id
            );
        }
    }
    info!(
        "Reset {} experiments from {} to {}",
        reset_ids.len(),
        request.from,
        request.to
    );
    Ok(reset_ids)
}

/// Reset one observed record to `to`, purging what that target requires.
///
/// Returns `false` if the record changed since it was observed.
pub async fn reset_record(
    store: &dyn ExperimentStore,
    record: &ExperimentRecord,
    to: WorkState,
) -> Result<bool, CoordError> {
    let purge = Purge::for_reset_target(to)
        .filter(|_| record.work_state.can_reset_to(to))
        .ok_or_else(|| {
            CoordError::Misuse(format!(
                "cannot reset experiment {} from '{}' to '{}'",
                record.trace_id, record.work_state, to
            ))
        })?;
    let window = if to == WorkState::Fresh {
        WindowChange::Clear
    } else {
        WindowChange::Keep
    };

    let expect = Expectation::exact(record.work_state, record.version);
    let update = StateUpdate::new(to, None).with_window(window);
    Ok(store.reset(record.trace_id, &expect, &update, purge).await?)
}

/// Number of records in each state.
pub async fn status(store: &dyn ExperimentStore) -> Result<BTreeMap<WorkState, usize>, CoordError> {
    Ok(store.state_counts().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xp_core::{
        claim_by_id, ClaimOptions, ResultEntry, ScriptedSimulator, Stage, TraceSummary,
    };
    use xp_store::MemoryStore;

    #[tokio::test]
    async fn test_create_rejects_bad_definitions() {
        let store = MemoryStore::new();

        let no_manifests = NewExperiment::single("A", "edison").with_workflows(
            WorkflowHandling::Manifest,
            "fcfs",
            1800,
            &[],
        );
        assert!(create(&store, &no_manifests).await.unwrap_err().is_misuse());

        let a = create(&store, &NewExperiment::single("A", "edison")).await.unwrap();
        let odd = NewExperiment::single("A", "edison").aggregate_of(TraceKind::Delta, vec![a.trace_id]);
        assert!(matches!(
            create(&store, &odd).await.unwrap_err(),
            CoordError::OddDeltaSubtraces(1)
        ));

        let missing = NewExperiment::single("A", "edison").aggregate_of(TraceKind::Group, vec![a.trace_id, 99]);
        assert!(create(&store, &missing).await.unwrap_err().is_misuse());

        let group = create(
            &store,
            &NewExperiment::single("A", "edison").aggregate_of(TraceKind::Group, vec![a.trace_id]),
        )
        .await
        .unwrap();
        let nested = NewExperiment::single("A", "edison").aggregate_of(TraceKind::Group, vec![group.trace_id]);
        assert!(create(&store, &nested).await.unwrap_err().is_misuse());

        let counts = status(&store).await.unwrap();
        assert_eq!(counts.values().sum::<usize>(), 2);
    }

    #[tokio::test]
    async fn test_reset_to_fresh_purges_and_allows_reclaim() {
        let store = MemoryStore::new();
        let rec = create(&store, &NewExperiment::single("A", "edison")).await.unwrap();
        let done = StateUpdate::new(WorkState::AnalysisDone, None);
        assert!(store
            .compare_and_swap(rec.trace_id, &Expectation::exact(WorkState::Fresh, 0), &done)
            .await
            .unwrap());
        store
            .put_trace(rec.trace_id, &ScriptedSimulator::generate(&rec))
            .await
            .unwrap();
        store
            .put_result(
                rec.trace_id,
                &ResultEntry::Summary(TraceSummary {
                    job_count: 1,
                    workflow_count: 0,
                }),
            )
            .await
            .unwrap();

        let reset_ids = reset(
            &store,
            &ResetRequest {
                from: WorkState::AnalysisDone,
                to: WorkState::Fresh,
                trace_id: Some(rec.trace_id),
            },
        )
        .await
        .unwrap();
        assert_eq!(reset_ids, vec![rec.trace_id]);
        assert!(store.get_trace(rec.trace_id).await.unwrap().is_none());
        assert!(store.list_results(rec.trace_id).await.unwrap().is_empty());

        let claimed = claim_by_id(&store, rec.trace_id, Stage::Simulation, &ClaimOptions::new("w1"))
            .await
            .unwrap();
        assert_eq!(claimed.work_state, WorkState::PreSimulating);
    }

    #[tokio::test]
    async fn test_reset_rejects_unsupported_target() {
        let store = MemoryStore::new();
        let err = reset(
            &store,
            &ResetRequest {
                from: WorkState::Fresh,
                to: WorkState::Simulating,
                trace_id: None,
            },
        )
        .await
        .unwrap_err();
        assert!(err.is_misuse());
    }

    #[tokio::test]
    async fn test_reset_never_moves_forward() {
        let store = MemoryStore::new();
        let fresh = create(&store, &NewExperiment::single("A", "edison")).await.unwrap();
        let simulated = create(&store, &NewExperiment::single("B", "edison")).await.unwrap();
        let done = StateUpdate::new(WorkState::SimulationDone, None);
        assert!(store
            .compare_and_swap(simulated.trace_id, &Expectation::exact(WorkState::Fresh, 0), &done)
            .await
            .unwrap());

        for (from, trace_id) in [
            (WorkState::Fresh, fresh.trace_id),
            (WorkState::SimulationDone, simulated.trace_id),
        ] {
            for to in [WorkState::AnalysisDone, WorkState::Pending] {
                let err = reset(
                    &store,
                    &ResetRequest {
                        from,
                        to,
                        trace_id: Some(trace_id),
                    },
                )
                .await
                .unwrap_err();
                assert!(err.is_misuse(), "{} -> {}: {:?}", from, to, err);
            }
        }

        let observed = store.get(simulated.trace_id).await.unwrap().unwrap();
        assert_eq!(observed.work_state, WorkState::SimulationDone);
        assert_eq!(observed.version, 1);
        assert!(reset_record(&store, &observed, WorkState::AnalysisDone)
            .await
            .unwrap_err()
            .is_misuse());
        assert_eq!(
            store.get(fresh.trace_id).await.unwrap().unwrap().work_state,
            WorkState::Fresh
        );
    }

    #[tokio::test]
    async fn test_reset_by_state_only_touches_matching_records() {
        let store = MemoryStore::new();
        let a = create(&store, &NewExperiment::single("A", "edison")).await.unwrap();
        let b = create(&store, &NewExperiment::single("B", "edison")).await.unwrap();
        let error = StateUpdate::new(WorkState::SimulationError, None);
        assert!(store
            .compare_and_swap(a.trace_id, &Expectation::exact(WorkState::Fresh, 0), &error)
            .await
            .unwrap());

        let reset_ids = reset(
            &store,
            &ResetRequest {
                from: WorkState::SimulationError,
                to: WorkState::Fresh,
                trace_id: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(reset_ids, vec![a.trace_id]);
        assert_eq!(store.get(b.trace_id).await.unwrap().unwrap().version, 0);
    }
}
