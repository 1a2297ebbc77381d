use std::collections::{HashMap, HashSet};

use xp_core::{ExperimentStore, ResultKind, ScanFilter, TraceKind, WorkState};

/// A violation detected during simulation.
#[derive(Debug, Clone)]
pub struct Violation {
    pub step: usize,
    pub trace_id: Option<u64>,
    pub invariant: String,
    pub details: String,
}

impl Violation {
    fn new(step: usize, trace_id: Option<u64>, invariant: &str, details: String) -> Self {
        Violation {
            step,
            trace_id,
            invariant: invariant.to_string(),
            details,
        }
    }
}

/// Ids that appear more than once across the `succeeded` lists of
/// concurrent passes. Each record may finish a stage once per pass.
pub fn duplicate_successes(step: usize, passes: &[Vec<u64>]) -> Vec<Violation> {
    let mut seen = HashSet::new();
    let mut violations = Vec::new();
    for id in passes.iter().flatten() {
        if !seen.insert(*id) {
            violations.push(Violation::new(
                step,
                Some(*id),
                "single-owner",
                format!("Experiment {} completed the same stage in two concurrent passes", id),
            ));
        }
    }
    violations
}

/// Per-step checks against the raw (unfaulted) store.
///
/// `versions` carries each record's last observed version between steps.
/// With `has_faults`, checks that a failed release can legitimately break
/// (stuck in-progress records) are skipped.
pub async fn check_step_invariants(
    step: usize,
    store: &dyn ExperimentStore,
    versions: &mut HashMap<u64, u64>,
    has_faults: bool,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    let records = match store.scan(&ScanFilter::default()).await {
        Ok(records) => records,
        Err(e) => {
            violations.push(Violation::new(step, None, "store-readable", e.to_string()));
            return violations;
        }
    };
    let states: HashMap<u64, WorkState> = records
        .iter()
        .map(|r| (r.trace_id, r.work_state))
        .collect();

    for record in &records {
        let id = record.trace_id;
        let state = record.work_state;

        // 1. Versions never go backwards.
        if let Some(previous) = versions.insert(id, record.version) {
            if record.version < previous {
                violations.push(Violation::new(
                    step,
                    Some(id),
                    "version-monotonic",
                    format!("version went from {} to {}", previous, record.version),
                ));
            }
        }

        // 2. Simulated singles have a stored trace.
        if record.trace_type() == TraceKind::Single && state.has_trace() {
            match store.get_trace(id).await {
                Ok(Some(trace)) if !trace.jobs.is_empty() => {}
                Ok(_) => violations.push(Violation::new(
                    step,
                    Some(id),
                    "trace-present",
                    format!("single in {} has no usable trace", state),
                )),
                Err(e) => violations.push(Violation::new(step, Some(id), "store-readable", e.to_string())),
            }
        }

        // 3. Analyzed records have a summary.
        if matches!(
            state,
            WorkState::AnalysisDone | WorkState::PreSecondPass | WorkState::SecondPassDone
        ) {
            match store.get_result(id, ResultKind::Summary).await {
                Ok(Some(_)) => {}
                Ok(None) => violations.push(Violation::new(
                    step,
                    Some(id),
                    "summary-present",
                    format!("record in {} has no summary result", state),
                )),
                Err(e) => violations.push(Violation::new(step, Some(id), "store-readable", e.to_string())),
            }
        }

        // 4. Aggregates never run ahead of their sub-traces.
        if record.trace_type() != TraceKind::Single {
            let analyzed = matches!(
                state,
                WorkState::Analyzing
                    | WorkState::AnalysisDone
                    | WorkState::PreSecondPass
                    | WorkState::SecondPassDone
            );
            for sub in record.subtraces() {
                let sub_state = states.get(sub).copied();
                let simulated = sub_state.is_some_and(|s| s.has_trace() || s == WorkState::Pending);
                let reconcilable = matches!(
                    sub_state,
                    Some(WorkState::AnalysisDone | WorkState::SecondPassDone)
                );
                let behind = (analyzed && !simulated)
                    || (state == WorkState::SecondPassDone && !reconcilable);
                if behind {
                    violations.push(Violation::new(
                        step,
                        Some(id),
                        "aggregate-after-subtraces",
                        format!(
                            "{} {} is {} while sub-trace {} is {:?}",
                            record.trace_type(),
                            id,
                            state,
                            sub,
                            sub_state
                        ),
                    ));
                }
            }
        }

        // 5. Reconciled aggregates have their reconciled result.
        if state == WorkState::SecondPassDone {
            let kind = match record.trace_type() {
                TraceKind::Group => Some(ResultKind::ReconciledWorkflowStats),
                TraceKind::Delta => Some(ResultKind::ReconciledDeltaStats),
                TraceKind::Single => None,
            };
            if let Some(kind) = kind {
                if !matches!(store.get_result(id, kind).await, Ok(Some(_))) {
                    violations.push(Violation::new(
                        step,
                        Some(id),
                        "reconciled-present",
                        format!("{} {} is second_pass_done without {:?}", record.trace_type(), id, kind),
                    ));
                }
            }
        }

        if has_faults {
            continue;
        }

        // 6. Between steps nobody holds a claim.
        if state.is_in_progress() {
            violations.push(Violation::new(
                step,
                Some(id),
                "no-stuck-claims",
                format!("record left in {} by {:?}", state, record.assigned_worker),
            ));
        }

        // 7. Fresh records carry nothing from earlier runs.
        if state == WorkState::Fresh && record.trace_type() == TraceKind::Single {
            if matches!(store.get_trace(id).await, Ok(Some(_))) {
                violations.push(Violation::new(
                    step,
                    Some(id),
                    "fresh-is-clean",
                    "fresh single has a stored trace".to_string(),
                ));
            }
        }
    }

    violations
}

/// Checks once the pipeline has been drained.
///
/// With `expect_complete`, every single must be analyzed and every aggregate
/// reconciled. Otherwise only records nothing is blocking are checked.
pub async fn check_final_consistency(
    step: usize,
    store: &dyn ExperimentStore,
    expect_complete: bool,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    let records = match store.scan(&ScanFilter::default()).await {
        Ok(records) => records,
        Err(e) => {
            violations.push(Violation::new(step, None, "store-readable", e.to_string()));
            return violations;
        }
    };
    let states: HashMap<u64, WorkState> = records
        .iter()
        .map(|r| (r.trace_id, r.work_state))
        .collect();

    for record in &records {
        let id = record.trace_id;
        let blocked = record
            .subtraces()
            .iter()
            .any(|sub| states.get(sub).is_some_and(|s| s.is_error() || s.is_in_progress()));
        if record.work_state.is_error() || record.work_state.is_in_progress() || blocked {
            if expect_complete {
                violations.push(Violation::new(
                    step,
                    Some(id),
                    "drained",
                    format!("record ended in {}", record.work_state),
                ));
            }
            continue;
        }

        let expected = match record.trace_type() {
            TraceKind::Single => WorkState::AnalysisDone,
            TraceKind::Group | TraceKind::Delta => WorkState::SecondPassDone,
        };
        if record.work_state != expected {
            violations.push(Violation::new(
                step,
                Some(id),
                "drained",
                format!("record ended in {}, expected {}", record.work_state, expected),
            ));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_successes() {
        assert!(duplicate_successes(0, &[vec![1, 2], vec![3]]).is_empty());
        let violations = duplicate_successes(4, &[vec![1, 2], vec![2, 5]]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].trace_id, Some(2));
        assert_eq!(violations[0].invariant, "single-owner");
    }
}
