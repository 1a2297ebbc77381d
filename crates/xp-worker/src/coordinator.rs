//! Group and delta coordination.
//!
//! A group pools the job and workflow values of repeated runs of one
//! configuration; a delta compares consecutive pairs of runs workflow by
//! workflow. Both wait until every sub-trace has reached a state usable by
//! the stage being run.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::debug;
use xp_core::claim::{claim_candidate, SCAN_BATCH};
use xp_core::{
    ClaimOptions, CoordError, DeltaSummary, ExperimentRecord, ExperimentStore, FoldMode,
    JobValues, PairSummary, ResultEntry, ScanFilter, Stage, Stats, StatsEngine, SubtraceUtilization,
    Trace, TraceKind, TraceSummary, UtilizationSummary, ValuePool, WorkState, WorkflowDelta,
    WorkflowHandling, WorkflowValue,
};

/// Whether an aggregate's sub-traces allow a stage to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Some sub-traces have not reached the stage's terminal set yet.
    NotReady { waiting: Vec<u64> },
    /// Some sub-traces are in an error state and need operator attention.
    Blocked { failed: Vec<u64> },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Load the sub-trace records of an aggregate in stored order.
pub async fn load_subtraces(
    store: &dyn ExperimentStore,
    record: &ExperimentRecord,
) -> Result<Vec<ExperimentRecord>, CoordError> {
    let ids = record.subtraces();
    match record.trace_type() {
        TraceKind::Single => return Ok(Vec::new()),
        TraceKind::Group if ids.is_empty() => {
            return Err(CoordError::Misuse(format!(
                "group experiment {} has no sub-traces",
                record.trace_id
            )))
        }
        TraceKind::Delta if ids.is_empty() || ids.len() % 2 != 0 => {
            return Err(CoordError::OddDeltaSubtraces(ids.len()))
        }
        _ => {}
    }

    let mut subs = Vec::with_capacity(ids.len());
    for &id in ids {
        let sub = store.get(id).await?.ok_or(CoordError::MissingSubtrace {
            parent: record.trace_id,
            subtrace: id,
        })?;
        if sub.trace_type() != TraceKind::Single {
            return Err(CoordError::InvalidSubtrace {
                parent: record.trace_id,
                subtrace: id,
            });
        }
        subs.push(sub);
    }
    Ok(subs)
}

/// Check that every sub-trace of `record` is done enough for `stage`.
///
/// Single experiments are always ready.
pub async fn is_it_ready_to_process(
    store: &dyn ExperimentStore,
    record: &ExperimentRecord,
    stage: Stage,
) -> Result<Readiness, CoordError> {
    let subs = load_subtraces(store, record).await?;
    Ok(readiness_of(&subs, stage))
}

fn readiness_of(subs: &[ExperimentRecord], stage: Stage) -> Readiness {
    let failed: Vec<u64> = subs
        .iter()
        .filter(|s| s.work_state.is_error())
        .map(|s| s.trace_id)
        .collect();
    if !failed.is_empty() {
        return Readiness::Blocked { failed };
    }

    let terminal = stage.subtrace_ready_states();
    let waiting: Vec<u64> = subs
        .iter()
        .filter(|s| !terminal.contains(&s.work_state))
        .map(|s| s.trace_id)
        .collect();
    if waiting.is_empty() {
        Readiness::Ready
    } else {
        Readiness::NotReady { waiting }
    }
}

/// Delta pairs: (0,1), (2,3), ... A trailing odd element is ignored.
pub fn delta_pairs<T: Copy>(subtraces: &[T]) -> Vec<(T, T)> {
    subtraces
        .chunks_exact(2)
        .map(|pair| (pair[0], pair[1]))
        .collect()
}

/// Workflows present on both sides, matched by name, in the first side's order.
pub fn match_workflows<'a>(
    first: &'a [WorkflowValue],
    second: &'a [WorkflowValue],
) -> Vec<(&'a WorkflowValue, &'a WorkflowValue)> {
    let by_name: HashMap<&str, &WorkflowValue> =
        second.iter().map(|v| (v.key.name.as_str(), v)).collect();
    first
        .iter()
        .filter_map(|v| by_name.get(v.key.name.as_str()).map(|other| (v, *other)))
        .collect()
}

/// Deltas of every matched workflow of one pair.
pub fn pair_deltas(pair: usize, first: &[WorkflowValue], second: &[WorkflowValue]) -> Vec<WorkflowDelta> {
    match_workflows(first, second)
        .into_iter()
        .map(|(a, b)| WorkflowDelta::between(pair, a, b))
        .collect()
}

pub(crate) async fn load_trace(
    store: &dyn ExperimentStore,
    record: &ExperimentRecord,
) -> Result<Trace, CoordError> {
    store
        .get_trace(record.trace_id)
        .await?
        .ok_or_else(|| CoordError::MissingData {
            trace_id: record.trace_id,
            what: "trace".to_string(),
        })
}

struct TraceValues {
    job_count: usize,
    jobs: JobValues,
    workflows: Vec<WorkflowValue>,
    utilization: SubtraceUtilization,
}

async fn trace_values(
    store: &dyn ExperimentStore,
    stats: &dyn StatsEngine,
    record: &ExperimentRecord,
    sibling: usize,
) -> Result<TraceValues, CoordError> {
    let trace = load_trace(store, record).await?;
    let window = record.window();
    let jobs = stats.job_values(&trace, window).await?;
    let workflows = stats
        .workflow_values(&trace, window, record.workflow_handling, sibling)
        .await?;
    let utilization = stats.utilization(&trace, window).await?;
    Ok(TraceValues {
        job_count: trace.job_count(),
        jobs,
        workflows,
        utilization: SubtraceUtilization {
            trace_id: record.trace_id,
            median: utilization.median,
            mean: utilization.mean,
        },
    })
}

/// Compute the analysis results of `record` without writing them.
pub async fn aggregate(
    store: &dyn ExperimentStore,
    stats: &dyn StatsEngine,
    record: &ExperimentRecord,
) -> Result<Vec<ResultEntry>, CoordError> {
    match record.trace_type() {
        TraceKind::Single => aggregate_single(store, stats, record).await,
        TraceKind::Group => aggregate_group(store, stats, record).await,
        TraceKind::Delta => aggregate_delta(store, stats, record).await,
    }
}

async fn aggregate_single(
    store: &dyn ExperimentStore,
    stats: &dyn StatsEngine,
    record: &ExperimentRecord,
) -> Result<Vec<ResultEntry>, CoordError> {
    let values = trace_values(store, stats, record, 0).await?;

    let mut entries = vec![ResultEntry::JobStats(stats.job_stats(&values.jobs).await?)];
    if record.workflow_handling != WorkflowHandling::No {
        entries.push(ResultEntry::WorkflowStats(
            stats.workflow_stats(&values.workflows).await?,
        ));
    }
    entries.push(ResultEntry::Utilization(UtilizationSummary {
        median: values.utilization.median,
        mean: values.utilization.mean,
        per_subtrace: Vec::new(),
    }));
    entries.push(ResultEntry::Summary(TraceSummary {
        job_count: values.job_count,
        workflow_count: values.workflows.len(),
    }));
    Ok(entries)
}

async fn aggregate_group(
    store: &dyn ExperimentStore,
    stats: &dyn StatsEngine,
    record: &ExperimentRecord,
) -> Result<Vec<ResultEntry>, CoordError> {
    let subs = load_subtraces(store, record).await?;

    let mut pool = ValuePool::new();
    let mut per_subtrace = Vec::with_capacity(subs.len());
    let mut job_count = 0;
    for (sibling, sub) in subs.iter().enumerate() {
        let values = trace_values(store, stats, sub, sibling).await?;
        let mode = if sibling == 0 {
            FoldMode::Reset
        } else {
            FoldMode::Append
        };
        debug!(
            "Folding sub-trace {} into group {} ({} jobs, {} workflows)",
            sub.trace_id,
            record.trace_id,
            values.jobs.len(),
            values.workflows.len()
        );
        pool.fold(mode, values.jobs, values.workflows);
        per_subtrace.push(values.utilization);
        job_count += values.job_count;
    }

    let medians: Vec<f64> = per_subtrace.iter().map(|u| u.median).collect();
    let means: Vec<f64> = per_subtrace.iter().map(|u| u.mean).collect();

    let mut entries = vec![ResultEntry::JobStats(stats.job_stats(&pool.jobs).await?)];
    if record.workflow_handling != WorkflowHandling::No {
        entries.push(ResultEntry::WorkflowStats(
            stats.workflow_stats(&pool.workflows).await?,
        ));
    }
    entries.push(ResultEntry::Utilization(UtilizationSummary {
        median: Stats::from_values(&medians).map_or(0.0, |s| s.median),
        mean: Stats::from_values(&means).map_or(0.0, |s| s.mean),
        per_subtrace,
    }));
    entries.push(ResultEntry::Summary(TraceSummary {
        job_count,
        workflow_count: pool.workflows.len(),
    }));
    Ok(entries)
}

async fn aggregate_delta(
    store: &dyn ExperimentStore,
    stats: &dyn StatsEngine,
    record: &ExperimentRecord,
) -> Result<Vec<ResultEntry>, CoordError> {
    let subs = load_subtraces(store, record).await?;
    let indices: Vec<usize> = (0..subs.len()).collect();

    let mut pairs = Vec::new();
    let mut deltas = Vec::new();
    let mut job_count = 0;
    for (pair, (i, j)) in delta_pairs(&indices).into_iter().enumerate() {
        let first = trace_values(store, stats, &subs[i], i).await?;
        let second = trace_values(store, stats, &subs[j], j).await?;
        let matched = pair_deltas(pair, &first.workflows, &second.workflows);
        debug!(
            "Delta {} pair ({}, {}): {} matched workflows",
            record.trace_id,
            subs[i].trace_id,
            subs[j].trace_id,
            matched.len()
        );
        pairs.push(PairSummary {
            first: subs[i].trace_id,
            second: subs[j].trace_id,
            matched_workflows: matched.len(),
            truncated_to: None,
        });
        job_count += first.job_count + second.job_count;
        deltas.extend(matched);
    }

    let summary = TraceSummary {
        job_count,
        workflow_count: deltas.len(),
    };
    Ok(vec![
        ResultEntry::DeltaStats(DeltaSummary {
            pairs,
            stats: stats.delta_stats(&deltas).await?,
        }),
        ResultEntry::Summary(summary),
    ])
}

/// Result of one attempt to claim ready work.
#[derive(Debug)]
pub enum Claimed {
    /// A claimed record and the state it was claimed from.
    Record {
        record: ExperimentRecord,
        from: WorkState,
    },
    /// An aggregate that was skipped because its sub-traces are not done.
    NotReady { trace_id: u64, readiness: Readiness },
    Exhausted,
}

/// Claim the oldest record of `kinds` that `stage` can process now.
///
/// Aggregates whose sub-traces are not ready are reported once and added to
/// `skip`; callers pass the same set back in to page past them.
pub async fn claim_ready(
    store: &dyn ExperimentStore,
    stage: Stage,
    kinds: &[TraceKind],
    opts: &ClaimOptions,
    skip: &mut HashSet<u64>,
) -> Result<Claimed, CoordError> {
    if opts.lease_ttl.is_some() {
        let expired = store
            .scan(
                &ScanFilter::states(stage.in_progress_states())
                    .kinds(kinds)
                    .lease_expired_before(Utc::now())
                    .limit(SCAN_BATCH),
            )
            .await?;
        for candidate in expired {
            if skip.contains(&candidate.trace_id) {
                continue;
            }
            if let Some(record) = claim_candidate(store, &candidate, stage, opts).await? {
                debug!(
                    "Took over expired claim on {} from {}",
                    candidate.trace_id,
                    candidate.assigned_worker.as_deref().unwrap_or("-")
                );
                return Ok(Claimed::Record {
                    record,
                    from: candidate.work_state,
                });
            }
        }
    }

    let mut cursor = 0;
    loop {
        let mut batch = Vec::new();
        for kind in kinds {
            let sources = stage.source_states(*kind);
            if sources.is_empty() {
                continue;
            }
            batch.extend(
                store
                    .scan(
                        &ScanFilter::states(sources)
                            .kinds(&[*kind])
                            .min_trace_id(cursor)
                            .limit(SCAN_BATCH),
                    )
                    .await?,
            );
        }
        batch.sort_by_key(|r| r.trace_id);
        batch.truncate(SCAN_BATCH);
        let Some(last) = batch.last() else {
            return Ok(Claimed::Exhausted);
        };
        cursor = last.trace_id + 1;

        for candidate in batch {
            if skip.contains(&candidate.trace_id) {
                continue;
            }
            if candidate.trace_type() != TraceKind::Single {
                let readiness = is_it_ready_to_process(store, &candidate, stage).await?;
                if !readiness.is_ready() {
                    skip.insert(candidate.trace_id);
                    return Ok(Claimed::NotReady {
                        trace_id: candidate.trace_id,
                        readiness,
                    });
                }
            }
            if let Some(record) = claim_candidate(store, &candidate, stage, opts).await? {
                return Ok(Claimed::Record {
                    record,
                    from: candidate.work_state,
                });
            }
            debug!("Lost claim race on {}", candidate.trace_id);
        }
    }
}
