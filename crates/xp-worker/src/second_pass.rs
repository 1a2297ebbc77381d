//! Second-pass reconciliation.
//!
//! Siblings of a group or delta may finish different numbers of workflows
//! before the cutoff. The second pass truncates every sibling to a common
//! count, in completion order, and recomputes the workflow statistics.
//! Workflows are keyed by `(sibling, name)` while merged, so identical names
//! from different siblings never collide.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use xp_core::{
    advance_with, claim_by_id, release, ClaimOptions, CoordError, DeltaSummary, ExperimentRecord,
    ExperimentStore, PairSummary, ResultEntry, ResultKind, Stage, StageOutput, StatsEngine,
    TraceKind, WindowChange, WorkState, WorkflowValue,
};

use crate::analysis::log_not_ready;
use crate::coordinator::{
    claim_ready, delta_pairs, is_it_ready_to_process, load_subtraces, load_trace, pair_deltas,
    Claimed,
};
use crate::lease::Heartbeat;
use crate::settings::WorkerSettings;
use crate::stage::{hand_back, settle_failure};
use crate::summary::{serve_loop, Outcome, RunSummary};

const RECONCILED_KINDS: [TraceKind; 2] = [TraceKind::Group, TraceKind::Delta];

/// The count every sibling is truncated to.
pub fn common_count(counts: &[usize]) -> usize {
    counts.iter().copied().min().unwrap_or(0)
}

/// Keep the `count` workflows of a sibling that completed first, ordered by
/// end time. Ties keep their input order.
pub fn truncate_in_completion_order(mut values: Vec<WorkflowValue>, count: usize) -> Vec<WorkflowValue> {
    values.sort_by_key(|v| v.end);
    values.truncate(count);
    values
}

pub struct SecondPass {
    store: Arc<dyn ExperimentStore>,
    stats: Arc<dyn StatsEngine>,
    settings: WorkerSettings,
}

impl SecondPass {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        stats: Arc<dyn StatsEngine>,
        settings: WorkerSettings,
    ) -> Self {
        SecondPass {
            store,
            stats,
            settings,
        }
    }

    /// Reconcile one aggregate by id, or every analyzed aggregate until none is left.
    pub async fn run(&self, trace_id: Option<u64>) -> Result<RunSummary, CoordError> {
        let opts = self.settings.claim_options();
        let store = self.store.as_ref();
        let mut summary = RunSummary::default();

        match trace_id {
            Some(id) => {
                let record = store.get(id).await?.ok_or(CoordError::NotFound(id))?;
                if record.trace_type() == TraceKind::Single {
                    return Err(CoordError::Misuse(format!(
                        "experiment {} is a single experiment; the second pass reconciles groups and deltas",
                        id
                    )));
                }
                let readiness = is_it_ready_to_process(store, &record, Stage::SecondPass).await?;
                if !readiness.is_ready() {
                    log_not_ready(id, &readiness);
                    summary.record(id, Outcome::NotReady);
                    return Ok(summary);
                }
                let from = record.work_state;
                let mut claimed = claim_by_id(store, id, Stage::SecondPass, &opts).await?;
                let outcome = self.process(&mut claimed, from, &opts).await?;
                summary.record(id, outcome);
            }
            None => {
                let mut skip = HashSet::new();
                loop {
                    match claim_ready(store, Stage::SecondPass, &RECONCILED_KINDS, &opts, &mut skip)
                        .await?
                    {
                        Claimed::Record { mut record, from } => {
                            let id = record.trace_id;
                            let outcome = self.process(&mut record, from, &opts).await?;
                            skip.insert(id);
                            summary.record(id, outcome);
                        }
                        Claimed::NotReady {
                            trace_id,
                            readiness,
                        } => {
                            log_not_ready(trace_id, &readiness);
                            summary.record(trace_id, Outcome::NotReady);
                        }
                        Claimed::Exhausted => break,
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Poll for analyzed aggregates until `shutdown` is set.
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<(), CoordError> {
        serve_loop(
            "Second pass",
            self.settings.poll_interval,
            shutdown,
            || self.run(None),
        )
        .await
    }

    async fn process(
        &self,
        record: &mut ExperimentRecord,
        from: WorkState,
        opts: &ClaimOptions,
    ) -> Result<Outcome, CoordError> {
        let store = self.store.as_ref();
        let readiness = match is_it_ready_to_process(store, record, Stage::SecondPass).await {
            Ok(readiness) => readiness,
            Err(e) => return settle_failure(store, record, Stage::SecondPass, from, opts, e).await,
        };
        if !readiness.is_ready() {
            log_not_ready(record.trace_id, &readiness);
            return hand_back(store, record, Stage::SecondPass, from).await;
        }

        let heartbeat = Heartbeat::start(self.store.clone(), record, opts);
        let result = self.reconcile(record).await;
        let result = match result {
            Ok(entry) => self.commit(record, entry, opts).await,
            Err(e) => Err(e),
        };
        heartbeat.stop().await;

        match result {
            Ok(()) => Ok(Outcome::Succeeded),
            Err(e) => settle_failure(store, record, Stage::SecondPass, from, opts, e).await,
        }
    }

    async fn reconcile(&self, record: &ExperimentRecord) -> Result<ResultEntry, CoordError> {
        let subs = load_subtraces(self.store.as_ref(), record).await?;
        match record.trace_type() {
            TraceKind::Group => {
                let counts = self.workflow_counts(&subs).await?;
                let common = common_count(&counts);
                info!(
                    "Group {} workflow counts {:?}, truncating to {}",
                    record.trace_id, counts, common
                );
                self.reconcile_group(&subs, &vec![common; subs.len()]).await
            }
            TraceKind::Delta => self.reconcile_delta(record, &subs).await,
            TraceKind::Single => Err(CoordError::Misuse(format!(
                "experiment {} has no siblings to reconcile",
                record.trace_id
            ))),
        }
    }

    async fn commit(
        &self,
        record: &mut ExperimentRecord,
        entry: ResultEntry,
        opts: &ClaimOptions,
    ) -> Result<(), CoordError> {
        let store = self.store.as_ref();
        advance_with(
            store,
            record,
            WorkState::SecondPassDone,
            WindowChange::Keep,
            opts,
            &StageOutput::results(vec![entry]),
        )
        .await?;
        info!("Experiment {} reconciled", record.trace_id);
        Ok(())
    }

    /// Completed-workflow counts recorded by the analysis of each sibling.
    async fn workflow_counts(&self, subs: &[ExperimentRecord]) -> Result<Vec<usize>, CoordError> {
        let mut counts = Vec::with_capacity(subs.len());
        for sub in subs {
            match self
                .store
                .get_result(sub.trace_id, ResultKind::Summary)
                .await?
            {
                Some(ResultEntry::Summary(summary)) => counts.push(summary.workflow_count),
                _ => {
                    return Err(CoordError::MissingData {
                        trace_id: sub.trace_id,
                        what: "summary".to_string(),
                    })
                }
            }
        }
        Ok(counts)
    }

    async fn sibling_workflows(
        &self,
        sub: &ExperimentRecord,
        sibling: usize,
        limit: usize,
    ) -> Result<Vec<WorkflowValue>, CoordError> {
        let trace = load_trace(self.store.as_ref(), sub).await?;
        let values = self
            .stats
            .workflow_values(&trace, sub.window(), sub.workflow_handling, sibling)
            .await?;
        Ok(truncate_in_completion_order(values, limit))
    }

    async fn reconcile_group(
        &self,
        subs: &[ExperimentRecord],
        limits: &[usize],
    ) -> Result<ResultEntry, CoordError> {
        let mut pooled = Vec::new();
        for (sibling, (sub, limit)) in subs.iter().zip(limits).enumerate() {
            pooled.extend(self.sibling_workflows(sub, sibling, *limit).await?);
        }
        let stats = self.stats.workflow_stats(&pooled).await?;
        Ok(ResultEntry::ReconciledWorkflowStats(stats))
    }

    async fn reconcile_delta(
        &self,
        record: &ExperimentRecord,
        subs: &[ExperimentRecord],
    ) -> Result<ResultEntry, CoordError> {
        let counts = self.workflow_counts(subs).await?;
        let indices: Vec<usize> = (0..subs.len()).collect();

        let mut pairs = Vec::new();
        let mut deltas = Vec::new();
        for (pair, (i, j)) in delta_pairs(&indices).into_iter().enumerate() {
            let limit = common_count(&[counts[i], counts[j]]);
            let first = self.sibling_workflows(&subs[i], i, limit).await?;
            let second = self.sibling_workflows(&subs[j], j, limit).await?;
            let matched = pair_deltas(pair, &first, &second);
            pairs.push(PairSummary {
                first: subs[i].trace_id,
                second: subs[j].trace_id,
                matched_workflows: matched.len(),
                truncated_to: Some(limit),
            });
            deltas.extend(matched);
        }
        info!(
            "Delta {} reconciled over {} pairs, {} matched workflows",
            record.trace_id,
            pairs.len(),
            deltas.len()
        );

        Ok(ResultEntry::ReconciledDeltaStats(DeltaSummary {
            pairs,
            stats: self.stats.delta_stats(&deltas).await?,
        }))
    }

    /// Reconcile groups whose members line up by index, taking the minimum
    /// count per aligned index across all `parents`.
    ///
    /// Either every parent is claimed or none is; parents not yet ready are
    /// reported and nothing is claimed.
    pub async fn run_aligned(&self, parents: &[u64]) -> Result<RunSummary, CoordError> {
        let opts = self.settings.claim_options();
        let store = self.store.as_ref();
        let mut summary = RunSummary::default();

        let mut records = Vec::with_capacity(parents.len());
        for &id in parents {
            let record = store.get(id).await?.ok_or(CoordError::NotFound(id))?;
            if record.trace_type() != TraceKind::Group {
                return Err(CoordError::Misuse(format!(
                    "aligned reconciliation needs group experiments, {} is a {}",
                    id,
                    record.trace_type()
                )));
            }
            records.push(record);
        }
        let Some(width) = records.first().map(|r| r.subtraces().len()) else {
            return Ok(summary);
        };
        if let Some(odd) = records.iter().find(|r| r.subtraces().len() != width) {
            return Err(CoordError::Misuse(format!(
                "group {} has {} sub-traces, expected {}",
                odd.trace_id,
                odd.subtraces().len(),
                width
            )));
        }

        let mut not_ready = false;
        for record in &records {
            let readiness = is_it_ready_to_process(store, record, Stage::SecondPass).await?;
            if !readiness.is_ready() {
                log_not_ready(record.trace_id, &readiness);
                not_ready = true;
            }
        }
        if not_ready {
            for record in &records {
                summary.record(record.trace_id, Outcome::NotReady);
            }
            return Ok(summary);
        }

        let mut members = Vec::with_capacity(records.len());
        let mut limits = vec![usize::MAX; width];
        for record in &records {
            let subs = load_subtraces(store, record).await?;
            let counts = self.workflow_counts(&subs).await?;
            for (limit, count) in limits.iter_mut().zip(&counts) {
                *limit = (*limit).min(*count);
            }
            members.push(subs);
        }
        info!("Aligned workflow limits for {:?}: {:?}", parents, limits);

        let mut claimed: Vec<ExperimentRecord> = Vec::with_capacity(records.len());
        for record in &records {
            match claim_by_id(store, record.trace_id, Stage::SecondPass, &opts).await {
                Ok(c) => claimed.push(c),
                Err(e) => {
                    for held in &mut claimed {
                        if let Err(re) =
                            release(store, held, Stage::SecondPass, WorkState::AnalysisDone).await
                        {
                            warn!("Failed to release {}: {}", held.trace_id, re);
                        }
                    }
                    return Err(e);
                }
            }
        }

        for (record, subs) in claimed.iter_mut().zip(&members) {
            let result = match self.reconcile_group(subs, &limits).await {
                Ok(entry) => self.commit(record, entry, &opts).await,
                Err(e) => Err(e),
            };
            let outcome = match result {
                Ok(()) => Outcome::Succeeded,
                Err(e) => {
                    settle_failure(
                        store,
                        record,
                        Stage::SecondPass,
                        WorkState::AnalysisDone,
                        &opts,
                        e,
                    )
                    .await?
                }
            };
            summary.record(record.trace_id, outcome);
        }

        Ok(summary)
    }
}
