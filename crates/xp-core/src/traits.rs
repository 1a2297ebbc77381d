use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use xp_config::WorkflowHandling;

use crate::error::{CollaboratorError, StoreError};
use crate::record::{ExperimentRecord, NewExperiment, TraceKind};
use crate::results::{
    JobValues, ResultEntry, ResultKind, StatsBundle, TimeWindow, Utilization, WorkflowDelta,
    WorkflowValue,
};
use crate::state::{Expectation, Purge, StateUpdate, WorkState};
use crate::trace::Trace;

/// Predicate for [`ExperimentStore::scan`]. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanFilter {
    pub states: Vec<WorkState>,
    pub kinds: Vec<TraceKind>,
    /// Only records with `trace_id >= min_trace_id`.
    pub min_trace_id: Option<u64>,
    /// Only records whose lease is set and expired before this instant.
    pub lease_expired_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ScanFilter {
    pub fn states(states: &[WorkState]) -> Self {
        ScanFilter {
            states: states.to_vec(),
            ..Default::default()
        }
    }

    pub fn kinds(mut self, kinds: &[TraceKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn min_trace_id(mut self, min: u64) -> Self {
        self.min_trace_id = Some(min);
        self
    }

    pub fn lease_expired_before(mut self, now: DateTime<Utc>) -> Self {
        self.lease_expired_before = Some(now);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// In-process evaluation, used by stores without a query language.
    pub fn matches(&self, record: &ExperimentRecord) -> bool {
        if !self.states.is_empty() && !self.states.contains(&record.work_state) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&record.trace_type()) {
            return false;
        }
        if self.min_trace_id.is_some_and(|min| record.trace_id < min) {
            return false;
        }
        if let Some(now) = self.lease_expired_before {
            if !record.lease_expired(now) {
                return false;
            }
        }
        true
    }
}

/// Rows a stage writes together with its final state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub trace: Option<Trace>,
    pub results: Vec<ResultEntry>,
}

impl StageOutput {
    pub fn trace(trace: Trace) -> Self {
        StageOutput {
            trace: Some(trace),
            results: Vec::new(),
        }
    }

    pub fn results(results: Vec<ResultEntry>) -> Self {
        StageOutput {
            trace: None,
            results,
        }
    }
}

/// Shared experiment table plus the trace and result rows keyed by `trace_id`.
///
/// Every state write is a conditional update: it applies only when the stored
/// row satisfies the [`Expectation`], and reports `false` otherwise. A
/// successful write increments the record's `version`.
#[async_trait]
pub trait ExperimentStore: Send + Sync + 'static {
    /// Persist a new record in `fresh` state and assign its `trace_id`.
    async fn insert(&self, new: &NewExperiment) -> Result<ExperimentRecord, StoreError>;

    async fn get(&self, trace_id: u64) -> Result<Option<ExperimentRecord>, StoreError>;

    /// Matching records ordered by ascending `trace_id`.
    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ExperimentRecord>, StoreError>;

    /// Apply `update` if the row satisfies `expect`. Zero rows affected is `Ok(false)`.
    async fn compare_and_swap(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
    ) -> Result<bool, StoreError>;

    /// Conditional state write that also deletes dependent rows in the same step.
    async fn reset(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
        purge: Purge,
    ) -> Result<bool, StoreError>;

    /// Conditional state write that also stores `output` in the same step.
    /// Nothing is written when `expect` does not hold.
    async fn commit(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
        output: &StageOutput,
    ) -> Result<bool, StoreError>;

    /// Extend the lease of an in-progress record still held by `worker`.
    /// Does not change `version`.
    async fn renew_lease(
        &self,
        trace_id: u64,
        worker: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn state_counts(&self) -> Result<BTreeMap<WorkState, usize>, StoreError>;

    /// Store (or replace) the trace of an experiment.
    async fn put_trace(&self, trace_id: u64, trace: &Trace) -> Result<(), StoreError>;

    async fn get_trace(&self, trace_id: u64) -> Result<Option<Trace>, StoreError>;

    async fn trace_job_count(&self, trace_id: u64) -> Result<Option<usize>, StoreError>;

    /// Store (or replace) the result bundle of `entry.kind()`.
    async fn put_result(&self, trace_id: u64, entry: &ResultEntry) -> Result<(), StoreError>;

    async fn get_result(
        &self,
        trace_id: u64,
        kind: ResultKind,
    ) -> Result<Option<ResultEntry>, StoreError>;

    async fn list_results(&self, trace_id: u64) -> Result<Vec<ResultEntry>, StoreError>;
}

/// External workload simulator.
#[async_trait]
pub trait Simulator: Send + Sync + 'static {
    /// Generate the workload for `record` and simulate it on `host` to completion.
    async fn generate_and_run(
        &self,
        record: &ExperimentRecord,
        host: &str,
    ) -> Result<(), CollaboratorError>;

    /// The trace produced for `record`, if the simulator holds one.
    async fn fetch_trace(&self, record: &ExperimentRecord)
        -> Result<Option<Trace>, CollaboratorError>;
}

/// External statistics engine.
#[async_trait]
pub trait StatsEngine: Send + Sync + 'static {
    async fn job_values(
        &self,
        trace: &Trace,
        window: TimeWindow,
    ) -> Result<JobValues, CollaboratorError>;

    /// Completed workflows in completion order, keyed by `sibling`. Not finalized.
    async fn workflow_values(
        &self,
        trace: &Trace,
        window: TimeWindow,
        handling: WorkflowHandling,
        sibling: usize,
    ) -> Result<Vec<WorkflowValue>, CollaboratorError>;

    async fn utilization(
        &self,
        trace: &Trace,
        window: TimeWindow,
    ) -> Result<Utilization, CollaboratorError>;

    async fn job_stats(&self, values: &JobValues) -> Result<StatsBundle, CollaboratorError>;

    async fn workflow_stats(
        &self,
        values: &[WorkflowValue],
    ) -> Result<StatsBundle, CollaboratorError>;

    async fn delta_stats(
        &self,
        deltas: &[WorkflowDelta],
    ) -> Result<StatsBundle, CollaboratorError>;
}
