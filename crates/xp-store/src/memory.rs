use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use xp_core::{
    Expectation, ExperimentRecord, ExperimentStore, NewExperiment, Purge, ResultEntry, ResultKind,
    ScanFilter, StageOutput, StateUpdate, StoreError, Trace, WorkState,
};

#[derive(Default)]
struct Tables {
    last_id: u64,
    records: BTreeMap<u64, ExperimentRecord>,
    traces: HashMap<u64, Trace>,
    results: HashMap<u64, BTreeMap<ResultKind, ResultEntry>>,
}

impl Tables {
    fn purge(&mut self, trace_id: u64, purge: Purge) {
        match purge {
            Purge::Nothing => {}
            Purge::SecondPass => {
                if let Some(results) = self.results.get_mut(&trace_id) {
                    results.retain(|kind, _| !kind.is_second_pass());
                }
            }
            Purge::Results => {
                self.results.remove(&trace_id);
            }
            Purge::TraceAndResults => {
                self.traces.remove(&trace_id);
                self.results.remove(&trace_id);
            }
        }
    }
}

/// In-memory store for tests and single-process runs.
///
/// Every operation takes the table lock once, so each conditional update is
/// atomic with respect to concurrent tasks.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn insert(&self, new: &NewExperiment) -> Result<ExperimentRecord, StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.last_id += 1;
        let record = ExperimentRecord::from_new(tables.last_id, new, Utc::now());
        tables.records.insert(record.trace_id, record.clone());
        Ok(record)
    }

    async fn get(&self, trace_id: u64) -> Result<Option<ExperimentRecord>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables.records.get(&trace_id).cloned())
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ExperimentRecord>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .records
            .values()
            .filter(|r| filter.matches(r))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn compare_and_swap(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        match tables.records.get_mut(&trace_id) {
            Some(record) if record.satisfies(expect) => {
                record.apply(update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
        purge: Purge,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        match tables.records.get_mut(&trace_id) {
            Some(record) if record.satisfies(expect) => record.apply(update),
            _ => return Ok(false),
        }
        tables.purge(trace_id, purge);
        Ok(true)
    }

    async fn commit(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
        output: &StageOutput,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        match tables.records.get_mut(&trace_id) {
            Some(record) if record.satisfies(expect) => record.apply(update),
            _ => return Ok(false),
        }
        if let Some(trace) = &output.trace {
            tables.traces.insert(trace_id, trace.clone());
        }
        if !output.results.is_empty() {
            let results = tables.results.entry(trace_id).or_default();
            for entry in &output.results {
                results.insert(entry.kind(), entry.clone());
            }
        }
        Ok(true)
    }

    async fn renew_lease(
        &self,
        trace_id: u64,
        worker: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        match tables.records.get_mut(&trace_id) {
            Some(record)
                if record.work_state.is_in_progress()
                    && record.assigned_worker.as_deref() == Some(worker) =>
            {
                record.lease_expires_at = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn state_counts(&self) -> Result<BTreeMap<WorkState, usize>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut counts = BTreeMap::new();
        for record in tables.records.values() {
            *counts.entry(record.work_state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn put_trace(&self, trace_id: u64, trace: &Trace) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if !tables.records.contains_key(&trace_id) {
            return Err(StoreError::NotFound(trace_id));
        }
        tables.traces.insert(trace_id, trace.clone());
        Ok(())
    }

    async fn get_trace(&self, trace_id: u64) -> Result<Option<Trace>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables.traces.get(&trace_id).cloned())
    }

    async fn trace_job_count(&self, trace_id: u64) -> Result<Option<usize>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables.traces.get(&trace_id).map(|t| t.job_count()))
    }

    async fn put_result(&self, trace_id: u64, entry: &ResultEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if !tables.records.contains_key(&trace_id) {
            return Err(StoreError::NotFound(trace_id));
        }
        tables
            .results
            .entry(trace_id)
            .or_default()
            .insert(entry.kind(), entry.clone());
        Ok(())
    }

    async fn get_result(
        &self,
        trace_id: u64,
        kind: ResultKind,
    ) -> Result<Option<ResultEntry>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .results
            .get(&trace_id)
            .and_then(|results| results.get(&kind))
            .cloned())
    }

    async fn list_results(&self, trace_id: u64) -> Result<Vec<ResultEntry>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .results
            .get(&trace_id)
            .map(|results| results.values().cloned().collect())
            .unwrap_or_default())
    }
}
