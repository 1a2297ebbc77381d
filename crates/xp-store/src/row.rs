//! Column encoding shared by the SQL stores.
//!
//! Timestamps are stored as fixed-width RFC 3339 text with nanoseconds, so
//! values round-trip exactly and text order equals time order.

use chrono::{DateTime, SecondsFormat, Utc};

use xp_core::{
    ExperimentKind, ExperimentRecord, ResultKind, StoreError, TraceKind, WindowChange,
    WorkflowHandling, WorkState,
};

pub(crate) const COLUMNS: &str = "trace_id, name, seed, machine, trace_type, subtraces, \
    manifest_list, workflow_policy, workflow_period_s, workflow_handling, preload_time_s, \
    workload_duration_s, start_date, overload_target, work_state, assigned_worker, version, \
    lease_expires_at, created_at, state_entered_at, simulation_start, simulation_end";

pub(crate) fn encode_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn encode_opt_ts(t: Option<&DateTime<Utc>>) -> Option<String> {
    t.map(encode_ts)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("Invalid timestamp '{}': {}", raw, e)))
}

fn decode_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(decode_ts).transpose()
}

/// `(mode, at)` parameters driving the `CASE` expressions on the simulation timestamps.
pub(crate) fn window_params(window: &WindowChange) -> (&'static str, Option<String>) {
    match window {
        WindowChange::Keep => ("keep", None),
        WindowChange::Start(at) => ("start", Some(encode_ts(at))),
        WindowChange::End(at) => ("end", Some(encode_ts(at))),
        WindowChange::Clear => ("clear", None),
    }
}

/// Quoted, comma-separated `as_str` values for an `IN (...)` list of constants.
pub(crate) fn quoted_list<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    values
        .into_iter()
        .map(|v| format!("'{}'", v))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn in_progress_list() -> String {
    quoted_list(
        WorkState::ALL
            .iter()
            .filter(|s| s.is_in_progress())
            .map(|s| s.as_str()),
    )
}

pub(crate) fn second_pass_kinds() -> String {
    quoted_list(
        ResultKind::ALL
            .iter()
            .filter(|k| k.is_second_pass())
            .map(|k| k.as_str()),
    )
}

/// One `experiments` row in storage types, in [`COLUMNS`] order.
pub(crate) struct RecordRow {
    pub trace_id: i64,
    pub name: String,
    pub seed: String,
    pub machine: String,
    pub trace_type: String,
    pub subtraces: String,
    pub manifest_list: String,
    pub workflow_policy: String,
    pub workflow_period_s: i64,
    pub workflow_handling: String,
    pub preload_time_s: i64,
    pub workload_duration_s: i64,
    pub start_date: String,
    pub overload_target: Option<f64>,
    pub work_state: String,
    pub assigned_worker: Option<String>,
    pub version: i64,
    pub lease_expires_at: Option<String>,
    pub created_at: String,
    pub state_entered_at: String,
    pub simulation_start: Option<String>,
    pub simulation_end: Option<String>,
}

impl RecordRow {
    pub(crate) fn into_record(self) -> Result<ExperimentRecord, StoreError> {
        let trace_type: TraceKind = self.trace_type.parse().map_err(StoreError::Serialization)?;
        let subtraces: Vec<u64> = serde_json::from_str(&self.subtraces)?;
        let workflow_handling: WorkflowHandling = self
            .workflow_handling
            .parse()
            .map_err(StoreError::Serialization)?;
        let work_state: WorkState = self.work_state.parse().map_err(StoreError::Serialization)?;

        Ok(ExperimentRecord {
            trace_id: self.trace_id as u64,
            name: self.name,
            seed: self.seed,
            machine: self.machine,
            kind: ExperimentKind::from_parts(trace_type, subtraces),
            manifest_list: serde_json::from_str(&self.manifest_list)?,
            workflow_policy: self.workflow_policy,
            workflow_period_s: self.workflow_period_s as u64,
            workflow_handling,
            preload_time_s: self.preload_time_s as u64,
            workload_duration_s: self.workload_duration_s as u64,
            start_date: decode_ts(&self.start_date)?,
            overload_target: self.overload_target,
            work_state,
            assigned_worker: self.assigned_worker,
            version: self.version as u64,
            lease_expires_at: decode_opt_ts(self.lease_expires_at)?,
            created_at: decode_ts(&self.created_at)?,
            state_entered_at: decode_ts(&self.state_entered_at)?,
            simulation_start: decode_opt_ts(self.simulation_start)?,
            simulation_end: decode_opt_ts(self.simulation_end)?,
        })
    }
}
