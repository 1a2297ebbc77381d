use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xp_config::{PresetConfig, WorkflowHandling};

use crate::results::TimeWindow;
use crate::state::{Expectation, StateUpdate, WindowChange, WorkState};

/// Kind of experiment stored in the `trace_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Single,
    Group,
    Delta,
}

impl TraceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceKind::Single => "single",
            TraceKind::Group => "group",
            TraceKind::Delta => "delta",
        }
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(TraceKind::Single),
            "group" => Ok(TraceKind::Group),
            "delta" => Ok(TraceKind::Delta),
            other => Err(format!("Unknown trace type: {}", other)),
        }
    }
}

/// Variant payload of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trace_type", rename_all = "snake_case")]
pub enum ExperimentKind {
    Single,
    /// Repetitions of one configuration with different seeds.
    Group { subtraces: Vec<u64> },
    /// Pairs (0,1), (2,3), ... of experiments to compare.
    Delta { subtraces: Vec<u64> },
}

impl ExperimentKind {
    pub fn from_parts(kind: TraceKind, subtraces: Vec<u64>) -> Self {
        match kind {
            TraceKind::Single => ExperimentKind::Single,
            TraceKind::Group => ExperimentKind::Group { subtraces },
            TraceKind::Delta => ExperimentKind::Delta { subtraces },
        }
    }

    pub fn trace_type(&self) -> TraceKind {
        match self {
            ExperimentKind::Single => TraceKind::Single,
            ExperimentKind::Group { .. } => TraceKind::Group,
            ExperimentKind::Delta { .. } => TraceKind::Delta,
        }
    }

    pub fn subtraces(&self) -> &[u64] {
        match self {
            ExperimentKind::Single => &[],
            ExperimentKind::Group { subtraces } | ExperimentKind::Delta { subtraces } => subtraces,
        }
    }
}

/// Definition of an experiment before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExperiment {
    #[serde(default)]
    pub name: Option<String>,
    pub seed: String,
    pub machine: String,
    pub kind: ExperimentKind,
    #[serde(default)]
    pub manifest_list: Vec<String>,
    pub workflow_policy: String,
    #[serde(default)]
    pub workflow_period_s: u64,
    #[serde(default)]
    pub workflow_handling: WorkflowHandling,
    #[serde(default)]
    pub preload_time_s: u64,
    pub workload_duration_s: u64,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub overload_target: Option<f64>,
}

impl NewExperiment {
    /// A single experiment with no workflows.
    pub fn single(seed: impl Into<String>, machine: impl Into<String>) -> Self {
        NewExperiment {
            name: None,
            seed: seed.into(),
            machine: machine.into(),
            kind: ExperimentKind::Single,
            manifest_list: Vec::new(),
            workflow_policy: "no".to_string(),
            workflow_period_s: 0,
            workflow_handling: WorkflowHandling::No,
            preload_time_s: 0,
            workload_duration_s: 86400,
            start_date: DateTime::<Utc>::default(),
            overload_target: None,
        }
    }

    /// Build a single experiment from a configured preset.
    pub fn from_preset(preset: &PresetConfig, seed: impl Into<String>) -> Result<Self, String> {
        let start_date = match &preset.start_date {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| format!("Invalid start_date '{}': {}", raw, e))?
                .with_timezone(&Utc),
            None => DateTime::<Utc>::default(),
        };

        Ok(NewExperiment {
            name: None,
            seed: seed.into(),
            machine: preset.machine.clone(),
            kind: ExperimentKind::Single,
            manifest_list: preset.manifest_list.clone(),
            workflow_policy: preset.workflow_policy.clone(),
            workflow_period_s: preset.workflow_period_s,
            workflow_handling: preset.workflow_handling,
            preload_time_s: preset.preload_time_s,
            workload_duration_s: preset.workload_duration_s,
            start_date,
            overload_target: preset.overload_target,
        })
    }

    pub fn with_workflows(
        mut self,
        handling: WorkflowHandling,
        policy: impl Into<String>,
        period_s: u64,
        manifests: &[&str],
    ) -> Self {
        self.workflow_handling = handling;
        self.workflow_policy = policy.into();
        self.workflow_period_s = period_s;
        self.manifest_list = manifests.iter().map(|m| m.to_string()).collect();
        self
    }

    /// The same configuration wrapped as a group or delta over `subtraces`.
    pub fn aggregate_of(&self, kind: TraceKind, subtraces: Vec<u64>) -> Self {
        NewExperiment {
            name: None,
            kind: ExperimentKind::from_parts(kind, subtraces),
            ..self.clone()
        }
    }

    /// Stored name: the explicit one, or one derived from the definition.
    pub fn derive_name(&self) -> String {
        if let Some(name) = self.name.as_ref().filter(|n| !n.trim().is_empty()) {
            return name.clone();
        }

        let mut name = format!("{}-{}", self.machine, self.workflow_policy);
        if self.workflow_period_s > 0 {
            name.push_str(&format!("-p{}", self.workflow_period_s));
        }
        if self.workflow_handling != WorkflowHandling::No {
            name.push_str(&format!("-{}", self.workflow_handling));
            if !self.manifest_list.is_empty() {
                let stems: Vec<&str> = self.manifest_list.iter().map(|m| manifest_stem(m)).collect();
                name.push_str(&format!("-{}", stems.join("+")));
            }
        }
        if let Some(target) = self.overload_target {
            name.push_str(&format!("-o{}", target));
        }
        name.push_str(&format!("-{}h", self.workload_duration_s / 3600));
        match &self.kind {
            ExperimentKind::Single => name.push_str(&format!("-s{}", self.seed)),
            ExperimentKind::Group { subtraces } => {
                name.push_str(&format!("-group{}", subtraces.len()))
            }
            ExperimentKind::Delta { subtraces } => {
                name.push_str(&format!("-delta{}", subtraces.len() / 2))
            }
        }
        name
    }
}

/// Manifest name without directory or extension: `dir/floodplain.json` -> `floodplain`.
pub fn manifest_stem(manifest: &str) -> &str {
    let file = manifest.rsplit('/').next().unwrap_or(manifest);
    match file.rfind('.') {
        Some(dot) if dot > 0 => &file[..dot],
        _ => file,
    }
}

/// One stored experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub trace_id: u64,
    pub name: String,
    pub seed: String,
    pub machine: String,
    pub kind: ExperimentKind,
    pub manifest_list: Vec<String>,
    pub workflow_policy: String,
    pub workflow_period_s: u64,
    pub workflow_handling: WorkflowHandling,
    pub preload_time_s: u64,
    pub workload_duration_s: u64,
    pub start_date: DateTime<Utc>,
    pub overload_target: Option<f64>,
    pub work_state: WorkState,
    pub assigned_worker: Option<String>,
    /// Incremented by every state write; the compare-and-swap token.
    pub version: u64,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub state_entered_at: DateTime<Utc>,
    pub simulation_start: Option<DateTime<Utc>>,
    pub simulation_end: Option<DateTime<Utc>>,
}

impl ExperimentRecord {
    /// A freshly stored record for `new` under `trace_id`.
    pub fn from_new(trace_id: u64, new: &NewExperiment, now: DateTime<Utc>) -> Self {
        ExperimentRecord {
            trace_id,
            name: new.derive_name(),
            seed: new.seed.clone(),
            machine: new.machine.clone(),
            kind: new.kind.clone(),
            manifest_list: new.manifest_list.clone(),
            workflow_policy: new.workflow_policy.clone(),
            workflow_period_s: new.workflow_period_s,
            workflow_handling: new.workflow_handling,
            preload_time_s: new.preload_time_s,
            workload_duration_s: new.workload_duration_s,
            start_date: new.start_date,
            overload_target: new.overload_target,
            work_state: WorkState::Fresh,
            assigned_worker: None,
            version: 0,
            lease_expires_at: None,
            created_at: now,
            state_entered_at: now,
            simulation_start: None,
            simulation_end: None,
        }
    }

    pub fn trace_type(&self) -> TraceKind {
        self.kind.trace_type()
    }

    pub fn subtraces(&self) -> &[u64] {
        self.kind.subtraces()
    }

    /// The definition this record was created from.
    pub fn definition(&self) -> NewExperiment {
        NewExperiment {
            name: Some(self.name.clone()),
            seed: self.seed.clone(),
            machine: self.machine.clone(),
            kind: self.kind.clone(),
            manifest_list: self.manifest_list.clone(),
            workflow_policy: self.workflow_policy.clone(),
            workflow_period_s: self.workflow_period_s,
            workflow_handling: self.workflow_handling,
            preload_time_s: self.preload_time_s,
            workload_duration_s: self.workload_duration_s,
            start_date: self.start_date,
            overload_target: self.overload_target,
        }
    }

    /// First second of the measured period (after preload).
    pub fn start_epoch(&self) -> i64 {
        self.start_date.timestamp() + self.preload_time_s as i64
    }

    pub fn end_epoch(&self) -> i64 {
        self.start_epoch() + self.workload_duration_s as i64
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.start_epoch(),
            end: self.end_epoch(),
        }
    }

    /// Whether the record's lease has lapsed at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Apply a successful state write to this copy of the record.
    pub fn apply(&mut self, update: &StateUpdate) {
        self.work_state = update.state;
        self.assigned_worker = update.assigned_worker.clone();
        self.lease_expires_at = update.lease_expires_at;
        self.state_entered_at = update.entered_at;
        self.version += 1;
        match update.window {
            WindowChange::Keep => {}
            WindowChange::Start(at) => {
                self.simulation_start = Some(at);
                self.simulation_end = None;
            }
            WindowChange::End(at) => self.simulation_end = Some(at),
            WindowChange::Clear => {
                self.simulation_start = None;
                self.simulation_end = None;
            }
        }
    }

    /// Whether this copy satisfies a compare-and-swap expectation.
    pub fn satisfies(&self, expect: &Expectation) -> bool {
        self.work_state == expect.state
            && expect.version.map_or(true, |v| v == self.version)
            && expect
                .worker
                .as_ref()
                .map_or(true, |w| self.assigned_worker.as_deref() == Some(w.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow_experiment() -> NewExperiment {
        NewExperiment::single("AAAA", "edison").with_workflows(
            WorkflowHandling::Manifest,
            "period",
            3600,
            &["manifests/floodplain.json"],
        )
    }

    #[test]
    fn test_derive_name() {
        assert_eq!(
            workflow_experiment().derive_name(),
            "edison-period-p3600-manifest-floodplain-24h-sAAAA"
        );
        assert_eq!(
            NewExperiment::single("7", "edison").derive_name(),
            "edison-no-24h-s7"
        );
    }

    #[test]
    fn test_explicit_name_wins() {
        let mut new = workflow_experiment();
        new.name = Some("baseline".to_string());
        assert_eq!(new.derive_name(), "baseline");
    }

    #[test]
    fn test_aggregate_name() {
        let delta = workflow_experiment().aggregate_of(TraceKind::Delta, vec![1, 2, 3, 4]);
        assert!(delta.derive_name().ends_with("-delta2"));
        assert_eq!(delta.kind.subtraces(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_definition_roundtrips_through_record() {
        let new = workflow_experiment();
        let record = ExperimentRecord::from_new(3, &new, Utc::now());
        let definition = record.definition();
        assert_eq!(definition.name.as_deref(), Some(record.name.as_str()));
        assert_eq!(definition.manifest_list, new.manifest_list);

        // Aggregates built from it get their own name
        let group = definition.aggregate_of(TraceKind::Group, vec![3]);
        assert!(group.derive_name().ends_with("-group1"));
    }

    #[test]
    fn test_window_epochs() {
        let mut new = NewExperiment::single("A", "edison");
        new.start_date = DateTime::from_timestamp(1_000_000, 0).unwrap();
        new.preload_time_s = 7200;
        new.workload_duration_s = 3600;

        let record = ExperimentRecord::from_new(1, &new, Utc::now());
        assert_eq!(record.start_epoch(), 1_007_200);
        assert_eq!(record.end_epoch(), 1_010_800);
        assert_eq!(record.work_state, WorkState::Fresh);
        assert_eq!(record.version, 0);
    }

    #[test]
    fn test_manifest_stem() {
        assert_eq!(manifest_stem("floodplain.json"), "floodplain");
        assert_eq!(manifest_stem("a/b/synthLongWide.json"), "synthLongWide");
        assert_eq!(manifest_stem("plain"), "plain");
        assert_eq!(manifest_stem(".hidden"), ".hidden");
    }

    #[test]
    fn test_from_preset_parses_start_date() {
        let preset = PresetConfig {
            machine: "edison".to_string(),
            workflow_policy: "period".to_string(),
            workflow_period_s: 1800,
            workflow_handling: WorkflowHandling::Single,
            manifest_list: vec!["floodplain.json".to_string()],
            preload_time_s: 0,
            workload_duration_s: 3600,
            overload_target: None,
            start_date: Some("2015-01-01T00:00:00Z".to_string()),
        };
        let new = NewExperiment::from_preset(&preset, "B").unwrap();
        assert_eq!(new.start_date.timestamp(), 1_420_070_400);

        let bad = PresetConfig {
            start_date: Some("yesterday".to_string()),
            ..preset
        };
        assert!(NewExperiment::from_preset(&bad, "B").is_err());
    }
}
