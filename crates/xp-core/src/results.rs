//! Values exchanged with the statistics engine and the result bundles
//! persisted per experiment.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Measured period of an experiment in unix seconds, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn contains(&self, t: i64) -> bool {
        t >= self.start && t < self.end
    }
}

/// Per-job values of one or more traces, aligned by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobValues {
    pub runtime: Vec<f64>,
    pub wait: Vec<f64>,
    pub turnaround: Vec<f64>,
    pub stretch: Vec<f64>,
    pub cpus: Vec<f64>,
}

impl JobValues {
    pub fn len(&self) -> usize {
        self.runtime.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtime.is_empty()
    }

    fn extend(&mut self, other: JobValues) {
        self.runtime.extend(other.runtime);
        self.wait.extend(other.wait);
        self.turnaround.extend(other.turnaround);
        self.stretch.extend(other.stretch);
        self.cpus.extend(other.cpus);
    }
}

/// Identity of a workflow while merging siblings: the sub-trace it came
/// from plus its name inside that sub-trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub sibling: usize,
    pub name: String,
}

/// One completed workflow, before statistics are finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowValue {
    pub key: WorkflowKey,
    pub manifest: String,
    pub submit: i64,
    pub start: i64,
    pub end: i64,
    pub runtime: f64,
    pub wait: f64,
    pub turnaround: f64,
    pub stretch: f64,
}

impl WorkflowValue {
    pub fn metric(&self, metric: WorkflowMetric) -> f64 {
        match metric {
            WorkflowMetric::Runtime => self.runtime,
            WorkflowMetric::Wait => self.wait,
            WorkflowMetric::Turnaround => self.turnaround,
            WorkflowMetric::Stretch => self.stretch,
        }
    }
}

/// Workflow measures compared across delta pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkflowMetric {
    Runtime,
    Wait,
    Turnaround,
    Stretch,
}

impl WorkflowMetric {
    pub const ALL: [WorkflowMetric; 4] = [
        WorkflowMetric::Runtime,
        WorkflowMetric::Wait,
        WorkflowMetric::Turnaround,
        WorkflowMetric::Stretch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowMetric::Runtime => "runtime",
            WorkflowMetric::Wait => "wait",
            WorkflowMetric::Turnaround => "turnaround",
            WorkflowMetric::Stretch => "stretch",
        }
    }
}

/// Second-minus-first difference for one workflow matched across a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDelta {
    pub pair: usize,
    pub workflow: String,
    pub runtime: f64,
    pub wait: f64,
    pub turnaround: f64,
    pub stretch: f64,
}

impl WorkflowDelta {
    pub fn between(pair: usize, first: &WorkflowValue, second: &WorkflowValue) -> Self {
        WorkflowDelta {
            pair,
            workflow: first.key.name.clone(),
            runtime: second.runtime - first.runtime,
            wait: second.wait - first.wait,
            turnaround: second.turnaround - first.turnaround,
            stretch: second.stretch - first.stretch,
        }
    }
}

/// Whether a fold starts a new pool or extends the existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldMode {
    Reset,
    Append,
}

/// Accumulated job and workflow values across sub-traces.
#[derive(Debug, Clone, Default)]
pub struct ValuePool {
    pub jobs: JobValues,
    pub workflows: Vec<WorkflowValue>,
    folds: usize,
}

impl ValuePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold(&mut self, mode: FoldMode, jobs: JobValues, workflows: Vec<WorkflowValue>) {
        match mode {
            FoldMode::Reset => {
                self.jobs = jobs;
                self.workflows = workflows;
                self.folds = 1;
            }
            FoldMode::Append => {
                self.jobs.extend(jobs);
                self.workflows.extend(workflows);
                self.folds += 1;
            }
        }
    }

    /// Number of sub-traces folded since the last reset.
    pub fn folds(&self) -> usize {
        self.folds
    }
}

/// Share of machine capacity in use over a trace's window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    pub median: f64,
    pub mean: f64,
}

/// Summary statistics of one measure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
    pub p95: f64,
}

impl Stats {
    /// Statistics of `values`; `None` when empty or when a value is not finite.
    pub fn from_values(values: &[f64]) -> Option<Stats> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;

        Some(Stats {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean,
            median: percentile(&sorted, 50.0),
            p25: percentile(&sorted, 25.0),
            p75: percentile(&sorted, 75.0),
            p95: percentile(&sorted, 95.0),
        })
    }
}

/// Linear-interpolated percentile of an ascending slice.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (pct / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

/// Named statistics computed from one value set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsBundle {
    pub count: usize,
    pub metrics: BTreeMap<String, Stats>,
}

/// Utilization of a single trace or of every member of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSummary {
    pub median: f64,
    pub mean: f64,
    #[serde(default)]
    pub per_subtrace: Vec<SubtraceUtilization>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtraceUtilization {
    pub trace_id: u64,
    pub median: f64,
    pub mean: f64,
}

/// Counts recorded by the analysis stage and read by the second pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub job_count: usize,
    pub workflow_count: usize,
}

/// Per-pair workflow deltas plus statistics over all pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub pairs: Vec<PairSummary>,
    pub stats: StatsBundle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSummary {
    pub first: u64,
    pub second: u64,
    pub matched_workflows: usize,
    /// Workflows kept per side; set by the second pass.
    #[serde(default)]
    pub truncated_to: Option<usize>,
}

/// Key under which a result bundle is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    JobStats,
    WorkflowStats,
    Utilization,
    DeltaStats,
    Summary,
    ReconciledWorkflowStats,
    ReconciledDeltaStats,
}

impl ResultKind {
    pub const ALL: [ResultKind; 7] = [
        ResultKind::JobStats,
        ResultKind::WorkflowStats,
        ResultKind::Utilization,
        ResultKind::DeltaStats,
        ResultKind::Summary,
        ResultKind::ReconciledWorkflowStats,
        ResultKind::ReconciledDeltaStats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::JobStats => "job_stats",
            ResultKind::WorkflowStats => "workflow_stats",
            ResultKind::Utilization => "utilization",
            ResultKind::DeltaStats => "delta_stats",
            ResultKind::Summary => "summary",
            ResultKind::ReconciledWorkflowStats => "reconciled_workflow_stats",
            ResultKind::ReconciledDeltaStats => "reconciled_delta_stats",
        }
    }

    /// Results written by the second pass.
    pub fn is_second_pass(&self) -> bool {
        matches!(
            self,
            ResultKind::ReconciledWorkflowStats | ResultKind::ReconciledDeltaStats
        )
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResultKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown result kind: {}", s))
    }
}

/// One stored result bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResultEntry {
    JobStats(StatsBundle),
    WorkflowStats(StatsBundle),
    Utilization(UtilizationSummary),
    DeltaStats(DeltaSummary),
    Summary(TraceSummary),
    ReconciledWorkflowStats(StatsBundle),
    ReconciledDeltaStats(DeltaSummary),
}

impl ResultEntry {
    pub fn kind(&self) -> ResultKind {
        match self {
            ResultEntry::JobStats(_) => ResultKind::JobStats,
            ResultEntry::WorkflowStats(_) => ResultKind::WorkflowStats,
            ResultEntry::Utilization(_) => ResultKind::Utilization,
            ResultEntry::DeltaStats(_) => ResultKind::DeltaStats,
            ResultEntry::Summary(_) => ResultKind::Summary,
            ResultEntry::ReconciledWorkflowStats(_) => ResultKind::ReconciledWorkflowStats,
            ResultEntry::ReconciledDeltaStats(_) => ResultKind::ReconciledDeltaStats,
        }
    }
}
