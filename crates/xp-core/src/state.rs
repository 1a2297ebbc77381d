//! Experiment state machine.
//!
//! States advance left to right along the pipeline. The only backwards
//! edges are administrative resets, which go through
//! [`ExperimentStore::reset`](crate::ExperimentStore::reset) instead of
//! [`WorkState::can_advance_to`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::TraceKind;

/// Pipeline state of one experiment. Declaration order is pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Fresh,
    PreSimulating,
    Simulating,
    SimulationFailed,
    SimulationError,
    SimulationDone,
    Pending,
    PreAnalyzing,
    Analyzing,
    AnalysisError,
    AnalysisDone,
    PreSecondPass,
    SecondPassDone,
}

impl WorkState {
    pub const ALL: [WorkState; 13] = [
        WorkState::Fresh,
        WorkState::PreSimulating,
        WorkState::Simulating,
        WorkState::SimulationFailed,
        WorkState::SimulationError,
        WorkState::SimulationDone,
        WorkState::Pending,
        WorkState::PreAnalyzing,
        WorkState::Analyzing,
        WorkState::AnalysisError,
        WorkState::AnalysisDone,
        WorkState::PreSecondPass,
        WorkState::SecondPassDone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkState::Fresh => "fresh",
            WorkState::PreSimulating => "pre_simulating",
            WorkState::Simulating => "simulating",
            WorkState::SimulationFailed => "simulation_failed",
            WorkState::SimulationError => "simulation_error",
            WorkState::SimulationDone => "simulation_done",
            WorkState::Pending => "pending",
            WorkState::PreAnalyzing => "pre_analyzing",
            WorkState::Analyzing => "analyzing",
            WorkState::AnalysisError => "analysis_error",
            WorkState::AnalysisDone => "analysis_done",
            WorkState::PreSecondPass => "pre_second_pass",
            WorkState::SecondPassDone => "second_pass_done",
        }
    }

    /// States in which exactly one worker owns the record.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            WorkState::PreSimulating
                | WorkState::Simulating
                | WorkState::PreAnalyzing
                | WorkState::Analyzing
                | WorkState::PreSecondPass
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            WorkState::SimulationFailed | WorkState::SimulationError | WorkState::AnalysisError
        )
    }

    /// True once a validated trace must exist for the record.
    pub fn has_trace(&self) -> bool {
        matches!(
            self,
            WorkState::SimulationDone
                | WorkState::PreAnalyzing
                | WorkState::Analyzing
                | WorkState::AnalysisError
                | WorkState::AnalysisDone
                | WorkState::PreSecondPass
                | WorkState::SecondPassDone
        )
    }

    /// The stage whose worker holds a record in this in-progress state.
    pub fn owning_stage(&self) -> Option<Stage> {
        match self {
            WorkState::PreSimulating | WorkState::Simulating => Some(Stage::Simulation),
            WorkState::PreAnalyzing | WorkState::Analyzing => Some(Stage::Analysis),
            WorkState::PreSecondPass => Some(Stage::SecondPass),
            _ => None,
        }
    }

    /// Whether a worker may move a record from `self` to `next`.
    pub fn can_advance_to(&self, next: WorkState) -> bool {
        use WorkState::*;

        // Lease takeover: an abandoned in-progress record is re-claimed.
        if let (Some(stage), Some(next_stage)) = (self.owning_stage(), next.owning_stage()) {
            if stage == next_stage && next == stage.claim_state() {
                return true;
            }
        }

        matches!(
            (*self, next),
            (Fresh, PreSimulating)
                | (Fresh, PreAnalyzing)
                | (PreSimulating, Simulating)
                | (Simulating, SimulationDone)
                | (PreSimulating | Simulating, SimulationFailed | SimulationError)
                | (PreSimulating | SimulationFailed | SimulationError, SimulationDone)
                | (SimulationDone | Pending, PreAnalyzing)
                | (PreAnalyzing, Analyzing)
                | (Analyzing, AnalysisDone)
                | (PreAnalyzing | Analyzing, AnalysisError)
                | (AnalysisDone, PreSecondPass)
                | (PreSecondPass, SecondPassDone | AnalysisError)
        )
    }

    /// Whether an administrative reset may rewind a record from `self` to `to`.
    ///
    /// Only `fresh`, `pending` and `analysis_done` are reset targets, and a
    /// reset never moves a record forward or leaves it where it is. Simulation
    /// errors sit before `pending`, so they can only go back to `fresh`.
    pub fn can_reset_to(&self, to: WorkState) -> bool {
        Purge::for_reset_target(to).is_some() && to < *self
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown work state: {}", s))
    }
}

/// A pipeline stage run by one kind of worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Simulation,
    Analysis,
    SecondPass,
}

impl Stage {
    /// States a record of `kind` must be in before this stage may claim it.
    pub fn source_states(&self, kind: TraceKind) -> &'static [WorkState] {
        match (self, kind) {
            (Stage::Simulation, TraceKind::Single) => &[WorkState::Fresh],
            (Stage::Simulation, _) => &[],
            (Stage::Analysis, TraceKind::Single) => {
                &[WorkState::SimulationDone, WorkState::Pending]
            }
            (Stage::Analysis, _) => &[WorkState::Fresh, WorkState::Pending],
            (Stage::SecondPass, TraceKind::Single) => &[],
            (Stage::SecondPass, _) => &[WorkState::AnalysisDone],
        }
    }

    pub fn claim_state(&self) -> WorkState {
        match self {
            Stage::Simulation => WorkState::PreSimulating,
            Stage::Analysis => WorkState::PreAnalyzing,
            Stage::SecondPass => WorkState::PreSecondPass,
        }
    }

    pub fn running_state(&self) -> WorkState {
        match self {
            Stage::Simulation => WorkState::Simulating,
            Stage::Analysis => WorkState::Analyzing,
            Stage::SecondPass => WorkState::PreSecondPass,
        }
    }

    pub fn done_state(&self) -> WorkState {
        match self {
            Stage::Simulation => WorkState::SimulationDone,
            Stage::Analysis => WorkState::AnalysisDone,
            Stage::SecondPass => WorkState::SecondPassDone,
        }
    }

    pub fn error_state(&self) -> WorkState {
        match self {
            Stage::Simulation => WorkState::SimulationError,
            Stage::Analysis | Stage::SecondPass => WorkState::AnalysisError,
        }
    }

    /// Rows a failed attempt of this stage may have produced.
    pub fn failure_purge(&self) -> Purge {
        match self {
            Stage::Simulation => Purge::Nothing,
            Stage::Analysis => Purge::Results,
            Stage::SecondPass => Purge::SecondPass,
        }
    }

    /// In-progress states owned by this stage's workers.
    pub fn in_progress_states(&self) -> &'static [WorkState] {
        match self {
            Stage::Simulation => &[WorkState::PreSimulating, WorkState::Simulating],
            Stage::Analysis => &[WorkState::PreAnalyzing, WorkState::Analyzing],
            Stage::SecondPass => &[WorkState::PreSecondPass],
        }
    }

    /// States every sub-trace must be in before a group or delta may run this stage.
    pub fn subtrace_ready_states(&self) -> &'static [WorkState] {
        match self {
            Stage::Simulation => &[],
            Stage::Analysis => &[
                WorkState::SimulationDone,
                WorkState::Pending,
                WorkState::AnalysisDone,
                WorkState::SecondPassDone,
            ],
            Stage::SecondPass => &[WorkState::AnalysisDone, WorkState::SecondPassDone],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Simulation => "simulation",
            Stage::Analysis => "analysis",
            Stage::SecondPass => "second_pass",
        })
    }
}

/// Conditions a compare-and-swap requires of the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub state: WorkState,
    pub version: Option<u64>,
    /// When set, `assigned_worker` must equal this value.
    pub worker: Option<String>,
}

impl Expectation {
    pub fn state(state: WorkState) -> Self {
        Expectation {
            state,
            version: None,
            worker: None,
        }
    }

    pub fn exact(state: WorkState, version: u64) -> Self {
        Expectation {
            state,
            version: Some(version),
            worker: None,
        }
    }

    pub fn held_by(state: WorkState, version: u64, worker: &str) -> Self {
        Expectation {
            state,
            version: Some(version),
            worker: Some(worker.to_string()),
        }
    }
}

/// Change to the simulation timestamps carried by a state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowChange {
    Keep,
    Start(DateTime<Utc>),
    End(DateTime<Utc>),
    Clear,
}

/// Fields written by a successful compare-and-swap. The store bumps `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub state: WorkState,
    pub assigned_worker: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub entered_at: DateTime<Utc>,
    pub window: WindowChange,
}

impl StateUpdate {
    pub fn new(state: WorkState, assigned_worker: Option<String>) -> Self {
        StateUpdate {
            state,
            assigned_worker,
            lease_expires_at: None,
            entered_at: Utc::now(),
            window: WindowChange::Keep,
        }
    }

    pub fn with_lease(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.lease_expires_at = expires_at;
        self
    }

    pub fn with_window(mut self, window: WindowChange) -> Self {
        self.window = window;
        self
    }
}

/// Dependent data removed together with an administrative reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purge {
    Nothing,
    /// Only results produced by the second pass.
    SecondPass,
    /// All results; the trace is kept.
    Results,
    TraceAndResults,
}

impl Purge {
    /// The purge that keeps a record consistent with reset target `to`.
    pub fn for_reset_target(to: WorkState) -> Option<Purge> {
        match to {
            WorkState::Fresh => Some(Purge::TraceAndResults),
            WorkState::Pending => Some(Purge::Results),
            WorkState::AnalysisDone => Some(Purge::SecondPass),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for state in WorkState::ALL {
            assert_eq!(state.as_str().parse::<WorkState>().unwrap(), state);
        }
        assert!("done".parse::<WorkState>().is_err());
    }

    #[test]
    fn test_pipeline_edges() {
        use WorkState::*;
        assert!(Fresh.can_advance_to(PreSimulating));
        assert!(PreSimulating.can_advance_to(Simulating));
        assert!(Simulating.can_advance_to(SimulationDone));
        assert!(Simulating.can_advance_to(SimulationError));
        assert!(SimulationDone.can_advance_to(PreAnalyzing));
        assert!(Pending.can_advance_to(PreAnalyzing));
        assert!(Analyzing.can_advance_to(AnalysisDone));
        assert!(AnalysisDone.can_advance_to(PreSecondPass));
        assert!(PreSecondPass.can_advance_to(SecondPassDone));
    }

    #[test]
    fn test_no_backwards_edges() {
        use WorkState::*;
        assert!(!SimulationDone.can_advance_to(Fresh));
        assert!(!AnalysisDone.can_advance_to(PreAnalyzing));
        assert!(!SecondPassDone.can_advance_to(PreSecondPass));
        assert!(!Fresh.can_advance_to(SimulationDone));
        assert!(!AnalysisError.can_advance_to(AnalysisDone));
    }

    #[test]
    fn test_rescue_edges() {
        use WorkState::*;
        for from in [PreSimulating, Simulating, SimulationFailed, SimulationError] {
            assert!(from.can_advance_to(SimulationDone), "{} -> done", from);
        }
    }

    #[test]
    fn test_lease_takeover_edges() {
        use WorkState::*;
        assert!(Simulating.can_advance_to(PreSimulating));
        assert!(PreSimulating.can_advance_to(PreSimulating));
        assert!(Analyzing.can_advance_to(PreAnalyzing));
        assert!(!Simulating.can_advance_to(PreAnalyzing));
    }

    #[test]
    fn test_stage_sources_by_kind() {
        assert_eq!(
            Stage::Analysis.source_states(TraceKind::Single),
            &[WorkState::SimulationDone, WorkState::Pending]
        );
        assert_eq!(
            Stage::Analysis.source_states(TraceKind::Group),
            &[WorkState::Fresh, WorkState::Pending]
        );
        assert!(Stage::Simulation.source_states(TraceKind::Delta).is_empty());
        assert!(Stage::SecondPass.source_states(TraceKind::Single).is_empty());
    }

    #[test]
    fn test_reset_purge_targets() {
        assert_eq!(
            Purge::for_reset_target(WorkState::Fresh),
            Some(Purge::TraceAndResults)
        );
        assert_eq!(Purge::for_reset_target(WorkState::Pending), Some(Purge::Results));
        assert_eq!(
            Purge::for_reset_target(WorkState::AnalysisDone),
            Some(Purge::SecondPass)
        );
        assert_eq!(Purge::for_reset_target(WorkState::Simulating), None);
    }

    #[test]
    fn test_resets_only_rewind() {
        use WorkState::*;

        assert!(AnalysisDone.can_reset_to(Fresh));
        assert!(SecondPassDone.can_reset_to(AnalysisDone));
        assert!(AnalysisError.can_reset_to(Pending));
        assert!(AnalysisError.can_reset_to(Fresh));
        assert!(SimulationError.can_reset_to(Fresh));
        assert!(Analyzing.can_reset_to(Pending));

        assert!(!Fresh.can_reset_to(AnalysisDone));
        assert!(!SimulationDone.can_reset_to(AnalysisDone));
        assert!(!SimulationDone.can_reset_to(Pending));
        assert!(!SimulationFailed.can_reset_to(Pending));
        assert!(!Fresh.can_reset_to(Fresh));
        assert!(!AnalysisDone.can_reset_to(AnalysisDone));
        assert!(!SecondPassDone.can_reset_to(Simulating));
    }

    #[test]
    fn test_trace_bearing_states() {
        assert!(!WorkState::Fresh.has_trace());
        assert!(!WorkState::Pending.has_trace());
        assert!(WorkState::SimulationDone.has_trace());
        assert!(WorkState::SecondPassDone.has_trace());
    }
}
