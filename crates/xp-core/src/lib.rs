pub mod claim;
mod error;
mod record;
mod results;
mod state;
pub mod stub;
mod trace;
mod traits;

pub use claim::{advance, advance_with, claim_by_id, claim_by_scan, fail, release, ClaimOptions};
pub use error::{CollaboratorError, CoordError, StoreError};
pub use record::{manifest_stem, ExperimentKind, ExperimentRecord, NewExperiment, TraceKind};
pub use results::{
    percentile, DeltaSummary, FoldMode, JobValues, PairSummary, ResultEntry, ResultKind, Stats,
    StatsBundle, SubtraceUtilization, TimeWindow, TraceSummary, Utilization, UtilizationSummary,
    ValuePool, WorkflowDelta, WorkflowKey, WorkflowMetric, WorkflowValue,
};
pub use state::{Expectation, Purge, Stage, StateUpdate, WindowChange, WorkState};
pub use stub::{ScriptedSimulator, StubStatsEngine};
pub use trace::{JobRecord, Trace, WorkflowJobName, REGULAR_JOB_NAME};
pub use traits::{ExperimentStore, ScanFilter, Simulator, StageOutput, StatsEngine};
pub use xp_config::WorkflowHandling;
