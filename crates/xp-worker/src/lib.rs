pub mod admin;
mod analysis;
pub mod checker;
pub mod coordinator;
mod experiment;
mod lease;
pub mod remote;
mod second_pass;
mod settings;
mod stage;
mod summary;

pub use admin::{create, reset, reset_record, status, ResetRequest};
pub use analysis::AnalysisWorker;
pub use checker::{AlwaysConfirm, BadRecord, CheckReport, Checker, Confirm, SuspiciousPair};
pub use coordinator::{aggregate, delta_pairs, is_it_ready_to_process, Readiness};
pub use experiment::{ExperimentWorker, RESCUE_STATES};
pub use lease::Heartbeat;
pub use remote::{simulator_from_config, stats_from_config, HttpSimulator, HttpStatsEngine};
pub use second_pass::{common_count, truncate_in_completion_order, SecondPass};
pub use settings::WorkerSettings;
pub use summary::{Outcome, RunSummary};
