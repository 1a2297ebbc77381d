//! Analysis worker: runs simulated singles and ready aggregates through the
//! statistics engine and stores the result bundles.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use xp_core::{
    advance, advance_with, claim_by_id, ClaimOptions, CoordError, ExperimentRecord,
    ExperimentStore, Stage, StageOutput, StatsEngine, TraceKind, WindowChange, WorkState,
};

use crate::coordinator::{aggregate, claim_ready, is_it_ready_to_process, Claimed, Readiness};
use crate::lease::Heartbeat;
use crate::settings::WorkerSettings;
use crate::stage::{hand_back, settle_failure};
use crate::summary::{serve_loop, Outcome, RunSummary};

const ANALYZED_KINDS: [TraceKind; 3] = [TraceKind::Single, TraceKind::Group, TraceKind::Delta];

pub struct AnalysisWorker {
    store: Arc<dyn ExperimentStore>,
    stats: Arc<dyn StatsEngine>,
    settings: WorkerSettings,
}

pub(crate) fn log_not_ready(trace_id: u64, readiness: &Readiness) {
    match readiness {
        Readiness::Ready => {}
        Readiness::NotReady { waiting } => {
            info!("Experiment {} not ready, waiting on {:?}", trace_id, waiting)
        }
        Readiness::Blocked { failed } => warn!(
            "Experiment {} blocked by failed sub-traces {:?}",
            trace_id, failed
        ),
    }
}

impl AnalysisWorker {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        stats: Arc<dyn StatsEngine>,
        settings: WorkerSettings,
    ) -> Self {
        AnalysisWorker {
            store,
            stats,
            settings,
        }
    }

    /// Analyze one record by id, or every analyzable record until none is left.
    pub async fn run(&self, trace_id: Option<u64>) -> Result<RunSummary, CoordError> {
        let opts = self.settings.claim_options();
        let store = self.store.as_ref();
        let mut summary = RunSummary::default();

        match trace_id {
            Some(id) => {
                let record = store.get(id).await?.ok_or(CoordError::NotFound(id))?;
                let readiness = is_it_ready_to_process(store, &record, Stage::Analysis).await?;
                if !readiness.is_ready() {
                    log_not_ready(id, &readiness);
                    summary.record(id, Outcome::NotReady);
                    return Ok(summary);
                }
                let from = record.work_state;
                let mut claimed = claim_by_id(store, id, Stage::Analysis, &opts).await?;
                let outcome = self.process(&mut claimed, from, &opts).await?;
                summary.record(id, outcome);
            }
            None => {
                let mut skip = HashSet::new();
                loop {
                    match claim_ready(store, Stage::Analysis, &ANALYZED_KINDS, &opts, &mut skip)
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

    /// Poll for analyzable experiments until `shutdown` is set.
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<(), CoordError> {
        serve_loop(
            "Analysis",
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

        // Sub-traces may have been reset between the readiness check and the claim.
        if record.trace_type() != TraceKind::Single {
            let readiness = match is_it_ready_to_process(store, record, Stage::Analysis).await {
                Ok(readiness) => readiness,
                Err(e) => {
                    return settle_failure(store, record, Stage::Analysis, from, opts, e).await
                }
            };
            if !readiness.is_ready() {
                log_not_ready(record.trace_id, &readiness);
                return hand_back(store, record, Stage::Analysis, from).await;
            }
        }

        info!(
            "Analyzing {} experiment {} ({})",
            record.trace_type(),
            record.trace_id,
            record.name
        );
        let heartbeat = Heartbeat::start(self.store.clone(), record, opts);
        let result = self.analyze(record, opts).await;
        heartbeat.stop().await;

        match result {
            Ok(stored) => {
                info!("Experiment {} analyzed: {} result sets", record.trace_id, stored);
                Ok(Outcome::Succeeded)
            }
            Err(e) => settle_failure(store, record, Stage::Analysis, from, opts, e).await,
        }
    }

    async fn analyze(
        &self,
        record: &mut ExperimentRecord,
        opts: &ClaimOptions,
    ) -> Result<usize, CoordError> {
        let store = self.store.as_ref();
        advance(store, record, WorkState::Analyzing, WindowChange::Keep, opts).await?;

        let entries = aggregate(store, self.stats.as_ref(), record).await?;

        let stored = entries.len();
        advance_with(
            store,
            record,
            WorkState::AnalysisDone,
            WindowChange::Keep,
            opts,
            &StageOutput::results(entries),
        )
        .await?;
        Ok(stored)
    }
}
