//! Experiment worker: claims fresh single experiments, runs them through the
//! simulator, and stores the resulting trace.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};
use xp_core::{
    advance, advance_with, claim_by_id, claim_by_scan, ClaimOptions, CollaboratorError,
    CoordError, Expectation, ExperimentRecord, ExperimentStore, ScanFilter, Simulator, Stage,
    StageOutput, StateUpdate, TraceKind, WindowChange, WorkState,
};

use crate::lease::Heartbeat;
use crate::settings::WorkerSettings;
use crate::stage::settle_failure;
use crate::summary::{serve_loop, Outcome, RunSummary};

/// States a rescue may force to `simulation_done`.
pub const RESCUE_STATES: [WorkState; 4] = [
    WorkState::PreSimulating,
    WorkState::Simulating,
    WorkState::SimulationFailed,
    WorkState::SimulationError,
];

pub struct ExperimentWorker {
    store: Arc<dyn ExperimentStore>,
    simulator: Arc<dyn Simulator>,
    settings: WorkerSettings,
}

impl ExperimentWorker {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        simulator: Arc<dyn Simulator>,
        settings: WorkerSettings,
    ) -> Self {
        ExperimentWorker {
            store,
            simulator,
            settings,
        }
    }

    /// Simulate one record by id, or every fresh single experiment until none is left.
    pub async fn run(&self, trace_id: Option<u64>) -> Result<RunSummary, CoordError> {
        let opts = self.settings.claim_options();
        let mut summary = RunSummary::default();

        match trace_id {
            Some(id) => {
                let mut record =
                    claim_by_id(self.store.as_ref(), id, Stage::Simulation, &opts).await?;
                let outcome = self.process(&mut record, &opts).await?;
                summary.record(id, outcome);
            }
            None => {
                while let Some(mut record) = claim_by_scan(
                    self.store.as_ref(),
                    Stage::Simulation,
                    &[TraceKind::Single],
                    &opts,
                )
                .await?
                {
                    let outcome = self.process(&mut record, &opts).await?;
                    summary.record(record.trace_id, outcome);
                }
            }
        }

        Ok(summary)
    }

    /// Poll for fresh experiments until `shutdown` is set.
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<(), CoordError> {
        serve_loop(
            "Experiment",
            self.settings.poll_interval,
            shutdown,
            || self.run(None),
        )
        .await
    }

    async fn process(
        &self,
        record: &mut ExperimentRecord,
        opts: &ClaimOptions,
    ) -> Result<Outcome, CoordError> {
        info!(
            "Simulating experiment {} ({}) on {}",
            record.trace_id, record.name, self.settings.simulator_host
        );

        let heartbeat = Heartbeat::start(self.store.clone(), record, opts);
        let result = self.simulate(record, opts).await;
        heartbeat.stop().await;

        match result {
            Ok(jobs) => {
                info!("Experiment {} simulated: {} jobs", record.trace_id, jobs);
                Ok(Outcome::Succeeded)
            }
            Err(e) => {
                settle_failure(
                    self.store.as_ref(),
                    record,
                    Stage::Simulation,
                    WorkState::Fresh,
                    opts,
                    e,
                )
                .await
            }
        }
    }

    async fn simulate(
        &self,
        record: &mut ExperimentRecord,
        opts: &ClaimOptions,
    ) -> Result<usize, CoordError> {
        let store = self.store.as_ref();
        advance(
            store,
            record,
            WorkState::Simulating,
            WindowChange::Start(Utc::now()),
            opts,
        )
        .await?;

        let timeout = self.settings.simulation_timeout;
        let run = self
            .simulator
            .generate_and_run(record, &self.settings.simulator_host);
        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CollaboratorError::Timeout {
                    operation: "generate_and_run".to_string(),
                    seconds: timeout.as_secs(),
                }
                .into())
            }
        }

        let trace = self.simulator.fetch_trace(record).await?.ok_or_else(|| {
            CollaboratorError::Malformed(format!(
                "simulator produced no trace for experiment {}",
                record.trace_id
            ))
        })?;
        trace.validate()?;

        let jobs = trace.job_count();
        advance_with(
            store,
            record,
            WorkState::SimulationDone,
            WindowChange::End(Utc::now()),
            opts,
            &StageOutput::trace(trace),
        )
        .await?;
        Ok(jobs)
    }

    /// Pull whatever trace the simulation host holds and force the record to
    /// `simulation_done` without re-running the simulation.
    ///
    /// By id, any rescuable state is accepted. A scan only picks records in an
    /// error state or whose lease has expired, so live simulations are left alone.
    pub async fn rescue(&self, trace_id: Option<u64>) -> Result<RunSummary, CoordError> {
        let candidates = match trace_id {
            Some(id) => {
                let record = self
                    .store
                    .get(id)
                    .await?
                    .ok_or(CoordError::NotFound(id))?;
                if record.trace_type() != TraceKind::Single {
                    return Err(CoordError::Misuse(format!(
                        "only single experiments can be rescued, {} is a {}",
                        id,
                        record.trace_type()
                    )));
                }
                if !RESCUE_STATES.contains(&record.work_state) {
                    return Err(CoordError::UnexpectedState {
                        trace_id: id,
                        expected: RESCUE_STATES.to_vec(),
                        actual: record.work_state,
                    });
                }
                vec![record]
            }
            None => {
                let now = Utc::now();
                self.store
                    .scan(&ScanFilter::states(&RESCUE_STATES).kinds(&[TraceKind::Single]))
                    .await?
                    .into_iter()
                    .filter(|r| !r.work_state.is_in_progress() || r.lease_expired(now))
                    .collect()
            }
        };

        let mut summary = RunSummary::default();
        for record in candidates {
            let trace_id = record.trace_id;
            let outcome = self.rescue_one(record).await?;
            summary.record(trace_id, outcome);
        }
        Ok(summary)
    }

    async fn rescue_one(&self, record: ExperimentRecord) -> Result<Outcome, CoordError> {
        let trace = match self.simulator.fetch_trace(&record).await {
            Ok(Some(trace)) => trace,
            Ok(None) => {
                warn!("No trace left on the host for {}", record.trace_id);
                return Ok(Outcome::Failed("no trace on simulation host".to_string()));
            }
            Err(e) => {
                warn!("Failed to fetch trace for {}: {}", record.trace_id, e);
                return Ok(Outcome::Failed(e.to_string()));
            }
        };
        if let Err(e) = trace.validate() {
            warn!("Trace for {} is unusable: {}", record.trace_id, e);
            return Ok(Outcome::Failed(e.to_string()));
        }

        let jobs = trace.job_count();
        let expect = Expectation::exact(record.work_state, record.version);
        let update = StateUpdate::new(
            WorkState::SimulationDone,
            Some(self.settings.hostname.clone()),
        )
        .with_window(WindowChange::End(Utc::now()));
        if !self
            .store
            .commit(record.trace_id, &expect, &update, &StageOutput::trace(trace))
            .await?
        {
            warn!("Experiment {} changed while being rescued", record.trace_id);
            return Ok(Outcome::Lost);
        }

        info!(
            "Rescued experiment {} from {} with {} jobs",
            record.trace_id,
            record.work_state,
            jobs
        );
        Ok(Outcome::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use xp_core::{NewExperiment, ScriptedSimulator};
    use xp_store::MemoryStore;

    fn worker(
        store: Arc<dyn ExperimentStore>,
        simulator: Arc<ScriptedSimulator>,
    ) -> ExperimentWorker {
        ExperimentWorker::new(store, simulator, WorkerSettings::new("w1"))
    }

    #[tokio::test]
    async fn test_run_simulates_every_fresh_single() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let simulator = Arc::new(ScriptedSimulator::new());
        let a = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        let b = store.insert(&NewExperiment::single("B", "edison")).await.unwrap();

        let summary = worker(store.clone(), simulator.clone())
            .run(None)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, vec![a.trace_id, b.trace_id]);
        assert_eq!(simulator.runs(), 2);

        let stored = store.get(a.trace_id).await.unwrap().unwrap();
        assert_eq!(stored.work_state, WorkState::SimulationDone);
        assert!(stored.simulation_start.is_some());
        assert!(stored.simulation_end >= stored.simulation_start);
        assert!(store.trace_job_count(a.trace_id).await.unwrap().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_unreachable_simulator_marks_error() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let simulator = Arc::new(ScriptedSimulator::new());
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        simulator.fail_on(rec.trace_id);

        let summary = worker(store.clone(), simulator)
            .run(Some(rec.trace_id))
            .await
            .unwrap();
        assert_eq!(summary.failed.len(), 1);

        let stored = store.get(rec.trace_id).await.unwrap().unwrap();
        assert_eq!(stored.work_state, WorkState::SimulationError);
        assert!(store.get_trace(rec.trace_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_trace_marks_error() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let simulator = Arc::new(ScriptedSimulator::new());
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        simulator.malformed_on(rec.trace_id);

        worker(store.clone(), simulator)
            .run(Some(rec.trace_id))
            .await
            .unwrap();
        let stored = store.get(rec.trace_id).await.unwrap().unwrap();
        assert_eq!(stored.work_state, WorkState::SimulationError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_timeout_marks_error() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let simulator = Arc::new(ScriptedSimulator::new().with_delay(Duration::from_secs(3600)));
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();

        let settings = WorkerSettings::new("w1").with_simulation_timeout(Duration::from_secs(60));
        let summary = ExperimentWorker::new(store.clone(), simulator, settings)
            .run(Some(rec.trace_id))
            .await
            .unwrap();
        assert!(summary.failed[0].1.contains("timed out"));
        let stored = store.get(rec.trace_id).await.unwrap().unwrap();
        assert_eq!(stored.work_state, WorkState::SimulationError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_during_simulation_leaves_no_trace() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let simulator = Arc::new(ScriptedSimulator::new().with_delay(Duration::from_secs(600)));
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();

        let w = worker(store.clone(), simulator.clone());
        let running = tokio::spawn(async move { w.run(Some(rec.trace_id)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            store.get(rec.trace_id).await.unwrap().unwrap().work_state,
            WorkState::Simulating
        );

        let reset_ids = crate::admin::reset(
            store.as_ref(),
            &crate::admin::ResetRequest {
                from: WorkState::Simulating,
                to: WorkState::Fresh,
                trace_id: Some(rec.trace_id),
            },
        )
        .await
        .unwrap();
        assert_eq!(reset_ids, vec![rec.trace_id]);

        let summary = running.await.unwrap().unwrap();
        assert_eq!(summary.lost, vec![rec.trace_id]);
        assert_eq!(simulator.runs(), 1);
        let stored = store.get(rec.trace_id).await.unwrap().unwrap();
        assert_eq!(stored.work_state, WorkState::Fresh);
        assert!(store.get_trace(rec.trace_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_by_id_on_simulated_record_is_misuse() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let simulator = Arc::new(ScriptedSimulator::new());
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        let w = worker(store.clone(), simulator);
        w.run(Some(rec.trace_id)).await.unwrap();

        let err = w.run(Some(rec.trace_id)).await.unwrap_err();
        assert!(err.is_misuse());
        let stored = store.get(rec.trace_id).await.unwrap().unwrap();
        assert_eq!(stored.work_state, WorkState::SimulationDone);
    }

    #[tokio::test]
    async fn test_rescue_pulls_existing_trace() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let simulator = Arc::new(ScriptedSimulator::new());
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();

        // The owner died mid-simulation, after the host finished the run.
        let opts = ClaimOptions::new("crashed");
        let mut held = claim_by_id(store.as_ref(), rec.trace_id, Stage::Simulation, &opts)
            .await
            .unwrap();
        advance(
            store.as_ref(),
            &mut held,
            WorkState::Simulating,
            WindowChange::Start(Utc::now()),
            &opts,
        )
        .await
        .unwrap();
        simulator.plant_trace(rec.trace_id, ScriptedSimulator::generate(&held));

        let rescuer = ExperimentWorker::new(store.clone(), simulator.clone(), WorkerSettings::new("w2"));
        let summary = rescuer.rescue(Some(rec.trace_id)).await.unwrap();
        assert_eq!(summary.succeeded, vec![rec.trace_id]);
        assert_eq!(simulator.runs(), 0);

        let stored = store.get(rec.trace_id).await.unwrap().unwrap();
        assert_eq!(stored.work_state, WorkState::SimulationDone);
        assert_eq!(stored.assigned_worker.as_deref(), Some("w2"));
        assert!(store.get_trace(rec.trace_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rescue_without_trace_leaves_record() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let simulator = Arc::new(ScriptedSimulator::new());
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        simulator.fail_on(rec.trace_id);
        let w = worker(store.clone(), simulator);
        w.run(None).await.unwrap();

        let summary = w.rescue(None).await.unwrap();
        assert_eq!(summary.failed.len(), 1);
        let stored = store.get(rec.trace_id).await.unwrap().unwrap();
        assert_eq!(stored.work_state, WorkState::SimulationError);
    }

    #[tokio::test]
    async fn test_rescue_scan_leaves_live_claims() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let simulator = Arc::new(ScriptedSimulator::new());
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        claim_by_id(store.as_ref(), rec.trace_id, Stage::Simulation, &ClaimOptions::new("busy"))
            .await
            .unwrap();

        let summary = worker(store.clone(), simulator).rescue(None).await.unwrap();
        assert!(summary.is_empty());
    }
}
