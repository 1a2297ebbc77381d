use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;
use xp_core::{
    CoordError, ExperimentStore, NewExperiment, ScriptedSimulator, StubStatsEngine, TraceKind,
    WorkState, WorkflowHandling,
};
use xp_store::MemoryStore;
use xp_worker::{ResetRequest, RunSummary};

use crate::agent::{build_agents, AgentVm};
use crate::fault::{is_injected_fault, FaultConfig, FaultStats};
use crate::invariants::{
    check_final_consistency, check_step_invariants, duplicate_successes, Violation,
};
use crate::ops::{generate, Op};

/// Number of worker hosts in a default simulation.
pub const DEFAULT_AGENTS: usize = 3;

/// Simulated wall time of one simulator run.
const SIMULATION_DELAY: Duration = Duration::from_secs(60);

/// Upper bound on drain rounds; each round runs every stage once.
const MAX_DRAIN_ROUNDS: usize = 20;

/// A single operation/result entry captured during simulation.
#[derive(Debug, Clone)]
pub struct SimTraceEntry {
    pub step: usize,
    pub op: String,
    pub outcome: String,
}

/// The main simulation harness.
pub struct Sim {
    pub agents: Vec<AgentVm>,
    /// The shared store without fault injection, for inspection.
    pub store: Arc<dyn ExperimentStore>,
    pub simulator: Arc<ScriptedSimulator>,
    pub rng: ChaCha8Rng,
    pub step: usize,
    pub violations: Vec<Violation>,
    pub has_faults: bool,
    simulation_failure_rate: f64,
    singles: Vec<u64>,
    versions: HashMap<u64, u64>,
    /// Step-by-step operation outcomes.
    pub trace: Vec<SimTraceEntry>,
}

impl Sim {
    /// Create a new deterministic simulation with the given seed.
    pub fn new(seed: u64) -> Self {
        Self::new_with_config(seed, DEFAULT_AGENTS, None)
    }

    /// Create a new deterministic simulation with optional fault injection.
    pub fn new_with_faults(seed: u64, fault_config: Option<FaultConfig>) -> Self {
        Self::new_with_config(seed, DEFAULT_AGENTS, fault_config)
    }

    pub fn new_with_config(seed: u64, agents: usize, fault_config: Option<FaultConfig>) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let simulator = Arc::new(ScriptedSimulator::new().with_delay(SIMULATION_DELAY));
        let stats = Arc::new(StubStatsEngine::new());

        let simulation_failure_rate = fault_config
            .as_ref()
            .map_or(0.0, |config| config.simulation_failure_rate.clamp(0.0, 1.0));
        let has_faults = fault_config
            .as_ref()
            .is_some_and(|config| config.error_rate > 0.0);

        let agents = build_agents(
            store.clone(),
            simulator.clone(),
            stats,
            agents.max(1),
            fault_config,
            &mut rng,
        );

        Sim {
            agents,
            store,
            simulator,
            rng,
            step: 0,
            violations: Vec::new(),
            has_faults,
            simulation_failure_rate,
            singles: Vec::new(),
            versions: HashMap::new(),
            trace: Vec::new(),
        }
    }

    pub fn fault_stats(&self) -> FaultStats {
        FaultStats {
            fault_count: self.agents.iter().map(|a| a.fault_stats().fault_count).sum(),
        }
    }

    /// Run `steps` random operations, checking invariants after each.
    pub async fn run(&mut self, steps: usize) -> &[Violation] {
        for _ in 0..steps {
            let op = generate(&mut self.rng, self.agents.len(), self.singles.len());
            let violations = self.step_with(op).await;
            self.violations.extend(violations);
        }
        &self.violations
    }

    /// Apply one operation and check per-step invariants.
    pub async fn step_with(&mut self, op: Op) -> Vec<Violation> {
        let step = self.step;
        self.step += 1;
        let label = op.label();

        let (outcome, mut violations) = self.apply(op).await;
        debug!("step {}: {} -> {}", step, label, outcome);
        self.trace.push(SimTraceEntry {
            step,
            op: label,
            outcome,
        });

        violations.extend(
            check_step_invariants(step, self.store.as_ref(), &mut self.versions, self.has_faults)
                .await,
        );
        violations
    }

    /// Turn faults off and run every stage until nothing changes, then check
    /// the final state. Records stuck by faults are only checked when
    /// `expect_complete` is false.
    pub async fn drain(&mut self, expect_complete: bool) -> Vec<Violation> {
        for agent in &self.agents {
            agent.set_faults_enabled(false);
        }

        let mut violations = Vec::new();
        for _ in 0..MAX_DRAIN_ROUNDS {
            let before = self.state_fingerprint().await;
            for op in [
                Op::SimulateConcurrent,
                Op::AnalyzeConcurrent,
                Op::SecondPassConcurrent,
            ] {
                violations.extend(self.step_with(op).await);
            }
            if self.state_fingerprint().await == before {
                break;
            }
        }

        violations.extend(check_final_consistency(self.step, self.store.as_ref(), expect_complete).await);
        self.violations.extend(violations.iter().cloned());
        violations
    }

    async fn state_fingerprint(&self) -> Vec<(u64, WorkState, u64)> {
        match self.store.scan(&Default::default()).await {
            Ok(records) => records
                .into_iter()
                .map(|r| (r.trace_id, r.work_state, r.version))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn apply(&mut self, op: Op) -> (String, Vec<Violation>) {
        let step = self.step - 1;
        match op {
            Op::CreateSingles { count } => {
                let mut created = Vec::new();
                for _ in 0..count {
                    let seed = format!("{:08x}", self.rng.gen::<u32>());
                    let new = definition(&seed);
                    match xp_worker::create(self.agents[0].store.as_ref(), &new).await {
                        Ok(record) => {
                            if self.rng.gen_bool(self.simulation_failure_rate) {
                                self.simulator.fail_on(record.trace_id);
                            }
                            self.singles.push(record.trace_id);
                            created.push(record.trace_id);
                        }
                        Err(e) => return self.worker_error(step, "create", e),
                    }
                }
                (format!("created {:?}", created), Vec::new())
            }
            Op::CreateGroup { width } => self.create_aggregate(step, TraceKind::Group, width).await,
            Op::CreateDelta { pairs } => {
                self.create_aggregate(step, TraceKind::Delta, pairs * 2)
                    .await
            }
            Op::Simulate { agent } => {
                let result = self.agents[agent].experiments.run(None).await;
                self.summarize(step, "simulate", result)
            }
            Op::Analyze { agent } => {
                let result = self.agents[agent].analysis.run(None).await;
                self.summarize(step, "analyze", result)
            }
            Op::SecondPass { agent } => {
                let result = self.agents[agent].second_pass.run(None).await;
                self.summarize(step, "second pass", result)
            }
            Op::SimulateConcurrent => {
                let results = join_all(self.agents.iter().map(|a| a.experiments.run(None))).await;
                self.summarize_concurrent(step, "simulate", results)
            }
            Op::AnalyzeConcurrent => {
                let results = join_all(self.agents.iter().map(|a| a.analysis.run(None))).await;
                self.summarize_concurrent(step, "analyze", results)
            }
            Op::SecondPassConcurrent => {
                let results = join_all(self.agents.iter().map(|a| a.second_pass.run(None))).await;
                self.summarize_concurrent(step, "second pass", results)
            }
            Op::Rescue { agent } => {
                let result = self.agents[agent].experiments.rescue(None).await;
                self.summarize(step, "rescue", result)
            }
            Op::ResetErrors => {
                let store = self.agents[0].store.clone();
                let mut reset = Vec::new();
                for (from, to) in [
                    (WorkState::SimulationFailed, WorkState::Fresh),
                    (WorkState::SimulationError, WorkState::Fresh),
                    (WorkState::AnalysisError, WorkState::Pending),
                ] {
                    let request = ResetRequest {
                        from,
                        to,
                        trace_id: None,
                    };
                    match xp_worker::reset(store.as_ref(), &request).await {
                        Ok(ids) => reset.extend(ids),
                        Err(e) => return self.worker_error(step, "reset", e),
                    }
                }
                (format!("reset {:?}", reset), Vec::new())
            }
        }
    }

    async fn create_aggregate(
        &mut self,
        step: usize,
        kind: TraceKind,
        width: usize,
    ) -> (String, Vec<Violation>) {
        if width == 0 || self.singles.len() < width {
            return ("skipped: not enough singles".to_string(), Vec::new());
        }
        let subtraces: Vec<u64> = self
            .singles
            .choose_multiple(&mut self.rng, width)
            .copied()
            .collect();
        let new = definition("aggregate").aggregate_of(kind, subtraces.clone());
        match xp_worker::create(self.agents[0].store.as_ref(), &new).await {
            Ok(record) => (
                format!("created {} {} over {:?}", kind, record.trace_id, subtraces),
                Vec::new(),
            ),
            Err(e) => self.worker_error(step, "create", e),
        }
    }

    fn summarize(
        &self,
        step: usize,
        what: &str,
        result: Result<RunSummary, CoordError>,
    ) -> (String, Vec<Violation>) {
        match result {
            Ok(summary) => (describe(&summary), Vec::new()),
            Err(e) => self.worker_error(step, what, e),
        }
    }

    fn summarize_concurrent(
        &self,
        step: usize,
        what: &str,
        results: Vec<Result<RunSummary, CoordError>>,
    ) -> (String, Vec<Violation>) {
        let mut passes = Vec::new();
        let mut outcomes = Vec::new();
        let mut violations = Vec::new();
        for result in results {
            let (outcome, errors) = match result {
                Ok(summary) => {
                    let outcome = describe(&summary);
                    passes.push(summary.succeeded);
                    (outcome, Vec::new())
                }
                Err(e) => self.worker_error(step, what, e),
            };
            outcomes.push(outcome);
            violations.extend(errors);
        }
        violations.extend(duplicate_successes(step, &passes));
        (outcomes.join(" | "), violations)
    }

    /// Injected faults are expected; any other worker error is a violation.
    fn worker_error(&self, step: usize, what: &str, err: CoordError) -> (String, Vec<Violation>) {
        if is_injected_fault(&err) {
            return (format!("{} hit injected fault: {}", what, err), Vec::new());
        }
        let violation = Violation {
            step,
            trace_id: None,
            invariant: "no-unexpected-errors".to_string(),
            details: format!("{} failed: {}", what, err),
        };
        (format!("{} failed: {}", what, err), vec![violation])
    }
}

fn definition(seed: &str) -> NewExperiment {
    NewExperiment::single(seed, "edison").with_workflows(
        WorkflowHandling::Single,
        "fcfs",
        1800,
        &["floodplain.json", "montage.json"],
    )
}

fn describe(summary: &RunSummary) -> String {
    format!(
        "ok {:?}, failed {:?}, not ready {:?}, lost {:?}",
        summary.succeeded,
        summary.failed.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        summary.not_ready,
        summary.lost
    )
}
