use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use xp_core::{ExperimentStore, ScriptedSimulator, StubStatsEngine};
use xp_worker::{AnalysisWorker, ExperimentWorker, SecondPass, WorkerSettings};

use crate::fault::{FaultConfig, FaultStats, FaultyStore};

/// A simulated worker host running every stage against a shared store.
pub struct AgentVm {
    pub id: usize,
    pub hostname: String,
    /// The store as this agent sees it (fault-wrapped if faults are active).
    pub store: Arc<dyn ExperimentStore>,
    pub experiments: ExperimentWorker,
    pub analysis: AnalysisWorker,
    pub second_pass: SecondPass,
    pub faulty_store: Option<Arc<FaultyStore>>,
}

impl AgentVm {
    pub fn fault_stats(&self) -> FaultStats {
        self.faulty_store
            .as_ref()
            .map(|store| store.stats())
            .unwrap_or_default()
    }

    pub fn set_faults_enabled(&self, enabled: bool) {
        if let Some(store) = &self.faulty_store {
            store.set_enabled(enabled);
        }
    }
}

/// Build `count` agents sharing one store, simulator, and statistics engine.
///
/// When `fault_config` is Some, each agent gets its own [`FaultyStore`] over
/// the shared store, seeded from `master_rng`.
pub fn build_agents(
    shared: Arc<dyn ExperimentStore>,
    simulator: Arc<ScriptedSimulator>,
    stats: Arc<StubStatsEngine>,
    count: usize,
    fault_config: Option<FaultConfig>,
    master_rng: &mut ChaCha8Rng,
) -> Vec<AgentVm> {
    (0..count)
        .map(|id| {
            let hostname = format!("sim-{}", id);
            let faulty_store = fault_config.as_ref().map(|config| {
                let rng = ChaCha8Rng::seed_from_u64(master_rng.gen());
                Arc::new(FaultyStore::new(shared.clone(), rng, config.clone()))
            });
            let store: Arc<dyn ExperimentStore> = match &faulty_store {
                Some(faulty) => faulty.clone(),
                None => shared.clone(),
            };
            let settings = WorkerSettings::new(hostname.clone());

            AgentVm {
                id,
                experiments: ExperimentWorker::new(
                    store.clone(),
                    simulator.clone(),
                    settings.clone(),
                ),
                analysis: AnalysisWorker::new(store.clone(), stats.clone(), settings.clone()),
                second_pass: SecondPass::new(store.clone(), stats.clone(), settings),
                hostname,
                store,
                faulty_store,
            }
        })
        .collect()
}
