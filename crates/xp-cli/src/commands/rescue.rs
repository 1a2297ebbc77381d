use std::sync::Arc;

use xp_config::XpConfig;
use xp_core::ExperimentStore;
use xp_worker::{simulator_from_config, ExperimentWorker, WorkerSettings};

use super::print_summary;

pub async fn run(
    store: Arc<dyn ExperimentStore>,
    config: &XpConfig,
    trace_id: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let simulator = simulator_from_config(&config.simulator)?;
    let worker = ExperimentWorker::new(store, simulator, WorkerSettings::from_config(config));

    let summary = worker.rescue(trace_id).await?;
    print_summary("Rescue", &summary);
    Ok(())
}
