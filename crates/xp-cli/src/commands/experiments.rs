use std::sync::Arc;

use xp_config::XpConfig;
use xp_core::ExperimentStore;
use xp_worker::{simulator_from_config, ExperimentWorker, WorkerSettings};

use super::{print_summary, shutdown_on_ctrl_c};

pub async fn run(
    store: Arc<dyn ExperimentStore>,
    config: &XpConfig,
    trace_id: Option<u64>,
    serve: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let simulator = simulator_from_config(&config.simulator)?;
    let worker = ExperimentWorker::new(store, simulator, WorkerSettings::from_config(config));

    if serve {
        worker.serve(shutdown_on_ctrl_c()).await?;
    } else {
        let summary = worker.run(trace_id).await?;
        print_summary("Simulation", &summary);
    }
    Ok(())
}
