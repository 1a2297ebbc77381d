use std::sync::Arc;

use xp_config::XpConfig;
use xp_core::ExperimentStore;
use xp_worker::{stats_from_config, SecondPass, WorkerSettings};

use super::{print_summary, shutdown_on_ctrl_c};

pub async fn run(
    store: Arc<dyn ExperimentStore>,
    config: &XpConfig,
    trace_id: Option<u64>,
    aligned: Vec<u64>,
    serve: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let stats = stats_from_config(&config.stats)?;
    let reconciler = SecondPass::new(store, stats, WorkerSettings::from_config(config));

    if serve {
        reconciler.serve(shutdown_on_ctrl_c()).await?;
        return Ok(());
    }

    let summary = if aligned.is_empty() {
        reconciler.run(trace_id).await?
    } else {
        reconciler.run_aligned(&aligned).await?
    };
    print_summary("Second pass", &summary);
    Ok(())
}
