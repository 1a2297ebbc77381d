use xp_core::{ExperimentStore, WorkState};
use xp_worker::ResetRequest;

use super::join_ids;

pub async fn run(
    store: &dyn ExperimentStore,
    from: WorkState,
    to: WorkState,
    trace_id: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = ResetRequest { from, to, trace_id };
    let reset = xp_worker::reset(store, &request).await?;

    if reset.is_empty() {
        println!("No experiments in {} to reset", from);
    } else {
        println!("Reset {} experiments to {}: {}", reset.len(), to, join_ids(&reset));
    }
    Ok(())
}
