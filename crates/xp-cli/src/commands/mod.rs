pub mod analysis;
pub mod check;
pub mod config;
pub mod create;
pub mod experiments;
pub mod reset;
pub mod rescue;
pub mod second_pass;
pub mod status;

use tokio::sync::watch;
use tracing::info;
use xp_worker::RunSummary;

/// A shutdown signal that flips on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, finishing current pass");
            let _ = tx.send(true);
        }
    });
    rx
}

pub fn print_summary(label: &str, summary: &RunSummary) {
    if summary.is_empty() {
        println!("{}: nothing to do", label);
        return;
    }

    println!("{}:", label);
    if !summary.succeeded.is_empty() {
        println!("  succeeded: {}", join_ids(&summary.succeeded));
    }
    for (trace_id, reason) in &summary.failed {
        println!("  failed:    {} ({})", trace_id, reason);
    }
    if !summary.not_ready.is_empty() {
        println!("  not ready: {}", join_ids(&summary.not_ready));
    }
    if !summary.lost.is_empty() {
        println!("  lost:      {}", join_ids(&summary.lost));
    }
}

pub fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
