//! Per-pass outcome bookkeeping and the shared serve loop.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};
use xp_core::CoordError;

/// What happened to one record during a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    /// The stage failed and the record was moved to its error state.
    Failed(String),
    /// An aggregate whose sub-traces are not done yet.
    NotReady,
    /// The claim was taken over or reset mid-stage; nothing was written.
    Lost,
}

/// Records touched by one worker pass, by outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub succeeded: Vec<u64>,
    pub failed: Vec<(u64, String)>,
    pub not_ready: Vec<u64>,
    pub lost: Vec<u64>,
}

impl RunSummary {
    pub fn record(&mut self, trace_id: u64, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded.push(trace_id),
            Outcome::Failed(reason) => self.failed.push((trace_id, reason)),
            Outcome::NotReady => self.not_ready.push(trace_id),
            Outcome::Lost => self.lost.push(trace_id),
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.not_ready.extend(other.not_ready);
        self.lost.extend(other.lost);
    }

    /// Number of records processed to a terminal outcome.
    pub fn processed(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty()
            && self.failed.is_empty()
            && self.not_ready.is_empty()
            && self.lost.is_empty()
    }
}

/// Run `pass` every `interval` until `shutdown` flips to true.
///
/// Misuse errors end the loop; anything else is logged and retried on the
/// next tick.
pub(crate) async fn serve_loop<F, Fut>(
    name: &str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut pass: F,
) -> Result<(), CoordError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RunSummary, CoordError>>,
{
    info!("{} worker started", name);

    let mut ticker = tokio::time::interval(interval);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match pass().await {
                    Ok(summary) if !summary.is_empty() => info!(
                        "{} pass: {} succeeded, {} failed, {} not ready, {} lost",
                        name,
                        summary.succeeded.len(),
                        summary.failed.len(),
                        summary.not_ready.len(),
                        summary.lost.len()
                    ),
                    Ok(_) => {}
                    Err(e) if e.is_misuse() => {
                        error!("{} worker stopping: {}", name, e);
                        return Err(e);
                    }
                    Err(e) => error!("{} pass failed: {}", name, e),
                }
            }
        }
    }

    info!("{} worker stopped", name);
    Ok(())
}
