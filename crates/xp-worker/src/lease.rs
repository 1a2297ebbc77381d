//! Lease heartbeat for long-running stages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use xp_core::{ClaimOptions, ExperimentRecord, ExperimentStore};

const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

/// Background task renewing a claim's lease until stopped.
pub struct Heartbeat {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Start renewing the lease on `record` every ttl/3. No-op when leases are off.
    pub fn start(
        store: Arc<dyn ExperimentStore>,
        record: &ExperimentRecord,
        opts: &ClaimOptions,
    ) -> Self {
        let (ttl, worker) = match (opts.lease_ttl, record.assigned_worker.clone()) {
            (Some(ttl), Some(worker)) => (ttl, worker),
            _ => {
                return Heartbeat {
                    stop: None,
                    handle: None,
                }
            }
        };

        let trace_id = record.trace_id;
        let period = (ttl / 3).max(MIN_RENEW_PERIOD);
        let (tx, mut rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = tokio::time::sleep(period) => {}
                }

                let Some(expires_at) = chrono::Duration::from_std(ttl)
                    .ok()
                    .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                else {
                    break;
                };
                match store.renew_lease(trace_id, &worker, expires_at).await {
                    Ok(true) => debug!("Renewed lease on {} until {}", trace_id, expires_at),
                    Ok(false) => {
                        warn!("Lease on {} is no longer held by {}", trace_id, worker);
                        break;
                    }
                    Err(e) => warn!("Failed to renew lease on {}: {}", trace_id, e),
                }
            }
        });

        Heartbeat {
            stop: Some(tx),
            handle: Some(handle),
        }
    }

    /// Stop renewing and wait for the task to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xp_core::{claim_by_id, NewExperiment, Stage};
    use xp_store::MemoryStore;

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        let opts = ClaimOptions::new("w1").with_lease(Duration::from_millis(60));
        let claimed = claim_by_id(store.as_ref(), rec.trace_id, Stage::Simulation, &opts)
            .await
            .unwrap();
        let first_deadline = claimed.lease_expires_at.unwrap();

        let heartbeat = Heartbeat::start(store.clone(), &claimed, &opts);
        tokio::time::sleep(Duration::from_millis(150)).await;
        heartbeat.stop().await;

        let stored = store.get(rec.trace_id).await.unwrap().unwrap();
        assert!(stored.lease_expires_at.unwrap() > first_deadline);
        assert_eq!(stored.version, claimed.version);
    }

    #[tokio::test]
    async fn test_heartbeat_without_lease_is_inert() {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        let heartbeat = Heartbeat::start(store, &rec, &ClaimOptions::new("w1"));
        assert!(heartbeat.handle.is_none());
        heartbeat.stop().await;
    }
}
