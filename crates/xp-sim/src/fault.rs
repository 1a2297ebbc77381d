use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::Mutex;
use xp_core::{
    CoordError, Expectation, ExperimentRecord, ExperimentStore, NewExperiment, Purge, ResultEntry,
    ResultKind, ScanFilter, StageOutput, StateUpdate, StoreError, Trace, WorkState,
};

/// Prefix used in error messages to distinguish injected faults from real errors.
pub const FAULT_PREFIX: &str = "[fault-injected]";

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of failing a store call before it reaches the store (0.0-1.0).
    pub error_rate: f64,
    /// Probability that a newly created single experiment can never be simulated.
    pub simulation_failure_rate: f64,
}

/// Statistics about injected faults.
#[derive(Debug, Clone, Default)]
pub struct FaultStats {
    pub fault_count: usize,
}

/// Whether `err` carries an injected store fault.
pub fn is_injected_fault(err: &CoordError) -> bool {
    err.to_string().contains(FAULT_PREFIX)
}

/// A store wrapper that randomly fails calls. Failed calls never reach the
/// inner store.
pub struct FaultyStore {
    inner: Arc<dyn ExperimentStore>,
    rng: Mutex<ChaCha8Rng>,
    config: FaultConfig,
    enabled: AtomicBool,
    fault_count: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ExperimentStore>, rng: ChaCha8Rng, config: FaultConfig) -> Self {
        FaultyStore {
            inner,
            rng: Mutex::new(rng),
            config,
            enabled: AtomicBool::new(true),
            fault_count: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> FaultStats {
        FaultStats {
            fault_count: self.fault_count.load(Ordering::Relaxed),
        }
    }

    /// Turn injection on or off; used to let the pipeline drain.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Roll the RNG and fail with an injected error if it comes up.
    async fn roll(&self, op: &str, target: &str) -> Result<(), StoreError> {
        if self.config.error_rate <= 0.0 || !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut rng = self.rng.lock().await;
        let roll: f64 = rng.gen();
        if roll >= self.config.error_rate {
            return Ok(());
        }

        self.fault_count.fetch_add(1, Ordering::Relaxed);
        if rng.gen::<bool>() {
            Err(StoreError::Timeout {
                operation: format!("{} {}", FAULT_PREFIX, op),
                target: target.to_string(),
            })
        } else {
            Err(StoreError::ConnectionFailed {
                backend: format!("{} faulty", FAULT_PREFIX),
                source: Box::new(std::io::Error::other(format!(
                    "{} connection failed during {}",
                    FAULT_PREFIX, op
                ))),
            })
        }
    }
}

#[async_trait]
impl ExperimentStore for FaultyStore {
    async fn insert(&self, new: &NewExperiment) -> Result<ExperimentRecord, StoreError> {
        self.roll("insert", "experiments").await?;
        self.inner.insert(new).await
    }

    async fn get(&self, trace_id: u64) -> Result<Option<ExperimentRecord>, StoreError> {
        self.roll("get", &trace_id.to_string()).await?;
        self.inner.get(trace_id).await
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ExperimentRecord>, StoreError> {
        self.roll("scan", "experiments").await?;
        self.inner.scan(filter).await
    }

    async fn compare_and_swap(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
    ) -> Result<bool, StoreError> {
        self.roll("compare_and_swap", &trace_id.to_string()).await?;
        self.inner.compare_and_swap(trace_id, expect, update).await
    }

    async fn reset(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
        purge: Purge,
    ) -> Result<bool, StoreError> {
        self.roll("reset", &trace_id.to_string()).await?;
        self.inner.reset(trace_id, expect, update, purge).await
    }

    async fn commit(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
        output: &StageOutput,
    ) -> Result<bool, StoreError> {
        self.roll("commit", &trace_id.to_string()).await?;
        self.inner.commit(trace_id, expect, update, output).await
    }

    async fn renew_lease(
        &self,
        trace_id: u64,
        worker: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.roll("renew_lease", &trace_id.to_string()).await?;
        self.inner.renew_lease(trace_id, worker, expires_at).await
    }

    async fn state_counts(&self) -> Result<BTreeMap<WorkState, usize>, StoreError> {
        self.roll("state_counts", "experiments").await?;
        self.inner.state_counts().await
    }

    async fn put_trace(&self, trace_id: u64, trace: &Trace) -> Result<(), StoreError> {
        self.roll("put_trace", &trace_id.to_string()).await?;
        self.inner.put_trace(trace_id, trace).await
    }

    async fn get_trace(&self, trace_id: u64) -> Result<Option<Trace>, StoreError> {
        self.roll("get_trace", &trace_id.to_string()).await?;
        self.inner.get_trace(trace_id).await
    }

    async fn trace_job_count(&self, trace_id: u64) -> Result<Option<usize>, StoreError> {
        self.roll("trace_job_count", &trace_id.to_string()).await?;
        self.inner.trace_job_count(trace_id).await
    }

    async fn put_result(&self, trace_id: u64, entry: &ResultEntry) -> Result<(), StoreError> {
        self.roll("put_result", &trace_id.to_string()).await?;
        self.inner.put_result(trace_id, entry).await
    }

    async fn get_result(
        &self,
        trace_id: u64,
        kind: ResultKind,
    ) -> Result<Option<ResultEntry>, StoreError> {
        self.roll("get_result", &trace_id.to_string()).await?;
        self.inner.get_result(trace_id, kind).await
    }

    async fn list_results(&self, trace_id: u64) -> Result<Vec<ResultEntry>, StoreError> {
        self.roll("list_results", &trace_id.to_string()).await?;
        self.inner.list_results(trace_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use xp_store::MemoryStore;

    #[tokio::test]
    async fn test_always_failing_store() {
        let store = FaultyStore::new(
            Arc::new(MemoryStore::new()),
            ChaCha8Rng::seed_from_u64(1),
            FaultConfig {
                error_rate: 1.0,
                ..Default::default()
            },
        );
        let err = store.get(1).await.unwrap_err();
        assert!(err.is_transient());
        assert!(is_injected_fault(&CoordError::Store(err)));
        assert_eq!(store.stats().fault_count, 1);

        store.set_enabled(false);
        assert!(store.get(1).await.unwrap().is_none());
        assert_eq!(store.stats().fault_count, 1);
    }

    #[tokio::test]
    async fn test_zero_rate_passes_through() {
        let store = FaultyStore::new(
            Arc::new(MemoryStore::new()),
            ChaCha8Rng::seed_from_u64(1),
            FaultConfig::default(),
        );
        let record = store
            .insert(&NewExperiment::single("A", "edison"))
            .await
            .unwrap();
        assert!(store.get(record.trace_id).await.unwrap().is_some());
        assert_eq!(store.stats().fault_count, 0);
    }
}
