use std::time::Duration;

use xp_config::{XpConfig, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SIMULATION_TIMEOUT_SECS};
use xp_core::ClaimOptions;

/// Resolved worker settings, defaults applied.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Identity written into `assigned_worker`.
    pub hostname: String,
    pub simulator_host: String,
    pub poll_interval: Duration,
    pub simulation_timeout: Duration,
    pub lease_ttl: Option<Duration>,
}

impl WorkerSettings {
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        WorkerSettings {
            simulator_host: hostname.clone(),
            hostname,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            simulation_timeout: Duration::from_secs(DEFAULT_SIMULATION_TIMEOUT_SECS),
            lease_ttl: None,
        }
    }

    pub fn from_config(config: &XpConfig) -> Self {
        let worker = config.effective().worker;
        let hostname = worker.hostname.unwrap_or_else(|| "localhost".to_string());
        WorkerSettings {
            simulator_host: worker.simulator_host.unwrap_or_else(|| hostname.clone()),
            hostname,
            poll_interval: worker
                .poll_interval
                .map(|d| d.as_duration())
                .unwrap_or(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)),
            simulation_timeout: worker
                .simulation_timeout
                .map(|d| d.as_duration())
                .unwrap_or(Duration::from_secs(DEFAULT_SIMULATION_TIMEOUT_SECS)),
            lease_ttl: worker.lease_ttl.map(|d| d.as_duration()),
        }
    }

    pub fn with_simulation_timeout(mut self, timeout: Duration) -> Self {
        self.simulation_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    pub fn claim_options(&self) -> ClaimOptions {
        let opts = ClaimOptions::new(self.hostname.clone());
        match self.lease_ttl {
            Some(ttl) => opts.with_lease(ttl),
            None => opts,
        }
    }
}
