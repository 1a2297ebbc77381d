use crate::types::{HumanDuration, XpConfig};

/// Sleep between serve-mode passes when not configured.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Upper bound on one simulation when not configured.
pub const DEFAULT_SIMULATION_TIMEOUT_SECS: u64 = 6 * 3600;

impl XpConfig {
    /// Apply default inference rules to the configuration.
    /// This mutates the config in place.
    pub fn apply_defaults(&mut self) {
        let worker = &mut self.worker;

        // 1. Worker identity from the environment
        if worker.hostname.is_none() {
            worker.hostname = Some(detect_hostname());
        }

        // 2. Simulations run on the worker's own host unless told otherwise
        if worker.simulator_host.is_none() {
            worker.simulator_host = worker.hostname.clone();
        }

        if worker.poll_interval.is_none() {
            worker.poll_interval = Some(HumanDuration::from_secs(DEFAULT_POLL_INTERVAL_SECS));
        }

        if worker.simulation_timeout.is_none() {
            worker.simulation_timeout =
                Some(HumanDuration::from_secs(DEFAULT_SIMULATION_TIMEOUT_SECS));
        }
    }

    /// Returns a new config with all defaults applied.
    pub fn effective(&self) -> XpConfig {
        let mut config = self.clone();
        config.apply_defaults();
        config
    }
}

fn detect_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkerConfig;

    #[test]
    fn test_simulator_host_follows_hostname() {
        let config = XpConfig {
            worker: WorkerConfig {
                hostname: Some("vm-3".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let effective = config.effective();
        assert_eq!(effective.worker.simulator_host.as_deref(), Some("vm-3"));
        assert_eq!(
            effective.worker.poll_interval,
            Some(HumanDuration::from_secs(30))
        );
        assert_eq!(
            effective.worker.simulation_timeout,
            Some(HumanDuration::from_secs(6 * 3600))
        );
        assert!(effective.worker.lease_ttl.is_none());
    }

    #[test]
    fn test_explicit_values_kept() {
        let config = XpConfig {
            worker: WorkerConfig {
                hostname: Some("vm-3".to_string()),
                simulator_host: Some("sim-1".to_string()),
                poll_interval: Some(HumanDuration::from_secs(5)),
                ..Default::default()
            },
            ..Default::default()
        };

        let effective = config.effective();
        assert_eq!(effective.worker.simulator_host.as_deref(), Some("sim-1"));
        assert_eq!(
            effective.worker.poll_interval,
            Some(HumanDuration::from_secs(5))
        );
    }

    #[test]
    fn test_hostname_always_filled() {
        let effective = XpConfig::default().effective();
        assert!(effective
            .worker
            .hostname
            .as_deref()
            .is_some_and(|h| !h.is_empty()));
    }
}
