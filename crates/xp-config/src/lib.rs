mod defaults;
mod env;
pub mod types;
mod validation;

use std::path::Path;

pub use defaults::{DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SIMULATION_TIMEOUT_SECS};
pub use types::*;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Missing environment variables: {0:?}")]
    MissingEnvVars(Vec<String>),

    #[error("Invalid endpoint for {0}: '{1}' (expected http:// or https://)")]
    InvalidEndpoint(String, String),

    #[error("Invalid preset '{0}': {1}")]
    InvalidPreset(String, String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl XpConfig {
    /// Parse a configuration from a YAML string.
    /// Environment variables in the format `${VAR_NAME}` or
    /// `${VAR_NAME:-default}` are interpolated.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let interpolated = env::interpolate_env(yaml)?;
        let config: XpConfig = serde_yaml::from_str(&interpolated)?;
        Ok(config)
    }

    /// Load a configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
name: scheduler-study
store:
  type: sqlite
  path: ./xp.db
"#;

        let config = XpConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.name, Some("scheduler-study".to_string()));
        assert!(matches!(config.store, StoreConfig::Sqlite(_)));
        assert!(matches!(config.simulator, CollaboratorConfig::Stub(_)));
        assert_eq!(config.checker.lead_jobs, 200);
        assert_eq!(config.checker.name_check_jobs, 10);
    }

    #[test]
    fn test_parse_full_config() {
        std::env::set_var("XP_TEST_SIM_ENDPOINT", "http://sim-vm-3:8080");

        let yaml = r#"
name: study
store:
  type: postgres
  connection_string: postgres://xp@db/xp
  table_prefix: study_
worker:
  hostname: ${XP_TEST_UNSET_WORKER:-worker-1}
  poll_interval: 15s
  simulation_timeout: 2h
  lease_ttl: 10m
simulator:
  type: http
  endpoint: ${XP_TEST_SIM_ENDPOINT}
  timeout: 30s
stats:
  type: stub
checker:
  min_trace_id: 500
  lead_jobs: 100
presets:
  baseline:
    machine: edison
    workflow_policy: period
    workflow_period_s: 3600
    workflow_handling: manifest
    manifest_list: [floodplain.json, synthLongWide.json]
    preload_time_s: 7200
    workload_duration_s: 86400
"#;

        let config = XpConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.worker.hostname.as_deref(), Some("worker-1"));
        assert_eq!(
            config.worker.lease_ttl.map(|d| d.as_duration()),
            Some(std::time::Duration::from_secs(600))
        );
        match &config.simulator {
            CollaboratorConfig::Http(http) => {
                assert_eq!(http.endpoint, "http://sim-vm-3:8080");
            }
            other => panic!("Expected http simulator, got {:?}", other),
        }
        assert_eq!(config.checker.min_trace_id, 500);
        assert_eq!(config.checker.name_check_jobs, 10);

        let baseline = &config.presets["baseline"];
        assert_eq!(baseline.workflow_handling, WorkflowHandling::Manifest);
        assert_eq!(baseline.manifest_list.len(), 2);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_unknown_store_type_rejected() {
        let yaml = "store:\n  type: mysql\n";
        assert!(matches!(
            XpConfig::from_yaml(yaml),
            Err(ConfigError::YamlError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("xp-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("xp.yaml");
        std::fs::write(&path, "name: from-file\n").unwrap();

        let config = XpConfig::from_file(&path).unwrap();
        assert_eq!(config.name.as_deref(), Some("from-file"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
