use crate::types::{CollaboratorConfig, StoreConfig, WorkflowHandling, XpConfig};
use crate::ConfigError;

impl XpConfig {
    /// Validate the configuration and return a list of errors.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        match &self.store {
            StoreConfig::Sqlite(sqlite) if sqlite.path.trim().is_empty() => {
                errors.push(ConfigError::InvalidConfig(
                    "SQLite store path must not be empty".to_string(),
                ));
            }
            StoreConfig::Postgres(pg) if pg.connection_string.trim().is_empty() => {
                errors.push(ConfigError::InvalidConfig(
                    "Postgres connection string must not be empty".to_string(),
                ));
            }
            _ => {}
        }

        for (role, collaborator) in [("simulator", &self.simulator), ("stats", &self.stats)] {
            if let CollaboratorConfig::Http(http) = collaborator {
                if !(http.endpoint.starts_with("http://") || http.endpoint.starts_with("https://"))
                {
                    errors.push(ConfigError::InvalidEndpoint(
                        role.to_string(),
                        http.endpoint.clone(),
                    ));
                }
            }
        }

        if self.worker.poll_interval.is_some_and(|d| d.is_zero()) {
            errors.push(ConfigError::InvalidConfig(
                "worker.poll_interval must be greater than zero".to_string(),
            ));
        }

        if self.worker.lease_ttl.is_some_and(|d| d.is_zero()) {
            errors.push(ConfigError::InvalidConfig(
                "worker.lease_ttl must be greater than zero".to_string(),
            ));
        }

        // Leading workflow comparison uses lead_jobs / 10
        if self.checker.lead_jobs < 10 {
            errors.push(ConfigError::InvalidConfig(format!(
                "checker.lead_jobs must be at least 10, got {}",
                self.checker.lead_jobs
            )));
        }

        if self.checker.name_check_jobs == 0 {
            errors.push(ConfigError::InvalidConfig(
                "checker.name_check_jobs must be greater than zero".to_string(),
            ));
        }

        for (name, preset) in &self.presets {
            if preset.machine.trim().is_empty() {
                errors.push(ConfigError::InvalidPreset(
                    name.clone(),
                    "machine must not be empty".to_string(),
                ));
            }
            if preset.workflow_handling != WorkflowHandling::No && preset.manifest_list.is_empty()
            {
                errors.push(ConfigError::InvalidPreset(
                    name.clone(),
                    format!(
                        "workflow handling '{}' requires a non-empty manifest_list",
                        preset.workflow_handling
                    ),
                ));
            }
            if preset.workload_duration_s == 0 {
                errors.push(ConfigError::InvalidPreset(
                    name.clone(),
                    "workload_duration_s must be greater than zero".to_string(),
                ));
            }
        }

        errors
    }

    /// Validate and return Ok(()) if valid, or Err with the first error.
    pub fn validate_or_err(&self) -> Result<(), ConfigError> {
        match self.validate().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
