use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// How workflows are represented in a generated trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowHandling {
    /// No workflow jobs at all
    #[default]
    No,
    /// Each workflow submitted as one job
    Single,
    /// Each workflow submitted as one job that runs its manifest
    Manifest,
    /// Each workflow stage submitted as its own dependent job
    Multi,
}

impl WorkflowHandling {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowHandling::No => "no",
            WorkflowHandling::Single => "single",
            WorkflowHandling::Manifest => "manifest",
            WorkflowHandling::Multi => "multi",
        }
    }
}

impl FromStr for WorkflowHandling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "no" => Ok(WorkflowHandling::No),
            "single" => Ok(WorkflowHandling::Single),
            "manifest" => Ok(WorkflowHandling::Manifest),
            "multi" => Ok(WorkflowHandling::Multi),
            other => Err(format!("Unknown workflow handling: {}", other)),
        }
    }
}

impl fmt::Display for WorkflowHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable duration (e.g., "200ms", "5m", "6h").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub std::time::Duration);

impl Default for HumanDuration {
    fn default() -> Self {
        HumanDuration(std::time::Duration::from_secs(0))
    }
}

impl HumanDuration {
    pub fn from_secs(secs: u64) -> Self {
        HumanDuration(std::time::Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> std::time::Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();

        let (num_str, unit) = if let Some(n) = s.strip_suffix("ms") {
            (n, "ms")
        } else if let Some(n) = s.strip_suffix('s') {
            (n, "s")
        } else if let Some(n) = s.strip_suffix('m') {
            (n, "m")
        } else if let Some(n) = s.strip_suffix('h') {
            (n, "h")
        } else if let Some(n) = s.strip_suffix('d') {
            (n, "d")
        } else {
            return Err(format!("Invalid duration format: {}", s));
        };

        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", s))?;

        let duration = match unit {
            "ms" => std::time::Duration::from_millis(num),
            "s" => std::time::Duration::from_secs(num),
            "m" => std::time::Duration::from_secs(num * 60),
            "h" => std::time::Duration::from_secs(num * 3600),
            _ => std::time::Duration::from_secs(num * 86400),
        };

        Ok(HumanDuration(duration))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let millis = self.0.as_millis();

        if millis < 1000 || self.0.subsec_millis() != 0 {
            write!(f, "{}ms", millis)
        } else if secs % 86400 == 0 {
            write!(f, "{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        HumanDuration::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// SQLite store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    pub path: String,
}

/// PostgreSQL store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresStoreConfig {
    pub connection_string: String,
    /// Prefix for the experiments, traces, and results tables.
    #[serde(default)]
    pub table_prefix: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

/// Tagged enum for the experiment store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite(SqliteStoreConfig),
    Postgres(PostgresStoreConfig),
}

/// In-process stub collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StubCollaboratorConfig {
    /// Trace ids the stub simulator refuses to run.
    #[serde(default)]
    pub fail_trace_ids: Vec<u64>,
}

/// Remote collaborator reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCollaboratorConfig {
    pub endpoint: String,
    #[serde(default)]
    pub timeout: Option<HumanDuration>,
}

/// Tagged enum for the simulator and statistics engine collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollaboratorConfig {
    Stub(StubCollaboratorConfig),
    Http(HttpCollaboratorConfig),
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        CollaboratorConfig::Stub(StubCollaboratorConfig::default())
    }
}

/// Worker process settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerConfig {
    /// Identity written into `assigned_worker` on claim.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Host the simulator runs experiments on.
    #[serde(default)]
    pub simulator_host: Option<String>,
    #[serde(default)]
    pub poll_interval: Option<HumanDuration>,
    #[serde(default)]
    pub simulation_timeout: Option<HumanDuration>,
    /// Enables claim leases and the heartbeat when set.
    #[serde(default)]
    pub lease_ttl: Option<HumanDuration>,
}

/// Consistency checker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    #[serde(default)]
    pub min_trace_id: u64,
    #[serde(default = "default_lead_jobs")]
    pub lead_jobs: usize,
    #[serde(default = "default_name_check_jobs")]
    pub name_check_jobs: usize,
}

fn default_lead_jobs() -> usize {
    200
}

fn default_name_check_jobs() -> usize {
    10
}

impl Default for CheckerConfig {
    fn default() -> Self {
        CheckerConfig {
            min_trace_id: 0,
            lead_jobs: default_lead_jobs(),
            name_check_jobs: default_name_check_jobs(),
        }
    }
}

/// Named experiment template used by `xp create --preset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetConfig {
    pub machine: String,
    #[serde(default = "default_workflow_policy")]
    pub workflow_policy: String,
    #[serde(default)]
    pub workflow_period_s: u64,
    #[serde(default)]
    pub workflow_handling: WorkflowHandling,
    #[serde(default)]
    pub manifest_list: Vec<String>,
    #[serde(default)]
    pub preload_time_s: u64,
    #[serde(default = "default_workload_duration")]
    pub workload_duration_s: u64,
    #[serde(default)]
    pub overload_target: Option<f64>,
    /// RFC 3339 start of the simulated period.
    #[serde(default)]
    pub start_date: Option<String>,
}

fn default_workflow_policy() -> String {
    "no".to_string()
}

fn default_workload_duration() -> u64 {
    86400
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct XpConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub simulator: CollaboratorConfig,
    #[serde(default)]
    pub stats: CollaboratorConfig,
    #[serde(default)]
    pub checker: CheckerConfig,
    #[serde(default)]
    pub presets: IndexMap<String, PresetConfig>,
}
