//! Simulated job traces and the workflow job-name grammar.
//!
//! Regular jobs are named `sim_job`. Workflow jobs are named
//! `wf_{manifest}-{instance}`, with a `_S{stage}` suffix when each workflow
//! stage runs as its own job.

use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

/// Name given to every non-workflow job.
pub const REGULAR_JOB_NAME: &str = "sim_job";

/// One job as recorded by the simulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id_job: u64,
    pub job_name: String,
    /// Requested wall time in minutes.
    pub timelimit: u64,
    pub cpus_req: u32,
    /// Scheduler dependency expression, empty when none.
    #[serde(default)]
    pub dependency: String,
    /// Manifest the job runs, empty when none.
    #[serde(default)]
    pub manifest: String,
    pub time_submit: i64,
    pub time_start: i64,
    /// Zero when the job had not finished by the end of the simulation.
    pub time_end: i64,
}

impl JobRecord {
    pub fn is_finished(&self) -> bool {
        self.time_end > 0 && self.time_end >= self.time_start
    }

    pub fn workflow_name(&self) -> Option<WorkflowJobName> {
        WorkflowJobName::parse(&self.job_name)
    }

    /// The fields compared when looking for duplicated traces.
    pub fn identity(&self) -> (u64, &str, u64, u32) {
        (self.id_job, self.job_name.as_str(), self.timelimit, self.cpus_req)
    }
}

/// Parsed `wf_{manifest}-{instance}[_S{stage}]` job name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowJobName {
    pub manifest: String,
    pub instance: u64,
    pub stage: Option<u32>,
}

impl WorkflowJobName {
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("wf_")?;

        let (body, stage) = match rest.rfind("_S") {
            Some(idx) => match rest[idx + 2..].parse::<u32>() {
                Ok(stage) => (&rest[..idx], Some(stage)),
                Err(_) => (rest, None),
            },
            None => (rest, None),
        };

        let dash = body.rfind('-')?;
        let manifest = &body[..dash];
        let instance = body[dash + 1..].parse::<u64>().ok()?;
        if manifest.is_empty() {
            return None;
        }

        Some(WorkflowJobName {
            manifest: manifest.to_string(),
            instance,
            stage,
        })
    }

    /// Name shared by every job of the same workflow.
    pub fn workflow(&self) -> String {
        format!("wf_{}-{}", self.manifest, self.instance)
    }

    pub fn job_name(&self) -> String {
        match self.stage {
            Some(stage) => format!("{}_S{}", self.workflow(), stage),
            None => self.workflow(),
        }
    }
}

/// A complete simulated trace, ordered by job id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub jobs: Vec<JobRecord>,
}

impl Trace {
    pub fn new(jobs: Vec<JobRecord>) -> Self {
        Trace { jobs }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Minimal well-formedness check applied before a trace is stored.
    pub fn validate(&self) -> Result<(), CollaboratorError> {
        if self.jobs.is_empty() {
            return Err(CollaboratorError::Malformed("trace has no jobs".to_string()));
        }
        if let Some(job) = self.jobs.iter().find(|j| j.job_name.trim().is_empty()) {
            return Err(CollaboratorError::Malformed(format!(
                "job {} has no name",
                job.id_job
            )));
        }
        Ok(())
    }

    /// Workflow jobs in trace order.
    pub fn workflow_jobs(&self) -> impl Iterator<Item = (&JobRecord, WorkflowJobName)> {
        self.jobs
            .iter()
            .filter_map(|job| job.workflow_name().map(|name| (job, name)))
    }
}
