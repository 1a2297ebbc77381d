//! Offline consistency checker.
//!
//! A crashed worker's simulation host can be handed to a second worker
//! before the first run is recognized as abandoned, leaving two experiments
//! that store the same trace. Records sharing a job count are checked
//! against their own definition, then compared pairwise.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use xp_config::CheckerConfig;
use xp_core::{
    manifest_stem, CoordError, ExperimentRecord, ExperimentStore, ScanFilter, Trace, TraceKind,
    WorkState, WorkflowHandling, REGULAR_JOB_NAME,
};

use crate::admin::reset_record;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadRecord {
    pub trace_id: u64,
    pub reason: String,
}

/// Two good records with different seeds but the same leading jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspiciousPair {
    pub first: u64,
    pub second: u64,
    pub job_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub good: Vec<u64>,
    pub bad: Vec<BadRecord>,
    pub suspicious: Vec<SuspiciousPair>,
    /// Records whose job count no other record shares.
    pub unique: usize,
}

/// Operator confirmation before the checker mutates anything.
pub trait Confirm {
    fn confirm(&self, report: &CheckReport) -> bool;
}

/// Confirms every repair without asking.
pub struct AlwaysConfirm;

impl Confirm for AlwaysConfirm {
    fn confirm(&self, _report: &CheckReport) -> bool {
        true
    }
}

/// Check that a trace's leading jobs match the record's workflow handling
/// and manifest list.
pub fn check_handling(
    record: &ExperimentRecord,
    trace: &Trace,
    lead: usize,
    name_check: usize,
) -> Result<(), String> {
    let handling = record.workflow_handling;
    for job in trace.jobs.iter().take(lead) {
        if job.job_name == REGULAR_JOB_NAME {
            continue;
        }
        let name = job
            .workflow_name()
            .ok_or_else(|| format!("job {} has unknown name '{}'", job.id_job, job.job_name))?;

        match handling {
            WorkflowHandling::No => {
                return Err(format!(
                    "job {} is workflow job '{}' but the experiment has no workflows",
                    job.id_job, job.job_name
                ))
            }
            WorkflowHandling::Single | WorkflowHandling::Manifest => {
                if name.stage.is_some() {
                    return Err(format!(
                        "job {} has a stage suffix under '{}' handling",
                        job.id_job, handling
                    ));
                }
                if !job.dependency.is_empty() {
                    return Err(format!(
                        "job {} has dependency '{}' under '{}' handling",
                        job.id_job, job.dependency, handling
                    ));
                }
                let expected = if handling == WorkflowHandling::Manifest {
                    name.manifest.as_str()
                } else {
                    ""
                };
                if job.manifest != expected {
                    return Err(format!(
                        "job {} runs manifest '{}', expected '{}'",
                        job.id_job, job.manifest, expected
                    ));
                }
            }
            WorkflowHandling::Multi => {
                let Some(stage) = name.stage else {
                    return Err(format!(
                        "job {} has no stage suffix under 'multi' handling",
                        job.id_job
                    ));
                };
                if (stage > 0) == job.dependency.is_empty() {
                    return Err(format!(
                        "job {} at stage {} has dependency '{}'",
                        job.id_job, stage, job.dependency
                    ));
                }
            }
        }
    }

    let stems: Vec<&str> = record.manifest_list.iter().map(|m| manifest_stem(m)).collect();
    for (job, name) in trace.workflow_jobs().take(name_check) {
        if !stems.contains(&name.manifest.as_str()) {
            return Err(format!(
                "job {} belongs to manifest '{}', not one of {:?}",
                job.id_job, name.manifest, stems
            ));
        }
    }
    Ok(())
}

/// Whether two traces share their first `lead` jobs and first `lead / 10`
/// workflow jobs.
pub fn leading_identical(a: &Trace, b: &Trace, lead: usize) -> bool {
    let jobs_match = a
        .jobs
        .iter()
        .take(lead)
        .map(|j| j.identity())
        .eq(b.jobs.iter().take(lead).map(|j| j.identity()));
    let workflows_match = a
        .workflow_jobs()
        .take(lead / 10)
        .map(|(j, _)| j.identity())
        .eq(b.workflow_jobs().take(lead / 10).map(|(j, _)| j.identity()));
    jobs_match && workflows_match
}

pub struct Checker {
    store: Arc<dyn ExperimentStore>,
    config: CheckerConfig,
}

impl Checker {
    pub fn new(store: Arc<dyn ExperimentStore>, config: CheckerConfig) -> Self {
        Checker { store, config }
    }

    /// Classify every simulated single experiment at or past the configured
    /// minimum id, including ones reset to `pending` for re-analysis. Read-only.
    pub async fn scan(&self) -> Result<CheckReport, CoordError> {
        let store = self.store.as_ref();
        let records = store
            .scan(
                &ScanFilter::default()
                    .kinds(&[TraceKind::Single])
                    .min_trace_id(self.config.min_trace_id),
            )
            .await?;

        let mut by_count: BTreeMap<usize, Vec<ExperimentRecord>> = BTreeMap::new();
        for record in records
            .into_iter()
            .filter(|r| r.work_state.has_trace() || r.work_state == WorkState::Pending)
        {
            if let Some(count) = store.trace_job_count(record.trace_id).await? {
                by_count.entry(count).or_default().push(record);
            }
        }

        let mut report = CheckReport::default();
        for (job_count, group) in by_count {
            if group.len() < 2 {
                report.unique += group.len();
                continue;
            }

            let mut good: Vec<(ExperimentRecord, Trace)> = Vec::new();
            for record in group {
                let Some(trace) = store.get_trace(record.trace_id).await? else {
                    continue;
                };
                match check_handling(
                    &record,
                    &trace,
                    self.config.lead_jobs,
                    self.config.name_check_jobs,
                ) {
                    Ok(()) => good.push((record, trace)),
                    Err(reason) => {
                        warn!("Experiment {} is bad: {}", record.trace_id, reason);
                        report.bad.push(BadRecord {
                            trace_id: record.trace_id,
                            reason,
                        });
                    }
                }
            }

            for (i, (first, first_trace)) in good.iter().enumerate() {
                for (second, second_trace) in &good[i + 1..] {
                    if first.seed == second.seed {
                        continue;
                    }
                    if leading_identical(first_trace, second_trace, self.config.lead_jobs) {
                        warn!(
                            "Experiments {} and {} share their leading {} jobs",
                            first.trace_id, second.trace_id, self.config.lead_jobs
                        );
                        report.suspicious.push(SuspiciousPair {
                            first: first.trace_id,
                            second: second.trace_id,
                            job_count,
                        });
                    }
                }
            }
            report.good.extend(good.iter().map(|(r, _)| r.trace_id));
        }

        report.good.sort_unstable();
        info!(
            "Checked experiments: {} good, {} bad, {} suspicious pairs, {} unique",
            report.good.len(),
            report.bad.len(),
            report.suspicious.len(),
            report.unique
        );
        Ok(report)
    }

    /// Reset every bad record to fresh once `confirm` agrees.
    pub async fn repair(
        &self,
        report: &CheckReport,
        confirm: &dyn Confirm,
    ) -> Result<Vec<u64>, CoordError> {
        if report.bad.is_empty() || !confirm.confirm(report) {
            return Ok(Vec::new());
        }

        let mut repaired = Vec::new();
        for bad in &report.bad {
            let Some(record) = self.store.get(bad.trace_id).await? else {
                continue;
            };
            if !record.work_state.can_reset_to(WorkState::Fresh) {
                warn!(
                    "Experiment {} is already {}, skipping repair",
                    bad.trace_id, record.work_state
                );
                continue;
            }
            if reset_record(self.store.as_ref(), &record, WorkState::Fresh).await? {
                info!("Reset bad experiment {} to fresh", bad.trace_id);
                repaired.push(bad.trace_id);
            } else {
                warn!("Experiment {} changed before repair", bad.trace_id);
            }
        }
        Ok(repaired)
    }
}
