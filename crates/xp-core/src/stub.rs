//! In-process collaborators for tests, simulation, and `type: stub` configs.
//!
//! `ScriptedSimulator` produces a deterministic trace from an experiment's
//! definition, so two records with the same definition get identical
//! traces and records with different seeds do not.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use xp_config::WorkflowHandling;

use crate::error::CollaboratorError;
use crate::record::{manifest_stem, ExperimentRecord};
use crate::results::{
    JobValues, Stats, StatsBundle, TimeWindow, Utilization, WorkflowDelta, WorkflowKey,
    WorkflowMetric, WorkflowValue,
};
use crate::trace::{JobRecord, Trace, REGULAR_JOB_NAME};
use crate::traits::{Simulator, StatsEngine};

const STAGES_PER_WORKFLOW: u32 = 3;
const CPU_CHOICES: [u32; 5] = [24, 48, 96, 192, 384];

/// FNV-1a, stable across builds.
fn stable_hash(parts: &[&str]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in part.bytes().chain(std::iter::once(0xff)) {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

/// Deterministic stand-in for the remote simulator.
#[derive(Default)]
pub struct ScriptedSimulator {
    /// Traces left behind on the simulation host, by `trace_id`.
    produced: Mutex<HashMap<u64, Trace>>,
    failing: Mutex<HashSet<u64>>,
    malformed: Mutex<HashSet<u64>>,
    delay: Option<Duration>,
    runs: AtomicUsize,
}

impl ScriptedSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each run sleeps for `delay` before producing its trace.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Runs for `trace_id` fail as if the host were unreachable.
    pub fn fail_on(&self, trace_id: u64) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(trace_id);
    }

    /// Runs for `trace_id` succeed but leave an empty trace.
    pub fn malformed_on(&self, trace_id: u64) {
        self.malformed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(trace_id);
    }

    /// Leave `trace` on the host for `trace_id` without running anything.
    pub fn plant_trace(&self, trace_id: u64, trace: Trace) {
        self.produced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(trace_id, trace);
    }

    /// Number of `generate_and_run` calls so far.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }

    /// The trace this simulator produces for `record`.
    pub fn generate(record: &ExperimentRecord) -> Trace {
        let mut rng = ChaCha8Rng::seed_from_u64(stable_hash(&[&record.seed, &record.machine]));
        // Policy changes scheduling, not the workload itself.
        let wait_factor = 1.0 + (stable_hash(&[&record.workflow_policy]) % 5) as f64 * 0.25;

        let sim_start = record.start_date.timestamp();
        let sim_end = record.end_epoch();
        let span = (sim_end - sim_start).max(1);

        let mut jobs = Vec::new();
        let regular = (span / 600).clamp(1, 2000);
        for _ in 0..regular {
            let submit = sim_start + rng.gen_range(0..span);
            jobs.push(synth_job(&mut rng, REGULAR_JOB_NAME.to_string(), submit, wait_factor));
        }

        let manifests: Vec<&str> = record.manifest_list.iter().map(|m| manifest_stem(m)).collect();
        if record.workflow_handling != WorkflowHandling::No
            && record.workflow_period_s > 0
            && !manifests.is_empty()
        {
            let mut instance = 0u64;
            let mut submit = sim_start;
            while submit < sim_end {
                let manifest = manifests[instance as usize % manifests.len()];
                let base = format!("wf_{}-{}", manifest, instance);
                match record.workflow_handling {
                    WorkflowHandling::Multi => {
                        let mut ready = submit;
                        for stage in 0..STAGES_PER_WORKFLOW {
                            let mut job = synth_job(
                                &mut rng,
                                format!("{}_S{}", base, stage),
                                submit,
                                wait_factor,
                            );
                            let runtime = job.time_end - job.time_start;
                            job.time_start = job.time_start.max(ready);
                            job.time_end = job.time_start + runtime;
                            ready = job.time_end;
                            jobs.push(job);
                        }
                    }
                    handling => {
                        let mut job = synth_job(&mut rng, base, submit, wait_factor);
                        if handling == WorkflowHandling::Manifest {
                            job.manifest = manifest.to_string();
                        }
                        jobs.push(job);
                    }
                }
                instance += 1;
                submit += record.workflow_period_s as i64;
            }
        }

        // Ids follow submission order; stages of one workflow stay adjacent.
        jobs.sort_by_key(|j| j.time_submit);
        for (idx, job) in jobs.iter_mut().enumerate() {
            job.id_job = idx as u64 + 1;
        }
        for idx in 1..jobs.len() {
            let stage = jobs[idx].workflow_name().and_then(|n| n.stage);
            if stage.is_some_and(|s| s > 0) {
                let previous = jobs[idx - 1].id_job;
                jobs[idx].dependency = format!("afterok:{}", previous);
            }
        }
        // The simulation stops at the end of the window.
        for job in &mut jobs {
            if job.time_end > sim_end {
                job.time_end = 0;
            }
        }

        Trace::new(jobs)
    }
}

fn synth_job(rng: &mut ChaCha8Rng, name: String, submit: i64, wait_factor: f64) -> JobRecord {
    let runtime = rng.gen_range(60..3600i64);
    let wait = (rng.gen_range(0..600i64) as f64 * wait_factor) as i64;
    let cpus = CPU_CHOICES[rng.gen_range(0..CPU_CHOICES.len())];
    JobRecord {
        id_job: 0,
        job_name: name,
        timelimit: (runtime as u64 / 60) + rng.gen_range(1..30),
        cpus_req: cpus,
        dependency: String::new(),
        manifest: String::new(),
        time_submit: submit,
        time_start: submit + wait,
        time_end: submit + wait + runtime,
    }
}

#[async_trait]
impl Simulator for ScriptedSimulator {
    async fn generate_and_run(
        &self,
        record: &ExperimentRecord,
        host: &str,
    ) -> Result<(), CollaboratorError> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&record.trace_id);
        if failing {
            return Err(CollaboratorError::Unreachable {
                endpoint: host.to_string(),
                source: Box::new(std::io::Error::other(format!(
                    "simulation host {} refused experiment {}",
                    host, record.trace_id
                ))),
            });
        }

        let malformed = self
            .malformed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&record.trace_id);
        let trace = if malformed {
            Trace::default()
        } else {
            Self::generate(record)
        };

        self.produced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.trace_id, trace);
        Ok(())
    }

    async fn fetch_trace(
        &self,
        record: &ExperimentRecord,
    ) -> Result<Option<Trace>, CollaboratorError> {
        Ok(self
            .produced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&record.trace_id)
            .cloned())
    }
}

/// Local statistics engine computing plain summary statistics.
pub struct StubStatsEngine {
    capacity_cpus: f64,
    sample_step: i64,
    fail: AtomicBool,
}

impl Default for StubStatsEngine {
    fn default() -> Self {
        StubStatsEngine {
            capacity_cpus: 2048.0,
            sample_step: 300,
            fail: AtomicBool::new(false),
        }
    }
}

impl StubStatsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    fn check(&self, operation: &str) -> Result<(), CollaboratorError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(CollaboratorError::Failed(format!(
                "stats engine refused {}",
                operation
            )));
        }
        Ok(())
    }
}

fn bundle<'a>(count: usize, metrics: impl IntoIterator<Item = (&'a str, Vec<f64>)>) -> StatsBundle {
    StatsBundle {
        count,
        metrics: metrics
            .into_iter()
            .filter_map(|(name, values)| Stats::from_values(&values).map(|s| (name.to_string(), s)))
            .collect(),
    }
}

#[async_trait]
impl StatsEngine for StubStatsEngine {
    async fn job_values(
        &self,
        trace: &Trace,
        window: TimeWindow,
    ) -> Result<JobValues, CollaboratorError> {
        self.check("job_values")?;
        let mut values = JobValues::default();
        for job in trace.jobs.iter().filter(|j| {
            j.is_finished() && window.contains(j.time_submit) && j.workflow_name().is_none()
        }) {
            let runtime = (job.time_end - job.time_start) as f64;
            let wait = (job.time_start - job.time_submit) as f64;
            let turnaround = (job.time_end - job.time_submit) as f64;
            values.runtime.push(runtime);
            values.wait.push(wait);
            values.turnaround.push(turnaround);
            values.stretch.push(turnaround / runtime.max(1.0));
            values.cpus.push(job.cpus_req as f64);
        }
        Ok(values)
    }

    async fn workflow_values(
        &self,
        trace: &Trace,
        window: TimeWindow,
        handling: WorkflowHandling,
        sibling: usize,
    ) -> Result<Vec<WorkflowValue>, CollaboratorError> {
        self.check("workflow_values")?;
        if handling == WorkflowHandling::No {
            return Ok(Vec::new());
        }

        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<&JobRecord>> = HashMap::new();
        for (job, name) in trace.workflow_jobs() {
            let workflow = name.workflow();
            if !grouped.contains_key(&workflow) {
                order.push(workflow.clone());
            }
            grouped.entry(workflow).or_default().push(job);
        }

        let mut values = Vec::new();
        for workflow in order {
            let jobs = &grouped[&workflow];
            if !jobs.iter().all(|j| j.is_finished()) {
                continue;
            }
            let submit = jobs.iter().map(|j| j.time_submit).min().unwrap_or_default();
            if !window.contains(submit) {
                continue;
            }
            let start = jobs.iter().map(|j| j.time_start).min().unwrap_or_default();
            let end = jobs.iter().map(|j| j.time_end).max().unwrap_or_default();
            let manifest = jobs
                .first()
                .and_then(|j| j.workflow_name())
                .map(|n| n.manifest)
                .unwrap_or_default();
            let runtime = (end - start) as f64;
            let turnaround = (end - submit) as f64;
            values.push(WorkflowValue {
                key: WorkflowKey {
                    sibling,
                    name: workflow,
                },
                manifest,
                submit,
                start,
                end,
                runtime,
                wait: (start - submit) as f64,
                turnaround,
                stretch: turnaround / runtime.max(1.0),
            });
        }

        // Completion order
        values.sort_by(|a, b| a.end.cmp(&b.end).then_with(|| a.key.cmp(&b.key)));
        Ok(values)
    }

    async fn utilization(
        &self,
        trace: &Trace,
        window: TimeWindow,
    ) -> Result<Utilization, CollaboratorError> {
        self.check("utilization")?;
        let mut samples = Vec::new();
        let mut t = window.start;
        while t < window.end {
            let used: f64 = trace
                .jobs
                .iter()
                .filter(|j| j.time_start <= t && (j.time_end > t || j.time_end == 0))
                .map(|j| j.cpus_req as f64)
                .sum();
            samples.push((used / self.capacity_cpus).min(1.0));
            t += self.sample_step;
        }
        Ok(match Stats::from_values(&samples) {
            Some(stats) => Utilization {
                median: stats.median,
                mean: stats.mean,
            },
            None => Utilization {
                median: 0.0,
                mean: 0.0,
            },
        })
    }

    async fn job_stats(&self, values: &JobValues) -> Result<StatsBundle, CollaboratorError> {
        self.check("job_stats")?;
        Ok(bundle(
            values.len(),
            [
                ("runtime", values.runtime.clone()),
                ("wait", values.wait.clone()),
                ("turnaround", values.turnaround.clone()),
                ("stretch", values.stretch.clone()),
                ("cpus", values.cpus.clone()),
            ],
        ))
    }

    async fn workflow_stats(
        &self,
        values: &[WorkflowValue],
    ) -> Result<StatsBundle, CollaboratorError> {
        self.check("workflow_stats")?;
        Ok(bundle(
            values.len(),
            WorkflowMetric::ALL
                .iter()
                .map(|m| (m.as_str(), values.iter().map(|v| v.metric(*m)).collect())),
        ))
    }

    async fn delta_stats(
        &self,
        deltas: &[WorkflowDelta],
    ) -> Result<StatsBundle, CollaboratorError> {
        self.check("delta_stats")?;
        Ok(bundle(
            deltas.len(),
            [
                ("runtime", deltas.iter().map(|d| d.runtime).collect()),
                ("wait", deltas.iter().map(|d| d.wait).collect()),
                ("turnaround", deltas.iter().map(|d| d.turnaround).collect()),
                ("stretch", deltas.iter().map(|d| d.stretch).collect()),
            ],
        ))
    }
}
