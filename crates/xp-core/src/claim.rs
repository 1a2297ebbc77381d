//! Optimistic claim protocol.
//!
//! A worker takes ownership of a record with a compare-and-swap on the
//! record's observed `work_state` and `version`. A swap that affects no row
//! means another worker got there first; scans move on to the next
//! candidate instead of treating it as an error.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::CoordError;
use crate::record::{ExperimentRecord, TraceKind};
use crate::state::{Expectation, Stage, StateUpdate, WindowChange, WorkState};
use crate::traits::{ExperimentStore, ScanFilter, StageOutput};

/// Candidates fetched per scan round.
pub const SCAN_BATCH: usize = 16;

/// Identity and lease settings of the claiming worker.
#[derive(Debug, Clone)]
pub struct ClaimOptions {
    pub worker: String,
    /// Claims expire unless renewed within this period. `None` disables leases.
    pub lease_ttl: Option<Duration>,
}

impl ClaimOptions {
    pub fn new(worker: impl Into<String>) -> Self {
        ClaimOptions {
            worker: worker.into(),
            lease_ttl: None,
        }
    }

    pub fn with_lease(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    pub fn lease_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.lease_ttl?).ok()?;
        now.checked_add_signed(ttl)
    }
}

/// Claim a known record for `stage`.
///
/// The record must be in one of the stage's source states; anything else is
/// a caller error and the record is left untouched.
pub async fn claim_by_id(
    store: &dyn ExperimentStore,
    trace_id: u64,
    stage: Stage,
    opts: &ClaimOptions,
) -> Result<ExperimentRecord, CoordError> {
    let record = store
        .get(trace_id)
        .await?
        .ok_or(CoordError::NotFound(trace_id))?;

    let sources = stage.source_states(record.trace_type());
    if sources.is_empty() {
        return Err(CoordError::Misuse(format!(
            "{} experiment {} has no {} stage",
            record.trace_type(),
            trace_id,
            stage
        )));
    }
    if !sources.contains(&record.work_state) {
        return Err(CoordError::UnexpectedState {
            trace_id,
            expected: sources.to_vec(),
            actual: record.work_state,
        });
    }

    match claim_candidate(store, &record, stage, opts).await? {
        Some(claimed) => Ok(claimed),
        None => {
            let actual = store
                .get(trace_id)
                .await?
                .map(|r| r.work_state)
                .ok_or(CoordError::NotFound(trace_id))?;
            Err(CoordError::UnexpectedState {
                trace_id,
                expected: sources.to_vec(),
                actual,
            })
        }
    }
}

/// One claim attempt against an observed record. `Ok(None)` means the race was lost.
pub async fn claim_candidate(
    store: &dyn ExperimentStore,
    observed: &ExperimentRecord,
    stage: Stage,
    opts: &ClaimOptions,
) -> Result<Option<ExperimentRecord>, CoordError> {
    let next = stage.claim_state();
    if !observed.work_state.can_advance_to(next) {
        return Err(CoordError::InvalidTransition {
            trace_id: observed.trace_id,
            from: observed.work_state,
            to: next,
        });
    }

    let now = Utc::now();
    let expect = Expectation::exact(observed.work_state, observed.version);
    let update = StateUpdate::new(next, Some(opts.worker.clone()))
        .with_lease(opts.lease_deadline(now));

    if !store
        .compare_and_swap(observed.trace_id, &expect, &update)
        .await?
    {
        return Ok(None);
    }

    let mut claimed = observed.clone();
    claimed.apply(&update);
    Ok(Some(claimed))
}

/// Claim the oldest available record of `kinds` for `stage`.
///
/// With leases enabled, in-progress records of the same stage whose lease
/// has expired are taken over first. Returns `Ok(None)` when no work is left.
pub async fn claim_by_scan(
    store: &dyn ExperimentStore,
    stage: Stage,
    kinds: &[TraceKind],
    opts: &ClaimOptions,
) -> Result<Option<ExperimentRecord>, CoordError> {
    loop {
        let candidates = available(store, stage, kinds, opts).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        for candidate in &candidates {
            if let Some(claimed) = claim_candidate(store, candidate, stage, opts).await? {
                if candidate.work_state.is_in_progress() {
                    debug!(
                        trace_id = candidate.trace_id,
                        previous = candidate.assigned_worker.as_deref().unwrap_or("-"),
                        "took over expired claim"
                    );
                }
                return Ok(Some(claimed));
            }
            debug!(trace_id = candidate.trace_id, "lost claim race");
        }
    }
}

/// Records `stage` could claim right now, oldest first.
pub async fn available(
    store: &dyn ExperimentStore,
    stage: Stage,
    kinds: &[TraceKind],
    opts: &ClaimOptions,
) -> Result<Vec<ExperimentRecord>, CoordError> {
    if opts.lease_ttl.is_some() {
        let expired = store
            .scan(
                &ScanFilter::states(stage.in_progress_states())
                    .kinds(kinds)
                    .lease_expired_before(Utc::now())
                    .limit(SCAN_BATCH),
            )
            .await?;
        if !expired.is_empty() {
            return Ok(expired);
        }
    }

    let mut candidates = Vec::new();
    for kind in kinds {
        let sources = stage.source_states(*kind);
        if sources.is_empty() {
            continue;
        }
        candidates.extend(
            store
                .scan(
                    &ScanFilter::states(sources)
                        .kinds(&[*kind])
                        .limit(SCAN_BATCH),
                )
                .await?,
        );
    }
    candidates.sort_by_key(|r| r.trace_id);
    candidates.truncate(SCAN_BATCH);
    Ok(candidates)
}

fn holder_expectation(record: &ExperimentRecord) -> Expectation {
    match &record.assigned_worker {
        Some(worker) => Expectation::held_by(record.work_state, record.version, worker),
        None => Expectation::exact(record.work_state, record.version),
    }
}

fn checked_update(
    record: &ExperimentRecord,
    next: WorkState,
    window: WindowChange,
    opts: &ClaimOptions,
) -> Result<StateUpdate, CoordError> {
    if !record.work_state.can_advance_to(next) {
        return Err(CoordError::InvalidTransition {
            trace_id: record.trace_id,
            from: record.work_state,
            to: next,
        });
    }
    let lease = if next.is_in_progress() {
        opts.lease_deadline(Utc::now())
    } else {
        None
    };
    Ok(StateUpdate::new(next, record.assigned_worker.clone())
        .with_lease(lease)
        .with_window(window))
}

/// Move a claimed record to `next`, provided this worker still holds it.
pub async fn advance(
    store: &dyn ExperimentStore,
    record: &mut ExperimentRecord,
    next: WorkState,
    window: WindowChange,
    opts: &ClaimOptions,
) -> Result<(), CoordError> {
    let update = checked_update(record, next, window, opts)?;
    if !store
        .compare_and_swap(record.trace_id, &holder_expectation(record), &update)
        .await?
    {
        return Err(CoordError::LostClaim {
            trace_id: record.trace_id,
        });
    }

    record.apply(&update);
    Ok(())
}

/// Like [`advance`], storing `output` in the same write. A worker whose claim
/// was taken over or reset writes nothing.
pub async fn advance_with(
    store: &dyn ExperimentStore,
    record: &mut ExperimentRecord,
    next: WorkState,
    window: WindowChange,
    opts: &ClaimOptions,
    output: &StageOutput,
) -> Result<(), CoordError> {
    let update = checked_update(record, next, window, opts)?;
    if !store
        .commit(record.trace_id, &holder_expectation(record), &update, output)
        .await?
    {
        return Err(CoordError::LostClaim {
            trace_id: record.trace_id,
        });
    }

    record.apply(&update);
    Ok(())
}

/// Move a claimed record to its stage's error state and drop the rows that
/// stage owns.
pub async fn fail(
    store: &dyn ExperimentStore,
    record: &mut ExperimentRecord,
    stage: Stage,
    opts: &ClaimOptions,
) -> Result<(), CoordError> {
    let update = checked_update(record, stage.error_state(), WindowChange::Keep, opts)?;
    if !store
        .reset(
            record.trace_id,
            &holder_expectation(record),
            &update,
            stage.failure_purge(),
        )
        .await?
    {
        return Err(CoordError::LostClaim {
            trace_id: record.trace_id,
        });
    }

    record.apply(&update);
    Ok(())
}

/// Hand a claimed record back to one of the stage's source states.
pub async fn release(
    store: &dyn ExperimentStore,
    record: &mut ExperimentRecord,
    stage: Stage,
    back_to: WorkState,
) -> Result<(), CoordError> {
    if !stage.source_states(record.trace_type()).contains(&back_to) {
        return Err(CoordError::InvalidTransition {
            trace_id: record.trace_id,
            from: record.work_state,
            to: back_to,
        });
    }

    let update = StateUpdate::new(back_to, None);

    if !store
        .compare_and_swap(record.trace_id, &holder_expectation(record), &update)
        .await?
    {
        return Err(CoordError::LostClaim {
            trace_id: record.trace_id,
        });
    }

    record.apply(&update);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_deadline() {
        let now = Utc::now();
        assert_eq!(ClaimOptions::new("w1").lease_deadline(now), None);

        let opts = ClaimOptions::new("w1").with_lease(Duration::from_secs(600));
        assert_eq!(
            opts.lease_deadline(now),
            Some(now + chrono::Duration::seconds(600))
        );
    }
}
