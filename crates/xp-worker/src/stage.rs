//! Settling a claimed record after its stage went wrong.

use tracing::{error, warn};
use xp_core::{
    fail, release, ClaimOptions, CoordError, ExperimentRecord, ExperimentStore, Stage, WorkState,
};

use crate::summary::Outcome;

/// Source state to hand a claim back to: where it came from if that is a
/// source of `stage`, otherwise the stage's first source.
pub(crate) fn release_target(record: &ExperimentRecord, stage: Stage, from: WorkState) -> Option<WorkState> {
    let sources = stage.source_states(record.trace_type());
    if sources.contains(&from) {
        Some(from)
    } else {
        sources.first().copied()
    }
}

/// Give a claim back without running the stage.
pub(crate) async fn hand_back(
    store: &dyn ExperimentStore,
    record: &mut ExperimentRecord,
    stage: Stage,
    from: WorkState,
) -> Result<Outcome, CoordError> {
    let Some(back_to) = release_target(record, stage, from) else {
        return Err(CoordError::Misuse(format!(
            "{} experiment {} has no {} stage",
            record.trace_type(),
            record.trace_id,
            stage
        )));
    };
    match release(store, record, stage, back_to).await {
        Ok(()) => Ok(Outcome::NotReady),
        Err(CoordError::LostClaim { .. }) => Ok(Outcome::Lost),
        Err(e) => Err(e),
    }
}

/// Map a stage error to an outcome, moving the record to the stage's error
/// state for stage failures and dropping what the attempt left behind.
/// Misuse is handed back and re-raised.
pub(crate) async fn settle_failure(
    store: &dyn ExperimentStore,
    record: &mut ExperimentRecord,
    stage: Stage,
    from: WorkState,
    opts: &ClaimOptions,
    err: CoordError,
) -> Result<Outcome, CoordError> {
    match err {
        CoordError::LostClaim { trace_id } => {
            warn!("Lost claim on {} during {}", trace_id, stage);
            Ok(Outcome::Lost)
        }
        err if err.is_stage_failure() => {
            let reason = err.to_string();
            error!("{} of experiment {} failed: {}", stage, record.trace_id, reason);
            match fail(store, record, stage, opts).await {
                Ok(()) => Ok(Outcome::Failed(reason)),
                Err(CoordError::LostClaim { .. }) => Ok(Outcome::Lost),
                Err(e) => Err(e),
            }
        }
        err => {
            if let Some(back_to) = release_target(record, stage, from) {
                if let Err(e) = release(store, record, stage, back_to).await {
                    warn!("Failed to release {} after {}: {}", record.trace_id, err, e);
                }
            }
            Err(err)
        }
    }
}
