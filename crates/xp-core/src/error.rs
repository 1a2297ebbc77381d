use crate::state::WorkState;

/// Errors that can occur in experiment store operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Record does not exist.
    #[error("Experiment not found: {0}")]
    NotFound(u64),

    /// Connection to the store failed.
    #[error("Connection to store '{backend}' failed")]
    ConnectionFailed {
        backend: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out for {target}")]
    Timeout { operation: String, target: String },

    /// A persisted value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other store-specific error.
    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Returns true if this error is transient and the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionFailed { .. } => true,
            StoreError::Timeout { .. } => true,
            StoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Failures reported by the simulator or statistics engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CollaboratorError {
    #[error("Collaborator at '{endpoint}' is unreachable")]
    Unreachable {
        endpoint: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Collaborator failed: {0}")]
    Failed(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Unreachable { .. } | CollaboratorError::Timeout { .. }
        )
    }
}

/// Errors raised by the coordination layer.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("Experiment {0} not found")]
    NotFound(u64),

    #[error("Experiment {trace_id} is in state '{actual}', expected one of {expected:?}")]
    UnexpectedState {
        trace_id: u64,
        expected: Vec<WorkState>,
        actual: WorkState,
    },

    #[error("Illegal transition for experiment {trace_id}: {from} -> {to}")]
    InvalidTransition {
        trace_id: u64,
        from: WorkState,
        to: WorkState,
    },

    #[error("Experiment {parent} references missing sub-trace {subtrace}")]
    MissingSubtrace { parent: u64, subtrace: u64 },

    #[error("Experiment {parent} references sub-trace {subtrace}, which is not a single experiment")]
    InvalidSubtrace { parent: u64, subtrace: u64 },

    /// A record expected to have a trace or result row has none.
    #[error("Experiment {trace_id} has no stored {what}")]
    MissingData { trace_id: u64, what: String },

    #[error("Delta experiment needs an even, non-zero number of sub-traces, got {0}")]
    OddDeltaSubtraces(usize),

    /// The claim on a record was taken over or reset while this worker held it.
    #[error("Lost claim on experiment {trace_id}")]
    LostClaim { trace_id: u64 },

    #[error("Misuse: {0}")]
    Misuse(String),
}

impl CoordError {
    /// Caller errors that must never be retried.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            CoordError::NotFound(_)
                | CoordError::UnexpectedState { .. }
                | CoordError::InvalidTransition { .. }
                | CoordError::MissingSubtrace { .. }
                | CoordError::InvalidSubtrace { .. }
                | CoordError::OddDeltaSubtraces(_)
                | CoordError::Misuse(_)
        )
    }

    /// Failures that end one stage run in the stage's error state.
    pub fn is_stage_failure(&self) -> bool {
        matches!(
            self,
            CoordError::Store(_) | CoordError::Collaborator(_) | CoordError::MissingData { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_transient_classification() {
        let err = StoreError::ConnectionFailed {
            backend: "sqlite".to_string(),
            source: Box::new(std::io::Error::other("locked")),
        };
        assert!(err.is_transient());
        assert!(StoreError::Timeout {
            operation: "scan".to_string(),
            target: "experiments".to_string(),
        }
        .is_transient());
        assert!(!StoreError::NotFound(3).is_transient());
        assert!(!StoreError::Serialization("bad json".to_string()).is_transient());
    }

    #[test]
    fn test_collaborator_transient_classification() {
        assert!(CollaboratorError::Timeout {
            operation: "simulate".to_string(),
            seconds: 60,
        }
        .is_transient());
        assert!(!CollaboratorError::Malformed("empty trace".to_string()).is_transient());
    }

    #[test]
    fn test_misuse_classification() {
        let err = CoordError::UnexpectedState {
            trace_id: 4,
            expected: vec![WorkState::Fresh],
            actual: WorkState::SimulationDone,
        };
        assert!(err.is_misuse());
        assert!(CoordError::OddDeltaSubtraces(3).is_misuse());
        assert!(!CoordError::LostClaim { trace_id: 4 }.is_misuse());
        assert!(!CoordError::from(StoreError::Other("x".to_string())).is_misuse());
        assert!(CoordError::MissingData {
            trace_id: 4,
            what: "trace".to_string(),
        }
        .is_stage_failure());
        assert!(!err.is_stage_failure());
    }
}
