use ipflow_storage::StorageError;
use ipflow_types::{RecordId, Stage, StageInstanceId};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("record {0} not found")]
    RecordNotFound(RecordId),

    #[error("stage instance {0} not found")]
    InstanceNotFound(StageInstanceId),

    #[error("stage instance {id} is in stage {found}, expected {expected}")]
    StageMismatch {
        id: StageInstanceId,
        expected: Stage,
        found: Stage,
    },

    #[error("extension not allowed: {0}")]
    ExtensionNotAllowed(String),

    #[error("stage instance {0} is already resolved")]
    AlreadyResolved(StageInstanceId),

    #[error("a sweep is already in progress")]
    SweepInProgress,
}
