use thiserror::Error;

use crate::model::{BatchId, BatchState};

/// Structural misuse of the builder, registry or trigger controller.
///
/// Job execution failures never surface here; they are recorded as
/// [`crate::JobOutcome::Failure`] inside a [`crate::BatchResult`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("invalid job unit: {0}")]
    InvalidJobUnit(String),

    #[error("builder already finalized")]
    BuilderClosed,

    #[error("construction callback rejected batch: {0}")]
    ConstructionRejected(String),

    #[error("batch {0} already registered")]
    DuplicateBatch(BatchId),

    #[error("key {key:?} already has pending batch {existing}")]
    KeyConflict { key: String, existing: BatchId },

    #[error("batch {0} not found")]
    NotFound(BatchId),

    #[error("batch {batch_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        batch_id: BatchId,
        from: BatchState,
        to: BatchState,
    },

    #[error("batch {0} already dispatching")]
    AlreadyDispatching(BatchId),

    #[error("manual trigger disabled for batch {0}")]
    ManualTriggerDisabled(BatchId),

    #[error("batch {0} was cancelled before dispatch")]
    Cancelled(BatchId),

    #[error("registry is shut down")]
    ShutDown,
}
