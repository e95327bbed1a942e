use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use batch::{BatchError, BatchId, BatchResult, BatchState};

use crate::controller::TriggerController;

/// Caller's view of an armed batch: fire it, cancel it, or await its result.
pub struct BatchHandle {
    pub(crate) id: BatchId,
    pub(crate) controller: Arc<TriggerController>,
    pub(crate) rx: oneshot::Receiver<BatchResult>,
}

impl BatchHandle {
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Explicit trigger. See [`TriggerController::trigger`].
    pub fn trigger(&self) -> Result<(), BatchError> {
        self.controller.trigger(self.id)
    }

    pub fn cancel(&self) -> Result<(), BatchError> {
        self.controller.cancel(self.id)
    }

    pub fn state(&self) -> Result<BatchState, BatchError> {
        self.controller.registry().state(self.id)
    }

    /// Resolve once the batch has been dispatched and retired.
    ///
    /// Fails with `Cancelled` if the batch is cancelled (or drained at
    /// shutdown) before any trigger fired.
    pub async fn wait(self) -> Result<BatchResult, BatchError> {
        let id = self.id;
        self.rx.await.map_err(|_| BatchError::Cancelled(id))
    }
}

impl fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchHandle").field("id", &self.id).finish()
    }
}
