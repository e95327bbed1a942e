use std::fmt;
use std::sync::Arc;

use tracing::debug;

use batch::{Batch, BatchBuilder, BatchError, BatchId, JobId, JobUnit, Payload};
use scheduler::conditions::item_count_reached;
use scheduler::{BatchHandle, TriggerController};

/// A batch under construction, tied to the dispatcher that will run it.
///
/// Reaching the configured item count submits the batch on the spot; it then
/// fires immediately and further adds fail with `BuilderClosed`.
///
/// Admission (key conflicts, shutdown) is checked before the construction
/// callback runs, so a refused submit leaves the jobs in place and the
/// callback unused. If the registry refuses the batch after the callback ran,
/// the finalized batch is kept and the next `submit` retries it as is.
pub struct DeferredBatch {
    builder: BatchBuilder,
    controller: Arc<TriggerController>,
    frozen: Option<Batch>,
    handle: Option<BatchHandle>,
}

impl DeferredBatch {
    pub(crate) fn new(builder: BatchBuilder, controller: Arc<TriggerController>) -> Self {
        Self {
            builder,
            controller,
            frozen: None,
            handle: None,
        }
    }

    /// Append a job with a generated id.
    ///
    /// When this job would reach the item count and the batch cannot be
    /// admitted, the job is not added.
    pub fn add(&mut self, payload: Payload) -> Result<JobUnit, BatchError> {
        self.admit_if_filling()?;
        let job = self.builder.add(payload)?;
        self.submit_if_full()?;
        Ok(job)
    }

    /// Append a job with a caller-chosen id.
    pub fn add_with_id(
        &mut self,
        id: impl Into<JobId>,
        payload: Payload,
    ) -> Result<JobUnit, BatchError> {
        self.admit_if_filling()?;
        let job = self.builder.add_with_id(id, payload)?;
        self.submit_if_full()?;
        Ok(job)
    }

    /// Finalize, register and arm the batch.
    ///
    /// If the item count already submitted it, returns that handle instead.
    pub fn submit(&mut self) -> Result<BatchHandle, BatchError> {
        if let Some(handle) = self.handle.take() {
            return Ok(handle);
        }
        self.arm()?;
        self.handle.take().ok_or(BatchError::BuilderClosed)
    }

    /// Id of the batch once it has been submitted.
    pub fn batch_id(&self) -> Option<BatchId> {
        self.handle.as_ref().map(BatchHandle::id)
    }

    pub fn is_submitted(&self) -> bool {
        self.handle.is_some()
    }

    /// Jobs held and not yet handed to the registry.
    pub fn len(&self) -> usize {
        self.frozen.as_ref().map_or(self.builder.len(), Batch::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key(&self) -> Option<&str> {
        self.builder.key()
    }

    fn admit_if_filling(&self) -> Result<(), BatchError> {
        if self.builder.is_closed() {
            return Err(BatchError::BuilderClosed);
        }
        if item_count_reached(self.controller.config(), self.builder.len() + 1) {
            self.controller.admit(self.builder.key())?;
        }
        Ok(())
    }

    fn submit_if_full(&mut self) -> Result<(), BatchError> {
        if item_count_reached(self.controller.config(), self.builder.len()) {
            debug!(jobs = self.builder.len(), "item count reached, submitting");
            self.arm()?;
        }
        Ok(())
    }

    fn arm(&mut self) -> Result<(), BatchError> {
        let batch = match self.frozen.take() {
            Some(batch) => batch,
            None => {
                if self.builder.is_closed() {
                    return Err(BatchError::BuilderClosed);
                }
                self.controller.admit(self.builder.key())?;
                self.builder.finalize()?
            }
        };

        match self.controller.arm(batch.clone()) {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.frozen = Some(batch);
                Err(e)
            }
        }
    }
}

impl fmt::Debug for DeferredBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredBatch")
            .field("key", &self.builder.key())
            .field("jobs", &self.len())
            .field("batch_id", &self.batch_id())
            .finish()
    }
}
