use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::info;

use batch::{BatchBuilder, BatchError, BatchId, JobUnit, RegistryView};
use executor::{DispatchEngine, JobHandler};
use scheduler::{BatchHandle, TriggerConfig, TriggerController, TriggerCounters};

use crate::config::DeferredConfig;
use crate::deferred::DeferredBatch;

/// Owns the registry, engine and trigger controller for one handler.
///
/// Cheap to clone; clones share the same batches.
#[derive(Clone)]
pub struct BatchDispatcher {
    controller: Arc<TriggerController>,
}

impl BatchDispatcher {
    /// Wire everything up on the current Tokio runtime.
    pub fn start(config: DeferredConfig, handler: Arc<dyn JobHandler>) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("BatchDispatcher needs a Tokio runtime")?;

        info!(
            max_items = ?config.trigger.max_items,
            max_wait_ms = ?config.trigger.max_wait.map(|d| d.as_millis() as u64),
            manual = config.trigger.manual,
            max_parallel = config.dispatch.max_parallel,
            ordering = %config.dispatch.ordering,
            "starting batch dispatcher"
        );

        let engine = Arc::new(DispatchEngine::new(handler, config.dispatch));
        let controller = TriggerController::new(config.trigger, engine, runtime);

        Ok(Self { controller })
    }

    /// Open a new deferred batch. `construct` runs once, at submit time.
    pub fn deferred_batch<F>(&self, construct: F) -> DeferredBatch
    where
        F: FnOnce(&[JobUnit]) -> anyhow::Result<()> + Send + 'static,
    {
        DeferredBatch::new(BatchBuilder::new(construct), Arc::clone(&self.controller))
    }

    /// Like [`BatchDispatcher::deferred_batch`], bound to a logical key. Only
    /// one batch per key may be pending at a time.
    pub fn deferred_batch_keyed<F>(&self, key: impl Into<String>, construct: F) -> DeferredBatch
    where
        F: FnOnce(&[JobUnit]) -> anyhow::Result<()> + Send + 'static,
    {
        DeferredBatch::new(
            BatchBuilder::with_key(key, construct),
            Arc::clone(&self.controller),
        )
    }

    /// Finalize and arm a builder obtained elsewhere, e.g. from
    /// `BatchResult::retry_builder`.
    ///
    /// Admission is checked first: on `KeyConflict` or `ShutDown` the builder
    /// is left open with its jobs and its construction callback unused.
    pub fn submit(&self, builder: &mut BatchBuilder) -> Result<BatchHandle, BatchError> {
        self.controller.admit(builder.key())?;
        let batch = builder.finalize()?;
        self.controller.arm(batch)
    }

    pub fn trigger(&self, batch_id: BatchId) -> Result<(), BatchError> {
        self.controller.trigger(batch_id)
    }

    pub fn cancel(&self, batch_id: BatchId) -> Result<(), BatchError> {
        self.controller.cancel(batch_id)
    }

    /// Read-only view of the batches; use `trigger`/`cancel` to move them.
    pub fn registry(&self) -> RegistryView {
        self.controller.registry()
    }

    pub fn counters(&self) -> &TriggerCounters {
        self.controller.counters()
    }

    pub fn trigger_config(&self) -> &TriggerConfig {
        self.controller.config()
    }

    /// Cancel every pending batch and refuse new ones. Returns the cancelled
    /// ids; batches already dispatching still deliver their results.
    pub fn shutdown(&self) -> Vec<BatchId> {
        self.controller.shutdown()
    }
}
