//! The trigger controller.
//!
//! For each armed batch it:
//!   1. Registers the batch with the `BatchRegistry`.
//!   2. Fires immediately if the item-count condition already holds,
//!      otherwise schedules the timeout timer (if any).
//!   3. On the first successful `mark_dispatching` (explicit, count or
//!      timeout), runs the batch through the `DispatchEngine` on its own task.
//!   4. Records completion in the registry and delivers the result to the
//!      batch's `BatchHandle`.
//!
//! Losing the dispatch race is not an error for automatic conditions: the
//! losing timer simply logs and exits.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, field, info, warn};

use batch::{Batch, BatchError, BatchId, BatchRegistry, BatchResult, RegistryView};
use common::logger::{TraceId, root_span};
use executor::DispatchEngine;

use super::conditions::{item_count_reached, timeout_remaining};
use super::counters::TriggerCounters;
use super::handle::BatchHandle;
use super::types::{TriggerConfig, TriggerSource};

pub struct TriggerController {
    cfg: TriggerConfig,

    /// Owned outright: every transition goes through the controller so
    /// waiters and timers always follow the batch state.
    registry: Arc<BatchRegistry>,
    engine: Arc<DispatchEngine>,

    /// Runtime that timers and dispatch tasks are spawned on, so triggers can
    /// come from any thread.
    runtime: Handle,

    /// Result senders of batches that have not delivered yet.
    waiters: Mutex<HashMap<BatchId, oneshot::Sender<BatchResult>>>,

    /// Pending timeout timers keyed by batch.
    timers: Mutex<HashMap<BatchId, JoinHandle<()>>>,

    counters: TriggerCounters,
}

impl TriggerController {
    pub fn new(cfg: TriggerConfig, engine: Arc<DispatchEngine>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            registry: Arc::new(BatchRegistry::new()),
            engine,
            runtime,
            waiters: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            counters: TriggerCounters::default(),
        })
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.cfg
    }

    /// Read-only view; transitions only happen through the controller.
    pub fn registry(&self) -> RegistryView {
        RegistryView::new(Arc::clone(&self.registry))
    }

    /// Check that a batch under `key` would be accepted, before the caller
    /// finalizes it.
    pub fn admit(&self, key: Option<&str>) -> Result<(), BatchError> {
        self.registry.admit(key)
    }

    pub fn counters(&self) -> &TriggerCounters {
        &self.counters
    }

    /// Register `batch` and start watching its trigger conditions.
    pub fn arm(self: &Arc<Self>, batch: Batch) -> Result<BatchHandle, BatchError> {
        let id = batch.id();
        let len = batch.len();
        let created_at = batch.created_at();

        // The waiter goes in first so a trigger racing this call always finds
        // it. An occupied slot means the id is already live.
        let (tx, rx) = oneshot::channel();
        match self.waiters.lock().entry(id) {
            Entry::Occupied(_) => return Err(BatchError::DuplicateBatch(id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        if let Err(e) = self.registry.register(batch) {
            self.waiters.lock().remove(&id);
            return Err(e);
        }

        let handle = BatchHandle {
            id,
            controller: Arc::clone(self),
            rx,
        };

        if item_count_reached(&self.cfg, len) {
            if let Err(e) = self.fire(id, TriggerSource::ItemCount) {
                debug!(batch_id = %id, error = %e, "item-count trigger did not fire");
            }
        } else if let Some(delay) = timeout_remaining(&self.cfg, created_at, Utc::now()) {
            self.schedule_timeout(id, created_at, delay);
        }

        Ok(handle)
    }

    /// Explicit trigger.
    ///
    /// Fails with `ManualTriggerDisabled` when the configuration relies on
    /// automatic conditions only, and with the registry's error when another
    /// trigger already won.
    pub fn trigger(self: &Arc<Self>, batch_id: BatchId) -> Result<(), BatchError> {
        if !self.cfg.accepts_manual() {
            return Err(BatchError::ManualTriggerDisabled(batch_id));
        }
        self.fire(batch_id, TriggerSource::Explicit)
    }

    /// Cancel a pending batch. Its handle resolves with `Cancelled`.
    pub fn cancel(&self, batch_id: BatchId) -> Result<(), BatchError> {
        self.registry.cancel(batch_id)?;
        self.forget(batch_id);
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Cancel everything still pending and refuse new batches. Batches that are
    /// already dispatching run to completion and still deliver.
    pub fn shutdown(&self) -> Vec<BatchId> {
        let cancelled = self.registry.drain();
        for id in &cancelled {
            self.forget(*id);
        }
        self.counters
            .cancelled
            .fetch_add(cancelled.len() as u64, Ordering::Relaxed);

        info!(cancelled = cancelled.len(), "trigger controller shut down");
        cancelled
    }

    /// Try to win the dispatch race for `batch_id` and, on success, start the
    /// dispatch task.
    fn fire(self: &Arc<Self>, batch_id: BatchId, source: TriggerSource) -> Result<(), BatchError> {
        let batch = match self.registry.mark_dispatching(batch_id) {
            Ok(b) => b,
            Err(e) => {
                if matches!(
                    e,
                    BatchError::AlreadyDispatching(_) | BatchError::InvalidTransition { .. }
                ) {
                    self.counters.lost_races.fetch_add(1, Ordering::Relaxed);
                    debug!(batch_id = %batch_id, %source, error = %e, "trigger lost race");
                }
                return Err(e);
            }
        };

        // A timer firing is already on its way out; everything else stops it.
        let timer = self.timers.lock().remove(&batch_id);
        if source != TriggerSource::Timeout {
            if let Some(timer) = timer {
                timer.abort();
            }
        }

        self.counters.record_fire(source);
        info!(batch_id = %batch_id, %source, jobs = batch.len(), "trigger fired");

        let this = Arc::clone(self);
        self.runtime.spawn(async move { this.run_dispatch(batch).await });
        Ok(())
    }

    async fn run_dispatch(self: Arc<Self>, batch: Batch) {
        let id = batch.id();
        let span = root_span("batch_dispatch", &TraceId::from_uuid(id));
        span.record("batch_id", field::display(id));

        async {
            let result = self.engine.dispatch(batch).await;

            if let Err(e) = self.registry.complete(id, &result) {
                error!(batch_id = %id, error = %e, "failed to retire dispatched batch");
            }
            self.counters.record_result(&result);

            let waiter = self.waiters.lock().remove(&id);
            match waiter {
                Some(tx) => {
                    if tx.send(result).is_err() {
                        debug!(batch_id = %id, "handle dropped before result arrived");
                    }
                }
                None => warn!(batch_id = %id, "no waiter registered for dispatched batch"),
            }
        }
        .instrument(span)
        .await
    }

    fn schedule_timeout(
        self: &Arc<Self>,
        batch_id: BatchId,
        created_at: DateTime<Utc>,
        delay: std::time::Duration,
    ) {
        let this: Weak<Self> = Arc::downgrade(self);

        // Held across the spawn so a zero-delay timer cannot look up its own
        // entry before it exists.
        let mut timers = self.timers.lock();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(controller) = this.upgrade() else {
                return;
            };
            if let Err(e) = controller.fire(batch_id, TriggerSource::Timeout) {
                debug!(batch_id = %batch_id, error = %e, "timeout found batch already settled");
                controller.timers.lock().remove(&batch_id);
            }
        });
        timers.insert(batch_id, timer);
        drop(timers);

        debug!(
            batch_id = %batch_id,
            %created_at,
            delay_ms = delay.as_millis() as u64,
            "timeout scheduled"
        );
    }

    /// Drop the timer and waiter of a batch that will never dispatch.
    fn forget(&self, batch_id: BatchId) {
        if let Some(timer) = self.timers.lock().remove(&batch_id) {
            timer.abort();
        }
        // Dropping the sender resolves the handle with `Cancelled`.
        self.waiters.lock().remove(&batch_id);
    }
}
