use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::BatchError;
use crate::model::{Batch, BatchId, BatchState};
use crate::result::BatchResult;

/// A registered batch plus its lifecycle state.
///
/// State changes are single compare-and-swap operations on `state`; nothing
/// else in the registry needs to be locked to move a batch forward.
struct BatchSlot {
    batch: Batch,
    state: AtomicU8,
}

impl BatchSlot {
    fn new(batch: Batch) -> Self {
        let state = AtomicU8::new(batch.state().as_u8());
        Self { batch, state }
    }

    fn load(&self) -> BatchState {
        BatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn snapshot(&self) -> Batch {
        self.batch.with_state(self.load())
    }
}

/// How many retired batches keep a tombstone by default.
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 10_000;

/// Table of batches between registration and their terminal state.
///
/// One registry is created per dispatcher and injected where needed, so tests
/// can run with isolated registries. A batch leaves the table as soon as it is
/// cancelled or its dispatch completes; its id and final state are kept as a
/// tombstone for the most recent `tombstone_capacity` retirements. While the
/// tombstone lives, `state` still answers, a second `cancel` is an
/// `InvalidTransition` and the id cannot be registered again. Older ids are
/// forgotten (`NotFound`); batch ids are random v4 UUIDs, so they are never
/// minted twice in practice.
pub struct BatchRegistry {
    batches: DashMap<BatchId, Arc<BatchSlot>>,
    pending_keys: DashMap<String, BatchId>,
    tombstones: DashMap<BatchId, BatchState>,
    retired: Mutex<VecDeque<BatchId>>,
    tombstone_capacity: usize,
    closed: AtomicBool,

    /// Registrations hold it shared across their `closed` check and insert;
    /// `drain` takes it exclusively to close, so no registration straddles it.
    admission: RwLock<()>,
}

impl Default for BatchRegistry {
    fn default() -> Self {
        Self::with_tombstone_capacity(DEFAULT_TOMBSTONE_CAPACITY)
    }
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tombstone_capacity(tombstone_capacity: usize) -> Self {
        Self {
            batches: DashMap::new(),
            pending_keys: DashMap::new(),
            tombstones: DashMap::new(),
            retired: Mutex::new(VecDeque::new()),
            tombstone_capacity: tombstone_capacity.max(1),
            closed: AtomicBool::new(false),
            admission: RwLock::new(()),
        }
    }

    /// Would a batch under `key` be accepted right now?
    ///
    /// Lets callers find out before doing work they would otherwise throw
    /// away. `register` still has the final word.
    pub fn admit(&self, key: Option<&str>) -> Result<(), BatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BatchError::ShutDown);
        }
        if let Some(key) = key {
            if let Some(held) = self.pending_keys.get(key) {
                return Err(BatchError::KeyConflict {
                    key: key.to_owned(),
                    existing: *held.value(),
                });
            }
        }
        Ok(())
    }

    /// Register a Pending batch.
    pub fn register(&self, batch: Batch) -> Result<(), BatchError> {
        let _admission = self.admission.read();
        if self.closed.load(Ordering::Acquire) {
            return Err(BatchError::ShutDown);
        }

        let id = batch.id();
        if batch.state() != BatchState::Pending {
            return Err(BatchError::InvalidTransition {
                batch_id: id,
                from: batch.state(),
                to: BatchState::Pending,
            });
        }

        match self.batches.entry(id) {
            Entry::Occupied(_) => Err(BatchError::DuplicateBatch(id)),
            Entry::Vacant(vacant) => {
                // Retirement writes the tombstone before removing the slot, so
                // holding the vacant entry means any retired id is visible here.
                if self.tombstones.contains_key(&id) {
                    return Err(BatchError::DuplicateBatch(id));
                }

                if let Some(key) = batch.key() {
                    match self.pending_keys.entry(key.to_owned()) {
                        Entry::Occupied(held) => {
                            return Err(BatchError::KeyConflict {
                                key: key.to_owned(),
                                existing: *held.get(),
                            });
                        }
                        Entry::Vacant(free) => {
                            free.insert(id);
                        }
                    }
                }

                info!(
                    component = "registry",
                    batch_id = %id,
                    key = batch.key().unwrap_or(""),
                    jobs = batch.len(),
                    "batch registered"
                );
                vacant.insert(Arc::new(BatchSlot::new(batch)));
                Ok(())
            }
        }
    }

    /// Snapshot of a live batch. Retired batches are not found.
    pub fn get(&self, batch_id: BatchId) -> Result<Batch, BatchError> {
        self.batches
            .get(&batch_id)
            .map(|slot| slot.snapshot())
            .ok_or(BatchError::NotFound(batch_id))
    }

    /// Current state, including the final state of retired batches.
    pub fn state(&self, batch_id: BatchId) -> Result<BatchState, BatchError> {
        if let Some(slot) = self.batches.get(&batch_id) {
            return Ok(slot.load());
        }
        self.tombstones
            .get(&batch_id)
            .map(|t| *t.value())
            .ok_or(BatchError::NotFound(batch_id))
    }

    /// Pending → Cancelled. The batch is retired and will never dispatch.
    pub fn cancel(&self, batch_id: BatchId) -> Result<(), BatchError> {
        let to = BatchState::Cancelled;
        match self.compare_and_swap(batch_id, BatchState::Pending, to) {
            Ok(slot) => {
                self.retire(&slot, to);
                info!(component = "registry", batch_id = %batch_id, "batch cancelled");
                Ok(())
            }
            Err(Some(from)) => Err(BatchError::InvalidTransition { batch_id, from, to }),
            Err(None) => Err(BatchError::NotFound(batch_id)),
        }
    }

    /// Pending → Dispatching.
    ///
    /// Exactly one caller can win this for a given batch; everyone else gets
    /// `AlreadyDispatching` (or `InvalidTransition` if the batch was
    /// cancelled first). The winner receives the frozen batch to dispatch.
    pub fn mark_dispatching(&self, batch_id: BatchId) -> Result<Batch, BatchError> {
        let to = BatchState::Dispatching;
        match self.compare_and_swap(batch_id, BatchState::Pending, to) {
            Ok(slot) => {
                self.release_key(&slot);
                info!(component = "registry", batch_id = %batch_id, "batch dispatching");
                Ok(slot.batch.with_state(to))
            }
            Err(Some(from @ (BatchState::Cancelled | BatchState::Building))) => {
                Err(BatchError::InvalidTransition { batch_id, from, to })
            }
            Err(Some(_)) => {
                debug!(component = "registry", batch_id = %batch_id, "lost dispatch race");
                Err(BatchError::AlreadyDispatching(batch_id))
            }
            Err(None) => Err(BatchError::NotFound(batch_id)),
        }
    }

    /// Dispatching → Completed or Failed (per `result.state()`), then retire.
    pub fn complete(&self, batch_id: BatchId, result: &BatchResult) -> Result<(), BatchError> {
        debug_assert_eq!(batch_id, result.batch_id(), "result belongs to another batch");

        let to = result.state().terminal_state();
        match self.compare_and_swap(batch_id, BatchState::Dispatching, to) {
            Ok(slot) => {
                self.retire(&slot, to);
                info!(
                    component = "registry",
                    batch_id = %batch_id,
                    state = %to,
                    succeeded = result.succeeded(),
                    failed = result.failed(),
                    "batch retired"
                );
                Ok(())
            }
            Err(Some(from)) => Err(BatchError::InvalidTransition { batch_id, from, to }),
            Err(None) => Err(BatchError::NotFound(batch_id)),
        }
    }

    pub fn pending_ids(&self) -> Vec<BatchId> {
        self.batches
            .iter()
            .filter(|slot| slot.load() == BatchState::Pending)
            .map(|slot| *slot.key())
            .collect()
    }

    /// Number of live (not yet retired) batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting registrations and cancel every pending batch.
    ///
    /// Batches already dispatching are left to finish. Returns the ids that
    /// were cancelled here.
    pub fn drain(&self) -> Vec<BatchId> {
        {
            let _admission = self.admission.write();
            self.closed.store(true, Ordering::Release);
        }

        let mut cancelled = Vec::new();
        for id in self.pending_ids() {
            match self.cancel(id) {
                Ok(()) => cancelled.push(id),
                // A trigger won the race; the batch finishes normally.
                Err(e) => debug!(component = "registry", batch_id = %id, error = %e, "skip drain"),
            }
        }

        if !self.batches.is_empty() {
            warn!(
                component = "registry",
                in_flight = self.batches.len(),
                "registry drained with batches still dispatching"
            );
        }
        cancelled
    }

    /// Swap the state of a live batch. On failure returns the state actually
    /// observed, or `None` if the id is unknown.
    fn compare_and_swap(
        &self,
        batch_id: BatchId,
        from: BatchState,
        to: BatchState,
    ) -> Result<Arc<BatchSlot>, Option<BatchState>> {
        let slot = self.batches.get(&batch_id).map(|s| Arc::clone(s.value()));

        match slot {
            Some(slot) => slot
                .state
                .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
                .map(|_| slot)
                .map_err(|actual| Some(BatchState::from_u8(actual))),
            None => Err(self.tombstones.get(&batch_id).map(|t| *t.value())),
        }
    }

    fn release_key(&self, slot: &BatchSlot) {
        if let Some(key) = slot.batch.key() {
            let id = slot.batch.id();
            self.pending_keys.remove_if(key, |_, holder| *holder == id);
        }
    }

    fn retire(&self, slot: &BatchSlot, state: BatchState) {
        let id = slot.batch.id();
        self.release_key(slot);
        self.tombstones.insert(id, state);
        self.batches.remove(&id);

        let mut retired = self.retired.lock();
        retired.push_back(id);
        while retired.len() > self.tombstone_capacity {
            if let Some(oldest) = retired.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
    }
}

/// Read-only window onto a registry whose transitions are driven elsewhere.
///
/// Handed out by owners (the trigger controller) that must see every state
/// change they did not make themselves.
#[derive(Clone)]
pub struct RegistryView(Arc<BatchRegistry>);

impl RegistryView {
    pub fn new(registry: Arc<BatchRegistry>) -> Self {
        Self(registry)
    }

    pub fn get(&self, batch_id: BatchId) -> Result<Batch, BatchError> {
        self.0.get(batch_id)
    }

    pub fn state(&self, batch_id: BatchId) -> Result<BatchState, BatchError> {
        self.0.state(batch_id)
    }

    pub fn pending_ids(&self) -> Vec<BatchId> {
        self.0.pending_ids()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}
