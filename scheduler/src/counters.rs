use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use batch::{BatchResult, ResultState};

use crate::types::TriggerSource;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct TriggerCounters {
    pub fired_explicit: Arc<AtomicU64>,
    pub fired_item_count: Arc<AtomicU64>,
    pub fired_timeout: Arc<AtomicU64>,

    /// Trigger attempts that found the batch already dispatching or cancelled.
    pub lost_races: Arc<AtomicU64>,
    pub cancelled: Arc<AtomicU64>,

    // outcomes
    pub batches_completed: Arc<AtomicU64>,
    pub batches_failed: Arc<AtomicU64>,
    pub jobs_failed: Arc<AtomicU64>,
}

/// Point-in-time copy of [`TriggerCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub fired_explicit: u64,
    pub fired_item_count: u64,
    pub fired_timeout: u64,
    pub lost_races: u64,
    pub cancelled: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub jobs_failed: u64,
}

impl TriggerCounters {
    pub(crate) fn record_fire(&self, source: TriggerSource) {
        let counter = match source {
            TriggerSource::Explicit => &self.fired_explicit,
            TriggerSource::ItemCount => &self.fired_item_count,
            TriggerSource::Timeout => &self.fired_timeout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_result(&self, result: &BatchResult) {
        let counter = match result.state() {
            ResultState::AllFailed => &self.batches_failed,
            _ => &self.batches_completed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.jobs_failed
            .fetch_add(result.failed() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            fired_explicit: self.fired_explicit.load(Ordering::Relaxed),
            fired_item_count: self.fired_item_count.load(Ordering::Relaxed),
            fired_timeout: self.fired_timeout.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }
}
