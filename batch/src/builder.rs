//! Accumulates job units and freezes them into a [`Batch`].

use std::collections::HashSet;
use std::fmt;

use tracing::debug;
use uuid::Uuid;

use crate::error::BatchError;
use crate::model::{Batch, BatchState, JobId, JobUnit, Payload};

/// Caller-supplied construction callback.
///
/// Runs exactly once, at finalize time, with the accumulated jobs in insertion
/// order. Returning an error rejects the batch.
pub type ConstructionFn = Box<dyn FnOnce(&[JobUnit]) -> anyhow::Result<()> + Send>;

pub struct BatchBuilder {
    key: Option<String>,
    jobs: Vec<JobUnit>,
    ids: HashSet<JobId>,
    construct: Option<ConstructionFn>,
    closed: bool,
}

impl BatchBuilder {
    /// Store `construct` without invoking it.
    pub fn new<F>(construct: F) -> Self
    where
        F: FnOnce(&[JobUnit]) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            key: None,
            jobs: Vec::new(),
            ids: HashSet::new(),
            construct: Some(Box::new(construct)),
            closed: false,
        }
    }

    /// Like [`BatchBuilder::new`], binding the batch to a logical key. The
    /// registry allows one pending batch per key.
    pub fn with_key<F>(key: impl Into<String>, construct: F) -> Self
    where
        F: FnOnce(&[JobUnit]) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            key: Some(key.into()),
            ..Self::new(construct)
        }
    }

    /// Append a job with a generated id.
    pub fn add(&mut self, payload: Payload) -> Result<JobUnit, BatchError> {
        self.add_with_id(Uuid::new_v4().to_string(), payload)
    }

    /// Append a job with a caller-chosen id, unique within this builder.
    pub fn add_with_id(
        &mut self,
        id: impl Into<JobId>,
        payload: Payload,
    ) -> Result<JobUnit, BatchError> {
        if self.closed {
            return Err(BatchError::BuilderClosed);
        }

        let job = JobUnit::new(id, payload, self.jobs.len())?;
        if !self.ids.insert(job.id().to_owned()) {
            return Err(BatchError::InvalidJobUnit(format!(
                "duplicate job id {}",
                job.id()
            )));
        }

        self.jobs.push(job.clone());
        Ok(job)
    }

    /// Run the construction callback and freeze the jobs into a Pending batch.
    ///
    /// The builder closes even if the callback rejects the batch; build a new
    /// builder to try again.
    pub fn finalize(&mut self) -> Result<Batch, BatchError> {
        if self.closed {
            return Err(BatchError::BuilderClosed);
        }
        self.closed = true;

        let construct = self.construct.take().ok_or(BatchError::BuilderClosed)?;
        construct(&self.jobs).map_err(|e| BatchError::ConstructionRejected(format!("{e:#}")))?;

        let jobs = std::mem::take(&mut self.jobs);
        self.ids.clear();

        let batch = Batch::pending(self.key.clone(), jobs);
        debug!(batch_id = %batch.id(), jobs = batch.len(), "batch finalized");
        Ok(batch)
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// `Building` until finalized. A finalized builder reports `Pending`:
    /// the batch it produced has left its hands.
    pub fn state(&self) -> BatchState {
        if self.closed {
            BatchState::Pending
        } else {
            BatchState::Building
        }
    }
}

impl fmt::Debug for BatchBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBuilder")
            .field("key", &self.key)
            .field("jobs", &self.jobs.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn construction_fn_is_deferred_until_finalize() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let mut b = BatchBuilder::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        b.add(json!("a")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        b.finalize().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn construction_fn_sees_jobs_in_order() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let s = seen.clone();

        let mut b = BatchBuilder::new(move |jobs| {
            *s.lock().unwrap() = jobs.iter().map(|j| j.id().to_string()).collect();
            Ok(())
        });
        b.add_with_id("A", json!(1)).unwrap();
        b.add_with_id("B", json!(2)).unwrap();
        b.add_with_id("C", json!(3)).unwrap();

        let batch = b.finalize().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(batch.state(), BatchState::Pending);
        let ordinals: Vec<_> = batch.jobs().iter().map(|j| j.ordinal()).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn add_after_finalize_is_rejected() {
        let mut b = BatchBuilder::new(|_| Ok(()));
        b.add(json!(1)).unwrap();
        b.finalize().unwrap();

        assert_eq!(b.add(json!(2)).unwrap_err(), BatchError::BuilderClosed);
        assert!(b.is_closed());
    }

    #[test]
    fn finalize_twice_is_rejected() {
        let mut b = BatchBuilder::new(|_| Ok(()));
        b.finalize().unwrap();

        assert_eq!(b.finalize().unwrap_err(), BatchError::BuilderClosed);
    }

    #[test]
    fn rejected_construction_closes_builder() {
        let mut b = BatchBuilder::new(|_| anyhow::bail!("quota exceeded"));
        b.add(json!(1)).unwrap();

        let err = b.finalize().unwrap_err();
        assert!(matches!(err, BatchError::ConstructionRejected(ref m) if m.contains("quota")));
        assert_eq!(b.finalize().unwrap_err(), BatchError::BuilderClosed);
    }

    #[test]
    fn duplicate_job_id_is_rejected() {
        let mut b = BatchBuilder::new(|_| Ok(()));
        b.add_with_id("x", json!(1)).unwrap();

        let err = b.add_with_id("x", json!(2)).unwrap_err();
        assert!(matches!(err, BatchError::InvalidJobUnit(_)));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn invalid_payload_does_not_consume_ordinal() {
        let mut b = BatchBuilder::new(|_| Ok(()));
        assert!(b.add(Payload::Null).is_err());

        let job = b.add(json!("ok")).unwrap();
        assert_eq!(job.ordinal(), 0);
    }

    #[test]
    fn key_and_state_are_reported() {
        let mut b = BatchBuilder::with_key("tenant-1", |_| Ok(()));
        assert_eq!(b.key(), Some("tenant-1"));
        assert_eq!(b.state(), BatchState::Building);

        let batch = b.finalize().unwrap();
        assert_eq!(batch.key(), Some("tenant-1"));
        assert_eq!(b.state(), BatchState::Pending);
    }
}
