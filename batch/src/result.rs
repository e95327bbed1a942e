//! Outcome of dispatching one batch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::builder::BatchBuilder;
use crate::error::BatchError;
use crate::model::{Batch, BatchId, BatchState, JobId, JobUnit, Payload};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success(Payload),
    Failure(String),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultState {
    AllSucceeded,
    PartialFailure,
    AllFailed,
}

impl ResultState {
    /// Zero failures wins over zero successes, so an empty batch counts as
    /// `AllSucceeded`.
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        if failed == 0 {
            ResultState::AllSucceeded
        } else if succeeded == 0 {
            ResultState::AllFailed
        } else {
            ResultState::PartialFailure
        }
    }

    /// Registry state a dispatching batch moves to once this result is known.
    pub fn terminal_state(self) -> BatchState {
        match self {
            ResultState::AllFailed => BatchState::Failed,
            ResultState::AllSucceeded | ResultState::PartialFailure => BatchState::Completed,
        }
    }
}

/// Per-job outcomes plus the dispatched batch itself. Ownership of the batch
/// passes to whoever holds the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    batch: Batch,
    outcomes: HashMap<JobId, JobOutcome>,
    state: ResultState,
}

impl BatchResult {
    /// Build a result from outcomes keyed by job id.
    ///
    /// Every job of `batch` must have exactly one outcome and no outcome may
    /// name a job outside the batch.
    pub fn new(batch: Batch, outcomes: HashMap<JobId, JobOutcome>) -> Result<Self, BatchError> {
        if let Some(missing) = batch.jobs().iter().find(|j| !outcomes.contains_key(j.id())) {
            return Err(BatchError::InvalidJobUnit(format!(
                "no outcome recorded for job {}",
                missing.id()
            )));
        }
        if let Some(stray) = outcomes.keys().find(|id| batch.job(id).is_none()) {
            return Err(BatchError::InvalidJobUnit(format!(
                "outcome for job {stray} outside batch {}",
                batch.id()
            )));
        }

        Ok(Self::assemble(batch, outcomes))
    }

    /// Infallible variant used by the dispatch engine: outcomes for unknown
    /// ids are dropped and any job left without an outcome is recorded as a
    /// failure, so every job id appears exactly once.
    pub fn assemble(batch: Batch, mut outcomes: HashMap<JobId, JobOutcome>) -> Self {
        outcomes.retain(|id, _| batch.job(id).is_some());
        for job in batch.jobs() {
            outcomes
                .entry(job.id().to_owned())
                .or_insert_with(|| JobOutcome::Failure("no outcome recorded".into()));
        }

        let succeeded = outcomes.values().filter(|o| o.is_success()).count();
        let state = ResultState::from_counts(succeeded, outcomes.len() - succeeded);

        Self {
            batch,
            outcomes,
            state,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch.id()
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn into_batch(self) -> Batch {
        self.batch
    }

    pub fn state(&self) -> ResultState {
        self.state
    }

    pub fn outcome(&self, job_id: &str) -> Option<&JobOutcome> {
        self.outcomes.get(job_id)
    }

    pub fn outcomes(&self) -> &HashMap<JobId, JobOutcome> {
        &self.outcomes
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Failed jobs in their original insertion order.
    pub fn failed_jobs(&self) -> Vec<&JobUnit> {
        self.batch
            .jobs()
            .iter()
            .filter(|j| matches!(self.outcomes.get(j.id()), Some(JobOutcome::Failure(_))))
            .collect()
    }

    /// Start a new builder preloaded with the failed jobs' ids and payloads,
    /// under the same key. Retrying is always an explicit caller decision.
    pub fn retry_builder<F>(&self, construct: F) -> Result<BatchBuilder, BatchError>
    where
        F: FnOnce(&[JobUnit]) -> anyhow::Result<()> + Send + 'static,
    {
        let mut builder = match self.batch.key() {
            Some(key) => BatchBuilder::with_key(key, construct),
            None => BatchBuilder::new(construct),
        };
        for job in self.failed_jobs() {
            builder.add_with_id(job.id(), job.payload().clone())?;
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn abc_batch() -> Batch {
        let mut b = BatchBuilder::with_key("orders", |_| Ok(()));
        b.add_with_id("A", json!({"n": 1})).unwrap();
        b.add_with_id("B", json!({"n": 2})).unwrap();
        b.add_with_id("C", json!({"n": 3})).unwrap();
        b.finalize().unwrap()
    }

    fn outcomes(pairs: &[(&str, bool)]) -> HashMap<JobId, JobOutcome> {
        pairs
            .iter()
            .map(|(id, ok)| {
                let o = if *ok {
                    JobOutcome::Success(json!("done"))
                } else {
                    JobOutcome::Failure("boom".into())
                };
                (id.to_string(), o)
            })
            .collect()
    }

    #[test]
    fn aggregate_state_from_counts() {
        assert_eq!(ResultState::from_counts(3, 0), ResultState::AllSucceeded);
        assert_eq!(ResultState::from_counts(0, 3), ResultState::AllFailed);
        assert_eq!(ResultState::from_counts(2, 1), ResultState::PartialFailure);
        assert_eq!(ResultState::from_counts(0, 0), ResultState::AllSucceeded);
    }

    #[test]
    fn only_all_failed_maps_to_failed() {
        assert_eq!(ResultState::AllFailed.terminal_state(), BatchState::Failed);
        assert_eq!(ResultState::PartialFailure.terminal_state(), BatchState::Completed);
        assert_eq!(ResultState::AllSucceeded.terminal_state(), BatchState::Completed);
    }

    #[test]
    fn missing_outcome_is_rejected() {
        let err = BatchResult::new(abc_batch(), outcomes(&[("A", true), ("B", true)])).unwrap_err();
        assert!(matches!(err, BatchError::InvalidJobUnit(_)));

        let err = BatchResult::new(
            abc_batch(),
            outcomes(&[("A", true), ("B", true), ("Z", true)]),
        )
        .unwrap_err();
        assert!(matches!(err, BatchError::InvalidJobUnit(_)));
    }

    #[test]
    fn assemble_fills_gaps_with_failures() {
        let mut partial = outcomes(&[("A", true), ("C", true)]);
        partial.insert("Z".into(), JobOutcome::Success(json!(0)));

        let result = BatchResult::assemble(abc_batch(), partial);

        assert_eq!(result.outcomes().len(), 3);
        assert!(result.outcome("Z").is_none());
        assert!(matches!(result.outcome("B"), Some(JobOutcome::Failure(_))));
        assert_eq!(result.state(), ResultState::PartialFailure);
    }

    #[test]
    fn partial_failure_rebuilds_failed_payloads() {
        let result = BatchResult::new(
            abc_batch(),
            outcomes(&[("A", false), ("B", true), ("C", false)]),
        )
        .unwrap();

        assert_eq!(result.state(), ResultState::PartialFailure);
        assert_eq!(result.succeeded(), 1);
        assert_eq!(result.failed(), 2);

        let mut retry = result.retry_builder(|_| Ok(())).unwrap();
        let batch = retry.finalize().unwrap();

        assert_ne!(batch.id(), result.batch_id());
        assert_eq!(batch.key(), Some("orders"));
        let payloads: Vec<_> = batch.jobs().iter().map(|j| j.payload().clone()).collect();
        assert_eq!(payloads, vec![json!({"n": 1}), json!({"n": 3})]);
        let ordinals: Vec<_> = batch.jobs().iter().map(|j| j.ordinal()).collect();
        assert_eq!(ordinals, vec![0, 1]);
    }

    #[test]
    fn result_serializes_with_batch() {
        let result = BatchResult::new(abc_batch(), outcomes(&[("A", true), ("B", true), ("C", true)]))
            .unwrap();

        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded["state"], json!("AllSucceeded"));
        assert_eq!(encoded["batch"]["jobs"].as_array().map(|a| a.len()), Some(3));
    }
}
