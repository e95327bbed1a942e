//! Dispatch engine: executes the jobs of one batch.
//!
//! Design principles:
//! - **Fail-open**: a failing, panicking or timed-out job is recorded and its
//!   siblings keep running.
//! - **Exactly-once attempt**: every job is handed to the handler once; there
//!   are no retries inside a batch.
//! - **Bounded concurrency**: at most `max_parallel` jobs of a batch run at a
//!   time; with `1` they run in `ordering` order.
//!
//! This module NEVER touches the registry. Winning the dispatch race is the
//! caller's job, recording completion is too.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{Instrument, info, instrument, warn};

use batch::{Batch, BatchResult, JobId, JobOutcome, JobUnit};
use common::logger::{child_span, warn_if_slow};

use crate::types::{DispatchConfig, JobHandler};

/// Longest failure reason kept in a result.
const MAX_REASON_LEN: usize = 512;

pub struct DispatchEngine {
    handler: Arc<dyn JobHandler>,
    cfg: DispatchConfig,
}

impl DispatchEngine {
    pub fn new(handler: Arc<dyn JobHandler>, mut cfg: DispatchConfig) -> Self {
        cfg.max_parallel = cfg.max_parallel.max(1);
        Self { handler, cfg }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.cfg
    }

    /// Run every job of `batch` and collect one outcome per job.
    ///
    /// Precondition: the caller won `BatchRegistry::mark_dispatching` for this
    /// batch. Never fails; job errors live inside the returned result.
    #[instrument(
        skip(self, batch),
        target = "executor",
        fields(batch_id = %batch.id(), jobs = batch.len(), max_parallel = self.cfg.max_parallel)
    )]
    pub async fn dispatch(&self, batch: Batch) -> BatchResult {
        let ordered = self.cfg.ordering.arrange(batch.jobs());

        let outcomes = if self.cfg.max_parallel == 1 {
            self.run_sequential(ordered).await
        } else {
            self.run_bounded(ordered).await
        };

        let result = BatchResult::assemble(batch, outcomes);

        info!(
            state = ?result.state(),
            succeeded = result.succeeded(),
            failed = result.failed(),
            "batch dispatched"
        );
        result
    }

    async fn run_sequential(&self, jobs: Vec<JobUnit>) -> HashMap<JobId, JobOutcome> {
        let mut outcomes = HashMap::with_capacity(jobs.len());

        for job in jobs {
            let id = job.id().to_owned();
            let outcome = run_job(self.handler.clone(), self.limits(), job).await;
            outcomes.insert(id, outcome);
        }

        outcomes
    }

    /// Jobs are started in order, each after acquiring a permit; completion
    /// order is whatever the handler makes it.
    async fn run_bounded(&self, jobs: Vec<JobUnit>) -> HashMap<JobId, JobOutcome> {
        let permits = Arc::new(Semaphore::new(self.cfg.max_parallel));
        let mut outcomes = HashMap::with_capacity(jobs.len());
        let mut running = Vec::with_capacity(jobs.len());

        for job in jobs {
            let id = job.id().to_owned();

            let permit = match permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    outcomes.insert(id, JobOutcome::Failure("worker pool closed".into()));
                    continue;
                }
            };

            let handler = self.handler.clone();
            let limits = self.limits();
            let task = tokio::spawn(
                async move {
                    let _permit = permit;
                    run_job(handler, limits, job).await
                }
                .in_current_span(),
            );
            running.push((id, task));
        }

        for (id, task) in running {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => JobOutcome::Failure(bounded(format!("job task aborted: {e}"))),
            };
            outcomes.insert(id, outcome);
        }

        outcomes
    }

    fn limits(&self) -> JobLimits {
        JobLimits {
            timeout: self.cfg.job_timeout,
            slow_after: self.cfg.slow_job_threshold,
        }
    }
}

#[derive(Clone, Copy)]
struct JobLimits {
    timeout: Option<Duration>,
    slow_after: Duration,
}

/// Execute one job, converting every way it can go wrong into a failure.
async fn run_job(handler: Arc<dyn JobHandler>, limits: JobLimits, job: JobUnit) -> JobOutcome {
    let span = child_span("job");
    span.record("job_id", job.id());

    let attempt = async {
        let call = AssertUnwindSafe(handler.handle(&job)).catch_unwind();
        match limits.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.ok(),
            None => Some(call.await),
        }
    };

    let outcome = match warn_if_slow("job_handler", limits.slow_after, attempt)
        .instrument(span.clone())
        .await
    {
        Some(Ok(Ok(value))) => JobOutcome::Success(value),
        Some(Ok(Err(e))) => JobOutcome::Failure(classify_error(&e)),
        Some(Err(panic)) => JobOutcome::Failure(bounded(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
        None => JobOutcome::Failure(format!(
            "timed out after {} ms",
            limits.timeout.unwrap_or_default().as_millis()
        )),
    };

    if let JobOutcome::Failure(reason) = &outcome {
        span.in_scope(|| warn!(job_id = %job.id(), %reason, "job failed"));
    }
    outcome
}

/// Normalizes handler errors (including their context chain) into bounded
/// strings.
fn classify_error(e: &anyhow::Error) -> String {
    bounded(format!("{e:#}"))
}

fn bounded(mut s: String) -> String {
    if s.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.insert_str(0, "ERR:");
    }
    s
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
