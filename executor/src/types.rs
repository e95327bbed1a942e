//! Common types and small abstraction traits used by the executor.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use batch::{JobUnit, Payload};

/// Abstraction over whatever actually performs a job.
///
/// Errors are captured by the engine and recorded as the job's failure; they
/// never abort sibling jobs. Implementations should normalize error messages
/// into something stable enough to log and show to callers.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &JobUnit) -> anyhow::Result<Payload>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler. The closure receives its own copy of the job.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobUnit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobUnit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    async fn handle(&self, job: &JobUnit) -> anyhow::Result<Payload> {
        (self.0)(job.clone()).await
    }
}

/// Order in which jobs are started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderingPolicy {
    /// Ascending ordinal.
    #[default]
    InsertionOrder,
    /// Descending ordinal (last added runs first).
    ReverseInsertion,
}

impl OrderingPolicy {
    pub fn arrange(self, jobs: &[JobUnit]) -> Vec<JobUnit> {
        let mut ordered = jobs.to_vec();
        ordered.sort_by_key(|j| j.ordinal());
        if self == OrderingPolicy::ReverseInsertion {
            ordered.reverse();
        }
        ordered
    }
}

impl fmt::Display for OrderingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderingPolicy::InsertionOrder => f.write_str("insertion"),
            OrderingPolicy::ReverseInsertion => f.write_str("reverse"),
        }
    }
}

impl FromStr for OrderingPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insertion" => Ok(OrderingPolicy::InsertionOrder),
            "reverse" => Ok(OrderingPolicy::ReverseInsertion),
            other => Err(anyhow::anyhow!("Invalid OrderingPolicy value: {}", other)),
        }
    }
}

/// Configuration knobs for the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub ordering: OrderingPolicy,

    /// Maximum jobs of one batch running at the same time.
    /// `1` runs strictly sequentially in `ordering` order.
    pub max_parallel: usize,

    /// Per-job deadline. A job that exceeds it is recorded as failed.
    pub job_timeout: Option<Duration>,

    /// Jobs slower than this are reported on the `performance` log target.
    pub slow_job_threshold: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ordering: OrderingPolicy::InsertionOrder,
            max_parallel: 1,
            job_timeout: None,
            slow_job_threshold: Duration::from_millis(500),
        }
    }
}
