use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BatchError;

pub type BatchId = uuid::Uuid;
pub type JobId = String;

/// Opaque job payload. `Null` is treated as "no payload".
pub type Payload = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BatchState {
    Building = 0,
    Pending = 1,
    Dispatching = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Failed | BatchState::Cancelled
        )
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BatchState::Building,
            1 => BatchState::Pending,
            2 => BatchState::Dispatching,
            3 => BatchState::Completed,
            4 => BatchState::Failed,
            _ => BatchState::Cancelled,
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Building => "Building",
            BatchState::Pending => "Pending",
            BatchState::Dispatching => "Dispatching",
            BatchState::Completed => "Completed",
            BatchState::Failed => "Failed",
            BatchState::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for BatchState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Building" => Ok(BatchState::Building),
            "Pending" => Ok(BatchState::Pending),
            "Dispatching" => Ok(BatchState::Dispatching),
            "Completed" => Ok(BatchState::Completed),
            "Failed" => Ok(BatchState::Failed),
            "Cancelled" => Ok(BatchState::Cancelled),
            other => Err(anyhow::anyhow!("Invalid BatchState value: {}", other)),
        }
    }
}

/// One unit of deferred work. Immutable once created.
///
/// Two units are equal when their ids are equal; payload and ordinal are not
/// compared. Deserialization runs the same checks as [`JobUnit::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawJobUnit")]
pub struct JobUnit {
    id: JobId,
    payload: Payload,
    ordinal: usize,
}

impl JobUnit {
    pub fn new(id: impl Into<JobId>, payload: Payload, ordinal: usize) -> Result<Self, BatchError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(BatchError::InvalidJobUnit("empty job id".into()));
        }
        if payload.is_null() {
            return Err(BatchError::InvalidJobUnit(format!(
                "job {id} has no payload"
            )));
        }

        Ok(Self {
            id,
            payload,
            ordinal,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

#[derive(Deserialize)]
struct RawJobUnit {
    id: JobId,
    #[serde(default)]
    payload: Payload,
    ordinal: usize,
}

impl TryFrom<RawJobUnit> for JobUnit {
    type Error = BatchError;

    fn try_from(raw: RawJobUnit) -> Result<Self, Self::Error> {
        JobUnit::new(raw.id, raw.payload, raw.ordinal)
    }
}

impl PartialEq for JobUnit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for JobUnit {}

impl Hash for JobUnit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A frozen, ordered set of job units dispatched together.
///
/// The job sequence is shared (`Arc`) so snapshots handed out by the registry
/// never copy the payloads. Job ids are unique within a batch, including
/// batches that arrive through deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawBatch")]
pub struct Batch {
    id: BatchId,
    key: Option<String>,
    jobs: Arc<[JobUnit]>,
    state: BatchState,
    created_at: DateTime<Utc>,
}

impl Batch {
    /// Freeze `jobs` into a fresh Pending batch with a new id.
    pub(crate) fn pending(key: Option<String>, jobs: Vec<JobUnit>) -> Self {
        Self {
            id: BatchId::new_v4(),
            key,
            jobs: jobs.into(),
            state: BatchState::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn jobs(&self) -> &[JobUnit] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn job(&self, id: &str) -> Option<&JobUnit> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub(crate) fn with_state(&self, state: BatchState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

#[derive(Deserialize)]
struct RawBatch {
    id: BatchId,
    key: Option<String>,
    jobs: Vec<JobUnit>,
    state: BatchState,
    created_at: DateTime<Utc>,
}

impl TryFrom<RawBatch> for Batch {
    type Error = BatchError;

    fn try_from(raw: RawBatch) -> Result<Self, Self::Error> {
        let mut seen = HashSet::with_capacity(raw.jobs.len());
        for job in &raw.jobs {
            if !seen.insert(job.id()) {
                return Err(BatchError::InvalidJobUnit(format!(
                    "duplicate job id {} in batch {}",
                    job.id(),
                    raw.id
                )));
            }
        }

        Ok(Self {
            id: raw.id,
            key: raw.key,
            jobs: raw.jobs.into(),
            state: raw.state,
            created_at: raw.created_at,
        })
    }
}

impl PartialEq for Batch {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Batch {}
