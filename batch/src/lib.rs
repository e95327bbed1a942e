pub mod builder;
pub mod error;
pub mod model;
pub mod registry;
pub mod result;

pub use builder::{BatchBuilder, ConstructionFn};
pub use error::BatchError;
pub use model::{Batch, BatchId, BatchState, JobId, JobUnit, Payload};
pub use registry::{BatchRegistry, DEFAULT_TOMBSTONE_CAPACITY, RegistryView};
pub use result::{BatchResult, JobOutcome, ResultState};
