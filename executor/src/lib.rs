//! Batch execution: runs the jobs of a batch that already won dispatch.

pub mod engine;
pub mod types;

pub use engine::DispatchEngine;
pub use types::{DispatchConfig, FnHandler, JobHandler, OrderingPolicy, handler_fn};
