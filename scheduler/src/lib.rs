//! Trigger side of the deferred batch pipeline: decides when a pending batch
//! dispatches, runs it through the engine and hands the result back.

pub mod conditions;
pub mod controller;
pub mod counters;
pub mod handle;
pub mod types;

pub use controller::TriggerController;
pub use counters::{CounterSnapshot, TriggerCounters};
pub use handle::BatchHandle;
pub use types::{TriggerConfig, TriggerSource};
