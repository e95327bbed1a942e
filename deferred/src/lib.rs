//! Application-facing entry point for deferred batches.
//!
//! ```ignore
//! let dispatcher = BatchDispatcher::start(DeferredConfig::from_env(), handler)?;
//! let mut batch = dispatcher.deferred_batch(|jobs| {
//!     anyhow::ensure!(!jobs.is_empty(), "nothing to do");
//!     Ok(())
//! });
//! batch.add(json!({ "email": "a@example.com" }))?;
//! let handle = batch.submit()?;
//! handle.trigger()?;
//! let result = handle.wait().await?;
//! ```

pub mod config;
pub mod deferred;
pub mod dispatcher;

pub use config::DeferredConfig;
pub use deferred::DeferredBatch;
pub use dispatcher::BatchDispatcher;
