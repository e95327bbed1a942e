//! Structured logging for the deferred batch workspace.
//!
//! Every crate logs through `tracing`; binaries call [`init_logger`] once.

mod init;
mod span;
mod trace_id;

pub use init::init_logger;
pub use span::{child_span, root_span, warn_if_slow};
pub use trace_id::TraceId;
