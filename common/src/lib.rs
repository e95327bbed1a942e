//! Ambient plumbing shared by every crate in the workspace.

pub mod logger;
