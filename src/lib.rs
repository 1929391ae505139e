//! hyperclone library crate: a transactional VM clone/incremental-sync
//! orchestrator for hypervisor-managed VMs reachable over SSH.

/// Core library modules and APIs.
pub mod core;

/// CLI argument parsing and adapters (only when the `cli` feature is enabled).
#[cfg(feature = "cli")]
pub mod cli;

pub mod app;

mod config;
mod error;

pub use config::*;
pub use error::*;
