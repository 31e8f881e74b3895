//! Runtime core of a job launcher plugin.
//!
//! Tracks the status of jobs running in an external job scheduling system and
//! fans that status, plus per-job resource utilization and output streams, out
//! to any number of concurrent watchers.

pub mod config;
pub mod error;
pub mod jobs;
pub mod stream;

pub use config::LauncherConfig;
pub use error::{LauncherError, Result};
