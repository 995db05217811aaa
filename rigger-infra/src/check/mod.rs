//! Cluster drift detection
//!
//! [`engine::check_state`] plans every base and node state and collects the
//! verdicts into [`Statistics`]. [`config_check`] compares the local
//! configuration documents with the ones stored in the cluster.

pub mod config_check;
pub mod engine;
pub mod state;
pub mod statistics;

pub use config_check::{check_configuration, SyncStatus};
pub use engine::{check_state, CheckOptions, CheckStateResult};
pub use statistics::{CheckStatus, Statistics};
