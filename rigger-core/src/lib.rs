//! Shared building blocks for Rigger
//!
//! Error types, configuration, tracing setup, the condition ledger,
//! certificate and docker-auth helpers, and the Kubernetes seam used by the
//! infrastructure and registry subsystems.

pub mod conditions;
pub mod config;
pub mod dockercfg;
pub mod error;
pub mod hashing;
pub mod k8s;
pub mod lease;
pub mod memlog;
pub mod observability;
pub mod pki;
pub mod shutdown;

pub use error::{RiggerError, RiggerResult};
