//! Infrastructure side of Rigger
//!
//! Drives terraform or opentofu through [`runner::Runner`], groups runner
//! calls into [`pipeline`]s, hands out runners from the keyed
//! [`context::InfrastructureContext`] and checks a live cluster for drift in
//! [`check`].

pub mod backend;
pub mod check;
pub mod context;
pub mod executor;
pub mod lock;
pub mod meta;
pub mod pipeline;
pub mod plan;
pub mod runner;
pub mod state_saver;
pub mod types;

pub use context::{BackendFactory, CliBackendFactory, InfrastructureContext};
pub use meta::MetaConfig;
pub use runner::Runner;
pub use types::Step;
