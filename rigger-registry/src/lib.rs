//! Registry side of Rigger
//!
//! The [`checker`] verifies that a registry holds every image the running
//! release needs. The [`orchestrator`] moves the cluster between registry
//! modes and gates each step on the checker. [`store`] keeps both restorable
//! across restarts.

pub mod checker;
pub mod orchestrator;
pub mod store;

pub use checker::{Checker, CheckerLoop};
pub use orchestrator::{RegistryController, State};
pub use store::StateStore;
