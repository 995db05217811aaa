//! Registry mode orchestrator
//!
//! Drives the cluster between the Unmanaged, Direct and Proxy registry
//! modes. [`State`] holds the pure transition logic, [`RegistryController`]
//! feeds it from the cluster and writes its outputs back.

pub mod bashible;
pub mod controller;
pub mod incluster_proxy;
pub mod inputs;
pub mod mode;
pub mod params;
pub mod pki;
pub mod registry_switcher;
pub mod secrets;
pub mod state;
pub mod users;

pub use controller::RegistryController;
pub use inputs::Inputs;
pub use mode::Mode;
pub use params::Params;
pub use state::State;
