//! Everything one reconcile reads from the cluster

use super::params::Params;
use super::registry_switcher::RegistrySecretConfig;
use super::{bashible, incluster_proxy, pki, registry_switcher, users};
use crate::checker::CheckerStatus;
use rigger_core::error::RiggerResult;
use rigger_core::hashing::compute_hash;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inputs {
    pub params: Params,
    /// Current `deckhouse-registry` content
    pub registry_secret: RegistrySecretConfig,
    pub pki: pki::Inputs,
    pub users: users::Inputs,
    pub in_cluster_proxy: incluster_proxy::Inputs,
    pub bashible: bashible::Inputs,
    pub registry_switcher: registry_switcher::Inputs,
    pub checker_status: CheckerStatus,
}

impl Inputs {
    /// Fingerprint for logs; reconciles never gate on it
    pub fn hash(&self) -> RiggerResult<String> {
        compute_hash(self)
    }
}
