//! The `deckhouse-registry` secret downstream controllers read, and the wait
//! for the deckhouse leader to pick it up

use super::mode::{trim_with_ellipsis, REGISTRY_HOST, REGISTRY_PATH, REGISTRY_SCHEME};
use super::params::UpstreamParams;
use k8s_openapi::api::core::v1::Secret;
use rigger_core::dockercfg;
use rigger_core::error::RiggerResult;
use rigger_core::hashing::compute_hash;
use rigger_core::k8s::{make_secret, secret_data, secret_string};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SECRET_NAME: &str = "deckhouse-registry";
pub const SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
/// Leader pod annotation carrying the hash of the installed registry secret
pub const REGISTRY_VERSION_ANNOTATION: &str = "checksum/registry-version";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySecretConfig {
    pub address: String,
    pub path: String,
    pub scheme: String,
    #[serde(default)]
    pub ca: String,
    #[serde(default)]
    pub docker_config: Vec<u8>,
}

impl RegistrySecretConfig {
    pub fn from_secret(secret: &Secret) -> Self {
        Self {
            address: secret_string(secret, "address"),
            path: secret_string(secret, "path"),
            scheme: secret_string(secret, "scheme"),
            ca: secret_string(secret, "ca"),
            docker_config: secret_data(secret, DOCKER_CONFIG_KEY)
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
        }
    }

    pub fn to_secret(&self, namespace: &str) -> Secret {
        let mut data = BTreeMap::from([
            ("address".to_string(), self.address.clone().into_bytes()),
            ("path".to_string(), self.path.clone().into_bytes()),
            ("scheme".to_string(), self.scheme.clone().into_bytes()),
            (DOCKER_CONFIG_KEY.to_string(), self.docker_config.clone()),
        ]);
        if !self.ca.is_empty() {
            data.insert("ca".to_string(), self.ca.clone().into_bytes());
        }
        make_secret(namespace, SECRET_NAME, SECRET_TYPE, BTreeMap::new(), data)
    }

    /// Credentials stored for `address`
    pub fn credentials(&self) -> RiggerResult<(String, String)> {
        dockercfg::decode(&self.docker_config, &self.address)
    }

    /// Content hash the leader pod reports once it runs with this config
    pub fn version(&self) -> RiggerResult<String> {
        compute_hash(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Params {
    /// Deckhouse pulls through the in-cluster registry service
    Managed {
        ca: String,
        username: String,
        password: String,
    },
    /// Deckhouse pulls straight from the user's registry
    Unmanaged(UpstreamParams),
}

impl Params {
    pub fn expected_config(&self) -> RiggerResult<RegistrySecretConfig> {
        match self {
            Params::Managed {
                ca,
                username,
                password,
            } => Ok(RegistrySecretConfig {
                address: REGISTRY_HOST.to_string(),
                path: REGISTRY_PATH.to_string(),
                scheme: REGISTRY_SCHEME.to_string(),
                ca: ca.clone(),
                docker_config: dockercfg::encode(username, password, REGISTRY_HOST)?,
            }),
            Params::Unmanaged(upstream) => {
                let (host, path) = upstream.host_and_path();
                Ok(RegistrySecretConfig {
                    docker_config: dockercfg::encode(&upstream.username, &upstream.password, &host)?,
                    address: host,
                    path,
                    scheme: upstream.lower_scheme(),
                    ca: upstream.ca.clone(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeaderPod {
    pub name: String,
    pub ready: bool,
    /// Value of the registry version annotation, empty when unset
    pub registry_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inputs {
    pub secret: Option<RegistrySecretConfig>,
    pub leader_pod: Option<LeaderPod>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub ready: bool,
    pub message: String,
}

/// Secret the controller should publish. Not persisted; rebuilt every
/// reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    pub config: Option<RegistrySecretConfig>,
}

impl State {
    pub fn process(&mut self, params: &Params, inputs: &Inputs) -> RiggerResult<ProcessResult> {
        let expected = params.expected_config()?;
        let version = expected.version()?;
        self.config = Some(expected.clone());

        if inputs.secret.as_ref() != Some(&expected) {
            return Ok(ProcessResult {
                ready: false,
                message: format!("Updating {} secret...", SECRET_NAME),
            });
        }

        let Some(pod) = &inputs.leader_pod else {
            return Ok(ProcessResult {
                ready: false,
                message: "Waiting for the deckhouse leader pod...".to_string(),
            });
        };

        if pod.registry_version != version {
            return Ok(ProcessResult {
                ready: false,
                message: format!(
                    "Waiting for deckhouse pod {:?} to switch: {:?} → {:?}",
                    pod.name,
                    trim_with_ellipsis(&pod.registry_version),
                    trim_with_ellipsis(&version)
                ),
            });
        }

        if !pod.ready {
            return Ok(ProcessResult {
                ready: false,
                message: format!("Waiting for deckhouse pod {:?} to become ready", pod.name),
            });
        }

        Ok(ProcessResult {
            ready: true,
            message: format!("Deckhouse uses registry version {}", trim_with_ellipsis(&version)),
        })
    }
}
