//! Reconcile loop around [`State`]
//!
//! Every reconcile reads the cluster into [`Inputs`], restores the last
//! persisted [`State`], runs one [`State::process`] and writes back the
//! snapshot together with the secrets the state now describes. The checker
//! params it produces are handed to the checker loop over a watch channel
//! and its status comes back the same way.

use super::bashible::{self, NodeStatus, CONTAINERD_CFG_MODE_DEFAULT};
use super::incluster_proxy;
use super::inputs::Inputs;
use super::mode::UNKNOWN_VERSION;
use super::params::Params;
use super::pki;
use super::registry_switcher::{self, LeaderPod, RegistrySecretConfig};
use super::state::State;
use super::users::{User, USER_MIRROR_PULLER, USER_MIRROR_PUSHER, USER_RO, USER_RW};
use crate::checker::{self, CheckerStatus};
use crate::store::StateStore;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use rigger_core::error::{RiggerError, RiggerResult};
use rigger_core::k8s::{make_secret, secret_string, KubeClient};
use rigger_core::observability::reconcile_span;
use rigger_core::pki::CertModel;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const REGISTRY_CONFIG_SECRET: &str = "registry-config";
pub const PKI_SECRET: &str = "registry-pki";
pub const USER_SECRET_PREFIX: &str = "registry-user-";

pub const NODE_VERSION_ANNOTATION: &str = "registry.deckhouse.io/version";
pub const CONTAINERD_CONFIG_LABEL: &str = "node.deckhouse.io/containerd-config-registry";
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";
pub const LEADER_POD_SELECTOR: &str = "app=deckhouse,leader=true";

/// Key holding the YAML body of the bashible and proxy config secrets
pub const CONFIG_KEY: &str = "config.yaml";

const CA_CERT_KEY: &str = "ca.crt";
const CA_KEY_KEY: &str = "ca.key";
const TOKEN_CERT_KEY: &str = "token.crt";
const TOKEN_KEY_KEY: &str = "token.key";

const MANAGED_USERS: [&str; 4] = [USER_RO, USER_RW, USER_MIRROR_PULLER, USER_MIRROR_PUSHER];

pub fn user_secret_name(name: &str) -> String {
    format!("{}{}", USER_SECRET_PREFIX, name)
}

pub struct RegistryController {
    kube: Arc<dyn KubeClient>,
    store: StateStore,
    namespace: String,
    interval: Duration,
    checker_params: watch::Sender<checker::Params>,
    checker_status: watch::Receiver<CheckerStatus>,
}

impl RegistryController {
    pub fn new(
        kube: Arc<dyn KubeClient>,
        namespace: impl Into<String>,
        interval: Duration,
        checker_params: watch::Sender<checker::Params>,
        checker_status: watch::Receiver<CheckerStatus>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            store: StateStore::new(kube.clone(), namespace.clone()),
            kube,
            namespace,
            interval,
            checker_params,
            checker_status,
        }
    }

    /// Reconcile on every interval until `cancel` fires. A failed reconcile
    /// is logged and retried on the next tick.
    pub async fn run(&self, cancel: CancellationToken) -> RiggerResult<()> {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Registry controller stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "Registry reconcile failed");
                    }
                }
            }
        }
    }

    /// Run a single reconcile. Returns the resulting state, or `None` when
    /// the cluster carries no registry configuration yet.
    pub async fn reconcile_once(&self) -> RiggerResult<Option<State>> {
        let Some(inputs) = self.load_inputs().await? else {
            debug!(secret = REGISTRY_CONFIG_SECRET, "No registry configuration, nothing to do");
            return Ok(None);
        };

        let mut state = match self.store.load_state().await? {
            Some(state) => state,
            None => {
                info!("No persisted registry state, initializing from the cluster");
                let mut state = State::default();
                state.initialize(&inputs);
                state
            }
        };

        let span = reconcile_span(&inputs.params.mode.to_string(), inputs.params.generation);
        let result = span.in_scope(|| {
            if let Ok(hash) = inputs.hash() {
                debug!(inputs = %hash, "Processing registry inputs");
            }
            state.process(&inputs)
        });
        span.record("ready", state.is_ready());

        self.store.save_state(&state).await?;
        self.write_outputs(&state, &inputs).await?;
        self.checker_params.send_replace(state.checker_params.clone());

        result?;
        Ok(Some(state))
    }

    /// Read everything one reconcile needs. `None` without `registry-config`.
    pub async fn load_inputs(&self) -> RiggerResult<Option<Inputs>> {
        let ns = self.namespace.as_str();
        let Some(config) = self.kube.get_secret(ns, REGISTRY_CONFIG_SECRET).await? else {
            return Ok(None);
        };
        let params = Params::from_secret(&config)?;

        let registry_secret = self
            .kube
            .get_secret(ns, registry_switcher::SECRET_NAME)
            .await?
            .map(|s| RegistrySecretConfig::from_secret(&s));

        let pki = match self.kube.get_secret(ns, PKI_SECRET).await? {
            Some(secret) => pki_inputs(&secret),
            None => pki::Inputs::default(),
        };

        let mut users = BTreeMap::new();
        for name in MANAGED_USERS {
            if let Some(secret) = self.kube.get_secret(ns, &user_secret_name(name)).await? {
                users.insert(name.to_string(), user_from_secret(&secret));
            }
        }

        let mut in_cluster_proxy = self
            .kube
            .get_deployment(ns, incluster_proxy::DEPLOYMENT_NAME)
            .await?
            .map(|d| proxy_inputs(&d))
            .unwrap_or_default();
        in_cluster_proxy.is_secret_exist = self
            .kube
            .get_secret(ns, incluster_proxy::CONFIG_SECRET_NAME)
            .await?
            .is_some();

        let bashible = bashible::Inputs {
            is_secret_exist: self.kube.get_secret(ns, bashible::SECRET_NAME).await?.is_some(),
            master_nodes_ips: self
                .kube
                .list_nodes(CONTROL_PLANE_LABEL)
                .await?
                .iter()
                .filter_map(internal_ip)
                .collect(),
            node_status: self
                .kube
                .list_nodes("")
                .await?
                .iter()
                .filter_map(|n| Some((n.metadata.name.clone()?, node_status(n))))
                .collect(),
        };

        let leader_pod = self
            .kube
            .list_pods(ns, LEADER_POD_SELECTOR)
            .await?
            .first()
            .map(leader_pod_status);

        Ok(Some(Inputs {
            params,
            registry_secret: registry_secret.clone().unwrap_or_default(),
            pki,
            users,
            in_cluster_proxy,
            bashible,
            registry_switcher: registry_switcher::Inputs {
                secret: registry_secret,
                leader_pod,
            },
            checker_status: self.checker_status.borrow().clone(),
        }))
    }

    /// Bring the emitted secrets in line with `state`, skipping unchanged ones.
    async fn write_outputs(&self, state: &State, inputs: &Inputs) -> RiggerResult<()> {
        let ns = self.namespace.as_str();
        let mut errors = Vec::new();

        if let Some(config) = &state.registry_secret.config {
            if inputs.registry_switcher.secret.as_ref() != Some(config) {
                info!(secret = registry_switcher::SECRET_NAME, "Updating registry secret");
                errors.extend(self.kube.apply_secret(config.to_secret(ns)).await.err());
            }
        }

        match &state.bashible.config {
            Some(config) => match yaml_secret(ns, bashible::SECRET_NAME, config, BTreeMap::new()) {
                Ok(secret) => errors.extend(self.apply_if_changed(secret).await.err()),
                Err(e) => errors.push(e),
            },
            None if inputs.bashible.is_secret_exist => {
                info!(secret = bashible::SECRET_NAME, "Removing bashible config");
                errors.extend(self.kube.delete_secret(ns, bashible::SECRET_NAME).await.err());
            }
            None => {}
        }

        match (&state.pki.ca, &state.pki.token) {
            (Some(ca), Some(token)) => {
                if inputs.pki.ca.as_ref() != Some(ca) || inputs.pki.token.as_ref() != Some(token) {
                    errors.extend(self.kube.apply_secret(pki_secret(ns, ca, token)).await.err());
                }
            }
            _ if state.pki.is_empty() && inputs.pki.ca.is_some() => {
                errors.extend(self.kube.delete_secret(ns, PKI_SECRET).await.err());
            }
            _ => {}
        }

        let named = state.users.named();
        for (name, user) in &named {
            if inputs.users.get(*name) != Some(*user) {
                errors.extend(self.kube.apply_secret(user_secret(ns, name, user)).await.err());
            }
        }
        for name in inputs.users.keys() {
            if !named.iter().any(|(n, _)| *n == name.as_str()) {
                errors.extend(self.kube.delete_secret(ns, &user_secret_name(name)).await.err());
            }
        }

        match &state.in_cluster_proxy.config {
            Some(config) => {
                let annotations = BTreeMap::from([(
                    incluster_proxy::VERSION_ANNOTATION.to_string(),
                    config.version()?,
                )]);
                match yaml_secret(ns, incluster_proxy::CONFIG_SECRET_NAME, config, annotations) {
                    Ok(secret) => errors.extend(self.apply_if_changed(secret).await.err()),
                    Err(e) => errors.push(e),
                }
            }
            None if inputs.in_cluster_proxy.is_secret_exist => {
                info!(secret = incluster_proxy::CONFIG_SECRET_NAME, "Removing in-cluster proxy config");
                errors.extend(
                    self.kube
                        .delete_secret(ns, incluster_proxy::CONFIG_SECRET_NAME)
                        .await
                        .err(),
                );
            }
            None => {}
        }

        RiggerError::collect("cannot write registry secrets", errors)
    }

    async fn apply_if_changed(&self, secret: Secret) -> RiggerResult<()> {
        let ns = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        if let Some(current) = self.kube.get_secret(&ns, &name).await? {
            if current.data == secret.data && current.metadata.annotations == secret.metadata.annotations {
                return Ok(());
            }
        }
        debug!(secret = %name, "Writing secret");
        self.kube.apply_secret(secret).await
    }
}

fn yaml_secret<T: serde::Serialize>(
    namespace: &str,
    name: &str,
    value: &T,
    annotations: BTreeMap<String, String>,
) -> RiggerResult<Secret> {
    let body = serde_yaml::to_string(value).map_err(|e| RiggerError::parse(name, e))?;
    let mut secret = make_secret(
        namespace,
        name,
        "Opaque",
        BTreeMap::new(),
        BTreeMap::from([(CONFIG_KEY.to_string(), body.into_bytes())]),
    );
    if !annotations.is_empty() {
        secret.metadata.annotations = Some(annotations);
    }
    Ok(secret)
}

fn cert_model(secret: &Secret, cert_key: &str, key_key: &str) -> Option<CertModel> {
    let model = CertModel {
        cert: secret_string(secret, cert_key),
        key: secret_string(secret, key_key),
    };
    (!model.cert.is_empty() && !model.key.is_empty()).then_some(model)
}

fn pki_inputs(secret: &Secret) -> pki::Inputs {
    pki::Inputs {
        ca: cert_model(secret, CA_CERT_KEY, CA_KEY_KEY),
        token: cert_model(secret, TOKEN_CERT_KEY, TOKEN_KEY_KEY),
    }
}

fn pki_secret(namespace: &str, ca: &CertModel, token: &CertModel) -> Secret {
    let data = BTreeMap::from([
        (CA_CERT_KEY.to_string(), ca.cert.clone().into_bytes()),
        (CA_KEY_KEY.to_string(), ca.key.clone().into_bytes()),
        (TOKEN_CERT_KEY.to_string(), token.cert.clone().into_bytes()),
        (TOKEN_KEY_KEY.to_string(), token.key.clone().into_bytes()),
    ]);
    make_secret(namespace, PKI_SECRET, "Opaque", BTreeMap::new(), data)
}

fn user_from_secret(secret: &Secret) -> User {
    User {
        user_name: secret_string(secret, "name"),
        password: secret_string(secret, "password"),
        hashed_password: secret_string(secret, "passwordHash"),
    }
}

fn user_secret(namespace: &str, name: &str, user: &User) -> Secret {
    let data = BTreeMap::from([
        ("name".to_string(), user.user_name.clone().into_bytes()),
        ("password".to_string(), user.password.clone().into_bytes()),
        ("passwordHash".to_string(), user.hashed_password.clone().into_bytes()),
    ]);
    make_secret(namespace, &user_secret_name(name), "Opaque", BTreeMap::new(), data)
}

fn proxy_inputs(deployment: &Deployment) -> incluster_proxy::Inputs {
    let version = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(incluster_proxy::VERSION_ANNOTATION))
        .cloned()
        .unwrap_or_default();

    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = deployment.status.as_ref().is_some_and(|s| {
        s.ready_replicas.unwrap_or(0) >= desired && s.updated_replicas.unwrap_or(0) >= desired
    });

    incluster_proxy::Inputs {
        exists: true,
        ready,
        version,
        ..Default::default()
    }
}

fn internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

fn node_status(node: &Node) -> NodeStatus {
    let version = node
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(NODE_VERSION_ANNOTATION))
        .cloned()
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
    let containerd_cfg_mode = node
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(CONTAINERD_CONFIG_LABEL))
        .cloned()
        .unwrap_or_else(|| CONTAINERD_CFG_MODE_DEFAULT.to_string());
    NodeStatus {
        version,
        containerd_cfg_mode,
    }
}

fn leader_pod_status(pod: &Pod) -> LeaderPod {
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
    LeaderPod {
        name: pod.metadata.name.clone().unwrap_or_default(),
        ready,
        registry_version: pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(registry_switcher::REGISTRY_VERSION_ANNOTATION))
            .cloned()
            .unwrap_or_default(),
    }
}
