//! Whole-transition runs of the orchestrator against a simulated cluster
//! that applies whatever the state emits before the next reconcile.

use pretty_assertions::assert_eq;
use rigger_core::dockercfg;
use rigger_core::error::RiggerError;
use rigger_registry::checker::CheckerStatus;
use rigger_registry::orchestrator::bashible::{NodeStatus, CONTAINERD_CFG_MODE_DEFAULT};
use rigger_registry::orchestrator::mode::{RegistryService, REGISTRY_HOST, UNKNOWN_VERSION};
use rigger_registry::orchestrator::params::UpstreamParams;
use rigger_registry::orchestrator::registry_switcher::{LeaderPod, RegistrySecretConfig};
use rigger_registry::orchestrator::state::CONDITION_IN_CLUSTER_PROXY_CLEANUP;
use rigger_registry::orchestrator::{Inputs, Mode, Params, State};
use std::collections::BTreeMap;

const MAX_ROUNDS: usize = 20;

struct World {
    state: State,
    inputs: Inputs,
}

impl World {
    /// An Unmanaged cluster pulling from `r.ex.com/deckhouse/ee`
    fn unmanaged() -> Self {
        let registry_secret = RegistrySecretConfig {
            address: "r.ex.com".to_string(),
            path: "/deckhouse/ee".to_string(),
            scheme: "https".to_string(),
            ca: String::new(),
            docker_config: dockercfg::encode("u", "p", "r.ex.com").unwrap(),
        };

        let mut inputs = Inputs {
            registry_secret: registry_secret.clone(),
            ..Default::default()
        };
        inputs.registry_switcher.secret = Some(registry_secret.clone());
        inputs.registry_switcher.leader_pod = Some(LeaderPod {
            name: "deckhouse-0".to_string(),
            ready: true,
            registry_version: registry_secret.version().unwrap(),
        });
        inputs.bashible.master_nodes_ips = vec!["10.0.0.1".to_string()];
        inputs.bashible.node_status = BTreeMap::from([
            ("master-0".to_string(), node(UNKNOWN_VERSION)),
            ("worker-0".to_string(), node(UNKNOWN_VERSION)),
        ]);

        Self {
            state: State::default(),
            inputs,
        }
    }

    fn set_params(&mut self, mode: Mode, images_repo: &str) {
        self.inputs.params = Params {
            generation: self.inputs.params.generation + 1,
            mode,
            images_repo: images_repo.to_string(),
            scheme: "HTTPS".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            ..Default::default()
        };
    }

    /// One reconcile followed by the cluster catching up with its outputs.
    /// The state goes through its persisted form in between, the way the
    /// controller restores it.
    fn step(&mut self) -> Result<(), RiggerError> {
        self.state.process(&self.inputs)?;
        self.apply();
        let saved = serde_yaml::to_string(&self.state).unwrap();
        self.state = serde_yaml::from_str(&saved).unwrap();
        Ok(())
    }

    fn converge(&mut self) -> usize {
        for round in 1..=MAX_ROUNDS {
            self.step().unwrap();
            if self.state.is_ready() {
                return round;
            }
        }
        panic!("no convergence: {:#?}", self.state.conditions);
    }

    fn apply(&mut self) {
        let state = &self.state;
        let inputs = &mut self.inputs;

        inputs.checker_status = CheckerStatus {
            version: state.checker_params.version.clone(),
            ready: true,
            message: "all items checked".to_string(),
        };

        inputs.pki.ca = state.pki.ca.clone();
        inputs.pki.token = state.pki.token.clone();
        inputs.users = state
            .users
            .named()
            .into_iter()
            .map(|(name, user)| (name.to_string(), user.clone()))
            .collect();

        match &state.in_cluster_proxy.config {
            Some(config) => {
                inputs.in_cluster_proxy.exists = true;
                inputs.in_cluster_proxy.ready = true;
                inputs.in_cluster_proxy.version = config.version().unwrap();
            }
            None => inputs.in_cluster_proxy = Default::default(),
        }

        inputs.bashible.is_secret_exist = state.bashible.config.is_some();
        let node_version = state
            .bashible
            .config
            .as_ref()
            .map(|c| c.version.clone())
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
        for status in inputs.bashible.node_status.values_mut() {
            status.version = node_version.clone();
        }

        if let Some(config) = &state.registry_secret.config {
            inputs.registry_secret = config.clone();
            inputs.registry_switcher.secret = Some(config.clone());
            if let Some(pod) = inputs.registry_switcher.leader_pod.as_mut() {
                pod.registry_version = config.version().unwrap();
            }
        }
    }
}

fn node(version: &str) -> NodeStatus {
    NodeStatus {
        version: version.to_string(),
        containerd_cfg_mode: CONTAINERD_CFG_MODE_DEFAULT.to_string(),
    }
}

fn direct_world() -> World {
    let mut world = World::unmanaged();
    world.set_params(Mode::Direct, "r.ex.com/deckhouse/ee");
    world.converge();
    world
}

#[test]
fn test_unmanaged_to_direct() {
    let mut world = World::unmanaged();
    world.set_params(Mode::Direct, "r.ex.com/deckhouse/ee");
    let rounds = world.converge();
    assert!(rounds > 1);

    let state = &world.state;
    assert_eq!(state.mode, Mode::Direct);
    assert_eq!(state.registry_service, RegistryService::InClusterProxy);
    assert!(state.in_cluster_proxy.config.is_some());
    assert!(state.pki.ca.is_some());
    assert!(state.users.named().is_empty());
    assert_eq!(
        state.bashible.unmanaged_params.as_ref().map(|p| p.images_repo.as_str()),
        Some("r.ex.com/deckhouse/ee")
    );

    let bashible = state.bashible.config.as_ref().unwrap();
    assert_eq!(bashible.mode, Mode::Direct);
    assert_eq!(bashible.hosts.len(), 1);
    assert!(bashible.hosts.contains_key(REGISTRY_HOST));

    assert_eq!(world.inputs.registry_secret.address, REGISTRY_HOST);
    assert_eq!(
        world.inputs.registry_secret.credentials().unwrap(),
        ("u".to_string(), "p".to_string())
    );

    let ready = state.conditions.get("Ready").unwrap();
    assert_eq!(ready.observed_generation, world.inputs.params.generation);
}

#[test]
fn test_direct_to_unmanaged_restores_stored_upstream() {
    let mut world = direct_world();
    world.state.bashible.unmanaged_params = Some(UpstreamParams {
        images_repo: "mirror.ex.com/app".to_string(),
        scheme: "HTTPS".to_string(),
        username: "mu".to_string(),
        password: "mp".to_string(),
        ..Default::default()
    });

    world.set_params(Mode::Unmanaged, "");
    world.converge();

    let secret = &world.inputs.registry_secret;
    assert_eq!(secret.address, "mirror.ex.com");
    assert_eq!(secret.path, "/app");
    assert_eq!(secret.scheme, "https");
    assert_eq!(
        secret.credentials().unwrap(),
        ("mu".to_string(), "mp".to_string())
    );

    let state = &world.state;
    assert_eq!(state.mode, Mode::Unmanaged);
    assert_eq!(state.registry_service, RegistryService::Disabled);
    assert!(state.pki.is_empty());
    assert!(state.secrets.http.is_empty());
    assert!(state.users.named().is_empty());
    assert!(state.in_cluster_proxy.config.is_none());
    assert!(state.bashible.unmanaged_params.is_none());
    assert!(state.conditions.is_true(CONDITION_IN_CLUSTER_PROXY_CLEANUP));
    assert!(!world.inputs.in_cluster_proxy.exists);
}

#[test]
fn test_unmanaged_to_proxy() {
    let mut world = World::unmanaged();
    world.set_params(Mode::Proxy, "r.ex.com/deckhouse/ee");
    world.inputs.params.ttl = "24h".to_string();
    world.converge();

    let state = &world.state;
    assert_eq!(state.mode, Mode::Proxy);
    let ro = state.users.ro.as_ref().unwrap();
    assert!(ro.is_password_hash_valid());
    assert_eq!(state.users.named().len(), 1);

    let proxy = state.in_cluster_proxy.config.as_ref().unwrap();
    assert_eq!(proxy.upstream.ttl, "24h");
    assert_eq!(proxy.upstream.host, "r.ex.com");
    assert_eq!(proxy.users.len(), 1);

    let bashible = state.bashible.config.as_ref().unwrap();
    assert_eq!(bashible.mode, Mode::Proxy);
    assert!(!bashible.proxy_endpoints.is_empty());

    assert_eq!(world.inputs.registry_secret.address, REGISTRY_HOST);
    let (user, password) = world.inputs.registry_secret.credentials().unwrap();
    assert_eq!(user, ro.user_name);
    assert_eq!(password, ro.password);
}

#[test]
fn test_direct_to_proxy_is_refused() {
    let mut world = direct_world();
    let before = world.state.clone();

    world.set_params(Mode::Proxy, "r.ex.com/deckhouse/ee");
    let err = world.step().unwrap_err();
    assert!(matches!(err, RiggerError::TransitionNotSupported { .. }));
    assert_eq!(world.state.mode, before.mode);
    assert_eq!(world.state.pki, before.pki);
}

#[test]
fn test_converged_state_stays_ready() {
    let mut world = direct_world();
    let config = world.state.bashible.config.clone();
    for _ in 0..3 {
        world.step().unwrap();
        assert!(world.state.is_ready());
    }
    assert_eq!(world.state.bashible.config, config);
}
