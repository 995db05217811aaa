//! Node-side registry configuration rendered by bashible
//!
//! A mode switch goes through two stages. The transition stage publishes a
//! config holding the mirrors of both the previous and the new mode, so nodes
//! that have not been reconfigured yet keep pulling. The final stage drops the
//! previous mirrors. Each config is versioned by its own content hash and
//! nodes report the version they applied through an annotation.

use super::mode::{
    host_with_path, proxy_endpoints, trim_with_ellipsis, Mode, REGISTRY_HOST,
    REGISTRY_PATH_REGEXP, REGISTRY_SCHEME, UNKNOWN_VERSION,
};
use super::params::UpstreamParams;
use super::registry_switcher::RegistrySecretConfig;
use rigger_core::error::{RiggerError, RiggerResult};
use rigger_core::hashing::compute_hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const SECRET_NAME: &str = "registry-bashible-config";

pub const STAGE_PROCESS_FIRST: &str = "Process stage 1: apply new configs with existing ones";
pub const STAGE_PROCESS_SECOND: &str = "Process stage 2: apply new configs only, remove old if exist";
pub const STAGE_CLEANUP_FIRST: &str = "Cleanup stage 1: apply Unmanaged configs with existing ones";
pub const STAGE_CLEANUP_SECOND: &str =
    "Cleanup stage 2: cleanup old configs and remove registry-bashible-config secret";

const PREFLIGHT_CHECK_MESSAGE: &str = "Check current nodes configuration";
pub const CONTAINERD_CFG_MODE_DEFAULT: &str = "default";
pub const CONTAINERD_CFG_MODE_CUSTOM: &str = "custom";
const MAX_SHOWN_NODES: usize = 10;

/// Credentials nodes use against the in-cluster proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyParams {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum ModeParams {
    Unmanaged(UpstreamParams),
    Direct(UpstreamParams),
    Proxy(ProxyParams),
}

impl ModeParams {
    pub fn mode(&self) -> Mode {
        match self {
            ModeParams::Unmanaged(_) => Mode::Unmanaged,
            ModeParams::Direct(_) => Mode::Direct,
            ModeParams::Proxy(_) => Mode::Proxy,
        }
    }

    /// Whatever nodes use today, read back from the `deckhouse-registry`
    /// secret. Always Unmanaged since the secret only knows an upstream.
    pub fn from_registry_secret(secret: &RegistrySecretConfig) -> RiggerResult<Self> {
        let (username, password) = secret.credentials().map_err(|e| {
            RiggerError::context("cannot read credentials from the registry secret", e)
        })?;
        Ok(ModeParams::Unmanaged(UpstreamParams {
            images_repo: format!("{}{}", secret.address, secret.path),
            scheme: secret.scheme.to_ascii_lowercase(),
            ca: secret.ca.clone(),
            username,
            password,
        }))
    }

    /// Host key and its mirrors for the regular config
    fn host_mirrors(&self) -> (String, Vec<MirrorHost>) {
        match self {
            ModeParams::Unmanaged(p) => {
                let (host, _) = p.host_and_path();
                let mirror = MirrorHost::new(&host, &p.lower_scheme(), &p.ca, &p.username, &p.password);
                (host, vec![mirror])
            }
            ModeParams::Direct(p) => {
                let (host, path) = p.host_and_path();
                let mut mirror = MirrorHost::new(&host, &p.lower_scheme(), &p.ca, &p.username, &p.password);
                mirror.rewrites.push(Rewrite {
                    from: REGISTRY_PATH_REGEXP.to_string(),
                    to: path.trim_start_matches('/').to_string(),
                });
                (REGISTRY_HOST.to_string(), vec![mirror])
            }
            ModeParams::Proxy(p) => (
                REGISTRY_HOST.to_string(),
                vec![MirrorHost::new(REGISTRY_HOST, REGISTRY_SCHEME, &p.ca, &p.username, &p.password)],
            ),
        }
    }

    /// Prepull runs before cluster DNS, so Proxy mode also lists every
    /// master endpoint.
    fn prepull_mirrors(&self, master_ips: &[String]) -> (String, Vec<MirrorHost>) {
        let (host, mut mirrors) = self.host_mirrors();
        if let ModeParams::Proxy(p) = self {
            for endpoint in proxy_endpoints(master_ips) {
                mirrors.push(MirrorHost::new(&endpoint, REGISTRY_SCHEME, &p.ca, &p.username, &p.password));
            }
        }
        (host, mirrors)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rewrite {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorHost {
    pub host: String,
    pub scheme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rewrites: Vec<Rewrite>,
}

impl MirrorHost {
    fn new(host: &str, scheme: &str, ca: &str, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            scheme: scheme.to_string(),
            ca: ca.to_string(),
            auth: Auth {
                username: username.to_string(),
                password: password.to_string(),
            },
            rewrites: Vec::new(),
        }
    }

    /// Mirrors with the same key replace each other on merge
    pub fn unique_key(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigHosts {
    /// Every CA the mirrors of this host need, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ca: Vec<String>,
    pub mirrors: Vec<MirrorHost>,
}

impl ConfigHosts {
    fn merge(&mut self, mirrors: Vec<MirrorHost>) {
        for mirror in mirrors {
            if !mirror.ca.is_empty() {
                self.ca.push(mirror.ca.clone());
            }
            let key = mirror.unique_key();
            match self.mirrors.iter_mut().find(|m| m.unique_key() == key) {
                Some(existing) => *existing = mirror,
                None => self.mirrors.push(mirror),
            }
        }
        self.ca.sort();
        self.ca.dedup();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Hash of every other field
    pub version: String,
    pub mode: Mode,
    pub images_base: String,
    #[serde(default)]
    pub proxy_endpoints: Vec<String>,
    #[serde(default)]
    pub hosts: BTreeMap<String, ConfigHosts>,
    #[serde(default)]
    pub prepull_hosts: BTreeMap<String, ConfigHosts>,
}

impl Config {
    /// Merge `previous` (in order) and then `params` into one config.
    fn build(params: &ModeParams, previous: &[ModeParams], master_ips: &[String]) -> RiggerResult<Self> {
        let images_base = match params {
            ModeParams::Unmanaged(p) => p.images_repo.clone(),
            _ => host_with_path(),
        };

        let all: Vec<&ModeParams> = previous.iter().chain(std::iter::once(params)).collect();
        let proxy_endpoints = if all.iter().any(|p| p.mode() == Mode::Proxy) {
            proxy_endpoints(master_ips)
        } else {
            Vec::new()
        };

        let mut config = Config {
            version: String::new(),
            mode: params.mode(),
            images_base,
            proxy_endpoints,
            hosts: BTreeMap::new(),
            prepull_hosts: BTreeMap::new(),
        };
        for p in all {
            let (host, mirrors) = p.host_mirrors();
            config.hosts.entry(host).or_default().merge(mirrors);
            let (host, mirrors) = p.prepull_mirrors(master_ips);
            config.prepull_hosts.entry(host).or_default().merge(mirrors);
        }

        config.version = compute_hash(&config)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    /// Applied config version, [`UNKNOWN_VERSION`] when none
    pub version: String,
    pub containerd_cfg_mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inputs {
    /// The `registry-bashible-config` secret is present
    pub is_secret_exist: bool,
    pub master_nodes_ips: Vec<String>,
    pub node_status: BTreeMap<String, NodeStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    pub mode_params: ModeParams,
    /// Current `deckhouse-registry` content, seeds the actual params
    pub registry_secret: RegistrySecretConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub ready: bool,
    pub message: String,
}

impl ProcessResult {
    /// Condition text for a stage that returned an error
    pub fn failed(stage: &str) -> Self {
        Self {
            ready: false,
            message: format!("{}\nFailed to process Bashible configuration.", stage),
        }
    }

    fn already_processed(stage: &str) -> Self {
        Self {
            ready: true,
            message: format!("{}\nBashible already processed.", stage),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Upstream to fall back to when leaving a managed mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unmanaged_params: Option<UpstreamParams>,
    /// What nodes are configured with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_params: Option<ModeParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Config>,
}

impl State {
    pub fn is_running(&self) -> bool {
        self.config.is_some()
    }

    /// Publish the previous and the new mirrors together.
    pub fn process_transition(&mut self, params: &Params, inputs: &Inputs) -> RiggerResult<ProcessResult> {
        self.process(params, inputs, true, STAGE_PROCESS_FIRST)
    }

    /// Publish only the new mirrors.
    pub fn finalize_transition(&mut self, params: &Params, inputs: &Inputs) -> RiggerResult<ProcessResult> {
        self.process(params, inputs, false, STAGE_PROCESS_SECOND)
    }

    /// Leave the managed configuration. With no bashible secret in the
    /// cluster the state is dropped; otherwise the secret keeps serving the
    /// upstream found in `registry_secret`.
    pub fn finalize_unmanaged(
        &mut self,
        registry_secret: &RegistrySecretConfig,
        inputs: &Inputs,
    ) -> RiggerResult<ProcessResult> {
        if !inputs.is_secret_exist {
            *self = State::default();
            return Ok(build_result(inputs, true, UNKNOWN_VERSION, STAGE_CLEANUP_SECOND));
        }

        let mode_params = ModeParams::from_registry_secret(registry_secret)?;
        let params = Params {
            mode_params,
            registry_secret: registry_secret.clone(),
        };
        self.process(&params, inputs, false, STAGE_CLEANUP_FIRST)
    }

    fn process(
        &mut self,
        params: &Params,
        inputs: &Inputs,
        is_transition: bool,
        stage: &str,
    ) -> RiggerResult<ProcessResult> {
        if is_transition && self.actual_params.as_ref() == Some(&params.mode_params) {
            return Ok(ProcessResult::already_processed(stage));
        }

        let actual = match self.actual_params.take() {
            Some(actual) => actual,
            None => ModeParams::from_registry_secret(&params.registry_secret)?,
        };

        let (config, actual) = if is_transition {
            let config = Config::build(&params.mode_params, std::slice::from_ref(&actual), &inputs.master_nodes_ips);
            (config, actual)
        } else {
            let config = Config::build(&params.mode_params, &[], &inputs.master_nodes_ips);
            (config, params.mode_params.clone())
        };
        self.actual_params = Some(actual);

        let config = config?;
        let result = build_result(inputs, false, &config.version, stage);
        self.config = Some(config);
        Ok(result)
    }
}

fn build_result(inputs: &Inputs, is_stop: bool, version: &str, stage: &str) -> ProcessResult {
    let mut msg = format!("{}\n", stage);

    if is_stop && inputs.is_secret_exist {
        msg.push_str("Cleaning Managed configuration...\n");
        return ProcessResult { ready: false, message: msg };
    }
    if !is_stop && !inputs.is_secret_exist {
        msg.push_str("Creating Managed configuration...\n");
        return ProcessResult { ready: false, message: msg };
    }

    let pending: Vec<(&String, &NodeStatus)> = inputs
        .node_status
        .iter()
        .filter(|(_, status)| status.version != version)
        .collect();
    let total = inputs.node_status.len();

    if pending.is_empty() {
        if is_stop {
            let _ = writeln!(msg, "All {} node(s) use the Unmanaged config.", total);
        } else {
            let _ = writeln!(msg, "All {} node(s) updated to version {}.", total, trim_with_ellipsis(version));
        }
        return ProcessResult { ready: true, message: msg };
    }

    let _ = writeln!(msg, "{}/{} node(s) ready. Waiting:", total - pending.len(), total);
    for (i, (name, status)) in pending.iter().enumerate() {
        if i == MAX_SHOWN_NODES {
            let _ = writeln!(msg, "\t...and {} more", pending.len() - MAX_SHOWN_NODES);
            break;
        }
        let current = trim_with_ellipsis(&status.version);
        if is_stop {
            let _ = writeln!(msg, "- {}: {:?} → Unmanaged", name, current);
        } else {
            let _ = writeln!(msg, "- {}: {:?} → {:?}", name, current, trim_with_ellipsis(version));
        }
    }
    ProcessResult { ready: false, message: msg }
}

/// Nodes with a custom containerd merge config cannot take a managed
/// registry config. An existing bashible secret means this was checked
/// before.
pub fn preflight_check(inputs: &Inputs) -> ProcessResult {
    let mut msg = format!("{}\n", PREFLIGHT_CHECK_MESSAGE);
    let total = inputs.node_status.len();

    if inputs.is_secret_exist {
        msg.push_str("Configuration from registry module already exists.\n");
        let _ = writeln!(msg, "All {} node(s) Ready to configure.", total);
        return ProcessResult { ready: true, message: msg };
    }

    let pending: Vec<(&String, &NodeStatus)> = inputs
        .node_status
        .iter()
        .filter(|(_, status)| status.containerd_cfg_mode != CONTAINERD_CFG_MODE_DEFAULT)
        .collect();

    if pending.is_empty() {
        let _ = writeln!(msg, "All {} node(s) Ready to configure.", total);
        return ProcessResult { ready: true, message: msg };
    }

    let _ = writeln!(msg, "{}/{} node(s) Unready:", pending.len(), total);
    for (i, (name, status)) in pending.iter().enumerate() {
        if i == MAX_SHOWN_NODES {
            let _ = writeln!(msg, "\t...and {} more", pending.len() - MAX_SHOWN_NODES);
            break;
        }
        if status.containerd_cfg_mode == CONTAINERD_CFG_MODE_CUSTOM {
            let _ = writeln!(msg, "- {}: has custom toml merge containerd configuration", name);
        } else {
            let _ = writeln!(msg, "- {}: unknown containerd configuration, waiting...", name);
        }
    }
    ProcessResult { ready: false, message: msg }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rigger_core::dockercfg;

    fn upstream(repo: &str) -> UpstreamParams {
        UpstreamParams {
            images_repo: repo.to_string(),
            scheme: "HTTPS".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            ..Default::default()
        }
    }

    fn registry_secret() -> RegistrySecretConfig {
        RegistrySecretConfig {
            address: "old.ex.com".to_string(),
            path: "/d8".to_string(),
            scheme: "https".to_string(),
            ca: String::new(),
            docker_config: dockercfg::encode("a", "b", "old.ex.com").unwrap(),
        }
    }

    fn nodes(version: &str, count: usize) -> BTreeMap<String, NodeStatus> {
        (0..count)
            .map(|i| {
                (
                    format!("node-{:02}", i),
                    NodeStatus {
                        version: version.to_string(),
                        containerd_cfg_mode: CONTAINERD_CFG_MODE_DEFAULT.to_string(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_transition_merges_previous_mirrors() {
        let mut state = State::default();
        let params = Params {
            mode_params: ModeParams::Direct(upstream("new.ex.com/deckhouse/ee")),
            registry_secret: registry_secret(),
        };
        let inputs = Inputs {
            is_secret_exist: true,
            ..Default::default()
        };

        let result = state.process_transition(&params, &inputs).unwrap();
        assert!(result.ready, "{}", result.message);

        let config = state.config.clone().unwrap();
        assert_eq!(config.mode, Mode::Direct);
        assert_eq!(config.images_base, host_with_path());
        assert_eq!(config.hosts.len(), 2);
        let direct = &config.hosts[REGISTRY_HOST].mirrors[0];
        assert_eq!(direct.host, "new.ex.com");
        assert_eq!(direct.rewrites[0].to, "deckhouse/ee");
        assert_eq!(config.hosts["old.ex.com"].mirrors[0].auth.username, "a");

        // Actual params still describe the old upstream until finalize.
        assert!(matches!(state.actual_params, Some(ModeParams::Unmanaged(_))));

        let mut unversioned = config.clone();
        unversioned.version.clear();
        assert_eq!(config.version, compute_hash(&unversioned).unwrap());
    }

    #[test]
    fn test_finalize_then_transition_fast_path() {
        let mut state = State::default();
        let params = Params {
            mode_params: ModeParams::Direct(upstream("new.ex.com/d8")),
            registry_secret: registry_secret(),
        };
        let mut inputs = Inputs {
            is_secret_exist: true,
            node_status: nodes(UNKNOWN_VERSION, 2),
            ..Default::default()
        };

        let waiting = state.finalize_transition(&params, &inputs).unwrap();
        assert!(!waiting.ready);
        assert!(waiting.message.contains("0/2 node(s) ready. Waiting:"));
        assert_eq!(state.config.as_ref().unwrap().hosts.len(), 1);

        let version = state.config.as_ref().unwrap().version.clone();
        inputs.node_status = nodes(&version, 2);
        assert!(state.finalize_transition(&params, &inputs).unwrap().ready);

        let again = state.process_transition(&params, &inputs).unwrap();
        assert!(again.ready);
        assert_eq!(again.message, format!("{}\nBashible already processed.", STAGE_PROCESS_FIRST));
    }

    #[test]
    fn test_waiting_list_is_capped() {
        let inputs = Inputs {
            is_secret_exist: true,
            node_status: nodes("v1", 12),
            ..Default::default()
        };
        let result = build_result(&inputs, false, "v2", STAGE_PROCESS_SECOND);
        assert!(!result.ready);
        assert!(result.message.contains("0/12 node(s) ready. Waiting:"));
        assert!(result.message.contains("- node-00: \"v1\" → \"v2\""));
        assert!(result.message.contains("\t...and 2 more"));
        assert!(!result.message.contains("node-10"));
    }

    #[test]
    fn test_proxy_prepull_lists_master_endpoints() {
        let mut state = State::default();
        let params = Params {
            mode_params: ModeParams::Proxy(ProxyParams {
                ca: "CA".to_string(),
                username: "ro".to_string(),
                password: "x".to_string(),
            }),
            registry_secret: registry_secret(),
        };
        let inputs = Inputs {
            is_secret_exist: true,
            master_nodes_ips: vec!["10.0.0.2".to_string(), "10.0.0.1".to_string()],
            ..Default::default()
        };
        state.finalize_transition(&params, &inputs).unwrap();

        let config = state.config.unwrap();
        assert_eq!(config.proxy_endpoints, vec!["10.0.0.1:5001", "10.0.0.2:5001"]);
        assert_eq!(config.hosts[REGISTRY_HOST].mirrors.len(), 1);
        assert_eq!(config.prepull_hosts[REGISTRY_HOST].mirrors.len(), 3);
        assert_eq!(config.hosts[REGISTRY_HOST].ca, vec!["CA".to_string()]);
    }

    #[test]
    fn test_finalize_unmanaged_without_secret_resets() {
        let mut state = State {
            unmanaged_params: Some(upstream("mirror.ex.com/app")),
            ..Default::default()
        };
        let inputs = Inputs {
            node_status: nodes(UNKNOWN_VERSION, 1),
            ..Default::default()
        };
        let result = state.finalize_unmanaged(&registry_secret(), &inputs).unwrap();
        assert!(result.ready);
        assert!(result.message.starts_with(STAGE_CLEANUP_SECOND));
        assert_eq!(state, State::default());
    }

    #[test]
    fn test_preflight_check() {
        let mut node_status = nodes(UNKNOWN_VERSION, 1);
        node_status.insert(
            "custom-0".to_string(),
            NodeStatus {
                version: UNKNOWN_VERSION.to_string(),
                containerd_cfg_mode: CONTAINERD_CFG_MODE_CUSTOM.to_string(),
            },
        );
        node_status.insert("fresh-0".to_string(), NodeStatus::default());

        let mut inputs = Inputs {
            node_status,
            ..Default::default()
        };
        let result = preflight_check(&inputs);
        assert!(!result.ready);
        assert!(result.message.contains("2/3 node(s) Unready:"));
        assert!(result.message.contains("- custom-0: has custom toml merge containerd configuration"));
        assert!(result.message.contains("- fresh-0: unknown containerd configuration, waiting..."));

        inputs.is_secret_exist = true;
        assert!(preflight_check(&inputs).ready);
    }
}
