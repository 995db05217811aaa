//! Configuration of the in-cluster registry proxy deployment

use super::mode::trim_with_ellipsis;
use super::params::UpstreamParams;
use super::users::User;
use rigger_core::error::RiggerResult;
use rigger_core::hashing::compute_hash;
use rigger_core::pki::{self, CertKey, CertModel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const DEPLOYMENT_NAME: &str = "registry-incluster-proxy";
pub const CONFIG_SECRET_NAME: &str = "registry-incluster-proxy-config";
/// Deployment annotation with the config version it runs
pub const VERSION_ANNOTATION: &str = "registry.deckhouse.io/config-version";

pub const AUTH_COMMON_NAME: &str = "registry-auth";
pub const DISTRIBUTION_COMMON_NAME: &str = "registry-distribution";
pub const SANS: [&str; 3] = ["127.0.0.1", "localhost", "registry.d8-system.svc"];

pub struct Params {
    pub ca: CertKey,
    pub token: CertKey,
    pub http_secret: String,
    pub upstream: UpstreamParams,
    /// Cache TTL, only set when the proxy caches
    pub ttl: String,
    /// Clients allowed to pull through the proxy
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub scheme: String,
    pub host: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ttl: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyUser {
    pub name: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// CA certificate only, the key stays with the orchestrator
    pub ca: String,
    pub auth: CertModel,
    pub distribution: CertModel,
    pub token: CertModel,
    pub http_secret: String,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub users: Vec<ProxyUser>,
}

impl Config {
    pub fn version(&self) -> RiggerResult<String> {
        compute_hash(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inputs {
    /// The deployment exists
    pub exists: bool,
    pub ready: bool,
    /// Config version the deployment was rolled out with
    pub version: String,
    /// The config secret exists
    #[serde(skip)]
    pub is_secret_exist: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub ready: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Config>,
}

impl State {
    pub fn process(&mut self, params: &Params, inputs: &Inputs) -> RiggerResult<ProcessResult> {
        let previous = self.config.take();

        let auth = leaf_cert(
            previous.as_ref().map(|c| &c.auth),
            &params.ca,
            AUTH_COMMON_NAME,
        )?;
        let distribution = leaf_cert(
            previous.as_ref().map(|c| &c.distribution),
            &params.ca,
            DISTRIBUTION_COMMON_NAME,
        )?;

        let mut users = Vec::with_capacity(params.users.len());
        for user in &params.users {
            users.push(proxy_user(previous.as_ref(), user)?);
        }

        let (host, path) = params.upstream.host_and_path();
        let config = Config {
            ca: params.ca.cert_pem().to_string(),
            auth: auth.to_model(),
            distribution: distribution.to_model(),
            token: params.token.to_model(),
            http_secret: params.http_secret.clone(),
            upstream: UpstreamConfig {
                scheme: params.upstream.lower_scheme(),
                host,
                path,
                ca: params.upstream.ca.clone(),
                username: params.upstream.username.clone(),
                password: params.upstream.password.clone(),
                ttl: params.ttl.clone(),
            },
            users,
        };
        let version = config.version()?;
        self.config = Some(config);

        let result = if !inputs.exists {
            ProcessResult {
                ready: false,
                message: "Deploying in-cluster proxy...".to_string(),
            }
        } else if inputs.version != version {
            ProcessResult {
                ready: false,
                message: format!(
                    "Updating in-cluster proxy: {:?} → {:?}",
                    trim_with_ellipsis(&inputs.version),
                    trim_with_ellipsis(&version)
                ),
            }
        } else if !inputs.ready {
            ProcessResult {
                ready: false,
                message: "Waiting for in-cluster proxy to become ready...".to_string(),
            }
        } else {
            ProcessResult {
                ready: true,
                message: format!("In-cluster proxy runs version {}", trim_with_ellipsis(&version)),
            }
        };
        Ok(result)
    }

    /// Drop the config; ready once the deployment is gone.
    pub fn stop(&mut self, inputs: &Inputs) -> ProcessResult {
        self.config = None;
        if inputs.exists {
            ProcessResult {
                ready: false,
                message: "Removing in-cluster proxy...".to_string(),
            }
        } else {
            ProcessResult {
                ready: true,
                message: "In-cluster proxy removed".to_string(),
            }
        }
    }
}

/// Reuse `previous` while it is still valid for `ca` and the proxy SANs.
fn leaf_cert(previous: Option<&CertModel>, ca: &CertKey, common_name: &str) -> RiggerResult<CertKey> {
    if let Some(model) = previous {
        match model.to_pki().and_then(|cert| pki::validate_cert(&cert, ca, &SANS).map(|_| cert)) {
            Ok(cert) => return Ok(cert),
            Err(e) => info!(common_name, error = %e, "Reissuing in-cluster proxy certificate"),
        }
    }
    pki::generate_cert(ca, common_name, &SANS)
}

fn proxy_user(previous: Option<&Config>, user: &User) -> RiggerResult<ProxyUser> {
    if user.is_password_hash_valid() {
        return Ok(ProxyUser {
            name: user.user_name.clone(),
            password_hash: user.hashed_password.clone(),
        });
    }

    let known = previous
        .into_iter()
        .flat_map(|c| c.users.iter())
        .find(|u| u.name == user.user_name);
    if let Some(known) = known {
        if bcrypt::verify(&user.password, &known.password_hash).unwrap_or(false) {
            return Ok(known.clone());
        }
    }

    debug!(user = %user.user_name, "Hashing in-cluster proxy user password");
    let mut hashed = user.clone();
    hashed.update_password_hash()?;
    Ok(ProxyUser {
        name: hashed.user_name,
        password_hash: hashed.hashed_password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        let ca = pki::generate_ca("registry-ca").unwrap();
        let token = pki::generate_cert(&ca, "registry-auth-token", &[]).unwrap();
        Params {
            ca,
            token,
            http_secret: "secret".to_string(),
            upstream: UpstreamParams {
                images_repo: "r.ex.com/deckhouse/ee".to_string(),
                scheme: "HTTPS".to_string(),
                username: "u".to_string(),
                password: "p".to_string(),
                ..Default::default()
            },
            ttl: String::new(),
            users: vec![User::new("u", "p")],
        }
    }

    #[test]
    fn test_process_is_stable_and_waits_for_rollout() {
        let params = params();
        let mut state = State::default();

        let first = state.process(&params, &Inputs::default()).unwrap();
        assert!(!first.ready);
        let config = state.config.clone().unwrap();
        assert_eq!(config.upstream.host, "r.ex.com");
        assert_eq!(config.upstream.path, "/deckhouse/ee");
        assert_eq!(config.upstream.scheme, "https");
        assert!(bcrypt::verify("p", &config.users[0].password_hash).unwrap());

        // Certificates and hashes are reused, so the version holds.
        let version = config.version().unwrap();
        let inputs = Inputs {
            exists: true,
            ready: true,
            version: version.clone(),
            ..Default::default()
        };
        let second = state.process(&params, &inputs).unwrap();
        assert!(second.ready, "{}", second.message);
        assert_eq!(state.config.as_ref().unwrap().version().unwrap(), version);
    }

    #[test]
    fn test_stop() {
        let mut state = State::default();
        state.process(&params(), &Inputs::default()).unwrap();

        assert!(!state.stop(&Inputs { exists: true, ..Default::default() }).ready);
        assert!(state.config.is_none());
        assert!(state.stop(&Inputs::default()).ready);
    }
}
