//! User intent read from the `registry-config` secret

use super::mode::{split_images_repo, Mode};
use crate::checker::CheckMode;
use k8s_openapi::api::core::v1::Secret;
use rigger_core::error::{RiggerError, RiggerResult};
use rigger_core::k8s::secret_string;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Params {
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub images_repo: String,
    #[serde(default)]
    pub scheme: String,
    /// PEM encoded upstream CA
    #[serde(default)]
    pub ca: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Proxy cache TTL, passed through verbatim
    #[serde(default)]
    pub ttl: String,
    #[serde(default)]
    pub check_mode: CheckMode,
}

/// Where a registry upstream lives and how to log in to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamParams {
    pub images_repo: String,
    pub scheme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl UpstreamParams {
    /// `(host, /path)` of the images repository
    pub fn host_and_path(&self) -> (String, String) {
        split_images_repo(&self.images_repo)
    }

    pub fn lower_scheme(&self) -> String {
        self.scheme.to_ascii_lowercase()
    }
}

impl Params {
    /// Decode the `registry-config` secret. Unknown modes and check modes are
    /// rejected.
    pub fn from_secret(secret: &Secret) -> RiggerResult<Self> {
        let params = Self {
            generation: secret.metadata.generation.unwrap_or_default(),
            mode: secret_string(secret, "mode").parse()?,
            images_repo: secret_string(secret, "imagesRepo"),
            scheme: secret_string(secret, "scheme"),
            ca: secret_string(secret, "ca"),
            username: secret_string(secret, "username"),
            password: secret_string(secret, "password"),
            ttl: secret_string(secret, "ttl"),
            check_mode: secret_string(secret, "checkMode").parse()?,
        };
        Ok(params)
    }

    /// Upstream host, e.g. `mirror.ex.com`
    pub fn upstream_host(&self) -> String {
        split_images_repo(&self.images_repo).0
    }

    pub fn lower_scheme(&self) -> String {
        self.scheme.to_ascii_lowercase()
    }

    pub fn upstream(&self) -> UpstreamParams {
        UpstreamParams {
            images_repo: self.images_repo.trim().trim_end_matches('/').to_string(),
            scheme: self.scheme.clone(),
            ca: self.ca.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// Unmanaged mode that still points nodes at a user registry
    pub fn is_configurable_unmanaged(&self) -> bool {
        self.mode == Mode::Unmanaged && !self.images_repo.is_empty()
    }

    pub fn validate(&self) -> RiggerResult<()> {
        let needs_upstream = self.mode.is_managed() || self.is_configurable_unmanaged();
        if !needs_upstream {
            return Ok(());
        }

        if self.images_repo.trim().is_empty() {
            return Err(RiggerError::validation(
                "imagesRepo",
                format!("is required in {} mode", self.mode),
            ));
        }

        let (host, _) = split_images_repo(&self.images_repo);
        if host.is_empty() || host.contains("://") {
            return Err(RiggerError::validation(
                "imagesRepo",
                format!("{:?} must be host[:port]/path without a scheme", self.images_repo),
            ));
        }

        match self.lower_scheme().as_str() {
            "http" | "https" => {}
            other => {
                return Err(RiggerError::validation(
                    "scheme",
                    format!("{:?} must be HTTP or HTTPS", other),
                ))
            }
        }

        if self.username.is_empty() != self.password.is_empty() {
            return Err(RiggerError::validation(
                "username",
                "username and password must be set together",
            ));
        }

        if !self.ca.is_empty() && pem::parse(self.ca.as_bytes()).is_err() {
            return Err(RiggerError::validation("ca", "is not a PEM certificate"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigger_core::k8s::make_secret;
    use std::collections::BTreeMap;

    fn direct() -> Params {
        Params {
            mode: Mode::Direct,
            images_repo: "r.ex.com/deckhouse/ee".to_string(),
            scheme: "HTTPS".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(direct().validate().is_ok());
        assert!(Params::default().validate().is_ok());

        let mut missing_repo = direct();
        missing_repo.images_repo.clear();
        assert!(matches!(
            missing_repo.validate(),
            Err(RiggerError::Validation { ref field, .. }) if field == "imagesRepo"
        ));

        let mut bad_scheme = direct();
        bad_scheme.scheme = "ftp".to_string();
        assert!(bad_scheme.validate().is_err());

        let mut half_creds = direct();
        half_creds.password.clear();
        assert!(half_creds.validate().is_err());
    }

    #[test]
    fn test_from_secret() {
        let secret = make_secret(
            "d8-system",
            "registry-config",
            "Opaque",
            BTreeMap::new(),
            BTreeMap::from([
                ("mode".to_string(), b"Direct".to_vec()),
                ("imagesRepo".to_string(), b"r.ex.com/d8".to_vec()),
                ("scheme".to_string(), b"HTTPS".to_vec()),
                ("checkMode".to_string(), b"Soft".to_vec()),
            ]),
        );
        let params = Params::from_secret(&secret).unwrap();
        assert_eq!(params.mode, Mode::Direct);
        assert_eq!(params.upstream_host(), "r.ex.com");
        assert_eq!(params.check_mode, CheckMode::Soft);
        assert!(params.username.is_empty());
    }
}
