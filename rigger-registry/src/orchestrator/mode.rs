//! Registry modes and the well-known in-cluster endpoints

use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of the in-cluster registry service
pub const REGISTRY_HOST: &str = "registry.d8-system.svc:5001";
/// Repository path deckhouse images are served under
pub const REGISTRY_PATH: &str = "/system/deckhouse";
/// Path rewrite applied on nodes in Direct mode
pub const REGISTRY_PATH_REGEXP: &str = "^system/deckhouse";
pub const REGISTRY_SCHEME: &str = "https";
/// Port the proxy listens on on every master
pub const PROXY_PORT: u16 = 5001;
/// Node version annotation value when nothing was applied yet
pub const UNKNOWN_VERSION: &str = "unknown";

pub fn host_with_path() -> String {
    format!("{}{}", REGISTRY_HOST, REGISTRY_PATH)
}

/// `ip:port` proxy endpoints for the given masters, sorted.
pub fn proxy_endpoints(master_ips: &[String]) -> Vec<String> {
    let mut endpoints: Vec<String> = master_ips
        .iter()
        .map(|ip| format!("{}:{}", ip, PROXY_PORT))
        .collect();
    endpoints.sort();
    endpoints.dedup();
    endpoints
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Unmanaged,
    Direct,
    Proxy,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Unmanaged => "Unmanaged",
            Mode::Direct => "Direct",
            Mode::Proxy => "Proxy",
        }
    }

    /// Modes served through the in-cluster registry service
    pub fn is_managed(&self) -> bool {
        !matches!(self, Mode::Unmanaged)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = rigger_core::RiggerError;

    /// An empty mode means Unmanaged.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Unmanaged" => Ok(Mode::Unmanaged),
            "Direct" => Ok(Mode::Direct),
            "Proxy" => Ok(Mode::Proxy),
            other => Err(rigger_core::RiggerError::validation(
                "mode",
                format!("unsupported mode {:?}", other),
            )),
        }
    }
}

/// What the registry service in front of deckhouse points at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryService {
    #[default]
    Disabled,
    InClusterProxy,
}

/// Split `host[:port]/path` into the host and a `/`-prefixed path.
pub fn split_images_repo(images_repo: &str) -> (String, String) {
    let repo = images_repo.trim().trim_end_matches('/');
    match repo.split_once('/') {
        Some((host, path)) => (host.to_string(), format!("/{}", path)),
        None => (repo.to_string(), String::new()),
    }
}

/// Cut `value` to 15 characters followed by an ellipsis.
pub fn trim_with_ellipsis(value: &str) -> String {
    const LIMIT: usize = 15;
    if value.chars().count() <= LIMIT {
        return value.to_string();
    }
    let mut trimmed: String = value.chars().take(LIMIT).collect();
    trimmed.push('…');
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_images_repo() {
        assert_eq!(
            split_images_repo("mirror.ex.com/app"),
            ("mirror.ex.com".to_string(), "/app".to_string())
        );
        assert_eq!(
            split_images_repo("r.ex.com:5000/a/b/"),
            ("r.ex.com:5000".to_string(), "/a/b".to_string())
        );
        assert_eq!(
            split_images_repo("r.ex.com"),
            ("r.ex.com".to_string(), String::new())
        );
    }

    #[test]
    fn test_trim_with_ellipsis() {
        assert_eq!(trim_with_ellipsis("short"), "short");
        assert_eq!(
            trim_with_ellipsis("0123456789abcdefXYZ"),
            "0123456789abcde…"
        );
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("".parse::<Mode>().unwrap(), Mode::Unmanaged);
        assert_eq!("Proxy".parse::<Mode>().unwrap(), Mode::Proxy);
        assert!("Local".parse::<Mode>().is_err());
    }
}
