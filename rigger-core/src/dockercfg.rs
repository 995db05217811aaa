//! Docker auth config (`.dockerconfigjson`) encoding

use crate::error::{RiggerError, RiggerResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct DockerCfg {
    auths: BTreeMap<String, DockerCfgAuth>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct DockerCfgAuth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    auth: String,
}

/// Build a docker config granting `username`/`password` on `host`.
///
/// Empty credentials produce an empty auth entry for the host.
pub fn encode(username: &str, password: &str, host: &str) -> RiggerResult<Vec<u8>> {
    let mut entry = DockerCfgAuth::default();
    if !username.is_empty() || !password.is_empty() {
        entry.username = username.to_string();
        entry.password = password.to_string();
        entry.auth = STANDARD.encode(format!("{}:{}", username, password));
    }

    let mut cfg = DockerCfg::default();
    cfg.auths.insert(host.to_string(), entry);
    Ok(serde_json::to_vec(&cfg)?)
}

/// Extract `(username, password)` for `host`.
///
/// Explicit fields win; otherwise the base64 `auth` field is split on the
/// first colon. A missing host yields empty credentials.
pub fn decode(data: &[u8], host: &str) -> RiggerResult<(String, String)> {
    if data.is_empty() {
        return Ok((String::new(), String::new()));
    }

    let cfg: DockerCfg = serde_json::from_slice(data)?;
    let Some(entry) = cfg.auths.get(host) else {
        return Ok((String::new(), String::new()));
    };

    if !entry.username.is_empty() || !entry.password.is_empty() {
        return Ok((entry.username.clone(), entry.password.clone()));
    }

    if entry.auth.is_empty() {
        return Ok((String::new(), String::new()));
    }

    let raw = STANDARD
        .decode(entry.auth.as_bytes())
        .map_err(|e| RiggerError::parse("docker auth", e))?;
    let text = String::from_utf8(raw)?;
    match text.split_once(':') {
        Some((user, pass)) => Ok((user.to_string(), pass.to_string())),
        None => Err(RiggerError::parse(
            "docker auth",
            "expected \"username:password\"",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_survive_encoding() {
        let data = encode("reader", "s3:cret", "registry.d8-system.svc:5001").unwrap();
        let (user, pass) = decode(&data, "registry.d8-system.svc:5001").unwrap();
        assert_eq!(user, "reader");
        assert_eq!(pass, "s3:cret");
    }

    #[test]
    fn test_decode_from_auth_field_only() {
        let auth = STANDARD.encode("u:p");
        let json = format!(r#"{{"auths":{{"mirror.ex.com":{{"auth":"{}"}}}}}}"#, auth);
        let (user, pass) = decode(json.as_bytes(), "mirror.ex.com").unwrap();
        assert_eq!((user.as_str(), pass.as_str()), ("u", "p"));
    }

    #[test]
    fn test_anonymous_entry() {
        let data = encode("", "", "mirror.ex.com").unwrap();
        assert_eq!(
            String::from_utf8(data.clone()).unwrap(),
            r#"{"auths":{"mirror.ex.com":{}}}"#
        );
        assert_eq!(
            decode(&data, "mirror.ex.com").unwrap(),
            (String::new(), String::new())
        );
        assert_eq!(
            decode(&data, "other").unwrap(),
            (String::new(), String::new())
        );
    }
}
