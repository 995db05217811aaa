//! Inputs handed to the image checker by the orchestrator

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How much of the image set is probed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckMode {
    /// Every deckhouse and module image digest
    #[default]
    Default,
    /// Only the deckhouse image tag, for partial mirrors
    Soft,
}

impl fmt::Display for CheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckMode::Default => write!(f, "Default"),
            CheckMode::Soft => write!(f, "Soft"),
        }
    }
}

impl std::str::FromStr for CheckMode {
    type Err = rigger_core::RiggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Default" => Ok(CheckMode::Default),
            "Soft" => Ok(CheckMode::Soft),
            other => Err(rigger_core::RiggerError::validation(
                "checkMode",
                format!("unknown check mode {:?}", other),
            )),
        }
    }
}

/// Transport used for the probes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scheme {
    #[default]
    Https,
    Http,
}

impl Scheme {
    /// Case-insensitive parse; anything that is not `http` is HTTPS.
    pub fn parse_lossy(value: &str) -> Self {
        if value.eq_ignore_ascii_case("http") {
            Scheme::Http
        } else {
            Scheme::Https
        }
    }

    pub fn as_url_scheme(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryParams {
    /// `host[:port][/path]` of the repository holding deckhouse images
    pub address: String,
    pub scheme: Scheme,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    #[serde(default)]
    pub registries: BTreeMap<String, RegistryParams>,
    #[serde(default)]
    pub check_mode: CheckMode,
    /// Fingerprint of everything above, set by the orchestrator
    #[serde(default)]
    pub version: String,
}

impl Params {
    pub fn is_empty(&self) -> bool {
        self.registries.is_empty()
    }
}

/// What the orchestrator reads back from the checker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerStatus {
    pub version: String,
    pub ready: bool,
    pub message: String,
}
