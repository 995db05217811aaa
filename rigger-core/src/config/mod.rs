//! Configuration management for Rigger
//!
//! Configuration is loaded from a TOML file, overridden from `RIGGER_*`
//! environment variables and validated before use. Every section carries
//! `#[serde(default)]` so a partial file (or no file at all) is valid.

pub mod defaults;

use crate::error::{RiggerError, RiggerResult};
use defaults::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Global configuration instance
static CONFIG: once_cell::sync::OnceCell<Arc<RiggerConfig>> = once_cell::sync::OnceCell::new();

/// Complete configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiggerConfig {
    pub infrastructure: InfrastructureConfig,
    pub checker: CheckerConfig,
    pub registry: RegistryConfig,
    pub lease: LeaseConfig,
    pub logging: LoggingConfig,
}

/// Answer used when a cached infrastructure state is found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UseStateCache {
    Yes,
    No,
    #[default]
    Ask,
}

impl std::str::FromStr for UseStateCache {
    type Err = RiggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yes" | "y" => Ok(UseStateCache::Yes),
            "no" | "n" => Ok(UseStateCache::No),
            "ask" | "" => Ok(UseStateCache::Ask),
            other => Err(RiggerError::configuration(
                "infrastructure.use_state_cache",
                format!("unknown value {:?}, expected yes, no or ask", other),
            )),
        }
    }
}

/// Which infrastructure utility drives the pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Terraform,
    Opentofu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfrastructureConfig {
    /// Root directory holding modules, plugins and lock files
    pub root_dir: PathBuf,

    /// Directory for temporary state, plan and variables files
    pub tmp_dir: PathBuf,

    /// Binary invoked for back-end A
    pub terraform_binary: PathBuf,

    /// Binary invoked for back-end B
    pub opentofu_binary: PathBuf,

    pub backend: BackendKind,

    /// Forward child stderr to debug logs and run the utility with TF_LOG=DEBUG
    pub debug: bool,

    pub use_state_cache: UseStateCache,

    /// Directory used as a local state cache
    pub cache_dir: PathBuf,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            tmp_dir: PathBuf::from(DEFAULT_TMP_DIR),
            terraform_binary: PathBuf::from("terraform"),
            opentofu_binary: PathBuf::from("opentofu"),
            backend: BackendKind::default(),
            debug: false,
            use_state_cache: UseStateCache::default(),
            cache_dir: PathBuf::from(DEFAULT_TMP_DIR).join("state-cache"),
        }
    }
}

impl InfrastructureConfig {
    pub fn plugins_dir(&self) -> PathBuf {
        self.root_dir.join(DEFAULT_PLUGINS_SUBDIR)
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.root_dir.join(DEFAULT_MODULES_SUBDIR)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.tmp_dir.join(format!("tf_{}", DEFAULT_DATA_DIR_ID))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound for a whole checker reconcile
    #[serde(with = "humantime_serde")]
    pub process_timeout: Duration,

    /// Cool-down before failed items are retried
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    pub parallelism_per_registry: usize,

    pub show_max_err_items: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_CHECKER_INTERVAL_SECS),
            process_timeout: Duration::from_secs(DEFAULT_CHECKER_PROCESS_TIMEOUT_SECS),
            retry_delay: Duration::from_secs(DEFAULT_CHECKER_RETRY_DELAY_SECS),
            request_timeout: Duration::from_secs(DEFAULT_CHECKER_REQUEST_TIMEOUT_SECS),
            parallelism_per_registry: DEFAULT_CHECKER_PARALLELISM,
            show_max_err_items: DEFAULT_SHOW_MAX_ERR_ITEMS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub namespace: String,

    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_REGISTRY_NAMESPACE.to_string(),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub namespace: String,
    pub module: String,
    pub pod_name: String,
    pub pod_ip: String,
    pub cluster_domain: String,
    pub port: u16,
    pub duration_seconds: i32,

    #[serde(with = "humantime_serde")]
    pub renew_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_LEASE_NAMESPACE.to_string(),
            module: DEFAULT_LEASE_MODULE.to_string(),
            pod_name: String::new(),
            pod_ip: String::new(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            port: DEFAULT_LEASE_PORT,
            duration_seconds: DEFAULT_LEASE_DURATION_SECS,
            renew_interval: Duration::from_secs(DEFAULT_LEASE_RENEW_SECS),
            gc_interval: Duration::from_secs(DEFAULT_LEASE_GC_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl RiggerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> RiggerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RiggerError::configuration(
                "file",
                format!("Failed to read config file {}: {}", path.display(), e),
            )
        })?;

        let config: RiggerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from an optional file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> RiggerResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RIGGER_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> RiggerResult<()> {
        if let Ok(dir) = std::env::var("RIGGER_ROOT_DIR") {
            self.infrastructure.root_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("RIGGER_TMP_DIR") {
            self.infrastructure.tmp_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("RIGGER_CACHE_DIR") {
            self.infrastructure.cache_dir = PathBuf::from(dir);
        }

        if let Ok(debug) = std::env::var("RIGGER_DEBUG") {
            self.infrastructure.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }

        if let Ok(answer) = std::env::var("RIGGER_USE_TF_CACHE") {
            self.infrastructure.use_state_cache = answer.parse()?;
        }

        if let Ok(backend) = std::env::var("RIGGER_BACKEND") {
            self.infrastructure.backend = match backend.as_str() {
                "terraform" => BackendKind::Terraform,
                "opentofu" | "tofu" => BackendKind::Opentofu,
                other => {
                    return Err(RiggerError::configuration(
                        "infrastructure.backend",
                        format!("unknown backend {:?}", other),
                    ))
                }
            };
        }

        if let Ok(name) = std::env::var("RIGGER_POD_NAME") {
            self.lease.pod_name = name;
        }

        if let Ok(ip) = std::env::var("RIGGER_POD_IP") {
            self.lease.pod_ip = ip;
        }

        if let Ok(domain) = std::env::var("RIGGER_CLUSTER_DOMAIN") {
            self.lease.cluster_domain = domain;
        }

        if let Ok(filter) = std::env::var("RIGGER_LOG") {
            self.logging.filter = filter;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> RiggerResult<()> {
        if self.checker.parallelism_per_registry == 0 {
            return Err(RiggerError::configuration(
                "checker.parallelism_per_registry",
                "must be greater than zero",
            ));
        }

        if self.checker.interval.is_zero() {
            return Err(RiggerError::configuration(
                "checker.interval",
                "must be greater than zero",
            ));
        }

        if self.lease.duration_seconds <= 0 {
            return Err(RiggerError::configuration(
                "lease.duration_seconds",
                "must be greater than zero",
            ));
        }

        if self.lease.renew_interval.as_secs() >= self.lease.duration_seconds as u64 {
            return Err(RiggerError::configuration(
                "lease.renew_interval",
                "must be shorter than the lease duration",
            ));
        }

        if self.registry.namespace.is_empty() {
            return Err(RiggerError::configuration(
                "registry.namespace",
                "must not be empty",
            ));
        }

        Ok(())
    }
}

/// Install the process-wide configuration. The first call wins.
pub fn init(config: RiggerConfig) -> Arc<RiggerConfig> {
    CONFIG.get_or_init(|| Arc::new(config)).clone()
}

/// Process-wide configuration, or defaults when [`init`] was never called
pub fn get() -> Arc<RiggerConfig> {
    CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(RiggerConfig::default()))
}
