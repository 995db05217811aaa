//! Default configuration values for Rigger
//!
//! This module centralizes all default values to make them easy to find and modify.

// Infrastructure defaults
pub const DEFAULT_ROOT_DIR: &str = "/opt/rigger";
pub const DEFAULT_TMP_DIR: &str = "/tmp/rigger";
pub const DEFAULT_PLUGINS_SUBDIR: &str = "plugins";
pub const DEFAULT_MODULES_SUBDIR: &str = "modules";
pub const DEFAULT_DATA_DIR_ID: &str = "dhctl";
pub const HAS_CHANGES_EXIT_CODE: i32 = 2;
pub const STOP_POLL_INTERVAL_MS: u64 = 50;

// Registry checker defaults
pub const DEFAULT_CHECKER_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_CHECKER_PROCESS_TIMEOUT_SECS: u64 = 8;
pub const DEFAULT_CHECKER_RETRY_DELAY_SECS: u64 = 30;
pub const DEFAULT_CHECKER_PARALLELISM: usize = 20;
pub const DEFAULT_SHOW_MAX_ERR_ITEMS: usize = 5;
pub const DEFAULT_CHECKER_REQUEST_TIMEOUT_SECS: u64 = 5;

// Registry orchestrator defaults
pub const DEFAULT_REGISTRY_NAMESPACE: &str = "d8-system";
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 15;

// Lease defaults
pub const DEFAULT_LEASE_NAMESPACE: &str = "d8-system";
pub const DEFAULT_LEASE_MODULE: &str = "documentation";
pub const DEFAULT_LEASE_PORT: u16 = 8081;
pub const DEFAULT_LEASE_DURATION_SECS: i32 = 35;
pub const DEFAULT_LEASE_RENEW_SECS: u64 = 30;
pub const DEFAULT_LEASE_GC_SECS: u64 = 90;
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

// Logging defaults
pub const DEFAULT_LOG_FILTER: &str =
    "rigger=info,rigger_core=info,rigger_infra=info,rigger_registry=info,kube=warn";
