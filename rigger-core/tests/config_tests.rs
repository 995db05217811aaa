use pretty_assertions::assert_eq;
use rigger_core::config::{BackendKind, RiggerConfig, UseStateCache};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;

#[test]
fn test_partial_file_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[infrastructure]
root_dir = "/srv/rigger"
backend = "opentofu"
use_state_cache = "yes"

[checker]
interval = "20s"
retry_delay = "1m"
"#
    )
    .unwrap();

    let config = RiggerConfig::from_file(file.path()).unwrap();
    assert_eq!(config.infrastructure.root_dir.to_str(), Some("/srv/rigger"));
    assert_eq!(
        config.infrastructure.plugins_dir().to_str(),
        Some("/srv/rigger/plugins")
    );
    assert_eq!(config.infrastructure.backend, BackendKind::Opentofu);
    assert_eq!(config.infrastructure.use_state_cache, UseStateCache::Yes);
    assert_eq!(config.checker.interval, Duration::from_secs(20));
    assert_eq!(config.checker.retry_delay, Duration::from_secs(60));
    assert_eq!(config.checker.parallelism_per_registry, 20);
    assert_eq!(config.registry.namespace, "d8-system");
}

#[test]
fn test_invalid_toml_is_configuration_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[checker\ninterval = ").unwrap();
    let err = RiggerConfig::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("Configuration error in toml"));
}

#[test]
fn test_missing_file() {
    let err = RiggerConfig::from_file(std::path::Path::new("/nonexistent/rigger.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("RIGGER_USE_TF_CACHE", "no");
    std::env::set_var("RIGGER_DEBUG", "true");
    std::env::set_var("RIGGER_POD_IP", "10.0.0.1");

    let mut config = RiggerConfig::default();
    config.apply_env_overrides().unwrap();

    std::env::remove_var("RIGGER_USE_TF_CACHE");
    std::env::remove_var("RIGGER_DEBUG");
    std::env::remove_var("RIGGER_POD_IP");

    assert_eq!(config.infrastructure.use_state_cache, UseStateCache::No);
    assert!(config.infrastructure.debug);
    assert_eq!(config.lease.pod_ip, "10.0.0.1");
}

#[test]
#[serial]
fn test_bad_env_value_is_rejected() {
    std::env::set_var("RIGGER_BACKEND", "pulumi");
    let mut config = RiggerConfig::default();
    let result = config.apply_env_overrides();
    std::env::remove_var("RIGGER_BACKEND");
    assert!(result.is_err());
}
