//! Does the local configuration describe the cluster we are talking to?

use crate::meta::{MetaConfig, CLOUD_CLUSTER_TYPE};
use rigger_core::error::{RiggerError, RiggerResult};
use rigger_core::k8s::{secret_data, KubeClient};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

pub const CONFIG_NAMESPACE: &str = "kube-system";
pub const CLUSTER_CONFIGURATION_SECRET: &str = "d8-cluster-configuration";
pub const CLUSTER_CONFIGURATION_KEY: &str = "cluster-configuration.yaml";
pub const PROVIDER_CONFIGURATION_SECRET: &str = "d8-provider-cluster-configuration";
pub const PROVIDER_CONFIGURATION_KEY: &str = "cloud-provider-cluster-configuration.yaml";
pub const STATIC_CONFIGURATION_SECRET: &str = "d8-static-cluster-configuration";
pub const STATIC_CONFIGURATION_KEY: &str = "static-cluster-configuration.yaml";
pub const CLUSTER_UUID_CONFIG_MAP: &str = "d8-cluster-uuid";
pub const CLUSTER_UUID_KEY: &str = "cluster-uuid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    InSync,
    OutOfSync,
}

/// Configuration documents as stored in the cluster
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InClusterConfiguration {
    pub uuid: String,
    pub cluster_config: Option<Map<String, Value>>,
    pub provider_cluster_config: Option<Map<String, Value>>,
    pub static_cluster_config: Option<Map<String, Value>>,
}

fn parse_document(what: &str, raw: &[u8]) -> RiggerResult<Option<Map<String, Value>>> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    // Through serde_json::Value so key order never matters.
    let value: Value = serde_yaml::from_slice(raw).map_err(|e| RiggerError::parse(what, e))?;
    match value {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(RiggerError::parse(what, format!("expected a mapping, got {}", other))),
    }
}

async fn secret_document(
    kube: &dyn KubeClient,
    name: &str,
    key: &str,
) -> RiggerResult<Option<Map<String, Value>>> {
    let Some(secret) = kube.get_secret(CONFIG_NAMESPACE, name).await? else {
        return Ok(None);
    };
    match secret_data(&secret, key) {
        Some(raw) => parse_document(key, raw),
        None => Ok(None),
    }
}

pub async fn load_in_cluster_configuration(
    kube: &dyn KubeClient,
) -> RiggerResult<InClusterConfiguration> {
    let uuid = kube
        .get_config_map(CONFIG_NAMESPACE, CLUSTER_UUID_CONFIG_MAP)
        .await?
        .and_then(|cm| cm.data)
        .and_then(|data| data.get(CLUSTER_UUID_KEY).cloned())
        .unwrap_or_default();

    Ok(InClusterConfiguration {
        uuid,
        cluster_config: secret_document(kube, CLUSTER_CONFIGURATION_SECRET, CLUSTER_CONFIGURATION_KEY)
            .await?,
        provider_cluster_config: secret_document(
            kube,
            PROVIDER_CONFIGURATION_SECRET,
            PROVIDER_CONFIGURATION_KEY,
        )
        .await?,
        static_cluster_config: secret_document(
            kube,
            STATIC_CONFIGURATION_SECRET,
            STATIC_CONFIGURATION_KEY,
        )
        .await?,
    })
}

/// Empty and absent documents are the same thing.
fn same_document(local: Option<&Map<String, Value>>, remote: Option<&Map<String, Value>>) -> bool {
    let empty = Map::new();
    local.unwrap_or(&empty) == remote.unwrap_or(&empty)
}

/// Compare the local configuration with the in-cluster one. A cloud cluster
/// without a provider configuration on either side is an error.
pub fn compare_configuration(
    meta: &MetaConfig,
    in_cluster: &InClusterConfiguration,
) -> RiggerResult<SyncStatus> {
    let mut status = SyncStatus::InSync;

    if meta.uuid != in_cluster.uuid {
        debug!(local = %meta.uuid, cluster = %in_cluster.uuid, "Cluster UUID differs");
        status = SyncStatus::OutOfSync;
    }

    if !same_document(Some(&meta.cluster_config), in_cluster.cluster_config.as_ref()) {
        debug!("ClusterConfiguration differs");
        status = SyncStatus::OutOfSync;
    }

    if meta.cluster_type == CLOUD_CLUSTER_TYPE {
        let (Some(local), Some(remote)) = (
            meta.provider_cluster_config.as_ref(),
            in_cluster.provider_cluster_config.as_ref(),
        ) else {
            return Err(RiggerError::validation(
                "providerClusterConfiguration",
                "provider cluster configuration is required for Cloud clusters",
            ));
        };
        if local != remote {
            debug!("Provider cluster configuration differs");
            status = SyncStatus::OutOfSync;
        }
    } else if !same_document(
        meta.static_cluster_config.as_ref(),
        in_cluster.static_cluster_config.as_ref(),
    ) {
        debug!("StaticClusterConfiguration differs");
        status = SyncStatus::OutOfSync;
    }

    Ok(status)
}

pub async fn check_configuration(
    kube: &dyn KubeClient,
    meta: &MetaConfig,
) -> RiggerResult<SyncStatus> {
    let in_cluster = load_in_cluster_configuration(kube).await?;
    let status = compare_configuration(meta, &in_cluster)?;
    info!(?status, "Configuration check finished");
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn static_meta() -> MetaConfig {
        MetaConfig {
            cluster_type: "Static".to_string(),
            uuid: "b5c5a3b2".to_string(),
            cluster_config: obj(json!({"clusterType": "Static", "podSubnetCIDR": "10.111.0.0/16"})),
            ..Default::default()
        }
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let yaml = b"podSubnetCIDR: 10.111.0.0/16\nclusterType: Static\n";
        let in_cluster = InClusterConfiguration {
            uuid: "b5c5a3b2".to_string(),
            cluster_config: parse_document("cluster", yaml).unwrap(),
            provider_cluster_config: None,
            static_cluster_config: Some(Map::new()),
        };
        assert_eq!(
            compare_configuration(&static_meta(), &in_cluster).unwrap(),
            SyncStatus::InSync
        );
    }

    #[test]
    fn test_uuid_mismatch() {
        let in_cluster = InClusterConfiguration {
            uuid: "other".to_string(),
            cluster_config: Some(static_meta().cluster_config),
            ..Default::default()
        };
        assert_eq!(
            compare_configuration(&static_meta(), &in_cluster).unwrap(),
            SyncStatus::OutOfSync
        );
    }

    #[test]
    fn test_cloud_requires_provider_config() {
        let mut meta = static_meta();
        meta.cluster_type = "Cloud".to_string();
        let in_cluster = InClusterConfiguration {
            uuid: meta.uuid.clone(),
            cluster_config: Some(meta.cluster_config.clone()),
            ..Default::default()
        };
        assert!(compare_configuration(&meta, &in_cluster).is_err());

        meta.provider_cluster_config = Some(obj(json!({"layout": "Standard"})));
        let in_cluster = InClusterConfiguration {
            provider_cluster_config: Some(obj(json!({"layout": "WithoutNAT"}))),
            ..in_cluster
        };
        assert_eq!(
            compare_configuration(&meta, &in_cluster).unwrap(),
            SyncStatus::OutOfSync
        );
    }

    #[test]
    fn test_parse_document_rejects_scalars() {
        assert!(parse_document("x", b"   \n").unwrap().is_none());
        assert!(parse_document("x", b"just a string").is_err());
    }
}
