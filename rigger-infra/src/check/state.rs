//! Infrastructure state kept in the cluster and in the local cache

use crate::runner::cache::StateCache;
use crate::state_saver::SaveDestination;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::ByteString;
use rigger_core::error::{RiggerError, RiggerResult};
use rigger_core::k8s::{make_secret, secret_data, KubeClient};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const STATE_NAMESPACE: &str = "d8-system";
pub const CLUSTER_STATE_SECRET: &str = "d8-cluster-terraform-state";
pub const CLUSTER_STATE_KEY: &str = "cluster-tf-state.json";
pub const NODE_STATE_SECRET_PREFIX: &str = "d8-node-terraform-state-";
pub const NODE_STATE_KEY: &str = "node-tf-state.json";
pub const NODE_GROUP_SETTINGS_KEY: &str = "node-group-settings.json";
pub const NODE_STATE_LABEL: &str = "node.deckhouse.io/terraform-state";
pub const NODE_GROUP_LABEL: &str = "node.deckhouse.io/node-group";
pub const NODE_NAME_LABEL: &str = "node.deckhouse.io/node-name";

/// Cache entry holding node states in commander mode
pub const NODES_STATE_CACHE_KEY: &str = "nodes-state.json";

/// States of one node group, keyed by node name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupState {
    #[serde(default, with = "base64_map")]
    pub state: BTreeMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
}

pub type NodesState = BTreeMap<String, NodeGroupState>;

mod base64_map {
    use super::*;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&String, String> =
            map.iter().map(|(k, v)| (k, STANDARD.encode(v))).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v.as_bytes())
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

pub fn node_state_secret_name(node_name: &str) -> String {
    format!("{}{}", NODE_STATE_SECRET_PREFIX, node_name)
}

/// Base infrastructure state, `None` when the secret or key is absent.
pub async fn cluster_state_from_cluster(kube: &dyn KubeClient) -> RiggerResult<Option<Vec<u8>>> {
    let secret = kube.get_secret(STATE_NAMESPACE, CLUSTER_STATE_SECRET).await?;
    Ok(secret
        .as_ref()
        .and_then(|s| secret_data(s, CLUSTER_STATE_KEY))
        .map(<[u8]>::to_vec))
}

/// Node states grouped by the node-group label of their secrets.
pub async fn nodes_state_from_cluster(kube: &dyn KubeClient) -> RiggerResult<NodesState> {
    let secrets = kube.list_secrets(STATE_NAMESPACE, NODE_STATE_LABEL).await?;
    let mut nodes = NodesState::new();

    for secret in secrets {
        let labels = secret.metadata.labels.clone().unwrap_or_default();
        let Some(group) = labels.get(NODE_GROUP_LABEL) else {
            warn!(
                secret = secret.metadata.name.as_deref().unwrap_or_default(),
                "Node state secret has no node group label"
            );
            continue;
        };
        let secret_name = secret.metadata.name.clone().unwrap_or_default();
        let node_name = labels
            .get(NODE_NAME_LABEL)
            .cloned()
            .unwrap_or_else(|| {
                secret_name
                    .strip_prefix(NODE_STATE_SECRET_PREFIX)
                    .unwrap_or(&secret_name)
                    .to_string()
            });

        let entry = nodes.entry(group.clone()).or_default();
        if let Some(state) = secret_data(&secret, NODE_STATE_KEY) {
            entry.state.insert(node_name, state.to_vec());
        }
        if entry.settings.is_none() {
            if let Some(raw) = secret_data(&secret, NODE_GROUP_SETTINGS_KEY) {
                entry.settings = Some(
                    serde_json::from_slice(raw)
                        .map_err(|e| RiggerError::parse("node group settings", e))?,
                );
            }
        }
    }
    Ok(nodes)
}

/// Nodes state from the local cache with missing group settings taken from
/// the cluster.
pub async fn nodes_state_for_commander(
    cache: &dyn StateCache,
    kube: &dyn KubeClient,
) -> RiggerResult<NodesState> {
    if !cache.in_cache(NODES_STATE_CACHE_KEY)? {
        return Ok(NodesState::new());
    }
    let raw = cache.load(NODES_STATE_CACHE_KEY)?;
    let mut nodes: NodesState =
        serde_json::from_slice(&raw).map_err(|e| RiggerError::parse("nodes state cache", e))?;

    if nodes.values().all(|group| group.settings.is_some()) {
        return Ok(nodes);
    }

    match nodes_state_from_cluster(kube).await {
        Ok(in_cluster) => {
            for (group, state) in nodes.iter_mut() {
                if state.settings.is_none() {
                    state.settings = in_cluster.get(group).and_then(|g| g.settings.clone());
                }
            }
        }
        Err(e) => warn!("Cannot load node group settings from cluster: {}", e),
    }
    Ok(nodes)
}

/// Writes the base infrastructure state into its secret
pub struct ClusterStateSaver {
    kube: Arc<dyn KubeClient>,
}

impl ClusterStateSaver {
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl SaveDestination for ClusterStateSaver {
    async fn save_state(&self, data: &[u8]) -> RiggerResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let secret = match self.kube.get_secret(STATE_NAMESPACE, CLUSTER_STATE_SECRET).await? {
            Some(mut secret) => {
                secret
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(CLUSTER_STATE_KEY.to_string(), ByteString(data.to_vec()));
                secret
            }
            None => make_secret(
                STATE_NAMESPACE,
                CLUSTER_STATE_SECRET,
                "Opaque",
                BTreeMap::new(),
                BTreeMap::from([(CLUSTER_STATE_KEY.to_string(), data.to_vec())]),
            ),
        };
        self.kube.apply_secret(secret).await?;
        debug!("Intermediate base infra was saved in cluster");
        Ok(())
    }
}

/// Writes one node's state into its secret. Group settings are only stored
/// when the secret is created; master nodes have none.
pub struct NodeStateSaver {
    kube: Arc<dyn KubeClient>,
    node_name: String,
    node_group: String,
    settings: Option<Value>,
}

impl NodeStateSaver {
    pub fn new(
        kube: Arc<dyn KubeClient>,
        node_name: impl Into<String>,
        node_group: impl Into<String>,
        settings: Option<Value>,
    ) -> Self {
        Self {
            kube,
            node_name: node_name.into(),
            node_group: node_group.into(),
            settings,
        }
    }
}

#[async_trait]
impl SaveDestination for NodeStateSaver {
    async fn save_state(&self, data: &[u8]) -> RiggerResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let name = node_state_secret_name(&self.node_name);
        let secret = match self.kube.get_secret(STATE_NAMESPACE, &name).await? {
            Some(mut secret) => {
                secret
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(NODE_STATE_KEY.to_string(), ByteString(data.to_vec()));
                secret
            }
            None => {
                let labels = BTreeMap::from([
                    (NODE_GROUP_LABEL.to_string(), self.node_group.clone()),
                    (NODE_NAME_LABEL.to_string(), self.node_name.clone()),
                    (NODE_STATE_LABEL.to_string(), String::new()),
                ]);
                let mut body = BTreeMap::from([(NODE_STATE_KEY.to_string(), data.to_vec())]);
                if let Some(settings) = &self.settings {
                    body.insert(NODE_GROUP_SETTINGS_KEY.to_string(), serde_json::to_vec(settings)?);
                }
                make_secret(STATE_NAMESPACE, &name, "Opaque", labels, body)
            }
        };
        self.kube.apply_secret(secret).await?;
        debug!(node = %self.node_name, "Intermediate node state was saved in cluster");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::cache::FileStateCache;
    use rigger_core::k8s::fake::FakeKubeClient;
    use rigger_core::k8s::secret_string;
    use serde_json::json;

    #[tokio::test]
    async fn test_node_saver_creates_then_patches() {
        let kube = Arc::new(FakeKubeClient::new());
        let saver = NodeStateSaver::new(kube.clone(), "foo-khm-0", "khm", Some(json!({"name": "khm"})));

        saver.save_state(b"{\"v\":1}").await.unwrap();
        saver.save_state(b"{\"v\":2}").await.unwrap();
        saver.save_state(b"").await.unwrap();

        let secret = kube.secret(STATE_NAMESPACE, "d8-node-terraform-state-foo-khm-0").unwrap();
        assert_eq!(secret_string(&secret, NODE_STATE_KEY), "{\"v\":2}");
        assert_eq!(secret_string(&secret, NODE_GROUP_SETTINGS_KEY), "{\"name\":\"khm\"}");

        let nodes = nodes_state_from_cluster(kube.as_ref()).await.unwrap();
        assert_eq!(nodes["khm"].state["foo-khm-0"], b"{\"v\":2}".to_vec());
        assert_eq!(nodes["khm"].settings, Some(json!({"name": "khm"})));
    }

    #[tokio::test]
    async fn test_cluster_saver_round_trip() {
        let kube = Arc::new(FakeKubeClient::new());
        assert!(cluster_state_from_cluster(kube.as_ref()).await.unwrap().is_none());

        ClusterStateSaver::new(kube.clone())
            .save_state(b"{\"resources\":[]}")
            .await
            .unwrap();
        assert_eq!(
            cluster_state_from_cluster(kube.as_ref()).await.unwrap(),
            Some(b"{\"resources\":[]}".to_vec())
        );
    }

    #[tokio::test]
    async fn test_commander_settings_back_filled() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileStateCache::new(dir.path()).unwrap();
        let mut nodes = NodesState::new();
        nodes.insert(
            "khm".to_string(),
            NodeGroupState {
                state: BTreeMap::from([("foo-khm-0".to_string(), b"{}".to_vec())]),
                settings: None,
            },
        );
        cache
            .save(NODES_STATE_CACHE_KEY, &serde_json::to_vec(&nodes).unwrap())
            .unwrap();

        let kube = Arc::new(FakeKubeClient::new());
        NodeStateSaver::new(kube.clone(), "foo-khm-0", "khm", Some(json!({"replicas": 1})))
            .save_state(b"{}")
            .await
            .unwrap();

        let loaded = nodes_state_for_commander(&cache, kube.as_ref()).await.unwrap();
        assert_eq!(loaded["khm"].settings, Some(json!({"replicas": 1})));
        assert_eq!(loaded["khm"].state["foo-khm-0"], b"{}".to_vec());
    }
}
