//! Cluster meta configuration
//!
//! The parts of the cluster, provider and static configuration documents
//! that the runners and the check engine need: cluster type, provider,
//! prefix, layout and the node group specs.

use rigger_core::error::{RiggerError, RiggerResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

pub const MASTER_NODE_GROUP: &str = "master";
pub const CLOUD_CLUSTER_TYPE: &str = "Cloud";
pub const STATIC_CLUSTER_TYPE: &str = "Static";

const CLUSTER_CONFIGURATION_KIND: &str = "ClusterConfiguration";
const STATIC_CLUSTER_CONFIGURATION_KIND: &str = "StaticClusterConfiguration";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterNodeGroupSpec {
    #[serde(default)]
    pub replicas: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraNodeGroupSpec {
    pub name: String,
    #[serde(default)]
    pub replicas: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_template: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaConfig {
    pub cluster_type: String,
    pub layout: String,
    pub provider_name: String,
    pub cluster_prefix: String,
    pub master_node_group: MasterNodeGroupSpec,
    pub terra_node_groups: Vec<TerraNodeGroupSpec>,
    pub cluster_config: Map<String, Value>,
    pub provider_cluster_config: Option<Map<String, Value>>,
    pub static_cluster_config: Option<Map<String, Value>>,
    pub uuid: String,
    pub resource_management_timeout: String,
}

impl MetaConfig {
    /// Build from the raw configuration documents and extract the derived fields.
    pub fn new(
        cluster_config: Map<String, Value>,
        provider_cluster_config: Option<Map<String, Value>>,
        static_cluster_config: Option<Map<String, Value>>,
    ) -> RiggerResult<Self> {
        let mut meta = Self {
            cluster_config,
            provider_cluster_config,
            static_cluster_config,
            ..Default::default()
        };
        meta.prepare()?;
        Ok(meta)
    }

    /// Parse a multi-document YAML stream. Documents are told apart by `kind`.
    pub fn from_yaml(data: &str) -> RiggerResult<Self> {
        let mut cluster = None;
        let mut provider = None;
        let mut static_config = None;

        for document in serde_yaml::Deserializer::from_str(data) {
            let value = Value::deserialize(document)
                .map_err(|e| RiggerError::parse("meta configuration", e))?;
            let Value::Object(doc) = value else {
                continue;
            };
            let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
            match kind {
                CLUSTER_CONFIGURATION_KIND => cluster = Some(doc),
                STATIC_CLUSTER_CONFIGURATION_KIND => static_config = Some(doc),
                k if k.ends_with(CLUSTER_CONFIGURATION_KIND) => provider = Some(doc),
                _ => {}
            }
        }

        let cluster = cluster.ok_or_else(|| {
            RiggerError::validation("meta configuration", "ClusterConfiguration document not found")
        })?;
        Self::new(cluster, provider, static_config)
    }

    pub fn from_file(path: &Path) -> RiggerResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn with_resource_management_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.resource_management_timeout = timeout.into();
        self
    }

    fn prepare(&mut self) -> RiggerResult<()> {
        if !self.cluster_config.is_empty() {
            self.cluster_type = self
                .cluster_config
                .get("clusterType")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    RiggerError::parse(
                        "cluster configuration",
                        "unable to parse cluster type from cluster configuration",
                    )
                })?
                .to_string();
        }

        let Some(provider) = &self.provider_cluster_config else {
            return Ok(());
        };
        if self.cluster_type != CLOUD_CLUSTER_TYPE || provider.is_empty() {
            return Ok(());
        }

        let layout = provider.get("layout").and_then(Value::as_str).ok_or_else(|| {
            RiggerError::parse(
                "provider cluster configuration",
                "unable to unmarshal layout from cluster configuration",
            )
        })?;
        self.layout = to_kebab(layout);

        let cloud = self.cluster_config.get("cloud").ok_or_else(|| {
            RiggerError::parse(
                "cluster configuration",
                "unable to unmarshal cloud section from provider cluster configuration",
            )
        })?;
        self.provider_name = cloud
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        self.cluster_prefix = cloud
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let master = provider.get("masterNodeGroup").cloned().ok_or_else(|| {
            RiggerError::parse(
                "provider cluster configuration",
                "unable to unmarshal master node group from provider cluster configuration",
            )
        })?;
        self.master_node_group = serde_json::from_value(master)
            .map_err(|e| RiggerError::parse("master node group", e))?;

        self.terra_node_groups = match provider.get("nodeGroups") {
            Some(groups) => serde_json::from_value(groups.clone())
                .map_err(|e| RiggerError::parse("node groups", e))?,
            None => Vec::new(),
        };
        Ok(())
    }

    pub fn is_static(&self) -> bool {
        self.cluster_type == STATIC_CLUSTER_TYPE
    }

    pub fn terra_node_group(&self, name: &str) -> Option<&TerraNodeGroupSpec> {
        self.terra_node_groups.iter().find(|group| group.name == name)
    }

    /// Raw `nodeGroups[i]` entry of the provider configuration for `name`.
    pub fn find_terra_node_group(&self, name: &str) -> Option<Value> {
        let index = self.terra_node_groups.iter().position(|group| group.name == name)?;
        self.provider_cluster_config
            .as_ref()?
            .get("nodeGroups")?
            .as_array()?
            .get(index)
            .cloned()
    }

    pub fn replicas_by_node_group(&self, name: &str) -> usize {
        if name == MASTER_NODE_GROUP {
            return self.master_node_group.replicas;
        }
        self.terra_node_group(name).map(|group| group.replicas).unwrap_or(0)
    }

    /// Variables for the base infrastructure step. The static configuration
    /// is never passed to the utility.
    pub fn marshal_config(&self) -> RiggerResult<Vec<u8>> {
        let mut result = Map::new();
        result.insert(
            "clusterConfiguration".to_string(),
            Value::Object(self.cluster_config.clone()),
        );
        if let Some(provider) = self.provider_cluster_config.as_ref().filter(|p| !p.is_empty()) {
            result.insert(
                "providerClusterConfiguration".to_string(),
                Value::Object(provider.clone()),
            );
        }
        self.insert_common(&mut result);
        Ok(serde_json::to_vec(&Value::Object(result))?)
    }

    /// Variables to order one master or static node.
    pub fn node_group_config(
        &self,
        node_group: &str,
        node_index: usize,
        cloud_config: &str,
    ) -> RiggerResult<Vec<u8>> {
        let mut result = Map::new();
        result.insert(
            "clusterConfiguration".to_string(),
            Value::Object(self.cluster_config.clone()),
        );
        result.insert(
            "providerClusterConfiguration".to_string(),
            self.provider_cluster_config
                .clone()
                .map(Value::Object)
                .unwrap_or(Value::Null),
        );
        result.insert("nodeIndex".to_string(), Value::from(node_index));
        result.insert("cloudConfig".to_string(), Value::from(cloud_config));
        if node_group != MASTER_NODE_GROUP {
            result.insert("nodeGroupName".to_string(), Value::from(node_group));
        }
        self.insert_common(&mut result);
        Ok(serde_json::to_vec(&Value::Object(result))?)
    }

    fn insert_common(&self, result: &mut Map<String, Value>) {
        if !self.uuid.is_empty() {
            result.insert("clusterUUID".to_string(), Value::from(self.uuid.as_str()));
        }
        if !self.resource_management_timeout.is_empty() {
            result.insert(
                "resourceManagementTimeout".to_string(),
                Value::from(self.resource_management_timeout.as_str()),
            );
        }
    }

    /// Copy of the configuration whose provider `nodeGroups` holds only `settings`.
    pub fn with_single_node_group(&self, settings: Value) -> Self {
        let mut copy = self.clone();
        if let Some(provider) = copy.provider_cluster_config.as_mut() {
            provider.insert("nodeGroups".to_string(), Value::Array(vec![settings.clone()]));
        }
        if let Ok(spec) = serde_json::from_value::<TerraNodeGroupSpec>(settings) {
            copy.terra_node_groups = vec![spec];
        }
        copy
    }

    /// `<prefix>-<group>-<index>`
    pub fn node_name(&self, node_group: &str, index: usize) -> String {
        format!("{}-{}-{}", self.cluster_prefix, node_group, index)
    }
}

/// Index after the last dash of a node name.
pub fn index_from_node_name(name: &str) -> RiggerResult<usize> {
    let suffix = name.rsplit('-').next().unwrap_or(name);
    suffix
        .parse::<usize>()
        .map_err(|e| RiggerError::parse(format!("index of node {}", name), e))
}

fn to_kebab(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut out = String::with_capacity(value.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == ' ' {
            out.push('-');
            continue;
        }
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push('-');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}
