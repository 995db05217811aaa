//! Kubernetes access seam
//!
//! Everything in the workspace talks to the cluster through [`KubeClient`].
//! Production code uses [`client::ClusterClient`]; tests use the in-memory
//! `fake::FakeKubeClient`.

pub mod client;
#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;

use crate::error::RiggerResult;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

pub use client::ClusterClient;

#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> RiggerResult<Option<Secret>>;

    /// Create or update `secret`; namespace and name come from its metadata.
    async fn apply_secret(&self, secret: Secret) -> RiggerResult<()>;

    /// Delete a secret. Returns false when it did not exist.
    async fn delete_secret(&self, namespace: &str, name: &str) -> RiggerResult<bool>;

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> RiggerResult<Vec<Secret>>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> RiggerResult<Option<ConfigMap>>;

    async fn get_node(&self, name: &str) -> RiggerResult<Option<Node>>;

    async fn list_nodes(&self, label_selector: &str) -> RiggerResult<Vec<Node>>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> RiggerResult<Vec<Pod>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> RiggerResult<Option<Deployment>>;

    /// `spec.nodeTemplate` of a NodeGroup. An empty template is `None`.
    async fn get_node_group_template(
        &self,
        name: &str,
    ) -> RiggerResult<Option<BTreeMap<String, serde_json::Value>>>;

    async fn get_lease(&self, namespace: &str, name: &str) -> RiggerResult<Option<Lease>>;

    async fn create_lease(&self, lease: Lease) -> RiggerResult<Lease>;

    async fn replace_lease(&self, lease: Lease) -> RiggerResult<Lease>;

    async fn delete_lease(&self, namespace: &str, name: &str) -> RiggerResult<bool>;

    async fn list_leases(&self, namespace: &str, label_selector: &str) -> RiggerResult<Vec<Lease>>;
}

/// Read a key from a secret's `data`.
pub fn secret_data<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.as_slice())
}

/// Read a key from a secret's `data` as UTF-8 text, empty when missing.
pub fn secret_string(secret: &Secret, key: &str) -> String {
    secret_data(secret, key)
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default()
}

/// Build an opaque secret from string keys.
pub fn make_secret(
    namespace: &str,
    name: &str,
    type_: &str,
    labels: BTreeMap<String, String>,
    data: BTreeMap<String, Vec<u8>>,
) -> Secret {
    Secret {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: if labels.is_empty() { None } else { Some(labels) },
            ..Default::default()
        },
        type_: Some(type_.to_string()),
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k, ByteString(v)))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Match a `k=v,k2` style selector against labels. An empty selector matches.
pub fn labels_match(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(term),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_match() {
        let mut labels = BTreeMap::new();
        labels.insert("node.deckhouse.io/node-group".to_string(), "master".to_string());
        labels.insert("node.deckhouse.io/terraform-state".to_string(), String::new());

        assert!(labels_match("", Some(&labels)));
        assert!(labels_match("node.deckhouse.io/terraform-state", Some(&labels)));
        assert!(labels_match("node.deckhouse.io/node-group=master", Some(&labels)));
        assert!(!labels_match("node.deckhouse.io/node-group=worker", Some(&labels)));
        assert!(!labels_match("missing", None));
    }
}
