//! In-memory `KubeClient` for tests

use super::{labels_match, KubeClient};
use crate::error::{RiggerError, RiggerResult};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

type Key = (String, String);

#[derive(Default)]
struct Store {
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<Key, Pod>,
    deployments: BTreeMap<Key, Deployment>,
    leases: BTreeMap<Key, Lease>,
    node_group_templates: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    failing_nodes: HashSet<String>,
    secret_writes: usize,
    secret_deletes: Vec<String>,
}

#[derive(Default)]
pub struct FakeKubeClient {
    store: Mutex<Store>,
}

fn meta_key(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

impl FakeKubeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_secret(&self, secret: Secret) {
        let k = meta_key(&secret.metadata);
        self.store.lock().secrets.insert(k, secret);
    }

    pub fn insert_config_map(&self, config_map: ConfigMap) {
        let k = meta_key(&config_map.metadata);
        self.store.lock().config_maps.insert(k, config_map);
    }

    pub fn insert_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.store.lock().nodes.insert(name, node);
    }

    pub fn insert_pod(&self, pod: Pod) {
        let k = meta_key(&pod.metadata);
        self.store.lock().pods.insert(k, pod);
    }

    pub fn insert_deployment(&self, deployment: Deployment) {
        let k = meta_key(&deployment.metadata);
        self.store.lock().deployments.insert(k, deployment);
    }

    pub fn insert_lease(&self, lease: Lease) {
        let k = meta_key(&lease.metadata);
        self.store.lock().leases.insert(k, lease);
    }

    pub fn insert_node_group_template(
        &self,
        name: &str,
        template: BTreeMap<String, serde_json::Value>,
    ) {
        self.store
            .lock()
            .node_group_templates
            .insert(name.to_string(), template);
    }

    /// Make `get_node(name)` fail with a transient error.
    pub fn fail_node_lookup(&self, name: &str) {
        self.store.lock().failing_nodes.insert(name.to_string());
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.store.lock().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.store.lock().leases.get(&key(namespace, name)).cloned()
    }

    pub fn lease_names(&self) -> Vec<String> {
        self.store.lock().leases.keys().map(|(_, n)| n.clone()).collect()
    }

    pub fn secret_writes(&self) -> usize {
        self.store.lock().secret_writes
    }

    /// Names passed to `delete_secret`, whether or not the secret existed
    pub fn secret_deletes(&self) -> Vec<String> {
        self.store.lock().secret_deletes.clone()
    }
}

#[async_trait]
impl KubeClient for FakeKubeClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> RiggerResult<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn apply_secret(&self, secret: Secret) -> RiggerResult<()> {
        let k = meta_key(&secret.metadata);
        let mut store = self.store.lock();
        store.secret_writes += 1;
        store.secrets.insert(k, secret);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> RiggerResult<bool> {
        let mut store = self.store.lock();
        store.secret_deletes.push(name.to_string());
        Ok(store.secrets.remove(&key(namespace, name)).is_some())
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> RiggerResult<Vec<Secret>> {
        Ok(self
            .store
            .lock()
            .secrets
            .iter()
            .filter(|((ns, _), s)| ns == namespace && labels_match(label_selector, s.metadata.labels.as_ref()))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> RiggerResult<Option<ConfigMap>> {
        Ok(self
            .store
            .lock()
            .config_maps
            .get(&key(namespace, name))
            .cloned())
    }

    async fn get_node(&self, name: &str) -> RiggerResult<Option<Node>> {
        let store = self.store.lock();
        if store.failing_nodes.contains(name) {
            return Err(RiggerError::kube(
                format!("get node {}", name),
                "connection refused",
            ));
        }
        Ok(store.nodes.get(name).cloned())
    }

    async fn list_nodes(&self, label_selector: &str) -> RiggerResult<Vec<Node>> {
        Ok(self
            .store
            .lock()
            .nodes
            .values()
            .filter(|n| labels_match(label_selector, n.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> RiggerResult<Vec<Pod>> {
        Ok(self
            .store
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), p)| ns == namespace && labels_match(label_selector, p.metadata.labels.as_ref()))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> RiggerResult<Option<Deployment>> {
        Ok(self
            .store
            .lock()
            .deployments
            .get(&key(namespace, name))
            .cloned())
    }

    async fn get_node_group_template(
        &self,
        name: &str,
    ) -> RiggerResult<Option<BTreeMap<String, serde_json::Value>>> {
        Ok(self
            .store
            .lock()
            .node_group_templates
            .get(name)
            .filter(|t| !t.is_empty())
            .cloned())
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> RiggerResult<Option<Lease>> {
        Ok(self.lease(namespace, name))
    }

    async fn create_lease(&self, lease: Lease) -> RiggerResult<Lease> {
        let k = meta_key(&lease.metadata);
        let mut store = self.store.lock();
        if store.leases.contains_key(&k) {
            return Err(RiggerError::kube(
                format!("create lease {}/{}", k.0, k.1),
                "already exists",
            ));
        }
        store.leases.insert(k, lease.clone());
        Ok(lease)
    }

    async fn replace_lease(&self, lease: Lease) -> RiggerResult<Lease> {
        let k = meta_key(&lease.metadata);
        let mut store = self.store.lock();
        if !store.leases.contains_key(&k) {
            return Err(RiggerError::not_found(format!("lease {}/{}", k.0, k.1)));
        }
        store.leases.insert(k, lease.clone());
        Ok(lease)
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> RiggerResult<bool> {
        Ok(self
            .store
            .lock()
            .leases
            .remove(&key(namespace, name))
            .is_some())
    }

    async fn list_leases(&self, namespace: &str, label_selector: &str) -> RiggerResult<Vec<Lease>> {
        Ok(self
            .store
            .lock()
            .leases
            .iter()
            .filter(|((ns, _), l)| ns == namespace && labels_match(label_selector, l.metadata.labels.as_ref()))
            .map(|(_, l)| l.clone())
            .collect())
    }
}
