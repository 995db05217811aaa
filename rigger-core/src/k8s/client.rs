//! `KubeClient` backed by a real API server

use super::KubeClient;
use crate::error::{RiggerError, RiggerResult};
use ::kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams,
};
use ::kube::{Api, Client};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use std::collections::BTreeMap;
use tracing::debug;

const FIELD_MANAGER: &str = "rigger";

#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster configuration or the local kubeconfig.
    pub async fn try_default() -> RiggerResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| RiggerError::kube("connect", e))?;
        Ok(Self { client })
    }
}

fn is_not_found(err: &::kube::Error) -> bool {
    matches!(err, ::kube::Error::Api(response) if response.code == 404)
}

fn list_params(label_selector: &str) -> ListParams {
    if label_selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(label_selector)
    }
}

fn object_key(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> RiggerResult<(String, String)> {
    let name = meta
        .name
        .clone()
        .ok_or_else(|| RiggerError::validation("metadata.name", "must be set"))?;
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| RiggerError::validation("metadata.namespace", "must be set"))?;
    Ok((namespace, name))
}

#[async_trait]
impl KubeClient for ClusterClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> RiggerResult<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| RiggerError::kube(format!("get secret {}/{}", namespace, name), e))
    }

    async fn apply_secret(&self, mut secret: Secret) -> RiggerResult<()> {
        let (namespace, name) = object_key(&secret.metadata)?;
        secret.metadata.managed_fields = None;
        secret.metadata.resource_version = None;

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(&secret))
            .await
            .map_err(|e| RiggerError::kube(format!("apply secret {}/{}", namespace, name), e))?;
        debug!(namespace = %namespace, name = %name, "Secret applied");
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> RiggerResult<bool> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(RiggerError::kube(
                format!("delete secret {}/{}", namespace, name),
                e,
            )),
        }
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> RiggerResult<Vec<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&list_params(label_selector))
            .await
            .map_err(|e| RiggerError::kube(format!("list secrets in {}", namespace), e))?;
        Ok(list.items)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> RiggerResult<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| RiggerError::kube(format!("get configmap {}/{}", namespace, name), e))
    }

    async fn get_node(&self, name: &str) -> RiggerResult<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| RiggerError::kube(format!("get node {}", name), e))
    }

    async fn list_nodes(&self, label_selector: &str) -> RiggerResult<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(&list_params(label_selector))
            .await
            .map_err(|e| RiggerError::kube("list nodes", e))?;
        Ok(list.items)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> RiggerResult<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&list_params(label_selector))
            .await
            .map_err(|e| RiggerError::kube(format!("list pods in {}", namespace), e))?;
        Ok(list.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> RiggerResult<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| RiggerError::kube(format!("get deployment {}/{}", namespace, name), e))
    }

    async fn get_node_group_template(
        &self,
        name: &str,
    ) -> RiggerResult<Option<BTreeMap<String, serde_json::Value>>> {
        let gvk = GroupVersionKind::gvk("deckhouse.io", "v1", "NodeGroup");
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);

        let Some(object) = api
            .get_opt(name)
            .await
            .map_err(|e| RiggerError::kube(format!("get node group {}", name), e))?
        else {
            return Ok(None);
        };

        let template = object
            .data
            .get("spec")
            .and_then(|spec| spec.get("nodeTemplate"))
            .and_then(|t| t.as_object())
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<BTreeMap<_, _>>());

        Ok(template.filter(|t| !t.is_empty()))
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> RiggerResult<Option<Lease>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| RiggerError::kube(format!("get lease {}/{}", namespace, name), e))
    }

    async fn create_lease(&self, lease: Lease) -> RiggerResult<Lease> {
        let (namespace, name) = object_key(&lease.metadata)?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), &lease)
            .await
            .map_err(|e| RiggerError::kube(format!("create lease {}/{}", namespace, name), e))
    }

    async fn replace_lease(&self, lease: Lease) -> RiggerResult<Lease> {
        let (namespace, name) = object_key(&lease.metadata)?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), &lease)
            .await
            .map_err(|e| RiggerError::kube(format!("update lease {}/{}", namespace, name), e))
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> RiggerResult<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(RiggerError::kube(
                format!("delete lease {}/{}", namespace, name),
                e,
            )),
        }
    }

    async fn list_leases(&self, namespace: &str, label_selector: &str) -> RiggerResult<Vec<Lease>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&list_params(label_selector))
            .await
            .map_err(|e| RiggerError::kube(format!("list leases in {}", namespace), e))?;
        Ok(list.items)
    }
}
