//! Restore points kept in Kubernetes secrets

use crate::checker;
use crate::orchestrator::State;
use rigger_core::error::{RiggerError, RiggerResult};
use rigger_core::k8s::{make_secret, secret_data, KubeClient};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const REGISTRY_STATE_SECRET: &str = "registry-state";
pub const CHECKER_STATE_SECRET: &str = "registry-checker-state";

const STATE_KEY: &str = "state";
const PARAMS_KEY: &str = "params";

/// Loads and saves orchestrator and checker snapshots. Loading is best
/// effort: a missing or undecodable snapshot yields nothing and the caller
/// starts from scratch.
#[derive(Clone)]
pub struct StateStore {
    kube: Arc<dyn KubeClient>,
    namespace: String,
}

impl StateStore {
    pub fn new(kube: Arc<dyn KubeClient>, namespace: impl Into<String>) -> Self {
        Self {
            kube,
            namespace: namespace.into(),
        }
    }

    pub async fn load_state(&self) -> RiggerResult<Option<State>> {
        let Some(secret) = self.kube.get_secret(&self.namespace, REGISTRY_STATE_SECRET).await? else {
            return Ok(None);
        };
        Ok(decode(REGISTRY_STATE_SECRET, secret_data(&secret, STATE_KEY)))
    }

    pub async fn save_state(&self, state: &State) -> RiggerResult<()> {
        let data = BTreeMap::from([(STATE_KEY.to_string(), encode(state)?)]);
        self.save(REGISTRY_STATE_SECRET, data).await
    }

    /// Params and state the checker last worked with
    pub async fn load_checker(&self) -> RiggerResult<(Option<checker::Params>, checker::State)> {
        let Some(secret) = self.kube.get_secret(&self.namespace, CHECKER_STATE_SECRET).await? else {
            return Ok((None, checker::State::default()));
        };
        let params = decode(CHECKER_STATE_SECRET, secret_data(&secret, PARAMS_KEY));
        let state = decode(CHECKER_STATE_SECRET, secret_data(&secret, STATE_KEY)).unwrap_or_default();
        Ok((params, state))
    }

    pub async fn save_checker(&self, params: &checker::Params, state: &checker::State) -> RiggerResult<()> {
        let data = BTreeMap::from([
            (PARAMS_KEY.to_string(), encode(params)?),
            (STATE_KEY.to_string(), encode(state)?),
        ]);
        self.save(CHECKER_STATE_SECRET, data).await
    }

    async fn save(&self, name: &str, data: BTreeMap<String, Vec<u8>>) -> RiggerResult<()> {
        debug!(secret = name, "Saving snapshot");
        let secret = make_secret(&self.namespace, name, "Opaque", BTreeMap::new(), data);
        self.kube.apply_secret(secret).await
    }
}

fn encode<T: serde::Serialize>(value: &T) -> RiggerResult<Vec<u8>> {
    serde_yaml::to_string(value)
        .map(String::into_bytes)
        .map_err(|e| RiggerError::parse("snapshot", e))
}

fn decode<T: DeserializeOwned>(secret: &str, data: Option<&[u8]>) -> Option<T> {
    let data = data.filter(|d| !d.is_empty())?;
    match serde_yaml::from_slice(data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(secret, error = %e, "Ignoring undecodable snapshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Mode;
    use rigger_core::k8s::fake::FakeKubeClient;

    #[tokio::test]
    async fn test_state_round_trip_and_garbage() {
        let kube = Arc::new(FakeKubeClient::new());
        let store = StateStore::new(kube.clone(), "d8-system");
        assert!(store.load_state().await.unwrap().is_none());

        let state = State {
            mode: Mode::Direct,
            target_mode: Mode::Direct,
            ingress_enabled: true,
            ..Default::default()
        };
        store.save_state(&state).await.unwrap();
        assert_eq!(store.load_state().await.unwrap(), Some(state));

        kube.insert_secret(make_secret(
            "d8-system",
            REGISTRY_STATE_SECRET,
            "Opaque",
            BTreeMap::new(),
            BTreeMap::from([(STATE_KEY.to_string(), b"mode: [broken".to_vec())]),
        ));
        assert!(store.load_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checker_round_trip() {
        let kube = Arc::new(FakeKubeClient::new());
        let store = StateStore::new(kube, "d8-system");

        let params = checker::Params {
            version: "v1".to_string(),
            ..Default::default()
        };
        let state = checker::State {
            version: "v1".to_string(),
            message: "no registries to check".to_string(),
            ..Default::default()
        };
        store.save_checker(&params, &state).await.unwrap();

        let (loaded_params, loaded_state) = store.load_checker().await.unwrap();
        assert_eq!(loaded_params, Some(params));
        assert_eq!(loaded_state, state);
    }
}
